/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! TLS record and handshake decoding, one direction per context. Payload is
//! never decrypted; the observable handshake stages and record sizes are the
//! events.

use std::sync::Arc;

use crate::common::address::FlowAddress;
use crate::common::pdu::PduSlice;
use crate::config::AnalyzerConfig;
use crate::context::{Context, ContextState};
use crate::engine::Manager;
use crate::error::{Error, Result};
use crate::event::{EventData, EventType};
use crate::utils::bytes::read_u16_be;

const RECORD_HEADER_LEN: usize = 5;

const RECORD_CHANGE_CIPHER_SPEC: u8 = 20;
const RECORD_ALERT: u8 = 21;
const RECORD_HANDSHAKE: u8 = 22;
const RECORD_APPLICATION_DATA: u8 = 23;

const HS_CLIENT_HELLO: u8 = 1;
const HS_SERVER_HELLO: u8 = 2;
const HS_CERTIFICATE: u8 = 11;
const HS_SERVER_KEY_EXCHANGE: u8 = 12;
const HS_CERTIFICATE_REQUEST: u8 = 13;
const HS_SERVER_HELLO_DONE: u8 = 14;
const HS_CERTIFICATE_VERIFY: u8 = 15;
const HS_CLIENT_KEY_EXCHANGE: u8 = 16;
const HS_FINISHED: u8 = 20;

/// Per-direction TLS decoder state: partial record bytes, partial handshake
/// message bytes spanning records, and the stage flags.
#[derive(Default)]
pub struct TlsState {
    buffer: Vec<u8>,
    handshake_buffer: Vec<u8>,
    ccs_seen: bool,
    finished_reported: bool,
}

impl TlsState {
    pub fn finished(&self) -> bool {
        self.finished_reported
    }
}

type Completed = (EventType, EventData);

fn version_name(major: u8, minor: u8) -> String {
    match (major, minor) {
        (3, 0) => "SSLv3".to_string(),
        (3, 1) => "TLSv1.0".to_string(),
        (3, 2) => "TLSv1.1".to_string(),
        (3, 3) => "TLSv1.2".to_string(),
        (3, 4) => "TLSv1.3".to_string(),
        (a, b) => format!("unknown({}.{})", a, b),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn parse_client_hello(msg: &[u8]) -> Result<EventData> {
    if msg.len() < 35 {
        return Err(Error::TlsParseFailed("short client hello"));
    }
    let version = version_name(msg[0], msg[1]);
    let mut off = 34; // version + random
    let sid_len = msg[off] as usize;
    off += 1;
    if msg.len() < off + sid_len + 2 {
        return Err(Error::TlsParseFailed("short client hello"));
    }
    let session_id = hex(&msg[off..off + sid_len]);
    off += sid_len;
    let cs_len = read_u16_be(&msg[off..off + 2]) as usize;
    off += 2;
    if msg.len() < off + cs_len + 1 {
        return Err(Error::TlsParseFailed("short cipher suites"));
    }
    let cipher_suites = msg[off..off + cs_len]
        .chunks_exact(2)
        .map(read_u16_be)
        .collect();
    off += cs_len;
    let comp_len = msg[off] as usize;
    off += 1 + comp_len;

    let mut server_name = None;
    if msg.len() >= off + 2 {
        let ext_total = read_u16_be(&msg[off..off + 2]) as usize;
        off += 2;
        let end = (off + ext_total).min(msg.len());
        while off + 4 <= end {
            let ext_type = read_u16_be(&msg[off..off + 2]);
            let ext_len = read_u16_be(&msg[off + 2..off + 4]) as usize;
            off += 4;
            if off + ext_len > end {
                break;
            }
            if ext_type == 0 && ext_len >= 5 {
                // server_name list: type 0 entry carries the host name
                let data = &msg[off..off + ext_len];
                let name_len = read_u16_be(&data[3..5]) as usize;
                if data.len() >= 5 + name_len && data[2] == 0 {
                    server_name =
                        Some(String::from_utf8_lossy(&data[5..5 + name_len]).into_owned());
                }
            }
            off += ext_len;
        }
    }

    Ok(EventData::TlsClientHello {
        version,
        session_id,
        cipher_suites,
        server_name,
    })
}

fn parse_server_hello(msg: &[u8]) -> Result<EventData> {
    if msg.len() < 35 {
        return Err(Error::TlsParseFailed("short server hello"));
    }
    let version = version_name(msg[0], msg[1]);
    let mut off = 34;
    let sid_len = msg[off] as usize;
    off += 1;
    if msg.len() < off + sid_len + 2 {
        return Err(Error::TlsParseFailed("short server hello"));
    }
    let session_id = hex(&msg[off..off + sid_len]);
    off += sid_len;
    let cipher_suite = read_u16_be(&msg[off..off + 2]);
    Ok(EventData::TlsServerHello {
        version,
        session_id,
        cipher_suite,
    })
}

fn parse_certificates(msg: &[u8]) -> Result<EventData> {
    if msg.len() < 3 {
        return Err(Error::TlsParseFailed("short certificate list"));
    }
    let total = ((msg[0] as usize) << 16 | (msg[1] as usize) << 8 | msg[2] as usize).min(msg.len() - 3);
    let mut certs = Vec::new();
    let mut off = 3;
    while off + 3 <= 3 + total {
        let len = (msg[off] as usize) << 16 | (msg[off + 1] as usize) << 8 | msg[off + 2] as usize;
        off += 3;
        if off + len > msg.len() {
            break;
        }
        certs.push(msg[off..off + len].to_vec());
        off += len;
    }
    Ok(EventData::TlsCertificates { certs })
}

impl TlsState {
    fn on_handshake_message(
        &mut self,
        ht: u8,
        msg: &[u8],
        out: &mut Vec<Completed>,
    ) -> Result<()> {
        let length = msg.len() as u32;
        let generic = |t| EventData::TlsHandshake {
            handshake_type: t,
            length,
        };
        match ht {
            HS_CLIENT_HELLO => out.push((EventType::TlsClientHello, parse_client_hello(msg)?)),
            HS_SERVER_HELLO => out.push((EventType::TlsServerHello, parse_server_hello(msg)?)),
            HS_CERTIFICATE => out.push((EventType::TlsCertificates, parse_certificates(msg)?)),
            HS_SERVER_KEY_EXCHANGE => {
                out.push((EventType::TlsServerKeyExchange, generic(ht)))
            }
            HS_CERTIFICATE_REQUEST => out.push((EventType::TlsCertificateRequest, generic(ht))),
            HS_SERVER_HELLO_DONE => out.push((EventType::TlsServerHelloDone, generic(ht))),
            HS_CERTIFICATE_VERIFY => out.push((EventType::TlsCertificateVerify, generic(ht))),
            HS_CLIENT_KEY_EXCHANGE => out.push((EventType::TlsClientKeyExchange, generic(ht))),
            HS_FINISHED => out.push((EventType::TlsHandshakeFinished, generic(ht))),
            _ => out.push((EventType::TlsHandshakeGeneric, generic(ht))),
        }
        Ok(())
    }

    fn on_record(&mut self, rtype: u8, record: &[u8], out: &mut Vec<Completed>) -> Result<()> {
        match rtype {
            RECORD_CHANGE_CIPHER_SPEC => {
                self.ccs_seen = true;
                out.push((EventType::TlsChangeCipherSpec, EventData::Empty {}));
            }
            RECORD_ALERT => {}
            RECORD_HANDSHAKE => {
                if self.ccs_seen {
                    // encrypted handshake after change-cipher-spec is the
                    // Finished message; contents are opaque
                    if !self.finished_reported {
                        self.finished_reported = true;
                        out.push((
                            EventType::TlsHandshakeFinished,
                            EventData::TlsHandshake {
                                handshake_type: HS_FINISHED,
                                length: record.len() as u32,
                            },
                        ));
                    }
                    return Ok(());
                }
                self.handshake_buffer.extend_from_slice(record);
                while self.handshake_buffer.len() >= 4 {
                    let ht = self.handshake_buffer[0];
                    let len = (self.handshake_buffer[1] as usize) << 16
                        | (self.handshake_buffer[2] as usize) << 8
                        | self.handshake_buffer[3] as usize;
                    if self.handshake_buffer.len() < 4 + len {
                        break;
                    }
                    let msg: Vec<u8> = self.handshake_buffer.drain(..4 + len).collect();
                    self.on_handshake_message(ht, &msg[4..], out)?;
                }
            }
            RECORD_APPLICATION_DATA => {
                out.push((
                    EventType::TlsApplicationData,
                    EventData::TlsApplicationData {
                        length: record.len() as u32,
                    },
                ));
            }
            _ => out.push((EventType::TlsUnknown, EventData::Empty {})),
        }
        Ok(())
    }

    /// Feeds stream bytes, returning the completed stage events.
    pub fn parse(&mut self, data: &[u8]) -> Result<Vec<Completed>> {
        self.buffer.extend_from_slice(data);
        let mut out = Vec::new();
        while self.buffer.len() >= RECORD_HEADER_LEN {
            let rtype = self.buffer[0];
            let len = read_u16_be(&self.buffer[3..5]) as usize;
            if self.buffer.len() < RECORD_HEADER_LEN + len {
                break;
            }
            let record: Vec<u8> = self
                .buffer
                .drain(..RECORD_HEADER_LEN + len)
                .skip(RECORD_HEADER_LEN)
                .collect();
            self.on_record(rtype, &record, &mut out)?;
        }
        Ok(out)
    }
}

/// TLS stream processing function; also the escalation target for STARTTLS
/// style upgrades from the mail parsers.
pub fn process(
    mgr: &dyn Manager,
    _config: &AnalyzerConfig,
    tcp_ctx: &Arc<Context>,
    slice: &PduSlice,
) -> Result<()> {
    let ctx = Context::get_or_create(tcp_ctx, FlowAddress::application("tls"), || {
        ContextState::Tls(TlsState::default())
    });
    ctx.touch(slice.time);

    let (completed, newly_finished) = ctx.with_state(|s| match s {
        ContextState::Tls(tls) => {
            let before = tls.finished_reported;
            let out = tls.parse(slice.data)?;
            Ok((out, !before && tls.finished_reported))
        }
        _ => Err(Error::ContextStateMismatch),
    })?;

    for (action, data) in completed {
        mgr.handle(ctx.event(action, slice.time, slice.direction, data));
    }

    // both sides finished: the handshake is complete; the side that
    // finishes second reports it
    if newly_finished {
        let other_done = ctx
            .reverse()
            .map(|rev| {
                rev.with_state(|s| match s {
                    ContextState::Tls(tls) => tls.finished(),
                    _ => false,
                })
            })
            .unwrap_or(false);
        if other_done {
            mgr.handle(ctx.event(
                EventType::TlsHandshakeComplete,
                slice.time,
                slice.direction,
                EventData::Empty {},
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(rtype: u8, payload: &[u8]) -> Vec<u8> {
        let mut r = vec![rtype, 3, 3];
        r.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        r.extend_from_slice(payload);
        r
    }

    fn handshake(ht: u8, body: &[u8]) -> Vec<u8> {
        let mut h = vec![ht];
        h.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        h.extend_from_slice(body);
        h
    }

    fn client_hello_body(server_name: &str) -> Vec<u8> {
        let mut b = vec![3u8, 3];
        b.extend_from_slice(&[0u8; 32]); // random
        b.push(0); // no session id
        b.extend_from_slice(&4u16.to_be_bytes()); // two suites
        b.extend_from_slice(&[0x13, 0x01, 0x13, 0x02]);
        b.extend_from_slice(&[1, 0]); // null compression
        let name = server_name.as_bytes();
        let mut sni = Vec::new();
        sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        sni.push(0); // host_name
        sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni.extend_from_slice(name);
        let mut ext = Vec::new();
        ext.extend_from_slice(&0u16.to_be_bytes()); // server_name ext
        ext.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        ext.extend_from_slice(&sni);
        b.extend_from_slice(&(ext.len() as u16).to_be_bytes());
        b.extend_from_slice(&ext);
        b
    }

    #[test]
    fn client_hello_with_sni() {
        let mut tls = TlsState::default();
        let rec = record(RECORD_HANDSHAKE, &handshake(HS_CLIENT_HELLO, &client_hello_body("example.com")));
        let out = tls.parse(&rec).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, EventType::TlsClientHello);
        match &out[0].1 {
            EventData::TlsClientHello {
                version,
                cipher_suites,
                server_name,
                ..
            } => {
                assert_eq!(version, "TLSv1.2");
                assert_eq!(cipher_suites, &vec![0x1301, 0x1302]);
                assert_eq!(server_name.as_deref(), Some("example.com"));
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn records_split_across_slices() {
        let mut tls = TlsState::default();
        let rec = record(RECORD_HANDSHAKE, &handshake(HS_SERVER_HELLO_DONE, &[]));
        assert!(tls.parse(&rec[..3]).unwrap().is_empty());
        let out = tls.parse(&rec[3..]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, EventType::TlsServerHelloDone);
    }

    #[test]
    fn certificates_chain_lengths() {
        let cert_a = vec![0xAAu8; 16];
        let cert_b = vec![0xBBu8; 8];
        let mut list = Vec::new();
        for c in [&cert_a, &cert_b] {
            list.extend_from_slice(&(c.len() as u32).to_be_bytes()[1..]);
            list.extend_from_slice(c);
        }
        let mut body = Vec::new();
        body.extend_from_slice(&(list.len() as u32).to_be_bytes()[1..]);
        body.extend_from_slice(&list);

        let mut tls = TlsState::default();
        let out = tls
            .parse(&record(RECORD_HANDSHAKE, &handshake(HS_CERTIFICATE, &body)))
            .unwrap();
        match &out[0].1 {
            EventData::TlsCertificates { certs } => {
                assert_eq!(certs.len(), 2);
                assert_eq!(certs[0], cert_a);
                assert_eq!(certs[1], cert_b);
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn finished_after_ccs_then_application_data() {
        let mut tls = TlsState::default();
        let mut stream = record(RECORD_CHANGE_CIPHER_SPEC, &[1]);
        stream.extend(record(RECORD_HANDSHAKE, &[0u8; 40])); // encrypted finished
        stream.extend(record(RECORD_APPLICATION_DATA, &[0u8; 100]));
        let out = tls.parse(&stream).unwrap();
        let actions: Vec<_> = out.iter().map(|(a, _)| *a).collect();
        assert_eq!(
            actions,
            vec![
                EventType::TlsChangeCipherSpec,
                EventType::TlsHandshakeFinished,
                EventType::TlsApplicationData
            ]
        );
    }
}
