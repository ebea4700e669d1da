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

//! DNS message decoding: header, questions and resource records with name
//! compression. Datagrams carry one message; over TCP each message is
//! preceded by a two-byte length.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use crate::common::address::FlowAddress;
use crate::common::pdu::PduSlice;
use crate::config::AnalyzerConfig;
use crate::context::{Context, ContextState};
use crate::engine::Manager;
use crate::error::{Error, Result};
use crate::event::{DnsAnswer, DnsHeader, DnsQuery, EventData, EventType};
use crate::utils::bytes::{read_u16_be, read_u32_be};

const DNS_HEADER_LEN: usize = 12;
const MAX_NAME_JUMPS: usize = 16;

const TYPE_A: u16 = 1;
const TYPE_NS: u16 = 2;
const TYPE_CNAME: u16 = 5;
const TYPE_SOA: u16 = 6;
const TYPE_PTR: u16 = 12;
const TYPE_MX: u16 = 15;
const TYPE_TXT: u16 = 16;
const TYPE_AAAA: u16 = 28;

/// Stream framing state for DNS over TCP.
#[derive(Debug, Default)]
pub struct DnsState {
    buffer: Vec<u8>,
}

/// Reads a possibly-compressed name starting at `off`. Returns the name and
/// the offset just past it in the uncompressed stream.
fn read_name(msg: &[u8], off: usize) -> Result<(String, usize)> {
    let mut name = String::new();
    let mut pos = off;
    let mut end = None;
    let mut jumps = 0;
    loop {
        let len = *msg.get(pos).ok_or(Error::DnsParseFailed("name overrun"))? as usize;
        if len & 0xc0 == 0xc0 {
            let b2 = *msg
                .get(pos + 1)
                .ok_or(Error::DnsParseFailed("pointer overrun"))? as usize;
            if end.is_none() {
                end = Some(pos + 2);
            }
            pos = (len & 0x3f) << 8 | b2;
            jumps += 1;
            if jumps > MAX_NAME_JUMPS {
                return Err(Error::DnsParseFailed("compression loop"));
            }
            continue;
        }
        if len == 0 {
            pos += 1;
            break;
        }
        let label = msg
            .get(pos + 1..pos + 1 + len)
            .ok_or(Error::DnsParseFailed("label overrun"))?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
        pos += 1 + len;
    }
    Ok((name, end.unwrap_or(pos)))
}

fn decode_rdata(msg: &[u8], rtype: u16, rdata_off: usize, rdata_len: usize) -> Result<String> {
    let rdata = msg
        .get(rdata_off..rdata_off + rdata_len)
        .ok_or(Error::DnsParseFailed("rdata overrun"))?;
    let s = match rtype {
        TYPE_A if rdata.len() == 4 => {
            Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]).to_string()
        }
        TYPE_AAAA if rdata.len() == 16 => {
            Ipv6Addr::from(<[u8; 16]>::try_from(rdata).unwrap()).to_string()
        }
        TYPE_NS | TYPE_CNAME | TYPE_PTR => read_name(msg, rdata_off)?.0,
        TYPE_MX if rdata.len() > 2 => {
            let pref = read_u16_be(&rdata[0..2]);
            let (name, _) = read_name(msg, rdata_off + 2)?;
            format!("{} {}", pref, name)
        }
        TYPE_SOA => {
            let (mname, off) = read_name(msg, rdata_off)?;
            let (rname, off) = read_name(msg, off)?;
            let serial = msg
                .get(off..off + 4)
                .map(read_u32_be)
                .unwrap_or_default();
            format!("{} {} {}", mname, rname, serial)
        }
        TYPE_TXT => String::from_utf8_lossy(rdata).into_owned(),
        _ => rdata.iter().map(|b| format!("{:02x}", b)).collect(),
    };
    Ok(s)
}

fn read_rrs(msg: &[u8], mut off: usize, count: u16) -> Result<(Vec<DnsAnswer>, usize)> {
    let mut rrs = Vec::new();
    for _ in 0..count {
        let (name, next) = read_name(msg, off)?;
        off = next;
        let fixed = msg
            .get(off..off + 10)
            .ok_or(Error::DnsParseFailed("rr overrun"))?;
        let rtype = read_u16_be(&fixed[0..2]);
        let rclass = read_u16_be(&fixed[2..4]);
        let ttl = read_u32_be(&fixed[4..8]);
        let rdata_len = read_u16_be(&fixed[8..10]) as usize;
        off += 10;
        let rdata = decode_rdata(msg, rtype, off, rdata_len)?;
        off += rdata_len;
        rrs.push(DnsAnswer {
            name,
            rtype,
            rclass,
            ttl,
            rdata,
        });
    }
    Ok((rrs, off))
}

/// Decodes one complete DNS message into an event payload.
pub fn parse_message(msg: &[u8]) -> Result<EventData> {
    if msg.len() < DNS_HEADER_LEN {
        return Err(Error::DnsParseFailed("short header"));
    }
    let flags = read_u16_be(&msg[2..4]);
    let header = DnsHeader {
        id: read_u16_be(&msg[0..2]),
        qr: flags & 0x8000 != 0,
        opcode: ((flags >> 11) & 0x0f) as u8,
        authoritative: flags & 0x0400 != 0,
        truncated: flags & 0x0200 != 0,
        recursion_desired: flags & 0x0100 != 0,
        recursion_available: flags & 0x0080 != 0,
        rcode: (flags & 0x000f) as u8,
    };
    let qdcount = read_u16_be(&msg[4..6]);
    let ancount = read_u16_be(&msg[6..8]);
    let nscount = read_u16_be(&msg[8..10]);
    let arcount = read_u16_be(&msg[10..12]);

    let mut off = DNS_HEADER_LEN;
    let mut queries = Vec::new();
    for _ in 0..qdcount {
        let (name, next) = read_name(msg, off)?;
        let fixed = msg
            .get(next..next + 4)
            .ok_or(Error::DnsParseFailed("question overrun"))?;
        queries.push(DnsQuery {
            name,
            qtype: read_u16_be(&fixed[0..2]),
            qclass: read_u16_be(&fixed[2..4]),
        });
        off = next + 4;
    }
    let (answers, off) = read_rrs(msg, off, ancount)?;
    let (authorities, off) = read_rrs(msg, off, nscount)?;
    let (additional, _) = read_rrs(msg, off, arcount)?;

    Ok(EventData::Dns {
        header,
        queries,
        answers,
        authorities,
        additional,
    })
}

fn dns_context(parent: &Arc<Context>) -> Arc<Context> {
    Context::get_or_create(parent, FlowAddress::application("dns"), || {
        ContextState::Dns(DnsState::default())
    })
}

/// One datagram, one message.
pub fn process_datagram(
    mgr: &dyn Manager,
    _config: &AnalyzerConfig,
    udp_ctx: &Arc<Context>,
    slice: &PduSlice,
) -> Result<()> {
    let ctx = dns_context(udp_ctx);
    ctx.touch(slice.time);
    let data = parse_message(slice.data)?;
    mgr.handle(ctx.event(EventType::DnsMessage, slice.time, slice.direction, data));
    Ok(())
}

/// DNS over TCP: two-byte length frames, possibly split or batched across
/// segments.
pub fn process_stream(
    mgr: &dyn Manager,
    _config: &AnalyzerConfig,
    tcp_ctx: &Arc<Context>,
    slice: &PduSlice,
) -> Result<()> {
    let ctx = dns_context(tcp_ctx);
    ctx.touch(slice.time);

    let messages = ctx.with_state(|s| match s {
        ContextState::Dns(dns) => {
            dns.buffer.extend_from_slice(slice.data);
            let mut msgs = Vec::new();
            loop {
                if dns.buffer.len() < 2 {
                    break;
                }
                let len = read_u16_be(&dns.buffer[0..2]) as usize;
                if dns.buffer.len() < 2 + len {
                    break;
                }
                let frame: Vec<u8> = dns.buffer.drain(..2 + len).skip(2).collect();
                msgs.push(frame);
            }
            Ok(msgs)
        }
        _ => Err(Error::ContextStateMismatch),
    })?;

    for msg in messages {
        let data = parse_message(&msg)?;
        mgr.handle(ctx.event(EventType::DnsMessage, slice.time, slice.direction, data));
    }
    Ok(())
}
