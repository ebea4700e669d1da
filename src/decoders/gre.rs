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

use std::sync::Arc;

use super::ip;
use crate::common::address::FlowAddress;
use crate::common::pdu::PduSlice;
use crate::config::AnalyzerConfig;
use crate::context::{Context, ContextState};
use crate::engine::Manager;
use crate::error::{Error, Result};
use crate::event::{EventData, EventType};
use crate::utils::bytes::{read_u16_be, read_u32_be};

const GRE_BASE_HEADER_LEN: usize = 4;

const FLAG_CHECKSUM: u8 = 0x80;
const FLAG_KEY: u8 = 0x20;
const FLAG_SEQUENCE: u8 = 0x10;
const FLAG_PPTP_ACK: u8 = 0x80;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;

/// GRE decapsulation. Plain version-0 tunnels carrying IP re-enter the IP
/// dispatch against the root, so the inner flow gets its own context tree;
/// anything else is reported as a GRE event. Version 1 is the PPTP variant.
pub fn process(
    mgr: &dyn Manager,
    config: &AnalyzerConfig,
    ip_ctx: &Arc<Context>,
    slice: &PduSlice,
) -> Result<()> {
    let data = slice.data;
    if data.len() < GRE_BASE_HEADER_LEN {
        return Err(Error::Truncated("gre"));
    }
    let flags = data[0];
    let version = data[1] & 0x07;
    let proto = read_u16_be(&data[2..4]);

    if version == 1 {
        return process_pptp(mgr, ip_ctx, slice, flags);
    }

    let mut offset = GRE_BASE_HEADER_LEN;
    let mut key = None;
    let mut sequence_no = None;
    if flags & FLAG_CHECKSUM != 0 {
        offset += 4;
    }
    if flags & FLAG_KEY != 0 {
        if data.len() < offset + 4 {
            return Err(Error::Truncated("gre"));
        }
        key = Some(read_u32_be(&data[offset..offset + 4]));
        offset += 4;
    }
    if flags & FLAG_SEQUENCE != 0 {
        if data.len() < offset + 4 {
            return Err(Error::Truncated("gre"));
        }
        sequence_no = Some(read_u32_be(&data[offset..offset + 4]));
        offset += 4;
    }
    if data.len() < offset {
        return Err(Error::Truncated("gre"));
    }
    let payload = &data[offset..];

    match proto {
        ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => {
            // decapsulate against the root so the inner flow is a sibling
            // tree, not a child of the outer tunnel flow
            let top = match ip_ctx.parent() {
                Some(p) => p,
                None => return Ok(()),
            };
            ip::process(mgr, config, &top, &slice.narrow(payload))
        }
        _ => {
            let ctx = Context::get_or_create(ip_ctx, FlowAddress::application("gre"), || {
                ContextState::Gre
            });
            ctx.touch(slice.time);
            mgr.handle(ctx.event(
                EventType::GreMessage,
                slice.time,
                slice.direction,
                EventData::Gre {
                    next_proto: proto,
                    key,
                    sequence_no,
                    payload: payload.to_vec(),
                },
            ));
            Ok(())
        }
    }
}

fn process_pptp(
    mgr: &dyn Manager,
    ip_ctx: &Arc<Context>,
    slice: &PduSlice,
    flags: u8,
) -> Result<()> {
    let data = slice.data;
    if data.len() < 8 {
        return Err(Error::Truncated("gre pptp"));
    }
    let payload_length = read_u16_be(&data[4..6]);
    let call_id = read_u16_be(&data[6..8]);
    let mut offset = 8;
    let mut sequence_no = None;
    let mut ack_no = None;
    if flags & FLAG_SEQUENCE != 0 {
        if data.len() < offset + 4 {
            return Err(Error::Truncated("gre pptp"));
        }
        sequence_no = Some(read_u32_be(&data[offset..offset + 4]));
        offset += 4;
    }
    if data[1] & FLAG_PPTP_ACK != 0 {
        if data.len() < offset + 4 {
            return Err(Error::Truncated("gre pptp"));
        }
        ack_no = Some(read_u32_be(&data[offset..offset + 4]));
    }

    let ctx =
        Context::get_or_create(ip_ctx, FlowAddress::application("gre"), || ContextState::Gre);
    ctx.touch(slice.time);
    mgr.handle(ctx.event(
        EventType::GrePptpMessage,
        slice.time,
        slice.direction,
        EventData::GrePptp {
            call_id,
            payload_length,
            sequence_no,
            ack_no,
        },
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::common::enums::Direction;
    use crate::decoders::ip4::tests::ip4_packet;
    use crate::event::Event;

    struct Collect(Mutex<Vec<Event>>);
    impl Manager for Collect {
        fn handle(&self, e: Event) {
            self.0.lock().unwrap().push(e);
        }
    }

    #[test]
    fn plain_gre_decapsulates_inner_ip() {
        // inner: icmp echo inside ipv4, wrapped in gre, wrapped in outer ipv4
        let inner_icmp = [8u8, 0, 0, 0, 0, 1, 0, 1, 0xde, 0xad];
        let inner = ip4_packet([10, 0, 0, 1], [10, 0, 0, 2], 1, 5, 0, &inner_icmp);
        let mut gre = vec![0u8, 0, 0x08, 0x00];
        gre.extend_from_slice(&inner);
        let outer = ip4_packet([192, 168, 0, 1], [192, 168, 0, 2], 47, 6, 0, &gre);

        let root = Context::root("d", "n");
        let sink = Collect(Mutex::new(Vec::new()));
        let slice = PduSlice::new(&outer, Duration::from_secs(1), Direction::NotKnown);
        crate::decoders::ip::process(&sink, &AnalyzerConfig::default(), &root, &slice).unwrap();

        let events = sink.0.into_inner().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, EventType::Icmp);
        // the inner flow hangs off the root, next to the outer tunnel flow
        assert_eq!(root.child_count(), 2);
    }

    #[test]
    fn unknown_gre_payload_reported() {
        let mut gre = vec![0x20u8, 0, 0x88, 0xbe]; // key present, erspan
        gre.extend_from_slice(&[0, 0, 0, 42]);
        gre.extend_from_slice(&[1, 2, 3]);
        let outer = ip4_packet([1, 1, 1, 1], [2, 2, 2, 2], 47, 6, 0, &gre);

        let root = Context::root("d", "n");
        let sink = Collect(Mutex::new(Vec::new()));
        let slice = PduSlice::new(&outer, Duration::from_secs(1), Direction::NotKnown);
        crate::decoders::ip::process(&sink, &AnalyzerConfig::default(), &root, &slice).unwrap();

        let events = sink.0.into_inner().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, EventType::GreMessage);
        match &events[0].data {
            EventData::Gre { key, payload, .. } => {
                assert_eq!(*key, Some(42));
                assert_eq!(payload, &vec![1, 2, 3]);
            }
            _ => panic!("wrong payload"),
        }
    }
}
