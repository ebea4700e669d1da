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

use std::net::Ipv6Addr;
use std::sync::Arc;

use super::ip::{self, IpState};
use crate::common::address::{Address, FlowAddress};
use crate::common::enums::IpProtocol;
use crate::common::pdu::PduSlice;
use crate::config::AnalyzerConfig;
use crate::context::{Context, ContextState};
use crate::engine::Manager;
use crate::error::{Error, Result};
use crate::utils::bytes::{read_u16_be, read_u32_be};

const IP6_HEADER_LEN: usize = 40;
const FRAGMENT_HEADER_LEN: usize = 8;

/// IPv6 decoding: walks the extension-header chain to the final next-header
/// value, reassembling through the Fragment extension when present, then
/// dispatches like the v4 path.
pub fn process(
    mgr: &dyn Manager,
    config: &AnalyzerConfig,
    parent: &Arc<Context>,
    slice: &PduSlice,
) -> Result<()> {
    let data = slice.data;
    if data.len() < IP6_HEADER_LEN {
        return Err(Error::Truncated("ip6"));
    }
    if data[0] >> 4 != 6 {
        return Err(Error::InvalidIpVersion(data[0] >> 4));
    }
    let payload_len = read_u16_be(&data[4..6]) as usize;
    let end = (IP6_HEADER_LEN + payload_len).min(data.len());
    let src = Ipv6Addr::from(<[u8; 16]>::try_from(&data[8..24]).unwrap());
    let dst = Ipv6Addr::from(<[u8; 16]>::try_from(&data[24..40]).unwrap());

    let ctx = Context::get_or_create(
        parent,
        FlowAddress::new(Address::ipv6(src), Address::ipv6(dst)),
        || ContextState::Ip6(IpState::default()),
    );
    ctx.touch(slice.time);

    let mut next = data[6];
    let mut offset = IP6_HEADER_LEN;

    // extension headers are (next, len-in-8-octets-minus-1) framed
    while IpProtocol::try_from(next)
        .unwrap_or_default()
        .is_ipv6_extension()
    {
        if end < offset + 2 {
            return Err(Error::Truncated("ip6 extension"));
        }
        let ext_len = if IpProtocol::Ah == next {
            // AH counts in 4-octet units
            (data[offset + 1] as usize + 2) * 4
        } else {
            (data[offset + 1] as usize + 1) * 8
        };
        if end < offset + ext_len {
            return Err(Error::Truncated("ip6 extension"));
        }
        next = data[offset];
        offset += ext_len;
    }

    if IpProtocol::Ipv6Fragment == next {
        if end < offset + FRAGMENT_HEADER_LEN {
            return Err(Error::Truncated("ip6 fragment"));
        }
        let inner_next = data[offset];
        let frag_field = read_u16_be(&data[offset + 2..offset + 4]);
        let id = read_u32_be(&data[offset + 4..offset + 8]);
        let frag_offset = ((frag_field >> 3) as u64) * 8;
        let more = frag_field & 0x0001 != 0;
        let payload = &data[offset + FRAGMENT_HEADER_LEN..end];

        let complete = ctx.with_state(|s| match s {
            ContextState::Ip6(ip) => Ok(ip.reassembly.add_fragment(
                (inner_next, id),
                frag_offset,
                more,
                payload,
                config.max_frag_list_len,
            )),
            _ => Err(Error::ContextStateMismatch),
        })?;
        if let Some(datagram) = complete {
            let inner = slice.narrow(&datagram);
            return ip::dispatch_transport(mgr, config, &ctx, inner_next, &inner);
        }
        return Ok(());
    }

    ip::dispatch_transport(mgr, config, &ctx, next, &slice.narrow(&data[offset..end]))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::common::enums::Direction;
    use crate::event::{Event, EventType};

    fn ip6_packet(next: u8, payload: &[u8]) -> Vec<u8> {
        let mut p = vec![0u8; 40];
        p[0] = 0x60;
        p[4..6].copy_from_slice(&(payload.len() as u16).to_be_bytes());
        p[6] = next;
        p[7] = 64;
        p[23] = 1; // src ::1 variant
        p[39] = 2;
        p.extend_from_slice(payload);
        p
    }

    struct Collect(Mutex<Vec<Event>>);
    impl Manager for Collect {
        fn handle(&self, e: Event) {
            self.0.lock().unwrap().push(e);
        }
    }

    #[test]
    fn hop_by_hop_chain_is_walked() {
        // hop-by-hop header (8 bytes) fronting an unknown final protocol
        let mut payload = vec![132u8, 0, 0, 0, 0, 0, 0, 0];
        payload.extend_from_slice(&[1, 2, 3, 4]);
        let p = ip6_packet(0, &payload);
        let root = Context::root("d", "n");
        let sink = Collect(Mutex::new(Vec::new()));
        let slice = PduSlice::new(&p, Duration::from_secs(1), Direction::NotKnown);
        process(&sink, &AnalyzerConfig::default(), &root, &slice).unwrap();
        let events = sink.0.into_inner().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, EventType::UnrecognisedIpProtocol);
        match events[0].data {
            crate::event::EventData::UnrecognisedIpProtocol { protocol, .. } => {
                assert_eq!(protocol, 132)
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn fragment_extension_reassembles() {
        let icmp: Vec<u8> = {
            let mut v = vec![128u8, 0, 0, 0];
            v.extend(vec![0u8; 28]);
            v
        };
        let frag_hdr = |off_units: u16, more: bool, id: u32| {
            let mut h = vec![58u8, 0];
            h.extend_from_slice(&((off_units << 3) | more as u16).to_be_bytes());
            h.extend_from_slice(&id.to_be_bytes());
            h
        };
        let mut pl1 = frag_hdr(0, true, 9);
        pl1.extend_from_slice(&icmp[..16]);
        let mut pl2 = frag_hdr(2, false, 9);
        pl2.extend_from_slice(&icmp[16..]);

        let p1 = ip6_packet(44, &pl1);
        let p2 = ip6_packet(44, &pl2);
        let root = Context::root("d", "n");
        let sink = Collect(Mutex::new(Vec::new()));
        for p in [p1, p2] {
            let slice = PduSlice::new(&p, Duration::from_secs(1), Direction::NotKnown);
            process(&sink, &AnalyzerConfig::default(), &root, &slice).unwrap();
        }
        let events = sink.0.into_inner().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, EventType::Icmp);
    }
}
