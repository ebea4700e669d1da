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

use std::net::Ipv4Addr;
use std::sync::Arc;

use super::ip::{self, IpState};
use crate::common::address::{Address, FlowAddress};
use crate::common::pdu::PduSlice;
use crate::config::AnalyzerConfig;
use crate::context::{Context, ContextState};
use crate::engine::Manager;
use crate::error::{Error, Result};
use crate::utils::bytes::{ones_complement_sum, read_u16_be};

const IP4_MIN_HEADER_LEN: usize = 20;
const FLAG_MORE_FRAGMENTS: u16 = 0x2000;
const FRAG_OFFSET_MASK: u16 = 0x1fff;

/// IPv4 decoding: header validation, fragment reassembly, next-protocol
/// dispatch. Intact packets go straight through; fragments pass through the
/// flow context's hole-list reassembler first.
pub fn process(
    mgr: &dyn Manager,
    config: &AnalyzerConfig,
    parent: &Arc<Context>,
    slice: &PduSlice,
) -> Result<()> {
    let data = slice.data;
    if data.len() < IP4_MIN_HEADER_LEN {
        return Err(Error::Truncated("ip4"));
    }
    if data[0] >> 4 != 4 {
        return Err(Error::InvalidIpVersion(data[0] >> 4));
    }
    let header_len = ((data[0] & 0x0f) as usize) * 4;
    if header_len < IP4_MIN_HEADER_LEN || data.len() < header_len {
        return Err(Error::Truncated("ip4"));
    }
    if ones_complement_sum(&data[..header_len]) != 0xffff {
        return Err(Error::ChecksumMismatch);
    }

    let total_len = (read_u16_be(&data[2..4]) as usize).clamp(header_len, data.len());
    let id = read_u16_be(&data[4..6]);
    let frag_field = read_u16_be(&data[6..8]);
    let proto = data[9];
    let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
    let dst = Ipv4Addr::new(data[16], data[17], data[18], data[19]);

    let ctx = Context::get_or_create(
        parent,
        FlowAddress::new(Address::ipv4(src), Address::ipv4(dst)),
        || ContextState::Ip4(IpState::default()),
    );
    ctx.touch(slice.time);

    let payload = &data[header_len..total_len];
    let more = frag_field & FLAG_MORE_FRAGMENTS != 0;
    let offset = ((frag_field & FRAG_OFFSET_MASK) as u64) * 8;

    if more || offset > 0 {
        let complete = ctx.with_state(|s| match s {
            ContextState::Ip4(ip) => Ok(ip.reassembly.add_fragment(
                (proto, id as u32),
                offset,
                more,
                payload,
                config.max_frag_list_len,
            )),
            _ => Err(Error::ContextStateMismatch),
        })?;
        if let Some(datagram) = complete {
            let inner = slice.narrow(&datagram);
            return ip::dispatch_transport(mgr, config, &ctx, proto, &inner);
        }
        return Ok(());
    }

    ip::dispatch_transport(mgr, config, &ctx, proto, &slice.narrow(payload))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::common::enums::Direction;
    use crate::event::{Event, EventType};

    pub(crate) fn checksum_fix(header: &mut [u8]) {
        header[10] = 0;
        header[11] = 0;
        let sum = !ones_complement_sum(header);
        header[10..12].copy_from_slice(&sum.to_be_bytes());
    }

    pub(crate) fn ip4_packet(
        src: [u8; 4],
        dst: [u8; 4],
        proto: u8,
        id: u16,
        frag_field: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let total = 20 + payload.len();
        let mut p = vec![0u8; 20];
        p[0] = 0x45;
        p[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        p[4..6].copy_from_slice(&id.to_be_bytes());
        p[6..8].copy_from_slice(&frag_field.to_be_bytes());
        p[8] = 64;
        p[9] = proto;
        p[12..16].copy_from_slice(&src);
        p[16..20].copy_from_slice(&dst);
        checksum_fix(&mut p[..20]);
        p.extend_from_slice(payload);
        p
    }

    struct Collect(Mutex<Vec<Event>>);
    impl Manager for Collect {
        fn handle(&self, e: Event) {
            self.0.lock().unwrap().push(e);
        }
    }

    fn run(packets: &[Vec<u8>]) -> (Arc<Context>, Vec<Event>) {
        let root = Context::root("d", "n");
        let config = AnalyzerConfig::default();
        let sink = Collect(Mutex::new(Vec::new()));
        for p in packets {
            let slice = PduSlice::new(p, Duration::from_secs(1), Direction::NotKnown);
            process(&sink, &config, &root, &slice).unwrap();
        }
        (root, sink.0.into_inner().unwrap())
    }

    #[test]
    fn checksum_is_enforced() {
        let mut p = ip4_packet([1, 1, 1, 1], [2, 2, 2, 2], 1, 1, 0, &[8, 0, 0, 0]);
        p[10] ^= 0xff;
        let root = Context::root("d", "n");
        let config = AnalyzerConfig::default();
        struct Null;
        impl Manager for Null {
            fn handle(&self, _: Event) {}
        }
        let slice = PduSlice::new(&p, Duration::from_secs(1), Direction::NotKnown);
        assert!(matches!(
            process(&Null, &config, &root, &slice),
            Err(Error::ChecksumMismatch)
        ));
    }

    #[test]
    fn unknown_protocol_reported() {
        let p = ip4_packet([1, 1, 1, 1], [2, 2, 2, 2], 132, 1, 0, &[0u8; 4]);
        let (_, events) = run(&[p]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, EventType::UnrecognisedIpProtocol);
    }

    #[test]
    fn fragments_out_of_order_reassemble() {
        // ICMP echo split in three, delivered 3-1-2
        let mut icmp = vec![8u8, 0, 0, 0, 0, 1, 0, 1];
        icmp.extend((0u8..40).collect::<Vec<_>>());
        let f1 = ip4_packet(
            [1, 1, 1, 1],
            [2, 2, 2, 2],
            1,
            99,
            FLAG_MORE_FRAGMENTS,
            &icmp[..16],
        );
        let f2 = ip4_packet(
            [1, 1, 1, 1],
            [2, 2, 2, 2],
            1,
            99,
            FLAG_MORE_FRAGMENTS | 2, // offset 16 bytes
            &icmp[16..32],
        );
        let f3 = ip4_packet([1, 1, 1, 1], [2, 2, 2, 2], 1, 99, 4, &icmp[32..]);
        let (_, events) = run(&[f3, f1, f2]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, EventType::Icmp);
        match &events[0].data {
            crate::event::EventData::Icmp { payload, .. } => {
                assert_eq!(payload, &icmp[8..]);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn missing_fragment_no_delivery() {
        let mut icmp = vec![8u8, 0, 0, 0, 0, 1, 0, 1];
        icmp.extend(vec![0u8; 40]);
        let f1 = ip4_packet(
            [1, 1, 1, 1],
            [2, 2, 2, 2],
            1,
            7,
            FLAG_MORE_FRAGMENTS,
            &icmp[..16],
        );
        let f3 = ip4_packet([1, 1, 1, 1], [2, 2, 2, 2], 1, 7, 4, &icmp[32..]);
        let (_, events) = run(&[f1, f3]);
        assert!(events.is_empty());
    }
}
