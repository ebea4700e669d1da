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

use log::debug;

use super::ip;
use crate::common::enums::LinkType;
use crate::common::pdu::PduSlice;
use crate::config::AnalyzerConfig;
use crate::context::Context;
use crate::engine::Manager;
use crate::error::{Error, Result};
use crate::utils::bytes::read_u16_be;

const ETH_HEADER_LEN: usize = 14;
const SLL_HEADER_LEN: usize = 16;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88a8;

/// Link-layer entry of the pipeline: strips the configured link framing and
/// routes the inner packet into the IP decoders. Non-IP ethertypes are
/// dropped quietly; the flow of interest is the IP stack above.
pub fn process(
    mgr: &dyn Manager,
    config: &AnalyzerConfig,
    root: &Arc<Context>,
    slice: &PduSlice,
) -> Result<()> {
    match config.link_type {
        LinkType::Ethernet => process_ethernet(mgr, config, root, slice),
        LinkType::LinuxSLL => {
            if slice.len() < SLL_HEADER_LEN {
                return Err(Error::Truncated("sll"));
            }
            let proto = read_u16_be(&slice.data[14..16]);
            dispatch_ethertype(mgr, config, root, proto, slice, SLL_HEADER_LEN)
        }
        LinkType::Null | LinkType::Raw | LinkType::Ipv4 | LinkType::Ipv6 => {
            ip::process(mgr, config, root, slice)
        }
    }
}

fn process_ethernet(
    mgr: &dyn Manager,
    config: &AnalyzerConfig,
    root: &Arc<Context>,
    slice: &PduSlice,
) -> Result<()> {
    if slice.len() < ETH_HEADER_LEN {
        return Err(Error::Truncated("ethernet"));
    }
    let mut ethertype = read_u16_be(&slice.data[12..14]);
    let mut offset = ETH_HEADER_LEN;
    // unwrap up to two VLAN tags
    for _ in 0..2 {
        if ethertype != ETHERTYPE_VLAN && ethertype != ETHERTYPE_QINQ {
            break;
        }
        if slice.len() < offset + 4 {
            return Err(Error::Truncated("vlan"));
        }
        ethertype = read_u16_be(&slice.data[offset + 2..offset + 4]);
        offset += 4;
    }
    dispatch_ethertype(mgr, config, root, ethertype, slice, offset)
}

fn dispatch_ethertype(
    mgr: &dyn Manager,
    config: &AnalyzerConfig,
    root: &Arc<Context>,
    ethertype: u16,
    slice: &PduSlice,
    offset: usize,
) -> Result<()> {
    let inner = slice.narrow(&slice.data[offset..]);
    match ethertype {
        ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => ip::process(mgr, config, root, &inner),
        other => {
            debug!("ignoring non-ip ethertype {:#06x}", other);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vlan_tags_are_unwrapped() {
        // 802.1Q tag followed by an ipv4 ethertype; payload intentionally
        // too short for the ip layer so the error names the ip4 header
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x64]); // vlan 100
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        frame.extend_from_slice(&[0x45, 0x00]);

        let root = Context::root("d", "n");
        let config = AnalyzerConfig::default();
        let slice = PduSlice::new(
            &frame,
            std::time::Duration::from_secs(1),
            crate::common::enums::Direction::NotKnown,
        );
        struct NullSink;
        impl Manager for NullSink {
            fn handle(&self, _: crate::event::Event) {}
        }
        let err = process(&NullSink, &config, &root, &slice).unwrap_err();
        assert!(matches!(err, Error::Truncated("ip4")));
    }
}
