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

use std::collections::HashSet;
use std::sync::Arc;

use super::reassembly::ReassemblyTable;
use super::{esp, gre, icmp, ip4, ip6, tcp, udp};
use crate::common::enums::IpProtocol;
use crate::common::pdu::PduSlice;
use crate::config::AnalyzerConfig;
use crate::context::Context;
use crate::engine::Manager;
use crate::error::{Error, Result};
use crate::event::{EventData, EventType};

/// Decoder state of an IP flow context, shared by the v4 and v6 variants:
/// pending fragment reassemblies plus the RTP port hints gathered from SDP
/// bodies on flows below this one.
#[derive(Debug, Default)]
pub struct IpState {
    pub reassembly: ReassemblyTable,
    pub rtp_hints: HashSet<u16>,
}

/// Works out the IP version and calls the appropriate decoder.
pub fn process(
    mgr: &dyn Manager,
    config: &AnalyzerConfig,
    root: &Arc<Context>,
    slice: &PduSlice,
) -> Result<()> {
    let first = *slice.data.first().ok_or(Error::Truncated("ip"))?;
    match first >> 4 {
        4 => ip4::process(mgr, config, root, slice),
        6 => ip6::process(mgr, config, root, slice),
        v => Err(Error::InvalidIpVersion(v)),
    }
}

/// Next-protocol dispatch shared by the v4/v6 decoders and GRE decap.
/// `proto` is the raw wire value so unrecognised protocols are reported
/// verbatim; unknown is never fatal.
pub fn dispatch_transport(
    mgr: &dyn Manager,
    config: &AnalyzerConfig,
    ip_ctx: &Arc<Context>,
    proto: u8,
    slice: &PduSlice,
) -> Result<()> {
    match IpProtocol::try_from(proto).unwrap_or_default() {
        IpProtocol::Tcp => tcp::process(mgr, config, ip_ctx, slice),
        IpProtocol::Udp => udp::process(mgr, config, ip_ctx, slice),
        IpProtocol::Icmpv4 | IpProtocol::Icmpv6 => icmp::process(mgr, config, ip_ctx, slice),
        IpProtocol::Gre => gre::process(mgr, config, ip_ctx, slice),
        IpProtocol::Esp => esp::process(mgr, config, ip_ctx, slice),
        IpProtocol::NoNextHeader => Ok(()),
        _ => {
            mgr.handle(ip_ctx.event(
                EventType::UnrecognisedIpProtocol,
                slice.time,
                slice.direction,
                EventData::UnrecognisedIpProtocol {
                    protocol: proto,
                    payload_length: slice.len() as u32,
                },
            ));
            Ok(())
        }
    }
}

/// Registers an RTP port hint on the nearest IP ancestor of `ctx`, so UDP
/// dispatch can recognize media flows negotiated over SDP.
pub fn add_rtp_hint(ctx: &Arc<Context>, port: u16) {
    let mut cur = Some(ctx.clone());
    while let Some(c) = cur {
        let is_ip = matches!(
            c.addr.layer(),
            crate::common::address::Layer::Ip4 | crate::common::address::Layer::Ip6
        );
        if is_ip {
            c.with_state(|s| {
                if let crate::context::ContextState::Ip4(ip) | crate::context::ContextState::Ip6(ip) = s
                {
                    ip.rtp_hints.insert(port);
                }
            });
            // the reverse direction will carry media too
            if let Some(rev) = c.reverse() {
                rev.with_state(|s| {
                    if let crate::context::ContextState::Ip4(ip)
                    | crate::context::ContextState::Ip6(ip) = s
                    {
                        ip.rtp_hints.insert(port);
                    }
                });
            }
            return;
        }
        cur = c.parent();
    }
}

/// True when `port` was hinted as RTP on the IP context.
pub fn has_rtp_hint(ip_ctx: &Arc<Context>, port: u16) -> bool {
    ip_ctx.with_state(|s| {
        if let crate::context::ContextState::Ip4(ip) | crate::context::ContextState::Ip6(ip) = s {
            ip.rtp_hints.contains(&port)
        } else {
            false
        }
    })
}
