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
use crate::common::address::{Address, FlowAddress};
use crate::common::pdu::PduSlice;
use crate::config::AnalyzerConfig;
use crate::context::{Context, ContextState};
use crate::engine::Manager;
use crate::error::{Error, Result};
use crate::event::{EventData, EventType};
use crate::parsers::{dns, ntp, rtp, sip};
use crate::utils::bytes::read_u16_be;

const UDP_HEADER_LEN: usize = 8;

const DNS_PORT: u16 = 53;
const NTP_PORT: u16 = 123;
const SIP_PORT: u16 = 5060;

/// UDP is stateless per packet: resolve the flow context, then dispatch the
/// datagram by port to the matching parser. Ports negotiated through SDP are
/// recognized via the RTP hints on the IP context.
pub fn process(
    mgr: &dyn Manager,
    config: &AnalyzerConfig,
    ip_ctx: &Arc<Context>,
    slice: &PduSlice,
) -> Result<()> {
    let data = slice.data;
    if data.len() < UDP_HEADER_LEN {
        return Err(Error::Truncated("udp"));
    }
    let src_port = read_u16_be(&data[0..2]);
    let dst_port = read_u16_be(&data[2..4]);
    let length = (read_u16_be(&data[4..6]) as usize).clamp(UDP_HEADER_LEN, data.len());

    let ctx = Context::get_or_create(
        ip_ctx,
        FlowAddress::new(Address::udp_port(src_port), Address::udp_port(dst_port)),
        || ContextState::Udp,
    );
    ctx.touch(slice.time);

    let payload = slice.narrow(&data[UDP_HEADER_LEN..length]);

    if src_port == DNS_PORT || dst_port == DNS_PORT {
        return dns::process_datagram(mgr, config, &ctx, &payload);
    }
    if src_port == NTP_PORT || dst_port == NTP_PORT {
        return ntp::process(mgr, config, &ctx, &payload);
    }
    if src_port == SIP_PORT || dst_port == SIP_PORT {
        return sip::process(mgr, config, &ctx, &payload);
    }
    if ip::has_rtp_hint(ip_ctx, dst_port) || ip::has_rtp_hint(ip_ctx, src_port) {
        return rtp::process(mgr, config, &ctx, &payload);
    }

    mgr.handle(ctx.event(
        EventType::UnrecognisedDatagram,
        slice.time,
        slice.direction,
        EventData::Payload {
            payload: payload.data.to_vec(),
        },
    ));
    Ok(())
}
