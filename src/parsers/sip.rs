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

//! SIP signalling: request/response decoding per datagram, plus SDP media
//! port extraction. Negotiated media ports become RTP hints on the IP
//! context so the UDP dispatcher can classify the streams that follow.

use std::sync::Arc;

use log::debug;

use crate::common::address::FlowAddress;
use crate::common::pdu::PduSlice;
use crate::config::AnalyzerConfig;
use crate::context::{Context, ContextState};
use crate::decoders::ip::add_rtp_hint;
use crate::engine::Manager;
use crate::error::{Error, Result};
use crate::event::{EventData, EventType};

/// Parses one SIP message. Returns the event plus any SDP media ports.
fn parse_message(data: &[u8]) -> Result<(EventType, EventData, Vec<u16>)> {
    let text = std::str::from_utf8(data).map_err(|_| Error::SipParseFailed("not utf8"))?;
    let mut lines = text.split("\r\n");
    let start = lines.next().ok_or(Error::SipParseFailed("empty message"))?;

    let mut from = String::new();
    let mut to = String::new();
    let mut in_body = false;
    let mut media_ports = Vec::new();
    for line in lines {
        if line.is_empty() {
            in_body = true;
            continue;
        }
        if !in_body {
            if let Some((key, value)) = line.split_once(':') {
                match key.trim().to_ascii_lowercase().as_str() {
                    "from" | "f" => from = value.trim().to_string(),
                    "to" | "t" => to = value.trim().to_string(),
                    _ => {}
                }
            }
        } else if let Some(rest) = line.strip_prefix("m=") {
            // SDP media line: m=audio 49170 RTP/AVP 0
            let mut parts = rest.split_whitespace();
            let _kind = parts.next();
            if let Some(Ok(port)) = parts.next().map(|p| p.parse::<u16>()) {
                media_ports.push(port);
            }
        }
    }

    if let Some(rest) = start.strip_prefix("SIP/2.0 ") {
        let mut parts = rest.splitn(2, ' ');
        let code = parts.next().unwrap_or("").parse().unwrap_or(0);
        let status = parts.next().unwrap_or("").to_string();
        return Ok((
            EventType::SipResponse,
            EventData::SipResponse {
                code,
                status,
                from,
                to,
            },
            media_ports,
        ));
    }

    let mut parts = start.split_whitespace();
    let method = parts
        .next()
        .ok_or(Error::SipParseFailed("missing method"))?
        .to_string();
    let uri = parts.next().unwrap_or("").to_string();
    if parts.next() != Some("SIP/2.0") {
        return Err(Error::SipParseFailed("not a sip start line"));
    }
    Ok((
        EventType::SipRequest,
        EventData::SipRequest {
            method,
            uri,
            from,
            to,
        },
        media_ports,
    ))
}

pub fn process(
    mgr: &dyn Manager,
    _config: &AnalyzerConfig,
    udp_ctx: &Arc<Context>,
    slice: &PduSlice,
) -> Result<()> {
    let ctx = Context::get_or_create(udp_ctx, FlowAddress::application("sip"), || {
        ContextState::Sip
    });
    ctx.touch(slice.time);

    let (action, data, media_ports) = parse_message(slice.data)?;
    for port in media_ports {
        debug!("sip negotiated media port {}", port);
        add_rtp_hint(udp_ctx, port);
        // RTCP conventionally sits one above the RTP port
        add_rtp_hint(udp_ctx, port.saturating_add(1));
    }
    mgr.handle(ctx.event(action, slice.time, slice.direction, data));
    Ok(())
}
