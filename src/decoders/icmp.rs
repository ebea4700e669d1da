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

use crate::common::address::FlowAddress;
use crate::common::pdu::PduSlice;
use crate::config::AnalyzerConfig;
use crate::context::{Context, ContextState};
use crate::engine::Manager;
use crate::error::{Error, Result};
use crate::event::{EventData, EventType};

const ICMP_HEADER_LEN: usize = 8;

/// ICMP (v4 and v6 alike) is reported as a single event carrying type, code
/// and the message payload.
pub fn process(
    mgr: &dyn Manager,
    _config: &AnalyzerConfig,
    ip_ctx: &Arc<Context>,
    slice: &PduSlice,
) -> Result<()> {
    if slice.len() < ICMP_HEADER_LEN {
        return Err(Error::Truncated("icmp"));
    }
    let ctx = Context::get_or_create(ip_ctx, FlowAddress::application("icmp"), || {
        ContextState::Icmp
    });
    ctx.touch(slice.time);

    mgr.handle(ctx.event(
        EventType::Icmp,
        slice.time,
        slice.direction,
        EventData::Icmp {
            icmp_type: slice.data[0],
            icmp_code: slice.data[1],
            payload: slice.data[ICMP_HEADER_LEN..].to_vec(),
        },
    ));
    Ok(())
}
