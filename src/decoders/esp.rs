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
use crate::utils::bytes::read_u32_be;

const ESP_HEADER_LEN: usize = 8;

/// ESP payload is opaque; the event reports SPI, sequence and length.
pub fn process(
    mgr: &dyn Manager,
    _config: &AnalyzerConfig,
    ip_ctx: &Arc<Context>,
    slice: &PduSlice,
) -> Result<()> {
    if slice.len() < ESP_HEADER_LEN {
        return Err(Error::Truncated("esp"));
    }
    let ctx = Context::get_or_create(ip_ctx, FlowAddress::application("esp"), || {
        ContextState::Esp
    });
    ctx.touch(slice.time);

    mgr.handle(ctx.event(
        EventType::Esp,
        slice.time,
        slice.direction,
        EventData::Esp {
            spi: read_u32_be(&slice.data[0..4]),
            sequence: read_u32_be(&slice.data[4..8]),
            payload_length: (slice.len() - ESP_HEADER_LEN) as u32,
        },
    ));
    Ok(())
}
