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

pub mod esp;
pub mod gre;
pub mod icmp;
pub mod ip;
pub mod ip4;
pub mod ip6;
pub mod link;
pub mod reassembly;
pub mod tcp;
pub mod tcp_ports;
pub mod udp;

use std::sync::Arc;

use crate::common::pdu::PduSlice;
use crate::config::AnalyzerConfig;
use crate::context::Context;
use crate::engine::Manager;
use crate::error::Result;

/// A resolved upper-layer processing function, bound into a TCP context once
/// the service is identified. The context argument is the transport context;
/// parsers anchor their own child context below it.
pub type Processor =
    fn(&dyn Manager, &AnalyzerConfig, &Arc<Context>, &PduSlice) -> Result<()>;

/// Close notification delivered to a bound service when its transport flow
/// tears down. Parsers use it to finish whatever the close delimits, e.g. a
/// streaming HTTP body. The slice is the segment that closed the flow.
pub type CloseNotify =
    fn(&dyn Manager, &AnalyzerConfig, &Arc<Context>, &PduSlice) -> Result<()>;

/// A resolved service: the per-slice processor plus an optional close
/// notification.
#[derive(Clone, Copy)]
pub struct Service {
    pub processor: Processor,
    pub on_close: Option<CloseNotify>,
}
