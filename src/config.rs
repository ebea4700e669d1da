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

use std::time::Duration;

use serde::Deserialize;

use crate::common::enums::LinkType;

pub const TIMEOUT_IP: Duration = Duration::from_secs(120);
pub const TIMEOUT_TCP: Duration = Duration::from_secs(300);
pub const TIMEOUT_TCP_CLOSED: Duration = Duration::from_secs(5);
pub const TIMEOUT_UDP: Duration = Duration::from_secs(60);
pub const TIMEOUT_APPLICATION: Duration = Duration::from_secs(120);

pub const IDENT_BUFFER_MAX: usize = 1024;
pub const MAX_SEGMENTS: usize = 64;
pub const MAX_FRAG_LIST_LEN: usize = 32;
pub const MAX_PACKETS: usize = 1024;

/// Per-layer inactivity thresholds consulted by the reaper. A context whose
/// whole subtree has been idle longer than its layer's threshold is pruned.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FlowTimeouts {
    #[serde(with = "humantime_serde")]
    pub ip: Duration,
    #[serde(with = "humantime_serde")]
    pub tcp: Duration,
    #[serde(with = "humantime_serde")]
    pub tcp_closed: Duration,
    #[serde(with = "humantime_serde")]
    pub udp: Duration,
    #[serde(with = "humantime_serde")]
    pub application: Duration,
}

impl Default for FlowTimeouts {
    fn default() -> Self {
        Self {
            ip: TIMEOUT_IP,
            tcp: TIMEOUT_TCP,
            tcp_closed: TIMEOUT_TCP_CLOSED,
            udp: TIMEOUT_UDP,
            application: TIMEOUT_APPLICATION,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Link type of ingress slices, normally Ethernet.
    pub link_type: LinkType,

    /// Bytes buffered per TCP direction while the service is unknown.
    pub ident_buffer_max: usize,
    /// Out-of-order segments retained per TCP direction.
    pub max_segments: usize,
    /// Fragments buffered per IP flow across all pending reassemblies.
    pub max_frag_list_len: usize,
    /// Event sender queue depth; producers block when full.
    pub max_packets: usize,

    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
    pub timeouts: FlowTimeouts,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            link_type: LinkType::Ethernet,
            ident_buffer_max: IDENT_BUFFER_MAX,
            max_segments: MAX_SEGMENTS,
            max_frag_list_len: MAX_FRAG_LIST_LEN,
            max_packets: MAX_PACKETS,
            reap_interval: Duration::from_secs(10),
            timeouts: FlowTimeouts::default(),
        }
    }
}
