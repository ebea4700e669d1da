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

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("truncated {0} header")]
    Truncated(&'static str),
    #[error("invalid ip version {0}")]
    InvalidIpVersion(u8),
    #[error("ip header checksum mismatch")]
    ChecksumMismatch,
    #[error("unhandled link type {0}")]
    UnhandledLinkType(u8),
    #[error("http parse failed: {0}")]
    HttpParseFailed(&'static str),
    #[error("dns parse failed: {0}")]
    DnsParseFailed(&'static str),
    #[error("tls parse failed: {0}")]
    TlsParseFailed(&'static str),
    #[error("sip parse failed: {0}")]
    SipParseFailed(&'static str),
    #[error("ntp parse failed")]
    NtpParseFailed,
    #[error("rtp parse failed")]
    RtpParseFailed,
    #[error("unexpected context state")]
    ContextStateMismatch,
    #[error("event queue terminated")]
    QueueTerminated,
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
