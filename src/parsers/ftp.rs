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

//! FTP control channel: commands on the client direction, grouped
//! (possibly multi-line) numbered replies on the server direction.

use std::sync::Arc;

use super::LineBuffer;
use crate::common::address::FlowAddress;
use crate::common::pdu::PduSlice;
use crate::config::AnalyzerConfig;
use crate::context::{Context, ContextState};
use crate::engine::Manager;
use crate::error::{Error, Result};
use crate::event::{EventData, EventType};

#[derive(Default)]
pub struct FtpState {
    lines: LineBuffer,
    response_status: u32,
    response_text: Vec<String>,
    in_multiline: bool,
}

type Completed = (EventType, EventData);

impl FtpState {
    fn on_server_line(&mut self, line: String, out: &mut Vec<Completed>) {
        let coded = line.len() >= 3 && line.as_bytes()[..3].iter().all(u8::is_ascii_digit);
        if self.in_multiline {
            if coded
                && line.as_bytes().get(3) == Some(&b' ')
                && line[..3].parse::<u32>().ok() == Some(self.response_status)
            {
                self.response_text.push(line[4..].to_string());
                self.in_multiline = false;
                out.push((
                    EventType::FtpResponse,
                    EventData::FtpResponse {
                        status: self.response_status,
                        text: std::mem::take(&mut self.response_text),
                    },
                ));
            } else {
                self.response_text.push(line);
            }
            return;
        }
        if !coded {
            return; // stray line outside a reply
        }
        let status: u32 = line[..3].parse().unwrap_or(0);
        match line.as_bytes().get(3) {
            Some(&b'-') => {
                self.response_status = status;
                self.response_text.push(line[4..].to_string());
                self.in_multiline = true;
            }
            _ => out.push((
                EventType::FtpResponse,
                EventData::FtpResponse {
                    status,
                    text: vec![line.get(4..).unwrap_or("").to_string()],
                },
            )),
        }
    }
}

fn ftp_context(tcp_ctx: &Arc<Context>) -> Arc<Context> {
    Context::get_or_create(tcp_ctx, FlowAddress::application("ftp"), || {
        ContextState::Ftp(FtpState::default())
    })
}

pub fn process_client(
    mgr: &dyn Manager,
    _config: &AnalyzerConfig,
    tcp_ctx: &Arc<Context>,
    slice: &PduSlice,
) -> Result<()> {
    let ctx = ftp_context(tcp_ctx);
    ctx.touch(slice.time);
    let lines = ctx.with_state(|s| match s {
        ContextState::Ftp(ftp) => Ok(ftp.lines.push(slice.data)),
        _ => Err(Error::ContextStateMismatch),
    })?;
    for line in lines {
        mgr.handle(ctx.event(
            EventType::FtpCommand,
            slice.time,
            slice.direction,
            EventData::FtpCommand { command: line },
        ));
    }
    Ok(())
}

pub fn process_server(
    mgr: &dyn Manager,
    _config: &AnalyzerConfig,
    tcp_ctx: &Arc<Context>,
    slice: &PduSlice,
) -> Result<()> {
    let ctx = ftp_context(tcp_ctx);
    ctx.touch(slice.time);
    let completed = ctx.with_state(|s| match s {
        ContextState::Ftp(ftp) => {
            let mut out = Vec::new();
            for line in ftp.lines.push(slice.data) {
                ftp.on_server_line(line, &mut out);
            }
            Ok(out)
        }
        _ => Err(Error::ContextStateMismatch),
    })?;
    for (action, data) in completed {
        mgr.handle(ctx.event(action, slice.time, slice.direction, data));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiline_reply_grouped() {
        let mut state = FtpState::default();
        let mut out = Vec::new();
        for line in state
            .lines
            .push(b"211-Features:\r\n MDTM\r\n SIZE\r\n211 End\r\n")
        {
            state.on_server_line(line, &mut out);
        }
        assert_eq!(out.len(), 1);
        match &out[0].1 {
            EventData::FtpResponse { status, text } => {
                assert_eq!(*status, 211);
                assert_eq!(text.len(), 4);
                assert_eq!(text[0], "Features:");
                assert_eq!(text[3], "End");
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn single_line_reply() {
        let mut state = FtpState::default();
        let mut out = Vec::new();
        for line in state.lines.push(b"220 ftp.example.com ready\r\n") {
            state.on_server_line(line, &mut out);
        }
        assert_eq!(out.len(), 1);
        match &out[0].1 {
            EventData::FtpResponse { status, text } => {
                assert_eq!(*status, 220);
                assert_eq!(text[0], "ftp.example.com ready");
            }
            _ => panic!("wrong payload"),
        }
    }
}
