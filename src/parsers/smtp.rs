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

//! SMTP: commands and grouped responses per direction, DATA capture into a
//! mail transaction, AUTH exchanges reported separately, and STARTTLS
//! escalating the flow to the TLS decoder.

use std::sync::Arc;

use super::{tls, LineBuffer};
use crate::common::address::FlowAddress;
use crate::common::pdu::PduSlice;
use crate::config::AnalyzerConfig;
use crate::context::{Context, ContextState};
use crate::engine::Manager;
use crate::error::{Error, Result};
use crate::event::{EventData, EventType};

/// Per-direction SMTP state. The client direction tracks the envelope and
/// DATA mode; the server direction groups multi-line replies.
#[derive(Default)]
pub struct SmtpState {
    lines: LineBuffer,

    // client side
    in_data: bool,
    data: Vec<u8>,
    from: String,
    to: Vec<String>,
    pub(crate) starttls_sent: bool,

    // server side
    response_status: u32,
    response_text: Vec<String>,
}

type Completed = (EventType, EventData);

fn extract_angle_addr(rest: &str) -> String {
    match (rest.find('<'), rest.find('>')) {
        (Some(a), Some(b)) if b > a => rest[a + 1..b].to_string(),
        _ => rest.trim().to_string(),
    }
}

impl SmtpState {
    fn on_client_line(&mut self, line: String, out: &mut Vec<Completed>) {
        if self.in_data {
            if line == "." {
                self.in_data = false;
                out.push((
                    EventType::SmtpData,
                    EventData::SmtpData {
                        from: std::mem::take(&mut self.from),
                        to: std::mem::take(&mut self.to),
                        body: std::mem::take(&mut self.data),
                    },
                ));
            } else {
                // undo dot stuffing
                let text = line.strip_prefix('.').unwrap_or(&line);
                self.data.extend_from_slice(text.as_bytes());
                self.data.extend_from_slice(b"\r\n");
            }
            return;
        }

        let upper = line.to_ascii_uppercase();
        if let Some(rest) = upper.strip_prefix("AUTH ") {
            let mut parts = rest.split_whitespace();
            let mechanism = parts.next().unwrap_or("").to_string();
            let initial = line.split_whitespace().nth(2).map(|s| s.to_string());
            out.push((
                EventType::SmtpAuth,
                EventData::SmtpAuth { mechanism, initial },
            ));
            return;
        }
        if upper.starts_with("MAIL FROM:") {
            self.from = extract_angle_addr(&line["MAIL FROM:".len()..]);
        } else if upper.starts_with("RCPT TO:") {
            self.to.push(extract_angle_addr(&line["RCPT TO:".len()..]));
        } else if upper == "DATA" {
            self.in_data = true;
        } else if upper == "STARTTLS" {
            self.starttls_sent = true;
        }
        out.push((
            EventType::SmtpCommand,
            EventData::SmtpCommand { command: line },
        ));
    }

    /// Returns true when the line completed a reply whose status was 220
    /// while the peer had STARTTLS pending; the caller escalates.
    fn on_server_line(&mut self, line: String, out: &mut Vec<Completed>) -> bool {
        if line.len() < 3 || !line.as_bytes()[..3].iter().all(u8::is_ascii_digit) {
            // not a reply line; fold it into any open reply
            self.response_text.push(line);
            return false;
        }
        let status: u32 = line[..3].parse().unwrap_or(0);
        let cont = line.as_bytes().get(3) == Some(&b'-');
        self.response_status = status;
        self.response_text
            .push(line.get(4..).unwrap_or("").to_string());
        if cont {
            return false;
        }
        out.push((
            EventType::SmtpResponse,
            EventData::SmtpResponse {
                status,
                text: std::mem::take(&mut self.response_text),
            },
        ));
        status == 220
    }
}

fn smtp_context(tcp_ctx: &Arc<Context>) -> Arc<Context> {
    Context::get_or_create(tcp_ctx, FlowAddress::application("smtp"), || {
        ContextState::Smtp(SmtpState::default())
    })
}

/// Escalates both directions of the transport flow to the TLS decoder.
pub(crate) fn escalate_to_tls(parser_ctx: &Arc<Context>) {
    let Some(tcp) = parser_ctx.parent() else {
        return;
    };
    tcp.with_state(|s| {
        if let ContextState::Tcp(t) = s {
            t.escalate(tls::process);
        }
    });
    if let Some(rev) = tcp.reverse() {
        rev.with_state(|s| {
            if let ContextState::Tcp(t) = s {
                t.escalate(tls::process);
            }
        });
    }
}

/// Client-to-server SMTP stream.
pub fn process_client(
    mgr: &dyn Manager,
    _config: &AnalyzerConfig,
    tcp_ctx: &Arc<Context>,
    slice: &PduSlice,
) -> Result<()> {
    let ctx = smtp_context(tcp_ctx);
    ctx.touch(slice.time);
    let completed = ctx.with_state(|s| match s {
        ContextState::Smtp(smtp) => {
            let mut out = Vec::new();
            for line in smtp.lines.push(slice.data) {
                smtp.on_client_line(line, &mut out);
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

/// Server-to-client SMTP stream.
pub fn process_server(
    mgr: &dyn Manager,
    _config: &AnalyzerConfig,
    tcp_ctx: &Arc<Context>,
    slice: &PduSlice,
) -> Result<()> {
    let ctx = smtp_context(tcp_ctx);
    ctx.touch(slice.time);
    let (completed, go_ahead) = ctx.with_state(|s| match s {
        ContextState::Smtp(smtp) => {
            let mut out = Vec::new();
            let mut go_ahead = false;
            for line in smtp.lines.push(slice.data) {
                go_ahead |= smtp.on_server_line(line, &mut out);
            }
            Ok((out, go_ahead))
        }
        _ => Err(Error::ContextStateMismatch),
    })?;
    for (action, data) in completed {
        mgr.handle(ctx.event(action, slice.time, slice.direction, data));
    }

    if go_ahead {
        // 220 after the peer sent STARTTLS switches both directions to TLS
        let peer_pending = ctx
            .reverse()
            .map(|rev| {
                rev.with_state(|s| match s {
                    ContextState::Smtp(smtp) => smtp.starttls_sent,
                    _ => false,
                })
            })
            .unwrap_or(false);
        if peer_pending {
            escalate_to_tls(&ctx);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_lines(input: &[u8]) -> (SmtpState, Vec<Completed>) {
        let mut state = SmtpState::default();
        let mut out = Vec::new();
        for line in state.lines.push(input) {
            state.on_client_line(line, &mut out);
        }
        (state, out)
    }

    #[test]
    fn envelope_and_data() {
        let (_, out) = client_lines(
            b"EHLO client\r\nMAIL FROM:<alice@example.com>\r\nRCPT TO:<bob@example.com>\r\nDATA\r\nSubject: hi\r\n\r\nbody line\r\n..stuffed\r\n.\r\n",
        );
        let data_events: Vec<_> = out
            .iter()
            .filter(|(a, _)| *a == EventType::SmtpData)
            .collect();
        assert_eq!(data_events.len(), 1);
        match &data_events[0].1 {
            EventData::SmtpData { from, to, body } => {
                assert_eq!(from, "alice@example.com");
                assert_eq!(to, &vec!["bob@example.com".to_string()]);
                let text = String::from_utf8_lossy(body);
                assert!(text.contains("body line"));
                assert!(text.contains("\r\n.stuffed"));
            }
            _ => panic!("wrong payload"),
        }
        let commands = out
            .iter()
            .filter(|(a, _)| *a == EventType::SmtpCommand)
            .count();
        assert_eq!(commands, 4); // EHLO, MAIL, RCPT, DATA
    }

    #[test]
    fn auth_reported_separately() {
        let (_, out) = client_lines(b"AUTH PLAIN dGVzdA==\r\n");
        assert_eq!(out.len(), 1);
        match &out[0].1 {
            EventData::SmtpAuth { mechanism, initial } => {
                assert_eq!(mechanism, "PLAIN");
                assert_eq!(initial.as_deref(), Some("dGVzdA=="));
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn multiline_response_grouped() {
        let mut state = SmtpState::default();
        let mut out = Vec::new();
        for line in state
            .lines
            .push(b"250-mail.example.com\r\n250-PIPELINING\r\n250 STARTTLS\r\n")
        {
            state.on_server_line(line, &mut out);
        }
        assert_eq!(out.len(), 1);
        match &out[0].1 {
            EventData::SmtpResponse { status, text } => {
                assert_eq!(*status, 250);
                assert_eq!(text.len(), 3);
                assert_eq!(text[2], "STARTTLS");
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn starttls_flag_set_on_client() {
        let (state, _) = client_lines(b"STARTTLS\r\n");
        assert!(state.starttls_sent);
    }
}
