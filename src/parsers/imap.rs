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

//! IMAP line protocol. Lines are reported as IMAP events; a tagged STARTTLS
//! answered by `<tag> OK` escalates the flow to TLS.

use std::sync::Arc;

use super::{smtp::escalate_to_tls, LineBuffer};
use crate::common::address::FlowAddress;
use crate::common::pdu::PduSlice;
use crate::config::AnalyzerConfig;
use crate::context::{Context, ContextState};
use crate::engine::Manager;
use crate::error::{Error, Result};
use crate::event::{EventData, EventType};

#[derive(Default)]
pub struct ImapState {
    lines: LineBuffer,
    pub(crate) starttls_tag: Option<String>,
}

fn imap_context(tcp_ctx: &Arc<Context>) -> Arc<Context> {
    Context::get_or_create(tcp_ctx, FlowAddress::application("imap"), || {
        ContextState::Imap(ImapState::default())
    })
}

fn emit_lines(
    mgr: &dyn Manager,
    ctx: &Arc<Context>,
    slice: &PduSlice,
    lines: Vec<String>,
) {
    for line in lines {
        mgr.handle(ctx.event(
            EventType::Imap,
            slice.time,
            slice.direction,
            EventData::Payload {
                payload: line.into_bytes(),
            },
        ));
    }
}

pub fn process_client(
    mgr: &dyn Manager,
    _config: &AnalyzerConfig,
    tcp_ctx: &Arc<Context>,
    slice: &PduSlice,
) -> Result<()> {
    let ctx = imap_context(tcp_ctx);
    ctx.touch(slice.time);
    let lines = ctx.with_state(|s| match s {
        ContextState::Imap(imap) => {
            let lines = imap.lines.push(slice.data);
            for line in &lines {
                let mut parts = line.split_whitespace();
                let tag = parts.next();
                if parts
                    .next()
                    .map(|c| c.eq_ignore_ascii_case("STARTTLS"))
                    .unwrap_or(false)
                {
                    imap.starttls_tag = tag.map(|t| t.to_string());
                }
            }
            Ok(lines)
        }
        _ => Err(Error::ContextStateMismatch),
    })?;
    emit_lines(mgr, &ctx, slice, lines);
    Ok(())
}

pub fn process_server(
    mgr: &dyn Manager,
    _config: &AnalyzerConfig,
    tcp_ctx: &Arc<Context>,
    slice: &PduSlice,
) -> Result<()> {
    let ctx = imap_context(tcp_ctx);
    ctx.touch(slice.time);
    let lines = ctx.with_state(|s| match s {
        ContextState::Imap(imap) => Ok(imap.lines.push(slice.data)),
        _ => Err(Error::ContextStateMismatch),
    })?;

    let pending_tag = ctx.reverse().and_then(|rev| {
        rev.with_state(|s| match s {
            ContextState::Imap(imap) => imap.starttls_tag.clone(),
            _ => None,
        })
    });
    let mut escalate = false;
    if let Some(tag) = pending_tag {
        for line in &lines {
            let mut parts = line.split_whitespace();
            if parts.next() == Some(tag.as_str())
                && parts.next().map(|c| c.eq_ignore_ascii_case("OK")).unwrap_or(false)
            {
                escalate = true;
            }
        }
    }
    emit_lines(mgr, &ctx, slice, lines);
    if escalate {
        escalate_to_tls(&ctx);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::common::address::Address;
    use crate::common::enums::Direction;
    use crate::decoders::ip::IpState;
    use crate::decoders::tcp::TcpState;
    use crate::decoders::Processor;
    use crate::event::Event;
    use crate::parsers::tls;

    struct Collect(Mutex<Vec<Event>>);
    impl Manager for Collect {
        fn handle(&self, e: Event) {
            self.0.lock().unwrap().push(e);
        }
    }

    struct Null;
    impl Manager for Null {
        fn handle(&self, _: Event) {}
    }

    fn tcp_pair() -> (Arc<Context>, Arc<Context>, Arc<Context>) {
        let root = Context::root("d", "n");
        let ip_fwd = Context::get_or_create(
            &root,
            FlowAddress::new(
                Address::ipv4("10.0.0.1".parse().unwrap()),
                Address::ipv4("10.0.0.2".parse().unwrap()),
            ),
            || ContextState::Ip4(IpState::default()),
        );
        let ip_rev = Context::get_or_create(&root, ip_fwd.addr.reverse(), || {
            ContextState::Ip4(IpState::default())
        });
        let client = Context::get_or_create(
            &ip_fwd,
            FlowAddress::new(Address::tcp_port(40000), Address::tcp_port(143)),
            || ContextState::Tcp(TcpState::default()),
        );
        let server = Context::get_or_create(
            &ip_rev,
            FlowAddress::new(Address::tcp_port(143), Address::tcp_port(40000)),
            || ContextState::Tcp(TcpState::default()),
        );
        (root, client, server)
    }

    fn slice_of(data: &[u8]) -> PduSlice<'_> {
        PduSlice::new(data, Duration::from_secs(1), Direction::NotKnown)
    }

    fn escalated(ctx: &Arc<Context>) -> bool {
        ctx.with_state(|s| match s {
            ContextState::Tcp(t) => t.processor() == Some(tls::process as Processor),
            _ => false,
        })
    }

    #[test]
    fn lines_reported() {
        let (_root, client, _server) = tcp_pair();
        let sink = Collect(Mutex::new(Vec::new()));
        let cfg = AnalyzerConfig::default();
        process_client(
            &sink,
            &cfg,
            &client,
            &slice_of(b"a1 LOGIN bob secret\r\na2 SELECT INBOX\r\n"),
        )
        .unwrap();

        let events = sink.0.into_inner().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.action == EventType::Imap));
        match &events[1].data {
            EventData::Payload { payload } => assert_eq!(payload, b"a2 SELECT INBOX"),
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn tagged_starttls_escalates_on_ok() {
        let (_root, client, server) = tcp_pair();
        let cfg = AnalyzerConfig::default();
        process_client(&Null, &cfg, &client, &slice_of(b"a1 STARTTLS\r\n")).unwrap();
        process_server(&Null, &cfg, &server, &slice_of(b"a1 OK Begin TLS\r\n")).unwrap();
        assert!(escalated(&client));
        assert!(escalated(&server));
    }

    #[test]
    fn mismatched_tag_does_not_escalate() {
        let (_root, client, server) = tcp_pair();
        let cfg = AnalyzerConfig::default();
        process_client(&Null, &cfg, &client, &slice_of(b"a1 STARTTLS\r\n")).unwrap();
        process_server(&Null, &cfg, &server, &slice_of(b"a2 OK unrelated completion\r\n"))
            .unwrap();
        assert!(!escalated(&client));
        assert!(!escalated(&server));
    }
}
