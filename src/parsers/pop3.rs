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

//! POP3 line protocol. Each line is reported as a POP3 event; STLS followed
//! by the server's `+OK` hands the flow to the TLS decoder.

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
pub struct Pop3State {
    lines: LineBuffer,
    pub(crate) stls_sent: bool,
}

fn pop3_context(tcp_ctx: &Arc<Context>) -> Arc<Context> {
    Context::get_or_create(tcp_ctx, FlowAddress::application("pop3"), || {
        ContextState::Pop3(Pop3State::default())
    })
}

pub fn process_client(
    mgr: &dyn Manager,
    _config: &AnalyzerConfig,
    tcp_ctx: &Arc<Context>,
    slice: &PduSlice,
) -> Result<()> {
    let ctx = pop3_context(tcp_ctx);
    ctx.touch(slice.time);
    let lines = ctx.with_state(|s| match s {
        ContextState::Pop3(pop3) => {
            let lines = pop3.lines.push(slice.data);
            if lines.iter().any(|l| l.eq_ignore_ascii_case("STLS")) {
                pop3.stls_sent = true;
            }
            Ok(lines)
        }
        _ => Err(Error::ContextStateMismatch),
    })?;
    for line in lines {
        mgr.handle(ctx.event(
            EventType::Pop3,
            slice.time,
            slice.direction,
            EventData::Payload {
                payload: line.into_bytes(),
            },
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
    let ctx = pop3_context(tcp_ctx);
    ctx.touch(slice.time);
    let lines = ctx.with_state(|s| match s {
        ContextState::Pop3(pop3) => Ok(pop3.lines.push(slice.data)),
        _ => Err(Error::ContextStateMismatch),
    })?;

    let mut go_ahead = false;
    for line in &lines {
        if line.starts_with("+OK") {
            go_ahead = true;
        }
        mgr.handle(ctx.event(
            EventType::Pop3,
            slice.time,
            slice.direction,
            EventData::Payload {
                payload: line.clone().into_bytes(),
            },
        ));
    }

    if go_ahead {
        let peer_pending = ctx
            .reverse()
            .map(|rev| {
                rev.with_state(|s| match s {
                    ContextState::Pop3(pop3) => pop3.stls_sent,
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

    /// Both directions of a TCP flow to `server_port`, roots kept alive by
    /// the returned handle.
    fn tcp_pair(server_port: u16) -> (Arc<Context>, Arc<Context>, Arc<Context>) {
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
            FlowAddress::new(Address::tcp_port(40000), Address::tcp_port(server_port)),
            || ContextState::Tcp(TcpState::default()),
        );
        let server = Context::get_or_create(
            &ip_rev,
            FlowAddress::new(Address::tcp_port(server_port), Address::tcp_port(40000)),
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
    fn client_lines_reported() {
        let (_root, client, _server) = tcp_pair(110);
        let sink = Collect(Mutex::new(Vec::new()));
        let cfg = AnalyzerConfig::default();
        process_client(&sink, &cfg, &client, &slice_of(b"USER bob\r\nPASS secret\r\n")).unwrap();

        let events = sink.0.into_inner().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.action == EventType::Pop3));
        match &events[0].data {
            EventData::Payload { payload } => assert_eq!(payload, b"USER bob"),
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn stls_escalates_after_server_ok() {
        let (_root, client, server) = tcp_pair(110);
        let cfg = AnalyzerConfig::default();
        process_client(&Null, &cfg, &client, &slice_of(b"STLS\r\n")).unwrap();
        process_server(&Null, &cfg, &server, &slice_of(b"+OK begin TLS negotiation\r\n"))
            .unwrap();
        assert!(escalated(&client));
        assert!(escalated(&server));
    }

    #[test]
    fn plain_ok_without_stls_does_not_escalate() {
        let (_root, client, server) = tcp_pair(110);
        let cfg = AnalyzerConfig::default();
        process_client(&Null, &cfg, &client, &slice_of(b"USER bob\r\n")).unwrap();
        process_server(&Null, &cfg, &server, &slice_of(b"+OK password required\r\n")).unwrap();
        assert!(!escalated(&client));
        assert!(!escalated(&server));
    }
}
