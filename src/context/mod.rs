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

pub mod reaper;
pub mod registry;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::common::address::{Address, FlowAddress, Layer};
use crate::common::enums::Direction;
use crate::config::FlowTimeouts;
use crate::decoders::ip::IpState;
use crate::decoders::tcp::TcpState;
use crate::event::{Event, EventData, EventType};
use crate::parsers::dns::DnsState;
use crate::parsers::ftp::FtpState;
use crate::parsers::http::HttpState;
use crate::parsers::imap::ImapState;
use crate::parsers::pop3::Pop3State;
use crate::parsers::smtp::SmtpState;
use crate::parsers::tls::TlsState;

/// Per-layer decoder state carried by a context. The set is closed: every
/// protocol the pipeline can route to has a variant here.
pub enum ContextState {
    Root {
        device: String,
        network: String,
        trigger: Option<Address>,
    },
    Ip4(IpState),
    Ip6(IpState),
    Tcp(TcpState),
    Udp,
    Icmp,
    Esp,
    Gre,
    HttpRequest(HttpState),
    HttpResponse(HttpState),
    Smtp(SmtpState),
    Pop3(Pop3State),
    Imap(ImapState),
    Ftp(FtpState),
    Sip,
    Dns(DnsState),
    Ntp,
    Rtp,
    Tls(TlsState),
}

impl ContextState {
    /// Inactivity threshold applied by the reaper for a context carrying
    /// this state. Roots are never reaped.
    pub fn idle_timeout(&self, t: &FlowTimeouts) -> Duration {
        match self {
            ContextState::Root { .. } => Duration::MAX,
            ContextState::Ip4(_) | ContextState::Ip6(_) => t.ip,
            ContextState::Tcp(s) if s.is_closed() => t.tcp_closed,
            ContextState::Tcp(_) => t.tcp,
            ContextState::Udp => t.udp,
            _ => t.application,
        }
    }
}

/// A node in the per-flow context tree. Parents own children; children refer
/// back through a weak pointer, so the natural tree has no cycles and
/// dropping a parent tears down its subtree.
pub struct Context {
    pub addr: FlowAddress,
    parent: Weak<Context>,
    children: Mutex<HashMap<FlowAddress, Arc<Context>>>,
    /// Microseconds since the Unix epoch of the last slice touching this
    /// context or one of its descendants.
    last_used: AtomicU64,
    /// Set by the reaper on nodes that were stale themselves but kept
    /// because the subtree below was still active.
    watermark: AtomicBool,
    state: Mutex<ContextState>,
}

impl Context {
    pub fn root(device: &str, network: &str) -> Arc<Context> {
        Arc::new(Context {
            addr: FlowAddress::new(Address::empty(Layer::Root), Address::empty(Layer::Root)),
            parent: Weak::new(),
            children: Mutex::new(HashMap::new()),
            last_used: AtomicU64::new(0),
            watermark: AtomicBool::new(false),
            state: Mutex::new(ContextState::Root {
                device: device.to_string(),
                network: network.to_string(),
                trigger: None,
            }),
        })
    }

    /// Returns the child for `addr`, materializing it with `make` on the
    /// first matching packet.
    pub fn get_or_create(
        parent: &Arc<Context>,
        addr: FlowAddress,
        make: impl FnOnce() -> ContextState,
    ) -> Arc<Context> {
        let mut children = parent.children.lock().unwrap();
        children
            .entry(addr.clone())
            .or_insert_with(|| {
                Arc::new(Context {
                    addr,
                    parent: Arc::downgrade(parent),
                    children: Mutex::new(HashMap::new()),
                    last_used: AtomicU64::new(parent.last_used.load(Ordering::Relaxed)),
                    watermark: AtomicBool::new(false),
                    state: Mutex::new(make()),
                })
            })
            .clone()
    }

    pub fn parent(&self) -> Option<Arc<Context>> {
        self.parent.upgrade()
    }

    /// The reverse-flow twin: the node keyed by the swapped pair under the
    /// reversed parent chain. Twins are reached by lookup, never by direct
    /// pointer; the root is its own reverse.
    pub fn reverse(self: &Arc<Context>) -> Option<Arc<Context>> {
        let parent = self.parent.upgrade()?;
        let rev_parent = if parent.parent.upgrade().is_none() {
            parent
        } else {
            parent.reverse()?
        };
        let children = rev_parent.children.lock().unwrap();
        children.get(&self.addr.reverse()).cloned()
    }

    pub fn touch(&self, time: Duration) {
        let micros = time.as_micros() as u64;
        self.last_used.fetch_max(micros, Ordering::Relaxed);
        self.watermark.store(false, Ordering::Relaxed);
        // bump ancestors so a busy leaf keeps its path alive
        let mut up = self.parent.upgrade();
        while let Some(ctx) = up {
            ctx.last_used.fetch_max(micros, Ordering::Relaxed);
            up = ctx.parent.upgrade();
        }
    }

    pub fn last_used(&self) -> Duration {
        Duration::from_micros(self.last_used.load(Ordering::Relaxed))
    }

    pub fn watermarked(&self) -> bool {
        self.watermark.load(Ordering::Relaxed)
    }

    /// Runs `f` with this context's protocol state locked. The lock covers
    /// only the closure; callers must not emit events while inside.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut ContextState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn child_count(&self) -> usize {
        self.children.lock().unwrap().len()
    }

    pub fn get_child(&self, addr: &FlowAddress) -> Option<Arc<Context>> {
        self.children.lock().unwrap().get(addr).cloned()
    }

    pub fn children_snapshot(&self) -> Vec<Arc<Context>> {
        self.children.lock().unwrap().values().cloned().collect()
    }

    /// Climbs to the root and returns `(device, network)`.
    pub fn root_info(self: &Arc<Context>) -> (String, String) {
        let mut ctx = self.clone();
        loop {
            let up = ctx.parent.upgrade();
            match up {
                Some(p) => ctx = p,
                None => break,
            }
        }
        ctx.with_state(|s| match s {
            ContextState::Root {
                device, network, ..
            } => (device.clone(), network.clone()),
            _ => (String::new(), String::new()),
        })
    }

    /// Renders the endpoints of this flow from the context stack, in the
    /// usual `ip:port` shape where both layers are present.
    pub fn describe_endpoints(self: &Arc<Context>) -> (String, String) {
        let mut src_parts: Vec<String> = Vec::new();
        let mut dst_parts: Vec<String> = Vec::new();
        let mut cur = Some(self.clone());
        while let Some(ctx) = cur {
            match ctx.addr.layer() {
                Layer::Ip4 | Layer::Ip6 | Layer::Tcp | Layer::Udp => {
                    src_parts.push(ctx.addr.src.to_string());
                    dst_parts.push(ctx.addr.dst.to_string());
                }
                _ => {}
            }
            cur = ctx.parent.upgrade();
        }
        src_parts.reverse();
        dst_parts.reverse();
        (src_parts.join(":"), dst_parts.join(":"))
    }

    /// Builds an event anchored at this context: provenance comes from the
    /// root, endpoint descriptions from the stack. The id is stamped later
    /// by the engine.
    pub fn event(
        self: &Arc<Context>,
        action: EventType,
        time: Duration,
        direction: Direction,
        data: EventData,
    ) -> Event {
        let (device, network) = self.root_info();
        let (src, dst) = self.describe_endpoints();
        Event {
            id: String::new(),
            action,
            time,
            device,
            network,
            direction,
            src,
            dst,
            data,
        }
    }

    /// Prunes idle descendants, depth first. Returns the most recent
    /// `last_used` anywhere in this subtree; a child is removed only when
    /// its whole subtree has been idle past its threshold.
    pub fn sweep(&self, now: Duration, timeouts: &FlowTimeouts) -> Duration {
        let mut recent = self.last_used();
        let mut children = self.children.lock().unwrap();
        let mut expired: Vec<FlowAddress> = Vec::new();
        for (addr, child) in children.iter() {
            let child_recent = child.sweep(now, timeouts);
            let threshold = child.with_state(|s| s.idle_timeout(timeouts));
            if now.saturating_sub(child_recent) > threshold {
                expired.push(addr.clone());
            } else {
                if now.saturating_sub(child.last_used()) > threshold {
                    child.watermark.store(true, Ordering::Relaxed);
                }
                recent = recent.max(child_recent);
            }
        }
        for addr in expired {
            children.remove(&addr);
        }
        recent
    }
}
