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

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use uuid::Uuid;

use crate::common::address::Address;
use crate::common::enums::Direction;
use crate::common::pdu::PduSlice;
use crate::config::AnalyzerConfig;
use crate::context::registry::ContextRegistry;
use crate::context::ContextState;
use crate::decoders::link;
use crate::event::{Event, EventData, EventType};

/// Sink for decoded events. The engine itself implements it (stamping event
/// ids on the way through); the final consumer does too.
pub trait Manager: Send + Sync {
    fn handle(&self, event: Event);
}

/// Event id source, injectable so tests can be deterministic.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

#[derive(Debug, Default)]
pub struct EngineCounter {
    pub rx: AtomicU64,
    pub decode_errors: AtomicU64,
    pub events: AtomicU64,
}

/// Top of the decoding pipeline. Owns the root-context registry, routes
/// ingress slices into the link decoder and relays events to the sink.
pub struct Engine {
    registry: ContextRegistry,
    config: AnalyzerConfig,
    sink: Arc<dyn Manager>,
    ids: Box<dyn IdGenerator>,
    counter: EngineCounter,
}

impl Engine {
    pub fn new(config: AnalyzerConfig, sink: Arc<dyn Manager>) -> Self {
        Self::with_id_generator(config, sink, Box::new(UuidGenerator))
    }

    pub fn with_id_generator(
        config: AnalyzerConfig,
        sink: Arc<dyn Manager>,
        ids: Box<dyn IdGenerator>,
    ) -> Self {
        Self {
            registry: ContextRegistry::new(),
            config,
            sink,
            ids,
            counter: EngineCounter::default(),
        }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn counter(&self) -> &EngineCounter {
        &self.counter
    }

    pub fn root_count(&self) -> usize {
        self.registry.len()
    }

    pub fn has_root(&self, device: &str, network: &str) -> bool {
        self.registry.get(device, network).is_some()
    }

    /// The only packet-entry point: locates or creates the root context for
    /// `(device, network)` and hands the slice to the link decoder. Decode
    /// errors drop the current slice; the flow's contexts stay intact.
    pub fn process(&self, device: &str, network: &str, slice: &PduSlice) {
        self.counter.rx.fetch_add(1, Ordering::Relaxed);
        let root = self.registry.get_or_create(device, network);
        root.touch(slice.time);
        if let Err(e) = link::process(self, &self.config, &root, slice) {
            self.counter.decode_errors.fetch_add(1, Ordering::Relaxed);
            debug!("dropped PDU on {}/{}: {}", device, network, e);
        }
    }

    /// Records the trigger address on the root and reports `TRIGGER_UP`.
    pub fn target_up(&self, device: &str, network: &str, address: Address, time: Duration) {
        let root = self.registry.get_or_create(device, network);
        root.touch(time);
        let description = address.to_string();
        root.with_state(|s| {
            if let ContextState::Root { trigger, .. } = s {
                *trigger = Some(address);
            }
        });
        self.handle(root.event(
            EventType::TriggerUp,
            time,
            Direction::NotKnown,
            EventData::Trigger {
                address: description,
            },
        ));
    }

    /// Drops the root atomically, cascading destruction of every descendant
    /// context, and reports `TRIGGER_DOWN`. Unknown pairs are a no-op.
    pub fn target_down(&self, device: &str, network: &str, time: Duration) {
        let Some(root) = self.registry.remove(device, network) else {
            return;
        };
        self.handle(root.event(
            EventType::TriggerDown,
            time,
            Direction::NotKnown,
            EventData::Empty {},
        ));
    }

    /// One reaper pass over all roots. Returns the number of contexts
    /// pruned. Roots are never removed here.
    pub fn reap(&self, now: Duration) -> usize {
        let mut pruned = 0;
        for root in self.registry.snapshot() {
            let before = count_contexts(&root);
            root.sweep(now, &self.config.timeouts);
            pruned += before - count_contexts(&root);
        }
        pruned
    }
}

fn count_contexts(ctx: &Arc<crate::context::Context>) -> usize {
    // children are counted through sweeps only; cheap because trees are
    // shallow and bounded by flow count
    let mut n = 0;
    let mut stack = vec![ctx.clone()];
    while let Some(c) = stack.pop() {
        n += 1;
        stack.extend(c.children_snapshot());
    }
    n
}

impl Manager for Engine {
    fn handle(&self, mut event: Event) {
        if event.id.is_empty() {
            event.id = self.ids.generate();
        }
        self.counter.events.fetch_add(1, Ordering::Relaxed);
        self.sink.handle(event);
    }
}
