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

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::Context;

/// `(device, network)` pair identifying a root context.
pub type RootKey = (String, String);

/// Top-level map of root contexts. The mutex guards creation and deletion
/// only; all decoding happens below it against per-context locks.
#[derive(Default)]
pub struct ContextRegistry {
    roots: Mutex<HashMap<RootKey, Arc<Context>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, device: &str, network: &str) -> Arc<Context> {
        let mut roots = self.roots.lock().unwrap();
        roots
            .entry((device.to_string(), network.to_string()))
            .or_insert_with(|| Context::root(device, network))
            .clone()
    }

    pub fn get(&self, device: &str, network: &str) -> Option<Arc<Context>> {
        let roots = self.roots.lock().unwrap();
        roots
            .get(&(device.to_string(), network.to_string()))
            .cloned()
    }

    /// Removes the root, cascading destruction of its subtree once in-flight
    /// holders release their references. Returns it if it existed.
    pub fn remove(&self, device: &str, network: &str) -> Option<Arc<Context>> {
        let mut roots = self.roots.lock().unwrap();
        roots.remove(&(device.to_string(), network.to_string()))
    }

    pub fn len(&self) -> usize {
        self.roots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current roots, for the reaper's sweep.
    pub fn snapshot(&self) -> Vec<Arc<Context>> {
        let roots = self.roots.lock().unwrap();
        roots.values().cloned().collect()
    }
}
