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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};

use crate::engine::Engine;

/// Background inactivity sweeper. On every tick it walks each root's
/// subtree and prunes contexts whose subtrees have been idle past their
/// per-protocol threshold. Roots themselves only go away via `target_down`.
pub struct Reaper {
    engine: Arc<Engine>,
    running: Arc<AtomicBool>,
    wakeup: Arc<(Mutex<()>, Condvar)>,
    thread_handle: Option<JoinHandle<()>>,
}

impl Reaper {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            running: Arc::new(AtomicBool::new(false)),
            wakeup: Arc::new((Mutex::new(()), Condvar::new())),
            thread_handle: None,
        }
    }

    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::Relaxed) {
            warn!("reaper already started, do nothing");
            return;
        }
        let engine = self.engine.clone();
        let running = self.running.clone();
        let wakeup = self.wakeup.clone();
        let interval = engine.config().reap_interval;
        self.thread_handle = Some(
            thread::Builder::new()
                .name("context-reaper".to_owned())
                .spawn(move || {
                    while running.load(Ordering::Relaxed) {
                        let now = SystemTime::now()
                            .duration_since(UNIX_EPOCH)
                            .unwrap_or_default();
                        let pruned = engine.reap(now);
                        if pruned > 0 {
                            debug!("reaper pruned {} contexts", pruned);
                        }
                        let (lock, cond) = &*wakeup;
                        let guard = lock.lock().unwrap();
                        let _ = cond.wait_timeout(guard, interval).unwrap();
                    }
                })
                .unwrap(),
        );
        info!("context reaper started");
    }

    pub fn notify_stop(&mut self) -> Option<JoinHandle<()>> {
        if !self.running.swap(false, Ordering::Relaxed) {
            return None;
        }
        let (_, cond) = &*self.wakeup;
        cond.notify_all();
        info!("context reaper stopping");
        self.thread_handle.take()
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.notify_stop() {
            let _ = handle.join();
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}
