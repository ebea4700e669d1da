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

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum Error<T> {
    #[error("the queue receiving operation has timed out")]
    Timeout,
    #[error("the queue has terminated")]
    Terminated(Option<T>),
}

struct Shared<T> {
    queue: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

struct State<T> {
    items: VecDeque<T>,
    capacity: usize,
    running: bool,
}

/// Fixed-capacity blocking MPSC queue. Producers block on a condition
/// variable when the queue is full; terminating wakes everyone and lets the
/// consumer drain what is left.
pub fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(State {
            items: VecDeque::with_capacity(capacity),
            capacity,
            running: true,
        }),
        not_empty: Condvar::new(),
        not_full: Condvar::new(),
    });
    (
        Sender {
            shared: shared.clone(),
        },
        Receiver { shared },
    )
}

pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Sender<T> {
    pub fn send(&self, item: T) -> Result<(), Error<T>> {
        let mut state = self.shared.queue.lock().unwrap();
        loop {
            if !state.running {
                return Err(Error::Terminated(Some(item)));
            }
            if state.items.len() < state.capacity {
                break;
            }
            state = self.shared.not_full.wait(state).unwrap();
        }
        state.items.push_back(item);
        drop(state);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    pub fn terminate(&self) {
        let mut state = self.shared.queue.lock().unwrap();
        state.running = false;
        drop(state);
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
    }
}

pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Receiver<T> {
    /// Blocks until an item arrives, the timeout elapses, or the queue
    /// terminates with nothing left to drain.
    pub fn recv(&self, timeout: Option<Duration>) -> Result<T, Error<T>> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut state = self.shared.queue.lock().unwrap();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.shared.not_full.notify_one();
                return Ok(item);
            }
            if !state.running {
                return Err(Error::Terminated(None));
            }
            state = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(Error::Timeout);
                    }
                    let (guard, result) = self
                        .shared
                        .not_empty
                        .wait_timeout(state, d - now)
                        .unwrap();
                    if result.timed_out() && guard.items.is_empty() {
                        if !guard.running {
                            return Err(Error::Terminated(None));
                        }
                        return Err(Error::Timeout);
                    }
                    guard
                }
                None => self.shared.not_empty.wait(state).unwrap(),
            };
        }
    }

    pub fn terminate(&self) {
        let mut state = self.shared.queue.lock().unwrap();
        state.running = false;
        drop(state);
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.shared.queue.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
