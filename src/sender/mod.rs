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

//! Outbound event path: a bounded blocking queue feeding a writer thread
//! that serializes events as JSON lines. Producers (the decode path) block
//! when the queue is full, which is the pipeline's backpressure.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::engine::Manager;
use crate::event::Event;
use crate::utils::queue::{self, Error as QueueError, Receiver, Sender};

const RECV_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct SenderCounter {
    pub rx: AtomicU64,
    pub tx: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub dropped: AtomicU64,
}

/// `Manager` implementation that enqueues events for the sender thread.
/// Sending blocks while the queue is full; events arriving after shutdown
/// are counted as dropped.
pub struct QueueSink {
    input: Sender<Event>,
    counter: Arc<SenderCounter>,
}

impl Manager for QueueSink {
    fn handle(&self, event: Event) {
        self.counter.rx.fetch_add(1, Ordering::Relaxed);
        if self.input.send(event).is_err() {
            self.counter.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Writer half: drains the queue and emits one JSON document per line.
pub struct EventSenderThread<W> {
    name: &'static str,
    output: Option<(Receiver<Event>, W)>,
    input: Sender<Event>,
    counter: Arc<SenderCounter>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl<W: Write + Send + 'static> EventSenderThread<W> {
    pub fn new(name: &'static str, queue_size: usize, writer: W) -> Self {
        let (input, output) = queue::bounded(queue_size);
        Self {
            name,
            output: Some((output, writer)),
            input,
            counter: Arc::new(SenderCounter::default()),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }

    /// The producer side, to hand to an `Engine` as its sink.
    pub fn sink(&self) -> Arc<QueueSink> {
        Arc::new(QueueSink {
            input: self.input.clone(),
            counter: self.counter.clone(),
        })
    }

    pub fn counter(&self) -> Arc<SenderCounter> {
        self.counter.clone()
    }

    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::Relaxed) {
            warn!("{} sender already started, do nothing", self.name);
            return;
        }
        let (output, mut writer) = self.output.take().expect("sender started twice");
        let running = self.running.clone();
        let counter = self.counter.clone();
        let name = self.name;
        self.thread_handle = Some(
            thread::Builder::new()
                .name("event-sender".to_owned())
                .spawn(move || {
                    loop {
                        match output.recv(Some(RECV_TIMEOUT)) {
                            Ok(event) => {
                                if let Err(e) = write_event(&mut writer, &event, &counter) {
                                    debug!("{} sender write failed: {}", name, e);
                                    counter.dropped.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                            Err(QueueError::Timeout) => {
                                if !running.load(Ordering::Relaxed) {
                                    break;
                                }
                                let _ = writer.flush();
                            }
                            Err(QueueError::Terminated(_)) => break,
                        }
                    }
                    let _ = writer.flush();
                })
                .unwrap(),
        );
        info!("{} event sender started", self.name);
    }

    /// Cooperative shutdown: stops accepting input, lets the thread drain
    /// what is queued, then joins it.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        self.input.terminate();
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        info!("{} event sender stopped", self.name);
    }
}

impl<W> Drop for EventSenderThread<W> {
    fn drop(&mut self) {
        if self.running.swap(false, Ordering::Relaxed) {
            self.input.terminate();
            if let Some(handle) = self.thread_handle.take() {
                let _ = handle.join();
            }
        }
    }
}

fn write_event<W: Write>(
    writer: &mut W,
    event: &Event,
    counter: &SenderCounter,
) -> std::io::Result<()> {
    let line = event
        .to_json()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    counter.tx.fetch_add(1, Ordering::Relaxed);
    counter
        .tx_bytes
        .fetch_add(line.len() as u64 + 1, Ordering::Relaxed);
    Ok(())
}

/// `Write` implementation collecting into shared memory, for tests and
/// embedders that post-process the stream themselves.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
