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

//! Datagram reassembly in the RFC 815 style: each pending datagram keeps a
//! hole list, initially `[0, ∞]`, narrowed or split by every arriving
//! fragment. An empty hole list means the datagram is complete.

use std::collections::{HashMap, VecDeque};

use log::warn;

/// A byte range of the datagram not yet received, bounds inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Hole {
    first: u64,
    last: u64,
}

const HOLE_INFINITY: u64 = u64::MAX;

#[derive(Debug, Clone)]
struct Fragment {
    first: u64,
    data: Vec<u8>,
}

#[derive(Debug)]
struct Pending {
    holes: Vec<Hole>,
    frags: Vec<Fragment>,
}

impl Pending {
    fn new() -> Self {
        Self {
            holes: vec![Hole {
                first: 0,
                last: HOLE_INFINITY,
            }],
            frags: Vec::new(),
        }
    }
}

/// Reassembly key within one IP flow context: next protocol plus the
/// datagram identification field.
pub type FragKey = (u8, u32);

/// Pending reassemblies for one IP flow. The total number of buffered
/// fragments is capped; on overflow the oldest pending datagram is dropped
/// whole.
#[derive(Debug, Default)]
pub struct ReassemblyTable {
    pending: HashMap<FragKey, Pending>,
    /// Keys in arrival order of their first fragment.
    order: VecDeque<FragKey>,
    frag_count: usize,
}

impl ReassemblyTable {
    /// Feeds one fragment. `offset` is the byte offset of the fragment
    /// within the datagram, `more` the more-fragments flag. Returns the
    /// reconstructed datagram when the hole list empties.
    pub fn add_fragment(
        &mut self,
        key: FragKey,
        offset: u64,
        more: bool,
        data: &[u8],
        max_frags: usize,
    ) -> Option<Vec<u8>> {
        if data.is_empty() {
            return None;
        }
        if self.frag_count >= max_frags {
            self.evict_oldest(&key);
        }

        if !self.pending.contains_key(&key) {
            self.pending.insert(key, Pending::new());
            self.order.push_back(key);
        }
        let entry = self.pending.get_mut(&key).unwrap();

        let first = offset;
        let last = offset + data.len() as u64 - 1;

        // duplicates are common on lossy taps; an identical range is a no-op
        if entry
            .frags
            .iter()
            .any(|f| f.first == first && f.data.len() == data.len())
        {
            return None;
        }

        let mut holes = Vec::with_capacity(entry.holes.len() + 1);
        for hole in entry.holes.drain(..) {
            if first > hole.last || last < hole.first {
                holes.push(hole);
                continue;
            }
            if hole.first < first {
                holes.push(Hole {
                    first: hole.first,
                    last: first - 1,
                });
            }
            if last < hole.last && (more || hole.last != HOLE_INFINITY) {
                holes.push(Hole {
                    first: last + 1,
                    last: hole.last,
                });
            }
        }
        if !more {
            // the final fragment fixes the datagram length
            holes.retain(|h| h.first <= last);
            for h in holes.iter_mut() {
                if h.last > last {
                    h.last = last;
                }
            }
        }
        entry.holes = holes;
        entry.frags.push(Fragment {
            first,
            data: data.to_vec(),
        });
        self.frag_count += 1;

        if !entry.holes.is_empty() {
            return None;
        }

        let entry = self.pending.remove(&key).unwrap();
        self.order.retain(|k| *k != key);
        self.frag_count -= entry.frags.len();

        let total = entry
            .frags
            .iter()
            .map(|f| f.first + f.data.len() as u64)
            .max()
            .unwrap_or(0) as usize;
        let mut out = vec![0u8; total];
        for frag in &entry.frags {
            let start = frag.first as usize;
            out[start..start + frag.data.len()].copy_from_slice(&frag.data);
        }
        Some(out)
    }

    pub fn pending_fragments(&self) -> usize {
        self.frag_count
    }

    pub fn pending_datagrams(&self) -> usize {
        self.pending.len()
    }

    fn evict_oldest(&mut self, incoming: &FragKey) {
        // prefer evicting another datagram over the one still arriving
        let victim = self
            .order
            .iter()
            .find(|k| *k != incoming)
            .or_else(|| self.order.front())
            .copied();
        if let Some(key) = victim {
            if let Some(entry) = self.pending.remove(&key) {
                self.frag_count -= entry.frags.len();
                warn!(
                    "fragment buffer full, dropping reassembly proto={} id={}",
                    key.0, key.1
                );
            }
            self.order.retain(|k| *k != key);
        }
    }
}
