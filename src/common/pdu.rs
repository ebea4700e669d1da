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

use std::time::Duration;

use super::enums::Direction;

/// A borrowed view of contiguous packet bytes plus capture metadata. Slices
/// never own the capture buffer; decoders copy anything they keep beyond the
/// current call into their context.
#[derive(Debug, Clone, Copy)]
pub struct PduSlice<'a> {
    pub data: &'a [u8],
    /// Capture timestamp, as duration since the Unix epoch.
    pub time: Duration,
    pub direction: Direction,
}

impl<'a> PduSlice<'a> {
    pub fn new(data: &'a [u8], time: Duration, direction: Direction) -> Self {
        Self {
            data,
            time,
            direction,
        }
    }

    /// The same slice narrowed to a payload range, keeping provenance. The
    /// range may also point into a reassembled buffer owned by the caller.
    pub fn narrow<'b>(&self, data: &'b [u8]) -> PduSlice<'b> {
        PduSlice {
            data,
            time: self.time,
            direction: self.direction,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
