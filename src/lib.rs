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

//! Passive network traffic analyzer.
//!
//! Link-layer packet slices enter through [`engine::Engine::process`], flow
//! through a tree of per-flow contexts and a chain of protocol decoders, and
//! come out the other side as semantic [`event::Event`]s tagged with the
//! observing device and network identity.

pub mod common;
pub mod config;
pub mod context;
pub mod decoders;
pub mod engine;
pub mod error;
pub mod event;
pub mod parsers;
pub mod sender;
pub mod utils;

pub use common::address::{Address, FlowAddress, Layer};
pub use common::enums::Direction;
pub use common::pdu::PduSlice;
pub use config::AnalyzerConfig;
pub use engine::{Engine, Manager};
pub use error::{Error, Result};
pub use event::{Event, EventType};
