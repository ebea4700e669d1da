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

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::Serialize;

use crate::utils::bytes::read_u16_be;

/// Protocol layer an address belongs to.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Root,
    Link,
    Ip4,
    Ip6,
    Tcp,
    Udp,
    Application,
}

/// An endpoint at some layer: a layer tag plus the raw address bytes.
/// IPv4/IPv6 addresses are stored in network order, ports as two big-endian
/// bytes, application addresses as an opaque protocol tag.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    pub layer: Layer,
    pub bytes: Vec<u8>,
}

impl Address {
    pub fn empty(layer: Layer) -> Self {
        Self {
            layer,
            bytes: Vec::new(),
        }
    }

    pub fn ipv4(a: Ipv4Addr) -> Self {
        Self {
            layer: Layer::Ip4,
            bytes: a.octets().to_vec(),
        }
    }

    pub fn ipv6(a: Ipv6Addr) -> Self {
        Self {
            layer: Layer::Ip6,
            bytes: a.octets().to_vec(),
        }
    }

    pub fn tcp_port(p: u16) -> Self {
        Self {
            layer: Layer::Tcp,
            bytes: p.to_be_bytes().to_vec(),
        }
    }

    pub fn udp_port(p: u16) -> Self {
        Self {
            layer: Layer::Udp,
            bytes: p.to_be_bytes().to_vec(),
        }
    }

    pub fn application(tag: &str) -> Self {
        Self {
            layer: Layer::Application,
            bytes: tag.as_bytes().to_vec(),
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self.layer {
            Layer::Tcp | Layer::Udp if self.bytes.len() == 2 => Some(read_u16_be(&self.bytes)),
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.layer {
            Layer::Ip4 if self.bytes.len() == 4 => {
                let o = &self.bytes;
                write!(f, "{}.{}.{}.{}", o[0], o[1], o[2], o[3])
            }
            Layer::Ip6 if self.bytes.len() == 16 => {
                let mut o = [0u8; 16];
                o.copy_from_slice(&self.bytes);
                write!(f, "{}", Ipv6Addr::from(o))
            }
            Layer::Tcp | Layer::Udp if self.bytes.len() == 2 => {
                write!(f, "{}", read_u16_be(&self.bytes))
            }
            Layer::Application => {
                write!(f, "{}", String::from_utf8_lossy(&self.bytes))
            }
            _ => {
                for b in &self.bytes {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

/// A directional `(src, dst)` endpoint pair at one layer. Its reverse is the
/// same pair swapped; child context maps are keyed by this type so the
/// reverse-flow twin is a single map lookup away.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlowAddress {
    pub src: Address,
    pub dst: Address,
}

impl FlowAddress {
    pub fn new(src: Address, dst: Address) -> Self {
        Self { src, dst }
    }

    /// Non-directional key for protocols that anchor a single context per
    /// flow rather than one per direction.
    pub fn application(tag: &str) -> Self {
        Self {
            src: Address::application(tag),
            dst: Address::application(tag),
        }
    }

    pub fn layer(&self) -> Layer {
        self.src.layer
    }

    pub fn reverse(&self) -> Self {
        Self {
            src: self.dst.clone(),
            dst: self.src.clone(),
        }
    }
}

impl fmt::Display for FlowAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}
