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

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

/// Which side of the observed target a slice travels on. Capture planes that
/// cannot tell report `NotKnown`.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    FromTarget,
    ToTarget,
    NotKnown,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::NotKnown
    }
}

// According to pcap-linktype(7) and http://www.tcpdump.org/linktypes.html
#[derive(
    Serialize,
    Deserialize,
    Debug,
    PartialEq,
    Eq,
    Clone,
    Copy,
    TryFromPrimitive,
    IntoPrimitive,
)]
#[repr(u8)]
pub enum LinkType {
    Null = 0,
    Ethernet = 1,
    Raw = 101,
    LinuxSLL = 113,
    Ipv4 = 228,
    Ipv6 = 229,
}

impl Default for LinkType {
    fn default() -> Self {
        LinkType::Ethernet
    }
}

// IpProtocol is an enumeration of IP protocol values, and acts as a decoder
// for any next-protocol field it supports.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum IpProtocol {
    Ipv6HopByHop = 0,
    Icmpv4 = 1,
    Tcp = 6,
    Udp = 17,
    Ipv6Routing = 43,
    Ipv6Fragment = 44,
    Gre = 47,
    Esp = 50,
    Ah = 51,
    Icmpv6 = 58,
    NoNextHeader = 59,
    Ipv6Destination = 60,
    #[num_enum(default)]
    Unknown = 255,
}

impl Default for IpProtocol {
    fn default() -> Self {
        IpProtocol::Unknown
    }
}

impl IpProtocol {
    /// IPv6 extension headers that carry a next-header field and are walked
    /// through rather than dispatched on.
    pub fn is_ipv6_extension(&self) -> bool {
        matches!(
            self,
            IpProtocol::Ipv6HopByHop
                | IpProtocol::Ipv6Routing
                | IpProtocol::Ipv6Destination
                | IpProtocol::Ah
        )
    }
}

impl PartialEq<u8> for IpProtocol {
    fn eq(&self, other: &u8) -> bool {
        u8::from(*self).eq(other)
    }
}

bitflags! {
    #[derive(Default)]
    pub struct TcpFlags: u16 {
        const FIN = 0x001;
        const SYN = 0x002;
        const RST = 0x004;
        const PSH = 0x008;
        const ACK = 0x010;
        const URG = 0x020;
        const ECE = 0x040;
        const CWR = 0x080;
        const NS = 0x100;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_protocol_from_wire() {
        assert_eq!(IpProtocol::try_from(6u8).unwrap(), IpProtocol::Tcp);
        assert_eq!(IpProtocol::try_from(17u8).unwrap(), IpProtocol::Udp);
        // unassigned values collapse to Unknown rather than failing
        assert_eq!(IpProtocol::try_from(200u8).unwrap(), IpProtocol::Unknown);
    }

    #[test]
    fn tcp_flags_from_wire() {
        let flags = TcpFlags::from_bits_truncate(0x012);
        assert!(flags.contains(TcpFlags::SYN));
        assert!(flags.contains(TcpFlags::ACK));
        assert!(!flags.contains(TcpFlags::FIN));
    }
}
