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

//! RTP fixed-header decoding on flows negotiated via SDP. Media payload is
//! not interpreted.

use std::sync::Arc;

use crate::common::address::FlowAddress;
use crate::common::pdu::PduSlice;
use crate::config::AnalyzerConfig;
use crate::context::{Context, ContextState};
use crate::engine::Manager;
use crate::error::{Error, Result};
use crate::event::{EventData, EventType};
use crate::utils::bytes::{read_u16_be, read_u32_be};

const RTP_HEADER_LEN: usize = 12;

pub fn process(
    mgr: &dyn Manager,
    _config: &AnalyzerConfig,
    udp_ctx: &Arc<Context>,
    slice: &PduSlice,
) -> Result<()> {
    let data = slice.data;
    if data.len() < RTP_HEADER_LEN || data[0] >> 6 != 2 {
        return Err(Error::RtpParseFailed);
    }
    let ctx = Context::get_or_create(udp_ctx, FlowAddress::application("rtp"), || {
        ContextState::Rtp
    });
    ctx.touch(slice.time);

    mgr.handle(ctx.event(
        EventType::Rtp,
        slice.time,
        slice.direction,
        EventData::Rtp {
            payload_type: data[1] & 0x7f,
            sequence: read_u16_be(&data[2..4]),
            timestamp: read_u32_be(&data[4..8]),
            ssrc: read_u32_be(&data[8..12]),
        },
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::common::address::Address;
    use crate::common::enums::Direction;
    use crate::event::Event;

    struct Collect(Mutex<Vec<Event>>);
    impl Manager for Collect {
        fn handle(&self, e: Event) {
            self.0.lock().unwrap().push(e);
        }
    }

    fn udp_ctx() -> Arc<Context> {
        let root = Context::root("d", "n");
        let ip = Context::get_or_create(
            &root,
            FlowAddress::new(
                Address::ipv4("10.0.0.1".parse().unwrap()),
                Address::ipv4("10.0.0.2".parse().unwrap()),
            ),
            || ContextState::Ip4(crate::decoders::ip::IpState::default()),
        );
        Context::get_or_create(
            &ip,
            FlowAddress::new(Address::udp_port(49170), Address::udp_port(49171)),
            || ContextState::Udp,
        )
    }

    #[test]
    fn header_fields_decoded() {
        let mut pkt = vec![0x80u8, 0x60]; // v2, PT 96
        pkt.extend_from_slice(&0x1234u16.to_be_bytes());
        pkt.extend_from_slice(&0xdeadbeefu32.to_be_bytes());
        pkt.extend_from_slice(&0xcafef00du32.to_be_bytes());
        pkt.extend_from_slice(&[0u8; 20]);

        let ctx = udp_ctx();
        let sink = Collect(Mutex::new(Vec::new()));
        let slice = PduSlice::new(&pkt, Duration::from_secs(1), Direction::NotKnown);
        process(&sink, &AnalyzerConfig::default(), &ctx, &slice).unwrap();
        let events = sink.0.into_inner().unwrap();
        assert_eq!(events.len(), 1);
        match events[0].data {
            EventData::Rtp {
                payload_type,
                sequence,
                ssrc,
                ..
            } => {
                assert_eq!(payload_type, 96);
                assert_eq!(sequence, 0x1234);
                assert_eq!(ssrc, 0xcafef00d);
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn wrong_version_rejected() {
        let ctx = udp_ctx();
        struct Null;
        impl Manager for Null {
            fn handle(&self, _: Event) {}
        }
        let pkt = [0u8; 12];
        let slice = PduSlice::new(&pkt, Duration::from_secs(1), Direction::NotKnown);
        assert!(matches!(
            process(&Null, &AnalyzerConfig::default(), &ctx, &slice),
            Err(Error::RtpParseFailed)
        ));
    }
}
