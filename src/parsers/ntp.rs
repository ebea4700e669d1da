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

//! NTP datagrams split by mode: ordinary timestamp exchanges, control
//! (mode 6) and the implementation-private mode 7.

use std::sync::Arc;

use crate::common::address::FlowAddress;
use crate::common::pdu::PduSlice;
use crate::config::AnalyzerConfig;
use crate::context::{Context, ContextState};
use crate::engine::Manager;
use crate::error::{Error, Result};
use crate::event::{EventData, EventType};

const NTP_TIMESTAMP_LEN: usize = 48;

const MODE_CONTROL: u8 = 6;
const MODE_PRIVATE: u8 = 7;

pub fn process(
    mgr: &dyn Manager,
    _config: &AnalyzerConfig,
    udp_ctx: &Arc<Context>,
    slice: &PduSlice,
) -> Result<()> {
    let data = slice.data;
    if data.is_empty() {
        return Err(Error::NtpParseFailed);
    }
    let version = (data[0] >> 3) & 0x07;
    let mode = data[0] & 0x07;

    let ctx = Context::get_or_create(udp_ctx, FlowAddress::application("ntp"), || {
        ContextState::Ntp
    });
    ctx.touch(slice.time);

    let (action, payload) = match mode {
        MODE_CONTROL => (EventType::NtpControlMessage, EventData::NtpControl { version }),
        MODE_PRIVATE => (EventType::NtpPrivateMessage, EventData::NtpPrivate { version }),
        _ => {
            if data.len() < NTP_TIMESTAMP_LEN {
                return Err(Error::NtpParseFailed);
            }
            (
                EventType::NtpTimestampMessage,
                EventData::NtpTimestamp {
                    version,
                    mode,
                    stratum: data[1],
                    poll: data[2] as i8,
                    precision: data[3] as i8,
                },
            )
        }
    };
    mgr.handle(ctx.event(action, slice.time, slice.direction, payload));
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
            FlowAddress::new(Address::udp_port(123), Address::udp_port(123)),
            || ContextState::Udp,
        )
    }

    #[test]
    fn modes_split() {
        let ctx = udp_ctx();
        let sink = Collect(Mutex::new(Vec::new()));
        let mut client = vec![0u8; 48];
        client[0] = 0x23; // v4, mode 3
        let mut control = vec![0u8; 12];
        control[0] = 0x26; // v4, mode 6
        for p in [&client, &control] {
            let slice = PduSlice::new(p, Duration::from_secs(1), Direction::NotKnown);
            process(&sink, &AnalyzerConfig::default(), &ctx, &slice).unwrap();
        }
        let events = sink.0.into_inner().unwrap();
        assert_eq!(events[0].action, EventType::NtpTimestampMessage);
        assert_eq!(events[1].action, EventType::NtpControlMessage);
        match events[0].data {
            EventData::NtpTimestamp { version, mode, .. } => {
                assert_eq!(version, 4);
                assert_eq!(mode, 3);
            }
            _ => panic!("wrong payload"),
        }
    }
}
