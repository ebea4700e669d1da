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

use std::sync::Arc;

use log::{debug, warn};

use super::tcp_ports;
use super::{CloseNotify, Processor};
use crate::common::address::{Address, FlowAddress};
use crate::common::enums::TcpFlags;
use crate::common::pdu::PduSlice;
use crate::config::AnalyzerConfig;
use crate::context::{Context, ContextState};
use crate::engine::Manager;
use crate::error::{Error, Result};
use crate::event::{EventData, EventType};
use crate::utils::bytes::{read_u16_be, read_u32_be};
use crate::utils::serial::{seq_gt, seq_sub};

const TCP_MIN_HEADER_LEN: usize = 20;

/// Connection progress of one direction of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    New,
    SynSeen,
    Connected,
    Closing,
    Closed,
}

/// An out-of-order segment waiting for the gap before it to fill.
struct TcpSegment {
    first: u32,
    data: Vec<u8>,
}

/// Per-direction TCP decoder state: handshake/teardown flags, the serial
/// sequence cursor, the bounded out-of-order segment set, and the service
/// identification buffer that feeds `tcp_ports` until the upper-layer
/// processor is resolved.
pub struct TcpState {
    state: ConnState,
    syn_observed: bool,
    fin_observed: bool,
    connected: bool,
    down_reported: bool,

    svc_idented: bool,
    ident_failed: bool,
    ident_buffer: Vec<u8>,
    processor: Option<Processor>,
    on_close: Option<CloseNotify>,

    seq_valid: bool,
    seq_expected: u32,
    ack_received: u32,
    segments: Vec<TcpSegment>,
}

impl Default for TcpState {
    fn default() -> Self {
        Self {
            state: ConnState::New,
            syn_observed: false,
            fin_observed: false,
            connected: false,
            down_reported: false,
            svc_idented: false,
            ident_failed: false,
            ident_buffer: Vec::new(),
            processor: None,
            on_close: None,
            seq_valid: false,
            seq_expected: 0,
            ack_received: 0,
            segments: Vec::new(),
        }
    }
}

impl TcpState {
    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// Highest acknowledgement seen from this direction.
    pub fn ack_received(&self) -> u32 {
        self.ack_received
    }

    /// Resolved processing function, once service identification completes.
    pub fn processor(&self) -> Option<Processor> {
        self.processor
    }

    /// Replaces the resolved processor; used when a parser escalates the
    /// flow, e.g. STARTTLS handing the stream over to the TLS decoder. Any
    /// close notification of the replaced service is dropped with it.
    pub fn escalate(&mut self, processor: Processor) {
        self.svc_idented = true;
        self.processor = Some(processor);
        self.on_close = None;
    }

    /// Feeds one segment through the serial-space reassembler, appending any
    /// newly contiguous bytes to `deliver`. Out-of-order data is queued up
    /// to `max_segments`; duplicates and left overlap are discarded, right
    /// overlap against queued data is trimmed (keep-first).
    fn ingest(&mut self, seq: u32, data: &[u8], max_segments: usize, deliver: &mut Vec<u8>) {
        if data.is_empty() {
            return;
        }
        if !self.seq_valid {
            self.seq_valid = true;
            self.seq_expected = seq;
        }

        let mut seq = seq;
        let mut data = data;
        // trim against bytes already delivered
        let behind = seq_sub(self.seq_expected, seq);
        if behind > 0 {
            if behind as usize >= data.len() {
                return; // wholly in the past: retransmission
            }
            data = &data[behind as usize..];
            seq = self.seq_expected;
        }

        if seq == self.seq_expected {
            deliver.extend_from_slice(data);
            self.seq_expected = seq.wrapping_add(data.len() as u32);
            self.drain_contiguous(deliver);
        } else {
            self.queue_segment(seq, data, max_segments);
        }
    }

    fn drain_contiguous(&mut self, deliver: &mut Vec<u8>) {
        loop {
            if self.segments.is_empty() {
                return;
            }
            let off = seq_sub(self.segments[0].first, self.seq_expected);
            if off > 0 {
                return;
            }
            let seg = self.segments.remove(0);
            let skip = (-off) as usize;
            if skip >= seg.data.len() {
                continue; // overtaken entirely by delivered data
            }
            deliver.extend_from_slice(&seg.data[skip..]);
            self.seq_expected = seg.first.wrapping_add(seg.data.len() as u32);
        }
    }

    fn queue_segment(&mut self, seq: u32, data: &[u8], max_segments: usize) {
        let mut seq = seq;
        let mut data = data.to_vec();

        let off = seq_sub(seq, self.seq_expected);
        debug_assert!(off > 0);
        let idx = self
            .segments
            .partition_point(|s| seq_sub(s.first, self.seq_expected) <= off);

        if idx > 0 {
            let pred = &self.segments[idx - 1];
            let pred_end = pred.first.wrapping_add(pred.data.len() as u32);
            let covered = seq_sub(pred_end, seq);
            if covered > 0 {
                if covered as usize >= data.len() {
                    return; // fully covered by an earlier arrival
                }
                data.drain(..covered as usize);
                seq = pred_end;
            }
        }
        if idx < self.segments.len() {
            let succ_first = self.segments[idx].first;
            let end = seq.wrapping_add(data.len() as u32);
            if seq_gt(end, succ_first) {
                let keep = seq_sub(succ_first, seq);
                if keep <= 0 {
                    return;
                }
                data.truncate(keep as usize);
            }
        }
        if data.is_empty() {
            return;
        }
        if self.segments.len() >= max_segments {
            warn!("tcp segment set full, dropping out-of-order data");
            return;
        }
        self.segments.insert(idx, TcpSegment { first: seq, data });
    }
}

/// Identification outcome computed under the state lock; the processor call
/// and event emission happen after it is released.
struct Delivery {
    processor: Option<Processor>,
    bytes: Vec<u8>,
    unrecognised: Option<Vec<u8>>,
}

/// TCP processing: resolves the per-direction flow context, tracks
/// connection state against the reverse twin, reassembles the byte stream
/// and routes it to the identified upper-layer parser.
pub fn process(
    mgr: &dyn Manager,
    config: &AnalyzerConfig,
    ip_ctx: &Arc<Context>,
    slice: &PduSlice,
) -> Result<()> {
    let data = slice.data;
    if data.len() < TCP_MIN_HEADER_LEN {
        return Err(Error::Truncated("tcp"));
    }
    let src_port = read_u16_be(&data[0..2]);
    let dst_port = read_u16_be(&data[2..4]);
    let seq = read_u32_be(&data[4..8]);
    let ack = read_u32_be(&data[8..12]);
    let header_len = ((data[12] >> 4) as usize) * 4;
    if header_len < TCP_MIN_HEADER_LEN || data.len() < header_len {
        return Err(Error::Truncated("tcp"));
    }
    let flags = TcpFlags::from_bits_truncate((((data[12] & 0x01) as u16) << 8) | data[13] as u16);
    let payload = &data[header_len..];

    let ctx = Context::get_or_create(
        ip_ctx,
        FlowAddress::new(Address::tcp_port(src_port), Address::tcp_port(dst_port)),
        || ContextState::Tcp(TcpState::default()),
    );
    ctx.touch(slice.time);

    // state machine and reassembly under this direction's lock
    let mut deliver = Vec::new();
    let was_connected = ctx.with_state(|s| {
        let ContextState::Tcp(tcp) = s else {
            return Err(Error::ContextStateMismatch);
        };
        let was_connected = tcp.connected;
        if flags.contains(TcpFlags::SYN) {
            tcp.syn_observed = true;
            tcp.state = ConnState::SynSeen;
            tcp.seq_valid = true;
            tcp.seq_expected = seq.wrapping_add(1);
        }
        if flags.contains(TcpFlags::ACK) {
            tcp.ack_received = ack;
        }
        if flags.contains(TcpFlags::FIN) {
            tcp.fin_observed = true;
            if tcp.state != ConnState::Closed {
                tcp.state = ConnState::Closing;
            }
        }
        if flags.contains(TcpFlags::RST) {
            tcp.state = ConnState::Closed;
        }
        if !payload.is_empty() && !flags.contains(TcpFlags::SYN) {
            tcp.ingest(seq, payload, config.max_segments, &mut deliver);
        }
        Ok(was_connected)
    })?;

    // the ACK that answers a SYN lands on the opposite direction's context
    if flags.contains(TcpFlags::ACK) {
        let established = match ctx.reverse() {
            Some(rev) => rev.with_state(|s| {
                if let ContextState::Tcp(tcp) = s {
                    if tcp.syn_observed && !tcp.connected {
                        tcp.connected = true;
                        tcp.state = ConnState::Connected;
                        return true;
                    }
                }
                false
            }),
            None => false,
        };
        if established && !was_connected {
            mgr.handle(ctx.event(
                EventType::ConnectionUp,
                slice.time,
                slice.direction,
                EventData::Empty {},
            ));
        }
    }

    if !deliver.is_empty() {
        let delivery = ctx.with_state(|s| {
            let ContextState::Tcp(tcp) = s else {
                return Err(Error::ContextStateMismatch);
            };
            Ok(identify_and_route(tcp, config, src_port, dst_port, &deliver))
        })?;
        if let Some(buffer) = delivery.unrecognised {
            mgr.handle(ctx.event(
                EventType::UnrecognisedStream,
                slice.time,
                slice.direction,
                EventData::Payload { payload: buffer },
            ));
        }
        if let Some(processor) = delivery.processor {
            let stream = slice.narrow(&delivery.bytes);
            processor(mgr, config, &ctx, &stream)?;
        }
    }

    // teardown runs after delivery so data riding the FIN reaches the
    // parser before its close notification
    if flags.intersects(TcpFlags::FIN | TcpFlags::RST) && teardown_complete(&ctx, flags) {
        close_services(mgr, config, &ctx, slice);
        mgr.handle(ctx.event(
            EventType::ConnectionDown,
            slice.time,
            slice.direction,
            EventData::Empty {},
        ));
    }

    Ok(())
}

fn identify_and_route(
    tcp: &mut TcpState,
    config: &AnalyzerConfig,
    src_port: u16,
    dst_port: u16,
    deliver: &[u8],
) -> Delivery {
    if tcp.svc_idented {
        return Delivery {
            processor: tcp.processor,
            bytes: deliver.to_vec(),
            unrecognised: None,
        };
    }
    if tcp.ident_failed {
        // stays untyped; bytes are dropped after the one report
        return Delivery {
            processor: None,
            bytes: Vec::new(),
            unrecognised: None,
        };
    }

    let room = config.ident_buffer_max - tcp.ident_buffer.len().min(config.ident_buffer_max);
    tcp.ident_buffer
        .extend_from_slice(&deliver[..deliver.len().min(room)]);

    if let Some(service) = tcp_ports::identify(src_port, dst_port, &tcp.ident_buffer) {
        tcp.svc_idented = true;
        tcp.processor = Some(service.processor);
        tcp.on_close = service.on_close;
        let bytes = std::mem::take(&mut tcp.ident_buffer);
        debug!("tcp flow {} -> {} identified", src_port, dst_port);
        return Delivery {
            processor: Some(service.processor),
            bytes,
            unrecognised: None,
        };
    }

    if tcp.ident_buffer.len() >= config.ident_buffer_max {
        tcp.ident_failed = true;
        let buffer = std::mem::take(&mut tcp.ident_buffer);
        return Delivery {
            processor: None,
            bytes: Vec::new(),
            unrecognised: Some(buffer),
        };
    }

    Delivery {
        processor: None,
        bytes: Vec::new(),
        unrecognised: None,
    }
}

/// Decides, exactly once per flow pair, that the connection has closed:
/// both directions saw FIN, or either was reset.
fn teardown_complete(ctx: &Arc<Context>, flags: TcpFlags) -> bool {
    let rst = flags.contains(TcpFlags::RST);
    let (self_fin, self_reported) = ctx.with_state(|s| {
        if let ContextState::Tcp(tcp) = s {
            (tcp.fin_observed, tcp.down_reported)
        } else {
            (false, false)
        }
    });
    let other_side = ctx.reverse().map(|rev| {
        rev.with_state(|s| {
            if let ContextState::Tcp(tcp) = s {
                if rst {
                    tcp.state = ConnState::Closed;
                }
                (tcp.fin_observed, tcp.down_reported)
            } else {
                (false, false)
            }
        })
    });
    let (rev_fin, rev_reported) = other_side.unwrap_or((false, false));

    let closed = rst || (self_fin && rev_fin);
    if closed && !self_reported && !rev_reported {
        ctx.with_state(|s| {
            if let ContextState::Tcp(tcp) = s {
                tcp.down_reported = true;
                tcp.state = ConnState::Closed;
            }
        });
        return true;
    }
    false
}

/// Hands the close to both directions' resolved services, once each, so
/// parsers can flush what the connection end delimits.
fn close_services(mgr: &dyn Manager, config: &AnalyzerConfig, ctx: &Arc<Context>, slice: &PduSlice) {
    for side in [Some(ctx.clone()), ctx.reverse()].into_iter().flatten() {
        let handler = side.with_state(|s| match s {
            ContextState::Tcp(tcp) => tcp.on_close.take(),
            _ => None,
        });
        if let Some(on_close) = handler {
            if let Err(e) = on_close(mgr, config, &side, slice) {
                debug!("close notification failed: {}", e);
            }
        }
    }
}
