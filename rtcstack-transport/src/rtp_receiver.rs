//! Receive side of an RTP session
//!
//! Validates and accounts for incoming RTP (RFC 3550 Appendix A), strips
//! RED and recovers FEC-protected losses, tracks the remote SSRC/CSRCs,
//! decodes telephone events and keeps the list of packets to NACK.
//!
//! Nothing here calls out to collaborators. Each packet yields a
//! [`ReceiveOutcome`] that the session delivers after the lock is released.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::callbacks::{AliveState, RtpHeaderInfo};
use crate::error::{TransportError, TransportResult};
use crate::fec::{parse_red, FecDecoder, FecPacket};
use crate::nack::{NackConfig, NackList, NackListEvent, NackStats};
use crate::payload_registry::{PayloadKind, PayloadRegistry, PayloadSpec};
use crate::rtcp::ReportBlock;
use crate::rtp_handler::{HeaderExtensionMap, HeaderExtensions, RtpExtensionType, RtpPacket};
use crate::seq_num::is_newer_timestamp;
use bytes::Bytes;
use rtcstack_config::RtpConfig;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, trace};

const RTP_SEQ_MOD: u32 = 1 << 16;

/// Jumps ahead larger than this restart validation
pub const MAX_DROPOUT: u32 = 3000;

/// Packets this far behind are treated as reordered, not as a restart
pub const MAX_MISORDER: u32 = 100;

/// Sequential packets needed before a source is valid
pub const MIN_SEQUENTIAL: u32 = 2;

/// Second byte of an RFC 2032 style FIR sent in the media stream
const FIR_OVER_RTP_PACKET_TYPE: u8 = 192;
const FIR_OVER_RTP_LENGTH: usize = 8;

/// Reception quality of the remote stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RtpStatistics {
    pub fraction_lost: u8,
    pub cumulative_lost: u32,
    pub extended_max_sequence: u32,
    /// Interarrival jitter in RTP timestamp units
    pub jitter: u32,
    pub max_jitter: u32,
}

/// Byte and packet counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DataCounters {
    pub payload_bytes: u64,
    pub packets: u32,
}

/// Per-source statistics as kept by RFC 3550 Appendix A.1, A.3 and A.8
#[derive(Debug, Clone, Default)]
pub struct ReceiveStatistics {
    initialized: bool,
    max_seq: u16,
    cycles: u32,
    base_seq: u32,
    bad_seq: u32,
    probation: u32,
    received: u32,
    expected_prior: u32,
    received_prior: u32,
    last_fraction_lost: u8,

    last_transit: Option<i64>,
    last_timestamp: Option<u32>,
    /// Q4 fixed point
    jitter_q4: u32,
    max_jitter: u32,

    counters: DataCounters,
}

impl ReceiveStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    fn init_seq(&mut self, seq: u16) {
        self.base_seq = u32::from(seq);
        self.max_seq = seq;
        self.bad_seq = RTP_SEQ_MOD + 1;
        self.cycles = 0;
        self.received = 0;
        self.received_prior = 0;
        self.expected_prior = 0;
    }

    /// Sequence validation; false while on probation or after a suspicious jump
    fn update_seq(&mut self, seq: u16) -> bool {
        if !self.initialized {
            self.initialized = true;
            self.init_seq(seq);
            self.max_seq = seq.wrapping_sub(1);
            self.probation = MIN_SEQUENTIAL;
        }

        let udelta = u32::from(seq.wrapping_sub(self.max_seq));
        if self.probation > 0 {
            if seq == self.max_seq.wrapping_add(1) {
                self.probation -= 1;
                self.max_seq = seq;
                if self.probation == 0 {
                    self.init_seq(seq);
                    self.received += 1;
                    return true;
                }
            } else {
                self.probation = MIN_SEQUENTIAL - 1;
                self.max_seq = seq;
            }
            return false;
        }

        if udelta < MAX_DROPOUT {
            if seq < self.max_seq {
                self.cycles += RTP_SEQ_MOD;
            }
            self.max_seq = seq;
        } else if udelta <= RTP_SEQ_MOD - MAX_MISORDER {
            if u32::from(seq) == self.bad_seq {
                // Two sequential packets after a jump: the source restarted
                debug!(seq, "Sequence restart accepted");
                self.init_seq(seq);
            } else {
                self.bad_seq = (u32::from(seq) + 1) & (RTP_SEQ_MOD - 1);
                return false;
            }
        }
        // else: duplicate or reordered
        self.received += 1;
        true
    }

    /// Account for one packet; `frequency_hz` of zero skips the jitter update
    pub fn on_packet(
        &mut self,
        sequence_number: u16,
        timestamp: u32,
        payload_len: usize,
        frequency_hz: u32,
        now_ms: i64,
    ) -> bool {
        let in_order = self.initialized
            && self.probation == 0
            && u32::from(sequence_number.wrapping_sub(self.max_seq)) < MAX_DROPOUT
            && sequence_number != self.max_seq;
        let valid = self.update_seq(sequence_number);

        self.counters.packets += 1;
        self.counters.payload_bytes += payload_len as u64;

        let new_timestamp = self.last_timestamp != Some(timestamp);
        if valid && in_order && new_timestamp && frequency_hz > 0 {
            let arrival = now_ms * i64::from(frequency_hz) / 1000;
            let transit = arrival - i64::from(timestamp);
            if let Some(last_transit) = self.last_transit {
                let d = (transit - last_transit).unsigned_abs().min(u64::from(u32::MAX >> 4)) as u32;
                self.jitter_q4 = self
                    .jitter_q4
                    .wrapping_add(d)
                    .wrapping_sub((self.jitter_q4 + 8) >> 4);
                self.max_jitter = self.max_jitter.max(self.jitter_q4 >> 4);
            }
            self.last_transit = Some(transit);
        }
        if valid && (in_order || self.last_timestamp.is_none()) {
            self.last_timestamp = Some(timestamp);
        }
        valid
    }

    pub fn extended_max_sequence(&self) -> u32 {
        self.cycles.wrapping_add(u32::from(self.max_seq))
    }

    fn expected(&self) -> u32 {
        self.extended_max_sequence()
            .wrapping_sub(self.base_seq)
            .wrapping_add(1)
    }

    /// Current statistics; `reset` starts a new reporting interval
    pub fn statistics(&mut self, reset: bool) -> Option<RtpStatistics> {
        if self.received == 0 {
            return None;
        }
        let expected = self.expected();
        let lost = i64::from(expected) - i64::from(self.received);
        let cumulative_lost = lost.clamp(0, 0x7F_FFFF) as u32;

        let expected_interval = expected.wrapping_sub(self.expected_prior);
        let received_interval = self.received.wrapping_sub(self.received_prior);
        let lost_interval = i64::from(expected_interval) - i64::from(received_interval);
        let fraction_lost = if expected_interval == 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval << 8) / i64::from(expected_interval)).min(255) as u8
        };

        if reset {
            self.expected_prior = expected;
            self.received_prior = self.received;
            self.last_fraction_lost = fraction_lost;
        }
        Some(RtpStatistics {
            fraction_lost: if reset { fraction_lost } else { self.last_fraction_lost },
            cumulative_lost,
            extended_max_sequence: self.extended_max_sequence(),
            jitter: self.jitter_q4 >> 4,
            max_jitter: self.max_jitter,
        })
    }

    /// Block for our next RR; starts a new reporting interval
    pub fn report_block(&mut self, source_ssrc: u32) -> Option<ReportBlock> {
        let stats = self.statistics(true)?;
        Some(ReportBlock {
            ssrc: source_ssrc,
            fraction_lost: stats.fraction_lost,
            cumulative_lost: stats.cumulative_lost as i32,
            extended_highest_sequence: stats.extended_max_sequence,
            jitter: stats.jitter,
            last_sr: 0,
            delay_since_last_sr: 0,
        })
    }

    /// Restart loss and jitter accounting, keeping the data counters
    pub fn reset_statistics(&mut self) {
        let counters = self.counters;
        *self = Self {
            counters,
            ..Self::default()
        };
    }

    pub fn reset_data_counters(&mut self) {
        self.counters = DataCounters::default();
    }

    pub fn data_counters(&self) -> DataCounters {
        self.counters
    }
}

/// Payload handed to the data collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPayload {
    pub payload: Bytes,
    pub info: RtpHeaderInfo,
}

/// Something the session must report to a collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveEvent {
    SsrcChanged(u32),
    CsrcChanged { csrc: u32, added: bool },
    InitializeDecoder {
        payload_type: u8,
        name: String,
        clock_rate_hz: u32,
        channels: u8,
    },
    TelephoneEvent { event: u8, end_of_event: bool },
    /// First packet after a reported timeout
    PacketReceivedAfterTimeout,
    /// RFC 2032 style FIR received in the media stream
    FirOverRtp,
    /// The loss gap outgrew the NACK list, only a key frame helps
    KeyFrameNeeded,
}

/// Everything one incoming packet produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveOutcome {
    pub payloads: Vec<ReceivedPayload>,
    pub events: Vec<ReceiveEvent>,
    /// Remote SSRC, set on the first packet and whenever it changes
    pub new_remote_ssrc: Option<u32>,
    /// First packet of a new video frame: RTP timestamp and arrival
    pub new_frame_timestamp: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ActiveTelephoneEvent {
    event: u8,
    timestamp: u32,
    ended: bool,
}

/// Last media packet, for lip sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastReceived {
    pub timestamp: u32,
    pub arrival_ms: i64,
    pub frequency_hz: u32,
}

struct ReceiverState {
    payloads: PayloadRegistry,
    extensions: HeaderExtensionMap,
    ssrc_filter: Option<u32>,
    remote_ssrc: Option<u32>,
    remote_csrcs: Vec<u32>,
    last_media_payload_type: Option<u8>,
    last_received: Option<LastReceived>,

    statistics: ReceiveStatistics,
    nack: Option<NackList>,
    fec: FecDecoder,
    telephone_event: Option<ActiveTelephoneEvent>,

    last_packet_ms: Option<i64>,
    timeout_reported: bool,
    media_since_check: bool,
    anything_since_check: bool,
}

impl ReceiverState {
    fn nack_on_received(&mut self, seq: u16, now_ms: i64, outcome: &mut ReceiveOutcome) {
        if let Some(nack) = self.nack.as_mut() {
            if nack.on_received(seq, now_ms) == NackListEvent::Overflow {
                outcome.events.push(ReceiveEvent::KeyFrameNeeded);
            }
        }
    }
}

/// Receive half of one session
pub struct RtpReceiver {
    nack_config: NackConfig,
    inner: Mutex<ReceiverState>,
}

impl RtpReceiver {
    pub fn new(config: &RtpConfig) -> Self {
        Self {
            nack_config: NackConfig::from(config),
            inner: Mutex::new(ReceiverState {
                payloads: PayloadRegistry::new(),
                extensions: HeaderExtensionMap::new(),
                ssrc_filter: None,
                remote_ssrc: None,
                remote_csrcs: Vec::new(),
                last_media_payload_type: None,
                last_received: None,
                statistics: ReceiveStatistics::new(),
                nack: None,
                fec: FecDecoder::new(config.fec_sei_timeout_ms),
                telephone_event: None,
                last_packet_ms: None,
                timeout_reported: false,
                media_since_check: false,
                anything_since_check: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ReceiverState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Forget the remote stream, keeping configuration
    pub fn reset(&self) {
        let mut state = self.state();
        state.remote_ssrc = None;
        state.remote_csrcs.clear();
        state.last_media_payload_type = None;
        state.last_received = None;
        state.statistics = ReceiveStatistics::new();
        if let Some(nack) = state.nack.as_mut() {
            nack.reset();
        }
        state.fec.reset();
        state.telephone_event = None;
        state.last_packet_ms = None;
        state.timeout_reported = false;
    }

    pub fn register_receive_payload(&self, spec: PayloadSpec) -> TransportResult<()> {
        self.state().payloads.register(spec)
    }

    pub fn deregister_receive_payload(&self, payload_type: u8) -> TransportResult<()> {
        let mut state = self.state();
        state.payloads.deregister(payload_type)?;
        if state.last_media_payload_type == Some(payload_type) {
            state.last_media_payload_type = None;
        }
        Ok(())
    }

    pub fn receive_payload(&self, payload_type: u8) -> TransportResult<PayloadSpec> {
        self.state()
            .payloads
            .get(payload_type)
            .cloned()
            .ok_or_else(|| TransportError::NotRegistered(format!("payload type {}", payload_type)))
    }

    pub fn receive_payload_type(&self, name: &str, clock_rate_hz: u32, channels: u8) -> TransportResult<u8> {
        self.state()
            .payloads
            .payload_type_of(name, clock_rate_hz, channels)
            .ok_or_else(|| TransportError::NotRegistered(format!("payload {}", name)))
    }

    pub fn register_header_extension(&self, ty: RtpExtensionType, id: u8) -> TransportResult<()> {
        self.state().extensions.register(ty, id)
    }

    pub fn deregister_header_extension(&self, ty: RtpExtensionType) {
        self.state().extensions.deregister(ty);
    }

    /// Only accept packets from `ssrc`; `None` accepts everything
    pub fn set_ssrc_filter(&self, ssrc: Option<u32>) {
        self.state().ssrc_filter = ssrc;
    }

    pub fn ssrc_filter(&self) -> Option<u32> {
        self.state().ssrc_filter
    }

    pub fn set_nack_status(&self, enable: bool) {
        let mut state = self.state();
        match (enable, state.nack.is_some()) {
            (true, false) => state.nack = Some(NackList::new(self.nack_config.clone())),
            (false, true) => state.nack = None,
            _ => {}
        }
    }

    pub fn nack_enabled(&self) -> bool {
        self.state().nack.is_some()
    }

    pub fn remote_ssrc(&self) -> Option<u32> {
        self.state().remote_ssrc
    }

    pub fn remote_csrcs(&self) -> Vec<u32> {
        self.state().remote_csrcs.clone()
    }

    pub fn last_received(&self) -> Option<LastReceived> {
        self.state().last_received
    }

    /// Parse and account for one RTP packet
    pub fn incoming_rtp(&self, data: &[u8], now_ms: i64) -> TransportResult<ReceiveOutcome> {
        let mut outcome = ReceiveOutcome::default();
        if is_fir_over_rtp(data) {
            outcome.events.push(ReceiveEvent::FirOverRtp);
            return Ok(outcome);
        }
        let packet = RtpPacket::parse(data)?;
        let header = &packet.header;

        let mut state = self.state();
        if let Some(filter) = state.ssrc_filter {
            if header.ssrc != filter {
                trace!(ssrc = header.ssrc, filter, "Dropping packet outside the SSRC filter");
                return Ok(outcome);
            }
        }

        state.last_packet_ms = Some(now_ms);
        state.anything_since_check = true;
        if state.timeout_reported {
            state.timeout_reported = false;
            outcome.events.push(ReceiveEvent::PacketReceivedAfterTimeout);
        }

        if state.remote_ssrc != Some(header.ssrc) {
            if let Some(previous) = state.remote_ssrc {
                debug!(previous, ssrc = header.ssrc, "Remote SSRC changed");
                outcome.events.push(ReceiveEvent::SsrcChanged(header.ssrc));
                state.statistics.reset_statistics();
                if let Some(nack) = state.nack.as_mut() {
                    nack.reset();
                }
                state.fec.reset();
                state.last_media_payload_type = None;
                state.last_received = None;
            }
            state.remote_ssrc = Some(header.ssrc);
            outcome.new_remote_ssrc = Some(header.ssrc);
        }

        let spec = state.payloads.get(header.payload_type).cloned();
        let frequency_hz = spec.as_ref().map_or(0, |s| s.clock_rate_hz);
        state.statistics.on_packet(
            header.sequence_number,
            header.timestamp,
            packet.payload.len(),
            frequency_hz,
            now_ms,
        );
        state.nack_on_received(header.sequence_number, now_ms, &mut outcome);

        let Some(spec) = spec else {
            if packet.payload.is_empty() {
                trace!(seq = header.sequence_number, "Keepalive received");
            } else {
                debug!(
                    payload_type = header.payload_type,
                    dump = %hex::encode(&data[..data.len().min(32)]),
                    "Dropping packet with unregistered payload type"
                );
            }
            return Ok(outcome);
        };

        update_csrcs(&mut state, &header.csrc, &mut outcome);
        let extensions = header.extensions(&state.extensions);

        match spec.kind() {
            PayloadKind::Red => {
                self.handle_red(&mut state, &packet, extensions, now_ms, &mut outcome)?;
            }
            PayloadKind::Ulpfec => {
                // FEC without RED encapsulation
                let fec = FecPacket::parse(&packet.payload)?;
                state.fec.add_fec_packet(header.ssrc, fec, now_ms);
                recover(&mut state, now_ms, &mut outcome)?;
            }
            PayloadKind::TelephoneEvent => {
                handle_telephone_event(&mut state, header.timestamp, &packet.payload, &mut outcome);
            }
            PayloadKind::ComfortNoise => {
                deliver(&mut state, &packet, &spec, extensions, false, now_ms, &mut outcome);
            }
            PayloadKind::Media => {
                state.media_since_check = true;
                state
                    .fec
                    .add_media_packet(header.sequence_number, Bytes::copy_from_slice(data), now_ms);
                deliver(&mut state, &packet, &spec, extensions, false, now_ms, &mut outcome);
            }
        }
        Ok(outcome)
    }

    fn handle_red(
        &self,
        state: &mut ReceiverState,
        packet: &RtpPacket,
        extensions: HeaderExtensions,
        now_ms: i64,
        outcome: &mut ReceiveOutcome,
    ) -> TransportResult<()> {
        let fec_payload_type = state.payloads.payload_type_of_kind(PayloadKind::Ulpfec);
        for block in parse_red(&packet.payload)? {
            if Some(block.payload_type) == fec_payload_type {
                let fec = FecPacket::parse(&block.data)?;
                state.fec.add_fec_packet(packet.header.ssrc, fec, now_ms);
                continue;
            }
            let Some(spec) = state.payloads.get(block.payload_type).cloned() else {
                debug!(
                    payload_type = block.payload_type,
                    "Dropping RED block with unregistered payload type"
                );
                continue;
            };
            let mut media = RtpPacket {
                header: packet.header.clone(),
                payload: block.data,
                padding_len: 0,
            };
            media.header.payload_type = block.payload_type;
            let serialized = media.serialize().freeze();
            state
                .fec
                .add_media_packet(media.header.sequence_number, serialized, now_ms);
            state.media_since_check = true;
            deliver(state, &media, &spec, extensions, false, now_ms, outcome);
        }
        recover(state, now_ms, outcome)
    }

    /// Fires the timeout once per silence longer than `timeout_ms`
    pub fn check_packet_timeout(&self, timeout_ms: i64, now_ms: i64) -> bool {
        let mut state = self.state();
        if timeout_ms <= 0 || state.timeout_reported {
            return false;
        }
        match state.last_packet_ms {
            Some(last) if now_ms - last > timeout_ms => {
                state.timeout_reported = true;
                true
            }
            _ => false,
        }
    }

    /// Liveness since the previous call
    pub fn dead_or_alive(&self) -> AliveState {
        let mut state = self.state();
        let alive = if state.media_since_check {
            AliveState::Alive
        } else if state.anything_since_check {
            AliveState::NoMedia
        } else {
            AliveState::Dead
        };
        state.media_since_check = false;
        state.anything_since_check = false;
        alive
    }

    /// Sequence numbers to request now
    pub fn nack_list(&self, now_ms: i64, rtt_ms: i64) -> Vec<u16> {
        self.state()
            .nack
            .as_mut()
            .map(|nack| nack.get_nack_list(now_ms, rtt_ms))
            .unwrap_or_default()
    }

    pub fn nack_stats(&self) -> Option<NackStats> {
        self.state().nack.as_ref().map(NackList::stats)
    }

    pub fn statistics(&self, reset: bool) -> TransportResult<RtpStatistics> {
        self.state()
            .statistics
            .statistics(reset)
            .ok_or_else(|| TransportError::NotAvailable("no RTP received yet".to_string()))
    }

    /// Block for the next outgoing report, if anything was received
    pub fn report_block(&self) -> Option<ReportBlock> {
        let mut state = self.state();
        let ssrc = state.remote_ssrc?;
        state.statistics.report_block(ssrc)
    }

    pub fn reset_statistics(&self) {
        self.state().statistics.reset_statistics();
    }

    pub fn reset_data_counters(&self) {
        self.state().statistics.reset_data_counters();
    }

    pub fn data_counters(&self) -> DataCounters {
        self.state().statistics.data_counters()
    }

    pub fn fec_recovered_packets(&self) -> u64 {
        self.state().fec.recovered_total()
    }
}

/// RFC 2032 FIR is an 8-byte packet whose second byte is 192
pub fn is_fir_over_rtp(data: &[u8]) -> bool {
    data.len() == FIR_OVER_RTP_LENGTH && data[1] == FIR_OVER_RTP_PACKET_TYPE
}

fn update_csrcs(state: &mut ReceiverState, csrcs: &[u32], outcome: &mut ReceiveOutcome) {
    if state.remote_csrcs == csrcs {
        return;
    }
    for &csrc in csrcs.iter().filter(|c| !state.remote_csrcs.contains(c)) {
        outcome.events.push(ReceiveEvent::CsrcChanged { csrc, added: true });
    }
    for &csrc in state.remote_csrcs.iter().filter(|c| !csrcs.contains(c)) {
        outcome.events.push(ReceiveEvent::CsrcChanged { csrc, added: false });
    }
    state.remote_csrcs = csrcs.to_vec();
}

fn deliver(
    state: &mut ReceiverState,
    packet: &RtpPacket,
    spec: &PayloadSpec,
    extensions: HeaderExtensions,
    recovered: bool,
    now_ms: i64,
    outcome: &mut ReceiveOutcome,
) {
    let header = &packet.header;
    if spec.kind() == PayloadKind::Media && state.last_media_payload_type != Some(header.payload_type) {
        state.last_media_payload_type = Some(header.payload_type);
        outcome.events.push(ReceiveEvent::InitializeDecoder {
            payload_type: spec.payload_type,
            name: spec.name.clone(),
            clock_rate_hz: spec.clock_rate_hz,
            channels: spec.channels,
        });
    }

    let newer = state
        .last_received
        .map_or(true, |last| is_newer_timestamp(header.timestamp, last.timestamp));
    if newer && !recovered {
        if spec.is_video() {
            outcome.new_frame_timestamp = Some(header.timestamp);
        }
        state.last_received = Some(LastReceived {
            timestamp: header.timestamp,
            arrival_ms: now_ms,
            frequency_hz: spec.clock_rate_hz,
        });
    }

    outcome.payloads.push(ReceivedPayload {
        payload: packet.payload.clone(),
        info: RtpHeaderInfo {
            header: header.clone(),
            extensions,
            payload_frequency_hz: spec.clock_rate_hz,
            recovered,
        },
    });
}

fn recover(state: &mut ReceiverState, now_ms: i64, outcome: &mut ReceiveOutcome) -> TransportResult<()> {
    for raw in state.fec.recover(now_ms) {
        let packet = RtpPacket::parse(&raw)?;
        let Some(spec) = state.payloads.get(packet.header.payload_type).cloned() else {
            continue;
        };
        state.nack_on_received(packet.header.sequence_number, now_ms, outcome);
        let extensions = packet.header.extensions(&state.extensions);
        deliver(state, &packet, &spec, extensions, true, now_ms, outcome);
    }
    Ok(())
}

/// RFC 4733: event, E bit, volume, duration
fn handle_telephone_event(
    state: &mut ReceiverState,
    timestamp: u32,
    payload: &[u8],
    outcome: &mut ReceiveOutcome,
) {
    for chunk in payload.chunks_exact(4) {
        let event = chunk[0];
        let end = chunk[1] & 0x80 != 0;
        match state.telephone_event {
            Some(active) if active.event == event && active.timestamp == timestamp => {
                if end && !active.ended {
                    outcome.events.push(ReceiveEvent::TelephoneEvent {
                        event,
                        end_of_event: true,
                    });
                    state.telephone_event = Some(ActiveTelephoneEvent { ended: true, ..active });
                }
            }
            _ => {
                outcome.events.push(ReceiveEvent::TelephoneEvent {
                    event,
                    end_of_event: false,
                });
                if end {
                    outcome.events.push(ReceiveEvent::TelephoneEvent {
                        event,
                        end_of_event: true,
                    });
                }
                state.telephone_event = Some(ActiveTelephoneEvent {
                    event,
                    timestamp,
                    ended: end,
                });
            }
        }
    }
}
