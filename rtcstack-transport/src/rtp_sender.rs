//! Send side of an RTP session
//!
//! Turns encoded frames into RTP packets sized to the MTU, optionally
//! wrapped in RED with ULPFEC parity, and keeps the counters behind the
//! sender report and the bitrate statistics.
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


use crate::error::{TransportError, TransportResult};
use crate::fec::{red_encapsulate, FecEncoder, FEC_HEADER_SIZE};
use crate::payload_registry::{validate_payload_type, PayloadKind, PayloadRegistry, PayloadSpec};
use crate::rtcp_engine::SenderStats;
use crate::rtp_handler::{
    AudioLevel, HeaderExtensionMap, HeaderExtensions, RtpExtensionType, RtpHeader, RtpPacket,
    MAX_CSRCS,
};
use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rtcstack_config::{RtpConfig, MAX_MTU, MIN_MTU};
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, trace};

/// IPv4 + UDP
pub const DEFAULT_TRANSPORT_OVERHEAD: u16 = 28;

/// RED header plus the FEC and long level-0 headers
const FEC_PACKET_OVERHEAD: usize = 1 + FEC_HEADER_SIZE + 8;

/// Transmission time offset is a signed 24-bit field
const MAX_TRANSMISSION_TIME_OFFSET: i32 = 0x7F_FFFF;

const BITRATE_WINDOW_MS: i64 = 1000;

/// Kind of frame handed to `send_outgoing_data`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    KeyFrame,
    DeltaFrame,
    AudioSpeech,
    /// Comfort noise, ends a talkspurt
    AudioCn,
    /// Nothing to send
    EmptyFrame,
}

/// What an outgoing packet carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Media,
    Fec,
    Keepalive,
    TelephoneEvent,
}

/// Packet ready for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingPacket {
    pub sequence_number: u16,
    pub data: Bytes,
    pub kind: PacketKind,
}

impl OutgoingPacket {
    /// Media and parity are kept for retransmission
    pub fn retransmittable(&self) -> bool {
        matches!(self.kind, PacketKind::Media | PacketKind::Fec)
    }
}

/// Sent bitrates over the last second
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BitrateSent {
    pub total_bps: u32,
    pub video_bps: u32,
    pub fec_bps: u32,
    pub nack_bps: u32,
}

/// Sent byte and packet counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SendCounters {
    pub payload_bytes: u64,
    pub packets: u32,
}

/// Generic FEC settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecSettings {
    pub enabled: bool,
    pub red_payload_type: u8,
    pub fec_payload_type: u8,
}

#[derive(Debug, Default)]
struct RateWindow {
    samples: VecDeque<(i64, usize)>,
    bytes: usize,
}

impl RateWindow {
    fn add(&mut self, now_ms: i64, bytes: usize) {
        self.samples.push_back((now_ms, bytes));
        self.bytes += bytes;
    }

    fn bitrate_bps(&mut self, now_ms: i64) -> u32 {
        while let Some(&(sent_ms, bytes)) = self.samples.front() {
            if now_ms - sent_ms < BITRATE_WINDOW_MS {
                break;
            }
            self.samples.pop_front();
            self.bytes -= bytes;
        }
        (self.bytes as u64 * 8).min(u64::from(u32::MAX)) as u32
    }
}

#[derive(Debug, Clone, Copy)]
struct Keepalive {
    payload_type: u8,
    interval_ms: i64,
    last_sent_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
struct FecRates {
    key_rate: u8,
    delta_rate: u8,
    key_uep: bool,
    delta_uep: bool,
}

struct SenderState {
    rng: StdRng,
    ssrc: u32,
    ssrc_forced: bool,
    sequence_number: u16,
    start_timestamp: u32,
    start_timestamp_forced: bool,
    csrcs: Vec<u32>,
    include_csrcs: bool,

    payloads: PayloadRegistry,
    mtu: u16,
    transport_overhead: u16,
    extensions: HeaderExtensionMap,
    transmission_time_offset: i32,
    audio_level: Option<u8>,
    audio_level_enabled: bool,

    sending_media: bool,
    in_talkspurt: bool,
    fec: Option<FecSettings>,
    fec_rates: FecRates,
    fec_encoder: FecEncoder,
    keepalive: Option<Keepalive>,

    last_timestamp: Option<u32>,
    last_send_ms: i64,
    last_frequency_hz: u32,
    counters: SendCounters,
    total_rate: RateWindow,
    video_rate: RateWindow,
    fec_rate: RateWindow,
    nack_rate: RateWindow,
}

impl SenderState {
    fn next_sequence_number(&mut self) -> u16 {
        let seq = self.sequence_number;
        self.sequence_number = self.sequence_number.wrapping_add(1);
        seq
    }

    fn header(&mut self, payload_type: u8, timestamp: u32, marker: bool) -> RtpHeader {
        let mut header = RtpHeader::new(payload_type, self.next_sequence_number(), timestamp, self.ssrc);
        header.marker = marker;
        if self.include_csrcs {
            header.csrc = self.csrcs.clone();
            header.csrc_count = header.csrc.len() as u8;
        }
        header
    }

    fn header_extensions(&self, audio: bool) -> HeaderExtensions {
        HeaderExtensions {
            transmission_time_offset: self
                .extensions
                .id_of(RtpExtensionType::TransmissionTimeOffset)
                .map(|_| self.transmission_time_offset),
            audio_level: match (audio && self.audio_level_enabled, self.audio_level) {
                (true, Some(level)) => Some(AudioLevel {
                    voice_activity: self.in_talkspurt,
                    level,
                }),
                _ => None,
            },
        }
    }

    fn extension_length(&self) -> usize {
        let mut length: usize = 0;
        if self.extensions.id_of(RtpExtensionType::TransmissionTimeOffset).is_some() {
            length += 1 + RtpExtensionType::TransmissionTimeOffset.data_len();
        }
        if self.audio_level_enabled && self.extensions.id_of(RtpExtensionType::AudioLevel).is_some() {
            length += 1 + RtpExtensionType::AudioLevel.data_len();
        }
        if length == 0 {
            0
        } else {
            4 + length.div_ceil(4) * 4
        }
    }

    fn max_payload_length(&self) -> usize {
        usize::from(self.mtu.saturating_sub(self.transport_overhead))
    }

    fn header_length(&self) -> usize {
        let csrcs = if self.include_csrcs { self.csrcs.len() } else { 0 };
        RtpHeader::MIN_SIZE + 4 * csrcs + self.extension_length()
    }

    fn max_data_payload_length(&self) -> usize {
        let fec_overhead = if self.fec.is_some_and(|f| f.enabled) {
            FEC_PACKET_OVERHEAD
        } else {
            0
        };
        self.max_payload_length()
            .saturating_sub(self.header_length() + fec_overhead)
    }

    fn account(&mut self, packet: &OutgoingPacket, payload_len: usize, now_ms: i64) {
        self.counters.packets += 1;
        self.counters.payload_bytes += payload_len as u64;
        self.total_rate.add(now_ms, packet.data.len());
        match packet.kind {
            PacketKind::Media => self.video_rate.add(now_ms, packet.data.len()),
            PacketKind::Fec => self.fec_rate.add(now_ms, packet.data.len()),
            _ => {}
        }
    }
}

/// Send half of one session
pub struct RtpSender {
    audio: bool,
    inner: Mutex<SenderState>,
}

impl RtpSender {
    pub fn new(audio: bool, config: &RtpConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let ssrc = random_ssrc(&mut rng, None);
        let sequence_number = rng.gen();
        let start_timestamp = rng.gen();
        Self {
            audio,
            inner: Mutex::new(SenderState {
                rng,
                ssrc,
                ssrc_forced: false,
                sequence_number,
                start_timestamp,
                start_timestamp_forced: false,
                csrcs: Vec::new(),
                include_csrcs: true,
                payloads: PayloadRegistry::new(),
                mtu: config.mtu,
                transport_overhead: DEFAULT_TRANSPORT_OVERHEAD,
                extensions: HeaderExtensionMap::new(),
                transmission_time_offset: 0,
                audio_level: None,
                audio_level_enabled: false,
                sending_media: true,
                in_talkspurt: false,
                fec: None,
                fec_rates: FecRates {
                    key_rate: 0,
                    delta_rate: 0,
                    key_uep: false,
                    delta_uep: false,
                },
                fec_encoder: FecEncoder::new(),
                keepalive: None,
                last_timestamp: None,
                last_send_ms: 0,
                last_frequency_hz: 0,
                counters: SendCounters::default(),
                total_rate: RateWindow::default(),
                video_rate: RateWindow::default(),
                fec_rate: RateWindow::default(),
                nack_rate: RateWindow::default(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SenderState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Back to a fresh sender, keeping payloads and transport settings
    pub fn init(&self) {
        let mut state = self.state();
        state.sending_media = true;
        state.in_talkspurt = false;
        state.keepalive = None;
        state.last_timestamp = None;
        state.counters = SendCounters::default();
        state.total_rate = RateWindow::default();
        state.video_rate = RateWindow::default();
        state.fec_rate = RateWindow::default();
        state.nack_rate = RateWindow::default();
    }

    /// Draw a new SSRC and sequence start unless the SSRC was set explicitly
    ///
    /// Returns the new SSRC if it changed.
    pub fn regenerate_ssrc(&self) -> Option<u32> {
        let mut state = self.state();
        if state.ssrc_forced {
            return None;
        }
        let previous = state.ssrc;
        state.ssrc = random_ssrc(&mut state.rng, Some(previous));
        state.sequence_number = state.rng.gen();
        if !state.start_timestamp_forced {
            state.start_timestamp = state.rng.gen();
        }
        debug!(previous, ssrc = state.ssrc, "Regenerated SSRC");
        Some(state.ssrc)
    }

    pub fn ssrc(&self) -> u32 {
        self.state().ssrc
    }

    pub fn set_ssrc(&self, ssrc: u32) {
        let mut state = self.state();
        state.ssrc = ssrc;
        state.ssrc_forced = true;
    }

    pub fn sequence_number(&self) -> u16 {
        self.state().sequence_number
    }

    pub fn set_sequence_number(&self, sequence_number: u16) {
        self.state().sequence_number = sequence_number;
    }

    pub fn start_timestamp(&self) -> u32 {
        self.state().start_timestamp
    }

    pub fn set_start_timestamp(&self, timestamp: u32) {
        let mut state = self.state();
        state.start_timestamp = timestamp;
        state.start_timestamp_forced = true;
    }

    pub fn csrcs(&self) -> Vec<u32> {
        self.state().csrcs.clone()
    }

    pub fn set_csrcs(&self, csrcs: &[u32]) -> TransportResult<()> {
        if csrcs.len() > MAX_CSRCS {
            return Err(TransportError::ConfigError(format!(
                "{} CSRCs exceed the maximum of {}",
                csrcs.len(),
                MAX_CSRCS
            )));
        }
        self.state().csrcs = csrcs.to_vec();
        Ok(())
    }

    pub fn set_csrc_status(&self, include: bool) {
        self.state().include_csrcs = include;
    }

    pub fn register_send_payload(&self, spec: PayloadSpec) -> TransportResult<()> {
        let mut state = self.state();
        if state.keepalive.is_some_and(|k| k.payload_type == spec.payload_type) {
            return Err(TransportError::AlreadyRegistered(format!(
                "payload type {} is the keepalive type",
                spec.payload_type
            )));
        }
        state.payloads.register(spec)
    }

    pub fn deregister_send_payload(&self, payload_type: u8) -> TransportResult<()> {
        self.state().payloads.deregister(payload_type).map(|_| ())
    }

    pub fn send_payload(&self, payload_type: u8) -> Option<PayloadSpec> {
        self.state().payloads.get(payload_type).cloned()
    }

    pub fn send_payloads(&self) -> Vec<PayloadSpec> {
        self.state().payloads.iter().cloned().collect()
    }

    pub fn set_max_transfer_unit(&self, mtu: u16) -> TransportResult<()> {
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(TransportError::ConfigError(format!(
                "MTU {} outside {}..={}",
                mtu, MIN_MTU, MAX_MTU
            )));
        }
        self.state().mtu = mtu;
        Ok(())
    }

    pub fn max_transfer_unit(&self) -> u16 {
        self.state().mtu
    }

    /// IP and transport header bytes subtracted from the MTU
    pub fn set_transport_overhead(&self, tcp: bool, ipv6: bool, authentication_overhead: u8) -> TransportResult<()> {
        let ip = if ipv6 { 40 } else { 20 };
        let transport = if tcp { 20 } else { 8 };
        let overhead = ip + transport + u16::from(authentication_overhead);
        let mut state = self.state();
        if overhead + RtpHeader::MIN_SIZE as u16 >= state.mtu {
            return Err(TransportError::ConfigError(format!(
                "transport overhead {} leaves no payload in MTU {}",
                overhead, state.mtu
            )));
        }
        state.transport_overhead = overhead;
        Ok(())
    }

    pub fn transport_overhead(&self) -> u16 {
        self.state().transport_overhead
    }

    /// Largest RTP packet
    pub fn max_payload_length(&self) -> usize {
        self.state().max_payload_length()
    }

    /// Largest media payload in one packet
    pub fn max_data_payload_length(&self) -> usize {
        self.state().max_data_payload_length()
    }

    pub fn register_header_extension(&self, ty: RtpExtensionType, id: u8) -> TransportResult<()> {
        self.state().extensions.register(ty, id)
    }

    pub fn deregister_header_extension(&self, ty: RtpExtensionType) {
        self.state().extensions.deregister(ty);
    }

    /// Header extension bytes added to every packet
    pub fn header_extension_length(&self) -> usize {
        self.state().extension_length()
    }

    pub fn set_transmission_time_offset(&self, offset: i32) -> TransportResult<()> {
        if !(-MAX_TRANSMISSION_TIME_OFFSET..=MAX_TRANSMISSION_TIME_OFFSET).contains(&offset) {
            return Err(TransportError::ConfigError(format!(
                "transmission time offset {} exceeds 24 bits",
                offset
            )));
        }
        self.state().transmission_time_offset = offset;
        Ok(())
    }

    pub fn set_audio_level_indication_status(&self, enable: bool, id: u8) -> TransportResult<()> {
        let mut state = self.state();
        if enable {
            state.extensions.register(RtpExtensionType::AudioLevel, id)?;
        } else {
            state.extensions.deregister(RtpExtensionType::AudioLevel);
        }
        state.audio_level_enabled = enable;
        Ok(())
    }

    pub fn audio_level_indication_status(&self) -> Option<u8> {
        let state = self.state();
        if !state.audio_level_enabled {
            return None;
        }
        state.extensions.id_of(RtpExtensionType::AudioLevel)
    }

    /// Level of the next audio packets in -dBov
    pub fn set_audio_level(&self, level_dbov: u8) -> TransportResult<()> {
        if level_dbov > 127 {
            return Err(TransportError::ConfigError(format!(
                "audio level {} above 127 -dBov",
                level_dbov
            )));
        }
        self.state().audio_level = Some(level_dbov);
        Ok(())
    }

    pub fn set_sending_media_status(&self, sending: bool) {
        self.state().sending_media = sending;
    }

    pub fn sending_media(&self) -> bool {
        self.state().sending_media
    }

    pub fn set_generic_fec_status(&self, enable: bool, red_payload_type: u8, fec_payload_type: u8) -> TransportResult<()> {
        if enable {
            validate_payload_type(red_payload_type)?;
            validate_payload_type(fec_payload_type)?;
            if red_payload_type == fec_payload_type {
                return Err(TransportError::ConfigError(format!(
                    "RED and FEC share payload type {}",
                    red_payload_type
                )));
            }
        }
        self.state().fec = enable.then_some(FecSettings {
            enabled: true,
            red_payload_type,
            fec_payload_type,
        });
        Ok(())
    }

    pub fn generic_fec_status(&self) -> Option<FecSettings> {
        self.state().fec
    }

    /// Protection factors out of 255 for key and delta frames
    pub fn set_fec_code_rate(&self, key_frame_rate: u8, delta_frame_rate: u8) {
        let mut state = self.state();
        state.fec_rates.key_rate = key_frame_rate;
        state.fec_rates.delta_rate = delta_frame_rate;
    }

    pub fn set_fec_uep_protection(&self, key_use_uep: bool, delta_use_uep: bool) {
        let mut state = self.state();
        state.fec_rates.key_uep = key_use_uep;
        state.fec_rates.delta_uep = delta_use_uep;
    }

    /// Keepalive packets use a payload type nothing else is sent with
    pub fn set_keepalive_status(&self, enable: bool, payload_type: u8, interval_ms: u16) -> TransportResult<()> {
        let mut state = self.state();
        if !enable {
            state.keepalive = None;
            return Ok(());
        }
        validate_payload_type(payload_type)?;
        if state.payloads.contains(payload_type) {
            return Err(TransportError::ConfigError(format!(
                "keepalive payload type {} is registered for media",
                payload_type
            )));
        }
        if interval_ms == 0 {
            return Err(TransportError::ConfigError(
                "keepalive interval must be positive".to_string(),
            ));
        }
        state.keepalive = Some(Keepalive {
            payload_type,
            interval_ms: i64::from(interval_ms),
            last_sent_ms: None,
        });
        Ok(())
    }

    /// Payload type and interval, if enabled
    pub fn keepalive_status(&self) -> Option<(u8, u16)> {
        self.state()
            .keepalive
            .map(|k| (k.payload_type, k.interval_ms as u16))
    }

    pub fn time_until_keepalive(&self, now_ms: i64) -> Option<i64> {
        let state = self.state();
        let keepalive = state.keepalive?;
        let last = keepalive.last_sent_ms.unwrap_or(state.last_send_ms);
        Some((last + keepalive.interval_ms - now_ms).max(0))
    }

    /// Header-only packet if nothing was sent for an interval
    pub fn keepalive_due(&self, now_ms: i64) -> Option<OutgoingPacket> {
        let mut state = self.state();
        let mut keepalive = state.keepalive?;
        let last = keepalive.last_sent_ms.unwrap_or(i64::MIN / 2).max(state.last_send_ms);
        if now_ms - last < keepalive.interval_ms {
            return None;
        }
        keepalive.last_sent_ms = Some(now_ms);
        state.keepalive = Some(keepalive);
        let timestamp = state.last_timestamp.unwrap_or(state.start_timestamp);
        let header = state.header(keepalive.payload_type, timestamp, false);
        let packet = OutgoingPacket {
            sequence_number: header.sequence_number,
            data: header.serialize().freeze(),
            kind: PacketKind::Keepalive,
        };
        state.account(&packet, 0, now_ms);
        trace!(seq = packet.sequence_number, "Keepalive due");
        Some(packet)
    }

    /// Packetize one encoded frame
    ///
    /// `fragments` splits the frame at codec boundaries; each fragment is
    /// packetized on its own. Packets come back in send order.
    pub fn send_outgoing_data(
        &self,
        frame_type: FrameType,
        payload_type: u8,
        capture_timestamp: u32,
        data: &[u8],
        fragments: Option<&[Range<usize>]>,
        now_ms: i64,
    ) -> TransportResult<Vec<OutgoingPacket>> {
        let mut state = self.state();
        if !state.sending_media || frame_type == FrameType::EmptyFrame {
            return Ok(Vec::new());
        }
        let spec = state
            .payloads
            .get(payload_type)
            .cloned()
            .ok_or_else(|| TransportError::NotRegistered(format!("send payload type {}", payload_type)))?;
        if let Some(fragments) = fragments {
            if let Some(bad) = fragments
                .iter()
                .find(|r| r.start > r.end || r.end > data.len())
            {
                return Err(TransportError::InvalidPacket(format!(
                    "fragment {:?} outside frame of {} bytes",
                    bad,
                    data.len()
                )));
            }
        }

        let timestamp = state.start_timestamp.wrapping_add(capture_timestamp);
        let packets = if self.audio {
            self.packetize_audio(&mut state, frame_type, &spec, timestamp, data, now_ms)?
        } else {
            self.packetize_video(&mut state, frame_type, &spec, timestamp, data, fragments, now_ms)?
        };
        state.last_timestamp = Some(timestamp);
        state.last_send_ms = now_ms;
        state.last_frequency_hz = spec.clock_rate_hz;
        Ok(packets)
    }

    fn packetize_audio(
        &self,
        state: &mut SenderState,
        frame_type: FrameType,
        spec: &PayloadSpec,
        timestamp: u32,
        data: &[u8],
        now_ms: i64,
    ) -> TransportResult<Vec<OutgoingPacket>> {
        if data.len() > state.max_data_payload_length() {
            return Err(TransportError::InvalidPacket(format!(
                "audio frame of {} bytes exceeds one packet",
                data.len()
            )));
        }
        // Marker on the first packet of a talkspurt
        let marker = frame_type == FrameType::AudioSpeech && !state.in_talkspurt;
        state.in_talkspurt = frame_type == FrameType::AudioSpeech;

        let extensions = state.header_extensions(true);
        let mut header = state.header(spec.payload_type, timestamp, marker);
        header.extension_header = extensions.to_extension_header(&state.extensions);
        let packet = build_packet(header, Bytes::copy_from_slice(data), PacketKind::Media);
        state.account(&packet, data.len(), now_ms);
        Ok(vec![packet])
    }

    #[allow(clippy::too_many_arguments)]
    fn packetize_video(
        &self,
        state: &mut SenderState,
        frame_type: FrameType,
        spec: &PayloadSpec,
        timestamp: u32,
        data: &[u8],
        fragments: Option<&[Range<usize>]>,
        now_ms: i64,
    ) -> TransportResult<Vec<OutgoingPacket>> {
        let max_payload = state.max_data_payload_length();
        if max_payload == 0 {
            return Err(TransportError::ConfigError(
                "MTU leaves no room for payload".to_string(),
            ));
        }
        let whole = [0..data.len()];
        let fragments = fragments.unwrap_or(&whole);
        let chunks: Vec<&[u8]> = fragments
            .iter()
            .flat_map(|range| {
                let fragment = &data[range.clone()];
                if fragment.is_empty() {
                    vec![fragment]
                } else {
                    fragment.chunks(max_payload).collect()
                }
            })
            .collect();

        let extensions = state.header_extensions(false);
        let fec = state.fec.filter(|f| f.enabled);
        let mut packets = Vec::with_capacity(chunks.len());
        let mut protected = Vec::new();
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.iter().enumerate() {
            let mut header = state.header(spec.payload_type, timestamp, i == last);
            header.extension_header = extensions.to_extension_header(&state.extensions);
            let media = RtpPacket {
                header,
                payload: Bytes::copy_from_slice(chunk),
                padding_len: 0,
            };
            let packet = match fec {
                Some(settings) => {
                    protected.push(media.serialize().freeze());
                    let mut red = media.clone();
                    red.header.payload_type = settings.red_payload_type;
                    red.payload = red_encapsulate(spec.payload_type, chunk);
                    OutgoingPacket {
                        sequence_number: red.header.sequence_number,
                        data: red.serialize().freeze(),
                        kind: PacketKind::Media,
                    }
                }
                None => OutgoingPacket {
                    sequence_number: media.header.sequence_number,
                    data: media.serialize().freeze(),
                    kind: PacketKind::Media,
                },
            };
            state.account(&packet, chunk.len(), now_ms);
            packets.push(packet);
        }

        if let Some(settings) = fec {
            let (rate, uep) = if frame_type == FrameType::KeyFrame {
                (state.fec_rates.key_rate, state.fec_rates.key_uep)
            } else {
                (state.fec_rates.delta_rate, state.fec_rates.delta_uep)
            };
            // One frame at a time; frames above the mask size go unprotected
            if protected.len() <= crate::fec::MAX_MEDIA_PACKETS {
                for parity in state.fec_encoder.generate(&protected, rate, uep)? {
                    let header = state.header(settings.red_payload_type, timestamp, false);
                    let payload = red_encapsulate(settings.fec_payload_type, &parity.serialize());
                    let payload_len = payload.len();
                    let packet = build_packet(header, payload, PacketKind::Fec);
                    state.account(&packet, payload_len, now_ms);
                    packets.push(packet);
                }
            }
        }
        trace!(
            timestamp,
            packets = packets.len(),
            bytes = data.len(),
            "Packetized frame"
        );
        Ok(packets)
    }

    /// RFC 4733 event packets: a start packet and three end packets
    pub fn send_telephone_event_outband(
        &self,
        event: u8,
        length_ms: u16,
        volume: u8,
        now_ms: i64,
    ) -> TransportResult<Vec<OutgoingPacket>> {
        let mut state = self.state();
        let spec = state
            .payloads
            .iter()
            .find(|p| p.kind() == PayloadKind::TelephoneEvent)
            .cloned()
            .ok_or_else(|| TransportError::NotRegistered("telephone-event payload".to_string()))?;
        if event > 16 || volume > 63 {
            return Err(TransportError::ConfigError(format!(
                "telephone event {} volume {} out of range",
                event, volume
            )));
        }
        let duration = (u64::from(length_ms) * u64::from(spec.clock_rate_hz) / 1000).min(0xFFFF) as u16;
        let elapsed_ms = (now_ms - state.last_send_ms).max(0) as u32;
        let timestamp = match state.last_timestamp {
            Some(last) => last.wrapping_add(elapsed_ms.wrapping_mul(spec.clock_rate_hz / 1000)),
            None => state.start_timestamp,
        };

        let mut packets = Vec::with_capacity(4);
        for i in 0..4 {
            let end = i > 0;
            let mut payload = BytesMut::with_capacity(4);
            payload.put_u8(event);
            payload.put_u8(if end { 0x80 | volume } else { volume });
            payload.put_u16(if end { duration } else { 0 });
            let header = state.header(spec.payload_type, timestamp, i == 0);
            let packet = build_packet(header, payload.freeze(), PacketKind::TelephoneEvent);
            state.account(&packet, 4, now_ms);
            packets.push(packet);
        }
        state.last_timestamp = Some(timestamp);
        state.last_send_ms = now_ms;
        debug!(event, length_ms, "Sending telephone event");
        Ok(packets)
    }

    /// RFC 2032 FIR: version byte, packet type 192, length 1, SSRC
    pub fn build_fir_over_rtp(&self) -> Bytes {
        let ssrc = self.state().ssrc;
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u8(0x80);
        buf.put_u8(192);
        buf.put_u16(1);
        buf.put_u32(ssrc);
        buf.freeze()
    }

    /// Counters for our next SR, with the RTP timestamp extrapolated to now
    pub fn sender_stats(&self, now_ms: i64) -> Option<SenderStats> {
        let state = self.state();
        let last_timestamp = state.last_timestamp?;
        let elapsed_ms = (now_ms - state.last_send_ms).max(0) as u64;
        let advance = elapsed_ms * u64::from(state.last_frequency_hz) / 1000;
        Some(SenderStats {
            rtp_timestamp: last_timestamp.wrapping_add(advance as u32),
            packet_count: state.counters.packets,
            octet_count: state.counters.payload_bytes as u32,
        })
    }

    pub fn on_packet_resent(&self, bytes: usize, now_ms: i64) {
        let mut state = self.state();
        state.nack_rate.add(now_ms, bytes);
        state.total_rate.add(now_ms, bytes);
    }

    pub fn bitrate_sent(&self, now_ms: i64) -> BitrateSent {
        let mut state = self.state();
        BitrateSent {
            total_bps: state.total_rate.bitrate_bps(now_ms),
            video_bps: state.video_rate.bitrate_bps(now_ms),
            fec_bps: state.fec_rate.bitrate_bps(now_ms),
            nack_bps: state.nack_rate.bitrate_bps(now_ms),
        }
    }

    pub fn data_counters(&self) -> SendCounters {
        self.state().counters
    }

    pub fn reset_data_counters(&self) {
        self.state().counters = SendCounters::default();
    }
}

fn build_packet(header: RtpHeader, payload: Bytes, kind: PacketKind) -> OutgoingPacket {
    let sequence_number = header.sequence_number;
    let packet = RtpPacket {
        header,
        payload,
        padding_len: 0,
    };
    OutgoingPacket {
        sequence_number,
        data: packet.serialize().freeze(),
        kind,
    }
}

fn random_ssrc(rng: &mut StdRng, avoid: Option<u32>) -> u32 {
    loop {
        let ssrc: u32 = rng.gen();
        if ssrc != 0 && Some(ssrc) != avoid {
            return ssrc;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fec::parse_red;

    fn video_sender() -> RtpSender {
        let sender = RtpSender::new(false, &RtpConfig::default(), 7);
        sender.register_send_payload(PayloadSpec::video(100, "VP8")).unwrap();
        sender.set_sequence_number(33);
        sender.set_start_timestamp(0);
        sender
    }

    fn parse(packet: &OutgoingPacket) -> RtpPacket {
        RtpPacket::parse(&packet.data).unwrap()
    }

    #[test]
    fn test_single_packet_frame() {
        let sender = video_sender();
        let packets = sender
            .send_outgoing_data(FrameType::KeyFrame, 100, 10, b"frame", None, 0)
            .unwrap();
        assert_eq!(packets.len(), 1);
        let rtp = parse(&packets[0]);
        assert!(rtp.header.marker);
        assert_eq!(rtp.header.payload_type, 100);
        assert_eq!(rtp.header.sequence_number, 33);
        assert_eq!(rtp.header.timestamp, 10);
        assert_eq!(rtp.header.ssrc, sender.ssrc());
        assert_eq!(rtp.header.csrc_count, 0);
        assert_eq!(packets[0].data.len(), 12 + 5);
    }

    #[test]
    fn test_frame_split_at_mtu() {
        let sender = video_sender();
        sender.set_max_transfer_unit(200).unwrap();
        let max = sender.max_data_payload_length();
        assert_eq!(max, 200 - 28 - 12);

        let frame = vec![7u8; max * 2 + 10];
        let packets = sender
            .send_outgoing_data(FrameType::DeltaFrame, 100, 0, &frame, None, 0)
            .unwrap();
        assert_eq!(packets.len(), 3);
        let markers: Vec<bool> = packets.iter().map(|p| parse(p).header.marker).collect();
        assert_eq!(markers, vec![false, false, true]);
        let seqs: Vec<u16> = packets.iter().map(|p| p.sequence_number).collect();
        assert_eq!(seqs, vec![33, 34, 35]);
        assert!(packets.iter().all(|p| p.data.len() <= 200 - 28));
    }

    #[test]
    fn test_fragments_packetized_separately() {
        let sender = video_sender();
        let frame = [1u8; 30];
        let packets = sender
            .send_outgoing_data(FrameType::DeltaFrame, 100, 0, &frame, Some(&[0..10, 10..30][..]), 0)
            .unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(parse(&packets[0]).payload.len(), 10);
        assert!(sender
            .send_outgoing_data(FrameType::DeltaFrame, 100, 0, &frame, Some(&[0..40][..]), 0)
            .is_err());
    }

    #[test]
    fn test_unregistered_payload_and_muted_media() {
        let sender = video_sender();
        assert!(matches!(
            sender.send_outgoing_data(FrameType::KeyFrame, 101, 0, b"x", None, 0),
            Err(TransportError::NotRegistered(_))
        ));
        sender.set_sending_media_status(false);
        assert!(sender
            .send_outgoing_data(FrameType::KeyFrame, 100, 0, b"x", None, 0)
            .unwrap()
            .is_empty());
        assert_eq!(sender.sequence_number(), 33);
    }

    #[test]
    fn test_transmission_time_offset_extension() {
        let sender = video_sender();
        assert_eq!(sender.header_extension_length(), 0);
        sender
            .register_header_extension(RtpExtensionType::TransmissionTimeOffset, 1)
            .unwrap();
        assert_eq!(sender.header_extension_length(), 8);
        sender.set_transmission_time_offset(22222).unwrap();

        let packets = sender
            .send_outgoing_data(FrameType::KeyFrame, 100, 0, b"x", None, 0)
            .unwrap();
        let mut map = HeaderExtensionMap::new();
        map.register(RtpExtensionType::TransmissionTimeOffset, 1).unwrap();
        let rtp = parse(&packets[0]);
        assert_eq!(rtp.header.extensions(&map).transmission_time_offset, Some(22222));

        sender.deregister_header_extension(RtpExtensionType::TransmissionTimeOffset);
        assert_eq!(sender.header_extension_length(), 0);
        assert!(sender.set_transmission_time_offset(1 << 23).is_err());
    }

    #[test]
    fn test_red_and_fec_packets() {
        let sender = video_sender();
        sender.set_generic_fec_status(true, 116, 117).unwrap();
        sender.set_fec_code_rate(255, 0);

        let packets = sender
            .send_outgoing_data(FrameType::KeyFrame, 100, 0, &[3u8; 50], None, 0)
            .unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].kind, PacketKind::Media);
        assert_eq!(packets[1].kind, PacketKind::Fec);

        let media = parse(&packets[0]);
        assert_eq!(media.header.payload_type, 116);
        let blocks = parse_red(&media.payload).unwrap();
        assert_eq!(blocks[0].payload_type, 100);
        let fec = parse(&packets[1]);
        assert_eq!(fec.header.sequence_number, 34);
        assert_eq!(parse_red(&fec.payload).unwrap()[0].payload_type, 117);

        // Delta frames at rate zero carry no parity
        let packets = sender
            .send_outgoing_data(FrameType::DeltaFrame, 100, 3000, &[3u8; 50], None, 0)
            .unwrap();
        assert_eq!(packets.len(), 1);
        assert!(sender.set_generic_fec_status(true, 116, 116).is_err());
    }

    #[test]
    fn test_audio_marker_on_talkspurt_start() {
        let sender = RtpSender::new(true, &RtpConfig::default(), 1);
        sender
            .register_send_payload(PayloadSpec::audio(0, "PCMU", 8000, 1))
            .unwrap();
        let marker = |frame_type| {
            let packets = sender
                .send_outgoing_data(frame_type, 0, 0, &[0u8; 160], None, 0)
                .unwrap();
            parse(&packets[0]).header.marker
        };
        assert!(marker(FrameType::AudioSpeech));
        assert!(!marker(FrameType::AudioSpeech));
        assert!(!marker(FrameType::AudioCn));
        assert!(marker(FrameType::AudioSpeech));
    }

    #[test]
    fn test_audio_level_extension() {
        let sender = RtpSender::new(true, &RtpConfig::default(), 1);
        sender
            .register_send_payload(PayloadSpec::audio(0, "PCMU", 8000, 1))
            .unwrap();
        sender.set_audio_level_indication_status(true, 2).unwrap();
        sender.set_audio_level(30).unwrap();
        assert!(sender.set_audio_level(128).is_err());

        let packets = sender
            .send_outgoing_data(FrameType::AudioSpeech, 0, 0, &[0u8; 160], None, 0)
            .unwrap();
        let mut map = HeaderExtensionMap::new();
        map.register(RtpExtensionType::AudioLevel, 2).unwrap();
        let level = parse(&packets[0]).header.extensions(&map).audio_level.unwrap();
        assert_eq!(level.level, 30);
        assert!(level.voice_activity);
    }

    #[test]
    fn test_keepalive() {
        let sender = video_sender();
        assert!(sender.set_keepalive_status(true, 100, 1000).is_err());
        sender.set_keepalive_status(true, 20, 1000).unwrap();
        assert!(matches!(
            sender.register_send_payload(PayloadSpec::video(20, "H264")),
            Err(TransportError::AlreadyRegistered(_))
        ));

        sender
            .send_outgoing_data(FrameType::KeyFrame, 100, 0, b"x", None, 500)
            .unwrap();
        assert!(sender.keepalive_due(1000).is_none());
        assert_eq!(sender.time_until_keepalive(1000), Some(500));
        let keepalive = sender.keepalive_due(1500).unwrap();
        let rtp = parse(&keepalive);
        assert_eq!(rtp.header.payload_type, 20);
        assert!(rtp.payload.is_empty());
        assert!(sender.keepalive_due(1600).is_none());

        sender.set_keepalive_status(false, 0, 0).unwrap();
        assert!(sender.keepalive_due(10_000).is_none());
    }

    #[test]
    fn test_telephone_event_packets() {
        let sender = RtpSender::new(true, &RtpConfig::default(), 3);
        assert!(sender.send_telephone_event_outband(1, 100, 10, 0).is_err());
        sender
            .register_send_payload(PayloadSpec::audio(106, "telephone-event", 8000, 1))
            .unwrap();
        let packets = sender.send_telephone_event_outband(1, 100, 10, 0).unwrap();
        assert_eq!(packets.len(), 4);
        let first = parse(&packets[0]);
        assert!(first.header.marker);
        assert_eq!(first.payload[1] & 0x80, 0);
        let last = parse(&packets[3]);
        assert_eq!(last.payload[1], 0x80 | 10);
        assert_eq!(u16::from_be_bytes([last.payload[2], last.payload[3]]), 800);
        assert_eq!(first.header.timestamp, last.header.timestamp);
    }

    #[test]
    fn test_fir_over_rtp_layout() {
        let sender = video_sender();
        sender.set_ssrc(0x0102_0304);
        assert_eq!(
            sender.build_fir_over_rtp().as_ref(),
            &[0x80, 192, 0, 1, 1, 2, 3, 4]
        );
    }

    #[test]
    fn test_ssrc_regeneration_respects_explicit_ssrc() {
        let sender = video_sender();
        let before = sender.ssrc();
        let after = sender.regenerate_ssrc().unwrap();
        assert_ne!(before, after);
        sender.set_ssrc(42);
        assert_eq!(sender.regenerate_ssrc(), None);
        assert_eq!(sender.ssrc(), 42);
    }

    #[test]
    fn test_sender_stats_extrapolated() {
        let sender = video_sender();
        assert!(sender.sender_stats(0).is_none());
        sender
            .send_outgoing_data(FrameType::KeyFrame, 100, 9000, &[0u8; 100], None, 1000)
            .unwrap();
        let stats = sender.sender_stats(1100).unwrap();
        assert_eq!(stats.rtp_timestamp, 9000 + 9000);
        assert_eq!(stats.packet_count, 1);
        assert_eq!(stats.octet_count, 100);

        sender.reset_data_counters();
        assert_eq!(sender.data_counters(), SendCounters::default());
    }

    #[test]
    fn test_bitrate_sent_window() {
        let sender = video_sender();
        sender
            .send_outgoing_data(FrameType::KeyFrame, 100, 0, &[0u8; 113], None, 0)
            .unwrap();
        sender.on_packet_resent(125, 10);
        let bitrate = sender.bitrate_sent(500);
        assert_eq!(bitrate.video_bps, 125 * 8);
        assert_eq!(bitrate.nack_bps, 125 * 8);
        assert_eq!(bitrate.total_bps, 250 * 8);
        assert_eq!(sender.bitrate_sent(1500).total_bps, 0);
    }

    #[test]
    fn test_mtu_and_overhead_validation() {
        let sender = video_sender();
        assert!(sender.set_max_transfer_unit(1501).is_err());
        assert!(sender.set_max_transfer_unit(64).is_err());
        sender.set_transport_overhead(true, true, 0).unwrap();
        assert_eq!(sender.transport_overhead(), 60);
        assert_eq!(sender.max_payload_length(), 1500 - 60);
        assert!(sender.set_csrcs(&[0; 16]).is_err());
    }
}
