//! RTP/RTCP session
//!
//! One session owns the send path, the receive path, the RTCP engine, the
//! retransmission history and the receive-side timing estimator, and wires
//! them to the collaborators an application registers. Components keep their
//! own locks; the session touches one at a time and calls collaborators with
//! none held.
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


use crate::bandwidth_estimation::{BandwidthManager, BandwidthUpdate};
use crate::callbacks::{
    AliveState, AudioFeedback, CallbackSlot, IntraRequestKind, RtcpFeedback, RtpData,
    RtpFeedback, Transport, VideoFeedback,
};
use crate::clock::{Clock, NtpTime};
use crate::error::{TransportError, TransportResult};
use crate::module::{Module, RtpModule};
use crate::payload_registry::PayloadSpec;
use crate::rtcp::{is_rtcp, parse_compound, ReportBlock, TmmbItem, VoipMetric};
use crate::rtcp_engine::{
    PeerState, RemoteReportBlock, RemoteSenderInfo, RtcpContext, RtcpEngine, RtcpMode,
    RtcpPacketInformation, RtcpPacketMask, RttStats,
};
use crate::rtp_handler::RtpExtensionType;
use crate::rtp_receiver::{
    is_fir_over_rtp, DataCounters, ReceiveEvent, ReceiveOutcome, RtpReceiver, RtpStatistics,
};
use crate::rtp_retransmission::{NackBitrateLimiter, RetransmissionStats, RtpPacketHistory};
use crate::rtp_sender::{BitrateSent, FecSettings, FrameType, RtpSender, SendCounters};
use crate::nack::NackStats;
use crate::seq_num::timestamp_diff;
use crate::timing::TimingEstimator;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rtcstack_config::{RtpConfig, StackConfig, TimingConfig};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Unique identity of a session, used to key default-module relations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How this session asks the remote sender for a key frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFrameRequestMethod {
    PliRtcp,
    FirRtcp,
    FirRtp,
}

/// Whether lost packets are requested with RTCP NACK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackMethod {
    Off,
    Rtcp,
}

/// Construction parameters for [`RtpSession`]
#[derive(Clone)]
pub struct SessionOptions {
    pub audio: bool,
    pub clock: Arc<dyn Clock>,
    pub rtp: RtpConfig,
    pub timing: TimingConfig,
    /// Seed for SSRC, sequence and interval randomization; entropy if unset
    pub rng_seed: Option<u64>,
}

impl SessionOptions {
    pub fn new(audio: bool, clock: Arc<dyn Clock>) -> Self {
        Self {
            audio,
            clock,
            rtp: RtpConfig::default(),
            timing: TimingConfig::default(),
            rng_seed: None,
        }
    }

    pub fn from_config(audio: bool, clock: Arc<dyn Clock>, config: &StackConfig) -> Self {
        Self {
            audio,
            clock,
            rtp: config.rtp.clone(),
            timing: config.timing.clone(),
            rng_seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }
}

#[derive(Default)]
struct Callbacks {
    transport: CallbackSlot<dyn Transport>,
    data: CallbackSlot<dyn RtpData>,
    rtp_feedback: CallbackSlot<dyn RtpFeedback>,
    rtcp_feedback: CallbackSlot<dyn RtcpFeedback>,
    video_feedback: CallbackSlot<dyn VideoFeedback>,
    audio_feedback: CallbackSlot<dyn AudioFeedback>,
}

#[derive(Default)]
struct Relations {
    default_module: Option<(SessionId, Weak<RtpSession>)>,
    children: BTreeMap<SessionId, Weak<RtpSession>>,
    sync_module: Option<Weak<RtpSession>>,
}

struct SessionState {
    sending: bool,
    has_sent: bool,
    key_frame_method: KeyFrameRequestMethod,
    packet_timeout_ms: i64,
    rtcp_timeout_ms: i64,
    dead_or_alive_interval_ms: Option<i64>,
    next_dead_or_alive_ms: i64,
    last_process_ms: i64,
    simulcast_index: u8,
    closed: bool,
}

/// Point-to-point RTP/RTCP session
pub struct RtpSession {
    id: SessionId,
    audio: bool,
    clock: Arc<dyn Clock>,
    process_interval_ms: i64,
    self_ref: Weak<RtpSession>,

    timing: TimingEstimator,
    history: RtpPacketHistory,
    nack_limiter: Mutex<NackBitrateLimiter>,
    rtcp: RtcpEngine,
    receiver: RtpReceiver,
    sender: RtpSender,
    bandwidth: Mutex<BandwidthManager>,

    callbacks: Mutex<Callbacks>,
    relations: Mutex<Relations>,
    state: Mutex<SessionState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl RtpSession {
    pub fn new(options: SessionOptions) -> Arc<Self> {
        let seed = options.rng_seed.unwrap_or_else(rand::random);
        let mut seeds = StdRng::seed_from_u64(seed);
        let sender = RtpSender::new(options.audio, &options.rtp, seeds.gen());
        let rtcp = RtcpEngine::new(
            options.clock.clone(),
            options.audio,
            &options.rtp,
            sender.ssrc(),
            seeds.gen(),
        );
        let now_ms = options.clock.now_ms();
        let id = SessionId::new();
        info!(
            session = %id,
            audio = options.audio,
            ssrc = sender.ssrc(),
            "Creating RTP session"
        );

        Arc::new_cyclic(|self_ref| Self {
            id,
            audio: options.audio,
            clock: options.clock.clone(),
            process_interval_ms: i64::from(options.rtp.process_interval_ms),
            self_ref: self_ref.clone(),
            timing: TimingEstimator::new(options.clock.clone(), options.timing.clone()),
            history: RtpPacketHistory::new(),
            nack_limiter: Mutex::new(NackBitrateLimiter::new()),
            rtcp,
            receiver: RtpReceiver::new(&options.rtp),
            sender,
            bandwidth: Mutex::new(BandwidthManager::new()),
            callbacks: Mutex::new(Callbacks::default()),
            relations: Mutex::new(Relations::default()),
            state: Mutex::new(SessionState {
                sending: false,
                has_sent: false,
                key_frame_method: KeyFrameRequestMethod::PliRtcp,
                packet_timeout_ms: i64::from(options.rtp.rtp_packet_timeout_ms),
                rtcp_timeout_ms: i64::from(options.rtp.rtcp_packet_timeout_ms),
                dead_or_alive_interval_ms: None,
                next_dead_or_alive_ms: now_ms,
                last_process_ms: now_ms,
                simulcast_index: 0,
                closed: false,
            }),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_audio(&self) -> bool {
        self.audio
    }

    fn callbacks(&self) -> MutexGuard<'_, Callbacks> {
        lock(&self.callbacks)
    }

    fn relations(&self) -> MutexGuard<'_, Relations> {
        lock(&self.relations)
    }

    fn session_state(&self) -> MutexGuard<'_, SessionState> {
        lock(&self.state)
    }

    // Collaborators

    pub fn register_transport(&self, transport: &Arc<dyn Transport>) -> TransportResult<()> {
        self.callbacks().transport.register(transport, "transport")
    }

    pub fn deregister_transport(&self) {
        self.callbacks().transport.clear();
    }

    pub fn register_incoming_data_callback(&self, callback: &Arc<dyn RtpData>) -> TransportResult<()> {
        self.callbacks().data.register(callback, "incoming data callback")
    }

    pub fn register_rtp_feedback(&self, callback: &Arc<dyn RtpFeedback>) -> TransportResult<()> {
        self.callbacks().rtp_feedback.register(callback, "RTP feedback")
    }

    pub fn register_rtcp_feedback(&self, callback: &Arc<dyn RtcpFeedback>) -> TransportResult<()> {
        self.callbacks().rtcp_feedback.register(callback, "RTCP feedback")
    }

    pub fn register_video_feedback(&self, callback: &Arc<dyn VideoFeedback>) -> TransportResult<()> {
        self.callbacks().video_feedback.register(callback, "video feedback")
    }

    pub fn register_audio_feedback(&self, callback: &Arc<dyn AudioFeedback>) -> TransportResult<()> {
        self.callbacks().audio_feedback.register(callback, "audio feedback")
    }

    fn transport(&self) -> TransportResult<Arc<dyn Transport>> {
        self.callbacks()
            .transport
            .get()
            .ok_or_else(|| TransportError::NotRegistered("transport".to_string()))
    }

    /// Video feedback of the default module if there is one, else our own
    fn video_feedback(&self) -> Option<Arc<dyn VideoFeedback>> {
        let default = self.default_module();
        if let Some(feedback) = default.and_then(|d| d.callbacks().video_feedback.get()) {
            return Some(feedback);
        }
        self.callbacks().video_feedback.get()
    }

    fn send_rtp_bytes(&self, data: &[u8]) -> TransportResult<()> {
        if self.transport()?.send_rtp(data) {
            Ok(())
        } else {
            Err(TransportError::TransportFailed("RTP packet rejected".to_string()))
        }
    }

    fn send_rtcp_bytes(&self, data: &[u8]) -> TransportResult<()> {
        if self.transport()?.send_rtcp(data) {
            Ok(())
        } else {
            Err(TransportError::TransportFailed("RTCP packet rejected".to_string()))
        }
    }

    // Lifecycle

    /// Reset the send side; payloads and transport settings are kept
    pub fn init_sender(&self) -> TransportResult<()> {
        self.set_sending_status(false)?;
        self.sender.init();
        *lock(&self.nack_limiter) = NackBitrateLimiter::new();
        Ok(())
    }

    /// Reset the receive side
    pub fn init_receiver(&self) {
        self.receiver.reset();
        self.rtcp.reset();
        self.timing.reset(Some(self.clock.now_ms()));
    }

    pub fn sending(&self) -> bool {
        self.session_state().sending
    }

    /// Start or stop sending; stopping says goodbye to the remote end
    pub fn set_sending_status(&self, sending: bool) -> TransportResult<()> {
        let (was_sending, restart) = {
            let mut state = self.session_state();
            let was_sending = state.sending;
            let restart = sending && !was_sending && state.has_sent;
            state.sending = sending;
            state.has_sent |= sending;
            (was_sending, restart)
        };
        if was_sending == sending {
            return Ok(());
        }
        if sending {
            if restart {
                if let Some(ssrc) = self.sender.regenerate_ssrc() {
                    self.rtcp.set_ssrc(ssrc);
                }
            }
            self.rtcp.set_sending(true);
            info!(session = %self.id, ssrc = self.sender.ssrc(), "Sending started");
            return Ok(());
        }

        if self.rtcp.mode() != RtcpMode::Off {
            if let Err(e) = self.send_rtcp(RtcpPacketMask::BYE) {
                debug!(session = %self.id, error = %e, "Could not send BYE");
            }
        }
        self.rtcp.set_sending(false);
        info!(session = %self.id, "Sending stopped");
        Ok(())
    }

    /// Mute without tearing the session down
    pub fn set_sending_media_status(&self, sending: bool) {
        self.sender.set_sending_media_status(sending);
    }

    pub fn sending_media(&self) -> bool {
        self.sender.sending_media()
    }

    /// Release this session; fails while other sessions use it as their default
    pub fn close(&self) -> TransportResult<()> {
        let children = {
            let mut relations = self.relations();
            relations.children.retain(|_, child| child.strong_count() > 0);
            relations.children.len()
        };
        if children > 0 {
            return Err(TransportError::InvalidState {
                state: format!("{} sessions still use this one as default module", children),
            });
        }
        self.deregister_default_module()?;
        self.set_sending_status(false)?;
        self.session_state().closed = true;
        info!(session = %self.id, "RTP session closed");
        Ok(())
    }

    // Payloads and packetization

    pub fn register_send_payload(&self, spec: PayloadSpec) -> TransportResult<()> {
        spec.validate()?;
        self.sender.register_send_payload(spec)
    }

    pub fn deregister_send_payload(&self, payload_type: u8) -> TransportResult<()> {
        self.sender.deregister_send_payload(payload_type)
    }

    pub fn send_payload(&self, payload_type: u8) -> TransportResult<PayloadSpec> {
        self.sender
            .send_payload(payload_type)
            .ok_or(TransportError::InvalidPayloadType { payload_type })
    }

    pub fn register_receive_payload(&self, spec: PayloadSpec) -> TransportResult<()> {
        spec.validate()?;
        self.receiver.register_receive_payload(spec)
    }

    pub fn deregister_receive_payload(&self, payload_type: u8) -> TransportResult<()> {
        self.receiver.deregister_receive_payload(payload_type)
    }

    pub fn receive_payload(&self, payload_type: u8) -> TransportResult<PayloadSpec> {
        self.receiver.receive_payload(payload_type)
    }

    pub fn receive_payload_type(&self, name: &str, clock_rate_hz: u32, channels: u8) -> TransportResult<u8> {
        self.receiver.receive_payload_type(name, clock_rate_hz, channels)
    }

    pub fn set_max_transfer_unit(&self, mtu: u16) -> TransportResult<()> {
        self.sender.set_max_transfer_unit(mtu)
    }

    pub fn max_transfer_unit(&self) -> u16 {
        self.sender.max_transfer_unit()
    }

    pub fn set_transport_overhead(&self, tcp: bool, ipv6: bool, authentication_overhead: u8) -> TransportResult<()> {
        self.sender.set_transport_overhead(tcp, ipv6, authentication_overhead)
    }

    pub fn max_data_payload_length(&self) -> usize {
        self.sender.max_data_payload_length()
    }

    pub fn register_send_header_extension(&self, ty: RtpExtensionType, id: u8) -> TransportResult<()> {
        self.sender.register_header_extension(ty, id)
    }

    pub fn deregister_send_header_extension(&self, ty: RtpExtensionType) {
        self.sender.deregister_header_extension(ty);
    }

    pub fn register_receive_header_extension(&self, ty: RtpExtensionType, id: u8) -> TransportResult<()> {
        self.receiver.register_header_extension(ty, id)
    }

    pub fn deregister_receive_header_extension(&self, ty: RtpExtensionType) {
        self.receiver.deregister_header_extension(ty);
    }

    pub fn set_transmission_time_offset(&self, offset: i32) -> TransportResult<()> {
        self.sender.set_transmission_time_offset(offset)
    }

    pub fn set_audio_level_indication_status(&self, enable: bool, id: u8) -> TransportResult<()> {
        if !self.audio {
            return Err(TransportError::InvalidState {
                state: "audio level on a video session".to_string(),
            });
        }
        self.sender.set_audio_level_indication_status(enable, id)
    }

    /// Extension id carrying the audio level, if enabled
    pub fn audio_level_indication_status(&self) -> Option<u8> {
        self.sender.audio_level_indication_status()
    }

    pub fn set_audio_level(&self, level_dbov: u8) -> TransportResult<()> {
        self.sender.set_audio_level(level_dbov)
    }

    /// Packetize one encoded frame and hand the packets to the transport
    pub fn send_outgoing_data(
        &self,
        frame_type: FrameType,
        payload_type: u8,
        capture_timestamp: u32,
        data: &[u8],
        fragments: Option<&[Range<usize>]>,
    ) -> TransportResult<()> {
        let transport = self.transport()?;
        let now_ms = self.clock.now_ms();
        let packets = self.sender.send_outgoing_data(
            frame_type,
            payload_type,
            capture_timestamp,
            data,
            fragments,
            now_ms,
        )?;

        let mut rejected = 0;
        for packet in &packets {
            if packet.retransmittable() {
                self.history
                    .on_packet_sent(packet.sequence_number, packet.data.clone(), now_ms);
            }
            if !transport.send_rtp(&packet.data) {
                rejected += 1;
            }
        }
        if rejected > 0 {
            warn!(session = %self.id, rejected, "Transport rejected RTP packets");
            return Err(TransportError::TransportFailed(format!(
                "{} of {} RTP packets rejected",
                rejected,
                packets.len()
            )));
        }
        Ok(())
    }

    /// RFC 4733 events sent as RTP packets
    pub fn send_telephone_event_outband(&self, event: u8, length_ms: u16, volume: u8) -> TransportResult<()> {
        let packets = self
            .sender
            .send_telephone_event_outband(event, length_ms, volume, self.clock.now_ms())?;
        for packet in &packets {
            self.send_rtp_bytes(&packet.data)?;
        }
        let feedback = self.callbacks().audio_feedback.get();
        if let Some(feedback) = feedback {
            feedback.on_play_telephone_event(event, length_ms, volume);
        }
        Ok(())
    }

    // SSRC and CSRC

    pub fn ssrc(&self) -> u32 {
        self.sender.ssrc()
    }

    /// Fix our SSRC; it is no longer regenerated on restart
    pub fn set_ssrc(&self, ssrc: u32) {
        self.sender.set_ssrc(ssrc);
        self.rtcp.set_ssrc(ssrc);
    }

    /// Next sequence number to be sent
    pub fn sequence_number(&self) -> u16 {
        self.sender.sequence_number()
    }

    pub fn set_sequence_number(&self, sequence_number: u16) {
        self.sender.set_sequence_number(sequence_number);
    }

    pub fn start_timestamp(&self) -> u32 {
        self.sender.start_timestamp()
    }

    pub fn set_start_timestamp(&self, timestamp: u32) {
        self.sender.set_start_timestamp(timestamp);
    }

    pub fn csrcs(&self) -> Vec<u32> {
        self.sender.csrcs()
    }

    pub fn remote_ssrc(&self) -> Option<u32> {
        self.receiver.remote_ssrc()
    }

    pub fn remote_csrcs(&self) -> Vec<u32> {
        self.receiver.remote_csrcs()
    }

    pub fn set_csrcs(&self, csrcs: &[u32]) -> TransportResult<()> {
        self.sender.set_csrcs(csrcs)?;
        self.rtcp.set_csrcs(csrcs);
        Ok(())
    }

    pub fn set_csrc_status(&self, include: bool) {
        self.sender.set_csrc_status(include);
        self.rtcp.set_csrc_status(include);
    }

    /// Only accept RTP from `ssrc`; `None` accepts everything
    pub fn set_ssrc_filter(&self, ssrc: Option<u32>) {
        self.receiver.set_ssrc_filter(ssrc);
    }

    pub fn ssrc_filter(&self) -> Option<u32> {
        self.receiver.ssrc_filter()
    }

    // Receive path

    /// Entry point for every datagram from the network
    pub fn incoming_packet(&self, data: &[u8]) -> TransportResult<()> {
        if data.len() < 8 {
            trace!(session = %self.id, len = data.len(), "Dropping runt packet");
            return Err(TransportError::InvalidPacket(format!(
                "{} byte packet",
                data.len()
            )));
        }
        // FIR over RTP shares its second byte with RTCP SR
        if !is_fir_over_rtp(data) && is_rtcp(data) {
            return self.incoming_rtcp_packet(data);
        }
        let outcome = self.receiver.incoming_rtp(data, self.clock.now_ms())?;
        self.handle_receive_outcome(outcome);
        Ok(())
    }

    fn handle_receive_outcome(&self, outcome: ReceiveOutcome) {
        if let Some(ssrc) = outcome.new_remote_ssrc {
            self.rtcp.set_remote_ssrc(ssrc);
        }
        if let Some(timestamp) = outcome.new_frame_timestamp {
            if !self.audio {
                self.timing.incoming_timestamp(timestamp, self.clock.now_ms());
            }
        }

        for event in outcome.events {
            match event {
                ReceiveEvent::SsrcChanged(ssrc) => {
                    let feedback = self.callbacks().rtp_feedback.get();
                    if let Some(feedback) = feedback {
                        feedback.on_incoming_ssrc_changed(ssrc);
                    }
                }
                ReceiveEvent::CsrcChanged { csrc, added } => {
                    let feedback = self.callbacks().rtp_feedback.get();
                    if let Some(feedback) = feedback {
                        feedback.on_incoming_csrc_changed(csrc, added);
                    }
                }
                ReceiveEvent::InitializeDecoder {
                    payload_type,
                    name,
                    clock_rate_hz,
                    channels,
                } => {
                    let feedback = self.callbacks().rtp_feedback.get();
                    if let Some(feedback) = feedback {
                        feedback.on_initialize_decoder(payload_type, &name, clock_rate_hz, channels);
                    }
                }
                ReceiveEvent::TelephoneEvent { event, end_of_event } => {
                    let feedback = self.callbacks().audio_feedback.get();
                    if let Some(feedback) = feedback {
                        feedback.on_received_telephone_event(event, end_of_event);
                    }
                }
                ReceiveEvent::PacketReceivedAfterTimeout => {
                    let feedback = self.callbacks().rtp_feedback.get();
                    if let Some(feedback) = feedback {
                        feedback.on_received_packet();
                    }
                }
                ReceiveEvent::FirOverRtp => self.on_intra_request(IntraRequestKind::FirOverRtp),
                ReceiveEvent::KeyFrameNeeded => {
                    if let Err(e) = self.request_key_frame() {
                        debug!(session = %self.id, error = %e, "Key frame request failed");
                    }
                }
            }
        }

        if outcome.payloads.is_empty() {
            return;
        }
        let data = self.callbacks().data.get();
        if let Some(data) = data {
            for payload in &outcome.payloads {
                data.on_received_payload_data(&payload.payload, &payload.info);
            }
        }
    }

    fn incoming_rtcp_packet(&self, data: &[u8]) -> TransportResult<()> {
        if self.rtcp.mode() == RtcpMode::Off {
            return Err(TransportError::RtcpOff);
        }
        let packets = parse_compound(data).inspect_err(|e| {
            debug!(
                session = %self.id,
                error = %e,
                dump = %hex::encode(&data[..data.len().min(32)]),
                "Dropping malformed RTCP"
            );
        })?;
        let info = self.rtcp.incoming_rtcp(&packets);
        self.handle_rtcp_information(info);
        Ok(())
    }

    fn handle_rtcp_information(&self, info: RtcpPacketInformation) {
        let now_ms = self.clock.now_ms();
        let rtcp_feedback = self.callbacks().rtcp_feedback.get();

        if let Some(ssrc) = info.remote_ssrc {
            if let Some(feedback) = &rtcp_feedback {
                if info.flags.contains(RtcpPacketMask::SR) {
                    feedback.on_sender_report_received(ssrc);
                } else if info.flags.contains(RtcpPacketMask::RR) {
                    feedback.on_receiver_report_received(ssrc);
                }
            }
        }
        if let (Some(fraction_lost), Some(extended)) = (info.fraction_lost, info.extended_highest_sequence) {
            let rtt_ms = info.rtt_ms.unwrap_or_else(|| self.rtcp.last_rtt_ms());
            let update = lock(&self.bandwidth).update_packet_loss(
                extended,
                fraction_lost,
                rtt_ms.clamp(0, i64::from(u32::MAX)) as u32,
            );
            self.on_bandwidth_update(update);
        }

        if info.flags.contains(RtcpPacketMask::NACK) && self.history.store_packets() {
            let rtt_ms = self.rtcp.last_rtt_ms();
            let queued = self
                .history
                .on_nack_received(&info.nack_sequence_numbers, rtt_ms, now_ms);
            trace!(session = %self.id, requested = info.nack_sequence_numbers.len(), queued, "NACK received");
            self.resend_pending(now_ms);
        }

        if info.flags.contains(RtcpPacketMask::PLI) {
            self.on_intra_request(IntraRequestKind::Pli);
        }
        if info.flags.contains(RtcpPacketMask::FIR) {
            self.on_intra_request(IntraRequestKind::Fir);
        }
        if let Some(picture_id) = info.sli_picture_id {
            if let Some(feedback) = self.video_feedback() {
                feedback.on_received_slice_loss_indication(picture_id);
            }
        }
        if let Some(picture_id) = info.rpsi_picture_id {
            if let Some(feedback) = self.video_feedback() {
                feedback.on_received_reference_picture_selection(picture_id);
            }
        }

        if let Some(bitrate_bps) = info.remb_bitrate_bps {
            let update = lock(&self.bandwidth).update_remote_estimate(bitrate_bps);
            self.on_bandwidth_update(update);
        }
        if info.flags.contains(RtcpPacketMask::TMMBR) {
            if let Some(bound_kbps) = self.rtcp.tmmbr_bound_kbps() {
                if let Some(feedback) = &rtcp_feedback {
                    feedback.on_tmmbr_received(bound_kbps);
                }
                let update = lock(&self.bandwidth).update_remote_estimate(bound_kbps.saturating_mul(1000));
                self.on_bandwidth_update(update);
            }
        }

        if let Some(feedback) = &rtcp_feedback {
            if let Some(app) = &info.application {
                feedback.on_application_data_received(app.subtype, app.name, &app.data);
            }
            if let Some(metric) = &info.voip_metric {
                feedback.on_xr_voip_metric_received(metric);
            }
        }
        if !info.goodbye_ssrcs.is_empty() {
            debug!(session = %self.id, ssrcs = ?info.goodbye_ssrcs, "BYE received");
        }

        if info.flags.contains(RtcpPacketMask::SR) {
            self.update_lip_sync(rtcp_feedback.as_deref());
        }
    }

    fn on_intra_request(&self, kind: IntraRequestKind) {
        let stream_idx = self.session_state().simulcast_index;
        debug!(session = %self.id, ?kind, stream_idx, "Key frame requested by remote end");
        if let Some(feedback) = self.video_feedback() {
            feedback.on_received_intra_frame_request(kind, stream_idx);
        }
    }

    fn on_bandwidth_update(&self, update: Option<BandwidthUpdate>) {
        let Some(update) = update else {
            return;
        };
        if let Some(feedback) = self.video_feedback() {
            feedback.on_network_changed(update.bitrate_bps, update.fraction_lost, update.rtt_ms);
        }
    }

    /// Resend queued packets within the NACK bitrate budget
    ///
    /// One burst is capped at roughly one round trip's worth of the send rate.
    fn resend_pending(&self, now_ms: i64) {
        let target_bps = lock(&self.bandwidth).bitrate_bps();
        let rtt_ms = self.rtcp.last_rtt_ms();
        let burst_budget = if target_bps > 0 && rtt_ms > 0 {
            Some((rtt_ms as u64 * u64::from(target_bps) / 8000) as usize)
        } else {
            None
        };

        let mut burst_bytes = 0usize;
        while lock(&self.nack_limiter).can_send(now_ms, target_bps) {
            let Some(packet) = self.history.next_packet_to_resend(now_ms) else {
                break;
            };
            if let Err(e) = self.send_rtp_bytes(&packet.data) {
                debug!(session = %self.id, seq = packet.sequence_number, error = %e, "Resend failed");
                break;
            }
            lock(&self.nack_limiter).on_resent(now_ms, packet.data.len());
            self.sender.on_packet_resent(packet.data.len(), now_ms);
            burst_bytes += packet.data.len();
            trace!(session = %self.id, seq = packet.sequence_number, "Resent packet");
            if burst_budget.is_some_and(|budget| burst_bytes >= budget) {
                break;
            }
        }
    }

    // Retransmission and loss protection

    /// Keep sent packets so NACKed ones can be resent
    pub fn set_store_packets_status(&self, enable: bool, history_size: u16) -> TransportResult<()> {
        self.history.set_store_packets_status(enable, history_size)
    }

    pub fn store_packets(&self) -> bool {
        self.history.store_packets()
    }

    pub fn retransmission_stats(&self) -> RetransmissionStats {
        self.history.stats()
    }

    pub fn set_nack_status(&self, method: NackMethod) {
        self.receiver.set_nack_status(method == NackMethod::Rtcp);
    }

    pub fn nack_method(&self) -> NackMethod {
        if self.receiver.nack_enabled() {
            NackMethod::Rtcp
        } else {
            NackMethod::Off
        }
    }

    pub fn nack_stats(&self) -> Option<NackStats> {
        self.receiver.nack_stats()
    }

    /// Request specific sequence numbers
    pub fn send_nack(&self, sequence_numbers: &[u16]) -> TransportResult<()> {
        self.send_rtcp_with(
            RtcpPacketMask::NACK,
            RtcpContext {
                nack_list: sequence_numbers.to_vec(),
                ..self.rtcp_context(RtcpPacketMask::NACK)
            },
        )
    }

    pub fn set_generic_fec_status(&self, enable: bool, red_payload_type: u8, fec_payload_type: u8) -> TransportResult<()> {
        self.sender
            .set_generic_fec_status(enable, red_payload_type, fec_payload_type)
    }

    pub fn generic_fec_status(&self) -> Option<FecSettings> {
        self.sender.generic_fec_status()
    }

    pub fn set_fec_code_rate(&self, key_frame_rate: u8, delta_frame_rate: u8) {
        self.sender.set_fec_code_rate(key_frame_rate, delta_frame_rate);
    }

    pub fn set_fec_uep_protection(&self, key_use_uep: bool, delta_use_uep: bool) {
        self.sender.set_fec_uep_protection(key_use_uep, delta_use_uep);
    }

    pub fn fec_recovered_packets(&self) -> u64 {
        self.receiver.fec_recovered_packets()
    }

    // Key frames

    pub fn set_key_frame_request_method(&self, method: KeyFrameRequestMethod) {
        self.session_state().key_frame_method = method;
    }

    pub fn key_frame_request_method(&self) -> KeyFrameRequestMethod {
        self.session_state().key_frame_method
    }

    /// Ask the remote sender for a key frame using the configured method
    pub fn request_key_frame(&self) -> TransportResult<()> {
        let method = self.session_state().key_frame_method;
        debug!(session = %self.id, ?method, "Requesting key frame");
        match method {
            KeyFrameRequestMethod::PliRtcp => self.send_rtcp(RtcpPacketMask::PLI),
            KeyFrameRequestMethod::FirRtcp => self.send_rtcp(RtcpPacketMask::FIR),
            KeyFrameRequestMethod::FirRtp => self.send_rtp_bytes(&self.sender.build_fir_over_rtp()),
        }
    }

    // Keepalive and liveness

    /// Send empty packets of an unused payload type while idle
    pub fn set_keepalive_status(&self, enable: bool, payload_type: u8, interval_ms: u16) -> TransportResult<()> {
        if enable && self.receiver.receive_payload(payload_type).is_ok() {
            return Err(TransportError::ConfigError(format!(
                "keepalive payload type {} is registered for receive",
                payload_type
            )));
        }
        self.sender.set_keepalive_status(enable, payload_type, interval_ms)
    }

    pub fn keepalive_status(&self) -> Option<(u8, u16)> {
        self.sender.keepalive_status()
    }

    /// Silence thresholds for the RTP and RTCP timeout callbacks, 0 disables
    pub fn set_packet_timeout(&self, rtp_timeout_ms: u32, rtcp_timeout_ms: u32) {
        let mut state = self.session_state();
        state.packet_timeout_ms = i64::from(rtp_timeout_ms);
        state.rtcp_timeout_ms = i64::from(rtcp_timeout_ms);
    }

    pub fn packet_timeout(&self) -> (u32, u32) {
        let state = self.session_state();
        (state.packet_timeout_ms as u32, state.rtcp_timeout_ms as u32)
    }

    /// Report `on_periodic_dead_or_alive` every `interval_s` seconds
    pub fn set_periodic_dead_or_alive_status(&self, enable: bool, interval_s: u8) -> TransportResult<()> {
        if enable && interval_s == 0 {
            return Err(TransportError::ConfigError(
                "dead-or-alive interval must be positive".to_string(),
            ));
        }
        let interval_ms = i64::from(interval_s) * 1000;
        let now_ms = self.clock.now_ms();
        {
            let mut state = self.session_state();
            state.dead_or_alive_interval_ms = enable.then_some(interval_ms);
            state.next_dead_or_alive_ms = now_ms + interval_ms;
        }
        if enable {
            // Discard activity from before the first window
            self.receiver.dead_or_alive();
        }
        Ok(())
    }

    // RTCP

    pub fn set_rtcp_status(&self, mode: RtcpMode) {
        self.rtcp.set_rtcp_status(mode);
    }

    pub fn rtcp_status(&self) -> RtcpMode {
        self.rtcp.mode()
    }

    pub fn peer_state(&self) -> PeerState {
        self.rtcp.peer_state()
    }

    pub fn set_cname(&self, cname: &str) -> TransportResult<()> {
        self.rtcp.set_cname(cname)
    }

    pub fn cname(&self) -> String {
        self.rtcp.cname()
    }

    pub fn remote_cname(&self, ssrc: u32) -> TransportResult<String> {
        self.rtcp.remote_cname(ssrc)
    }

    pub fn add_mixed_cname(&self, ssrc: u32, cname: &str) -> TransportResult<()> {
        self.rtcp.add_mixed_cname(ssrc, cname)
    }

    pub fn remove_mixed_cname(&self, ssrc: u32) -> TransportResult<()> {
        self.rtcp.remove_mixed_cname(ssrc)
    }

    pub fn add_rtcp_report_block(&self, ssrc: u32, block: ReportBlock) -> TransportResult<()> {
        self.rtcp.add_report_block(ssrc, block)
    }

    pub fn remove_rtcp_report_block(&self, ssrc: u32) -> TransportResult<()> {
        self.rtcp.remove_report_block(ssrc)
    }

    pub fn rtt(&self, remote_ssrc: u32) -> TransportResult<RttStats> {
        self.rtcp.rtt(remote_ssrc)
    }

    pub fn reset_rtt(&self, remote_ssrc: u32) -> TransportResult<()> {
        self.rtcp.reset_rtt(remote_ssrc)
    }

    pub fn remote_report_blocks(&self) -> Vec<RemoteReportBlock> {
        self.rtcp.remote_report_blocks()
    }

    pub fn remote_sender_info(&self) -> TransportResult<RemoteSenderInfo> {
        self.rtcp.remote_sender_info()
    }

    pub fn set_rtcp_application_specific_data(&self, subtype: u8, name: [u8; 4], data: &[u8]) -> TransportResult<()> {
        self.rtcp.set_application_specific_data(subtype, name, data)
    }

    pub fn set_rtcp_voip_metrics(&self, metric: VoipMetric) -> TransportResult<()> {
        self.rtcp.set_voip_metrics(metric)
    }

    pub fn send_rtcp_slice_loss_indication(&self, picture_id: u8) -> TransportResult<()> {
        self.send_rtcp_with(
            RtcpPacketMask::SLI,
            RtcpContext {
                slice_loss_picture_id: Some(picture_id),
                ..self.rtcp_context(RtcpPacketMask::SLI)
            },
        )
    }

    pub fn send_rtcp_reference_picture_selection(&self, payload_type: u8, picture_id: u64) -> TransportResult<()> {
        self.send_rtcp_with(
            RtcpPacketMask::RPSI,
            RtcpContext {
                reference_picture: Some((payload_type, picture_id)),
                ..self.rtcp_context(RtcpPacketMask::RPSI)
            },
        )
    }

    /// Build and send an RTCP packet holding `mask`
    pub fn send_rtcp(&self, mask: RtcpPacketMask) -> TransportResult<()> {
        self.send_rtcp_with(mask, self.rtcp_context(mask))
    }

    fn rtcp_context(&self, mask: RtcpPacketMask) -> RtcpContext {
        let with_report = self.rtcp.mode() == RtcpMode::Compound
            || mask.contains(RtcpPacketMask::REPORT)
            || mask.contains(RtcpPacketMask::SR)
            || mask.contains(RtcpPacketMask::RR);
        let sender_stats = if self.sending() {
            self.sender.sender_stats(self.clock.now_ms())
        } else {
            None
        };
        RtcpContext {
            sender_stats,
            receive_block: if with_report {
                self.receiver.report_block()
            } else {
                None
            },
            ..RtcpContext::default()
        }
    }

    fn send_rtcp_with(&self, mask: RtcpPacketMask, context: RtcpContext) -> TransportResult<()> {
        match self.rtcp.build_rtcp(mask, &context)? {
            Some(packet) => self.send_rtcp_bytes(&packet),
            None => {
                trace!(session = %self.id, mask = mask.bits(), "Nothing to send in RTCP");
                Ok(())
            }
        }
    }

    // Statistics

    pub fn statistics_rtp(&self, reset: bool) -> TransportResult<RtpStatistics> {
        self.receiver.statistics(reset)
    }

    pub fn reset_statistics_rtp(&self) {
        self.receiver.reset_statistics();
    }

    pub fn receive_data_counters(&self) -> DataCounters {
        self.receiver.data_counters()
    }

    pub fn reset_receive_data_counters(&self) {
        self.receiver.reset_data_counters();
    }

    pub fn send_data_counters(&self) -> SendCounters {
        self.sender.data_counters()
    }

    pub fn reset_send_data_counters(&self) {
        self.sender.reset_data_counters();
    }

    pub fn bitrate_sent_detail(&self) -> BitrateSent {
        self.sender.bitrate_sent(self.clock.now_ms())
    }

    /// Receive-side jitter buffer timing
    pub fn timing(&self) -> &TimingEstimator {
        &self.timing
    }

    // Bandwidth

    pub fn set_remb_status(&self, enable: bool) {
        self.rtcp.set_remb_status(enable);
    }

    pub fn remb(&self) -> bool {
        self.rtcp.remb()
    }

    pub fn set_tmmbr_status(&self, enable: bool) {
        self.rtcp.set_tmmbr_status(enable);
    }

    pub fn tmmbr(&self) -> bool {
        self.rtcp.tmmbr()
    }

    /// Ask the remote sender to stay below `bitrate_kbps`
    pub fn request_tmmbr(&self, bitrate_kbps: u32) -> TransportResult<()> {
        let overhead = self.sender.transport_overhead() + crate::rtp_handler::RtpHeader::MIN_SIZE as u16;
        self.rtcp.request_tmmbr(bitrate_kbps, overhead)?;
        self.send_rtcp(RtcpPacketMask::TMMBR)
    }

    pub fn tmmbr_bounding_set(&self) -> Vec<TmmbItem> {
        self.rtcp.tmmbr_bounding_set()
    }

    /// Bounding set the remote end announced in its last TMMBN
    pub fn received_tmmbn(&self) -> Vec<TmmbItem> {
        self.rtcp.received_bounding_set()
    }

    pub fn current_send_bitrate_bps(&self) -> u32 {
        lock(&self.bandwidth).bitrate_bps()
    }

    pub fn max_configured_bitrate_kbps(&self) -> TransportResult<u32> {
        lock(&self.bandwidth).max_configured_bitrate_kbps()
    }

    // Default module and synchronization

    fn default_module(&self) -> Option<Arc<RtpSession>> {
        self.relations()
            .default_module
            .as_ref()
            .and_then(|(_, weak)| weak.upgrade())
    }

    /// Route key-frame requests and loss feedback through `default`
    pub fn register_default_module(&self, default: &Arc<RtpSession>) -> TransportResult<()> {
        if default.id == self.id {
            return Err(TransportError::ConfigError(
                "a session cannot be its own default module".to_string(),
            ));
        }
        {
            let mut relations = self.relations();
            if relations
                .default_module
                .as_ref()
                .is_some_and(|(_, weak)| weak.strong_count() > 0)
            {
                return Err(TransportError::AlreadyRegistered("default module".to_string()));
            }
            relations.default_module = Some((default.id, Arc::downgrade(default)));
        }
        default
            .relations()
            .children
            .insert(self.id, self.self_ref.clone());
        debug!(session = %self.id, default = %default.id, "Registered default module");
        Ok(())
    }

    pub fn deregister_default_module(&self) -> TransportResult<()> {
        let previous = self.relations().default_module.take();
        if let Some((id, weak)) = previous {
            if let Some(default) = weak.upgrade() {
                default.relations().children.remove(&self.id);
            }
            debug!(session = %self.id, default = %id, "Deregistered default module");
        }
        Ok(())
    }

    /// Sessions using this one as their default module
    pub fn child_count(&self) -> usize {
        self.relations()
            .children
            .values()
            .filter(|child| child.strong_count() > 0)
            .count()
    }

    /// Pair an audio and a video session for lip sync
    pub fn register_sync_module(&self, other: &Arc<RtpSession>) -> TransportResult<()> {
        if other.audio == self.audio {
            return Err(TransportError::ConfigError(
                "lip sync pairs an audio with a video session".to_string(),
            ));
        }
        self.relations().sync_module = Some(Arc::downgrade(other));
        Ok(())
    }

    pub fn deregister_sync_module(&self) {
        self.relations().sync_module = None;
    }

    /// Arrival minus capture time of the last received packet, in ms
    fn transit_delay_ms(&self) -> Option<i64> {
        let sender = self.rtcp.remote_sender_info().ok()?;
        let last = self.receiver.last_received()?;
        let khz = i64::from(last.frequency_hz / 1000);
        if khz == 0 {
            return None;
        }
        let report_ms = NtpTime::new(sender.info.ntp_seconds, sender.info.ntp_fraction).to_unix_ms();
        let capture_ms = report_ms + timestamp_diff(last.timestamp, sender.info.rtp_timestamp) / khz;
        Some(last.arrival_ms - capture_ms)
    }

    fn update_lip_sync(&self, feedback: Option<&dyn RtcpFeedback>) {
        let Some(feedback) = feedback else {
            return;
        };
        let other = self.relations().sync_module.as_ref().and_then(Weak::upgrade);
        let Some(other) = other else {
            return;
        };
        if let (Some(own), Some(theirs)) = (self.transit_delay_ms(), other.transit_delay_ms()) {
            let offset_ms = (own - theirs).clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
            trace!(session = %self.id, offset_ms, "Lip sync offset");
            feedback.on_lip_sync_update(offset_ms);
        }
    }

    pub(crate) fn set_simulcast_index(&self, index: u8) {
        self.session_state().simulcast_index = index;
    }

    fn process_timeouts(&self, now_ms: i64) {
        let (packet_timeout_ms, rtcp_timeout_ms, dead_or_alive_due) = {
            let mut state = self.session_state();
            let due = match state.dead_or_alive_interval_ms {
                Some(interval) if now_ms >= state.next_dead_or_alive_ms => {
                    state.next_dead_or_alive_ms = now_ms + interval;
                    true
                }
                _ => false,
            };
            (state.packet_timeout_ms, state.rtcp_timeout_ms, due)
        };

        let rtp_feedback = self.callbacks().rtp_feedback.get();
        if self.receiver.check_packet_timeout(packet_timeout_ms, now_ms) {
            debug!(session = %self.id, "RTP packet timeout");
            if let Some(feedback) = &rtp_feedback {
                feedback.on_packet_timeout();
            }
        }
        if dead_or_alive_due {
            let alive = self.receiver.dead_or_alive();
            if alive == AliveState::Dead {
                debug!(session = %self.id, "Remote end dead");
            }
            if let Some(feedback) = &rtp_feedback {
                feedback.on_periodic_dead_or_alive(alive);
            }
        }
        if self.rtcp.check_rtcp_timeout(rtcp_timeout_ms) {
            debug!(session = %self.id, "RTCP packet timeout");
            let feedback = self.callbacks().rtcp_feedback.get();
            if let Some(feedback) = feedback {
                feedback.on_rtcp_packet_timeout();
            }
        }
    }
}

impl Module for RtpSession {
    fn time_until_next_process(&self) -> i64 {
        let now_ms = self.clock.now_ms();
        let last = self.session_state().last_process_ms;
        let mut wait = last + self.process_interval_ms - now_ms;
        if let Some(next_report) = self.rtcp.next_report_time_ms() {
            wait = wait.min(next_report - now_ms);
        }
        if self.sending() {
            if let Some(keepalive) = self.sender.time_until_keepalive(now_ms) {
                wait = wait.min(keepalive);
            }
        }
        wait
    }

    fn process(&self) -> TransportResult<()> {
        let now_ms = self.clock.now_ms();
        self.session_state().last_process_ms = now_ms;

        if self.rtcp.mode() != RtcpMode::Off {
            let nack_list = if self.receiver.nack_enabled() {
                self.receiver.nack_list(now_ms, self.rtcp.last_rtt_ms())
            } else {
                Vec::new()
            };
            let mut mask = RtcpPacketMask::NONE;
            if self.rtcp.time_to_send_rtcp_report() {
                mask |= RtcpPacketMask::REPORT | self.rtcp.pending_sections();
            }
            if !nack_list.is_empty() {
                mask |= RtcpPacketMask::NACK;
            }
            if !mask.is_empty() {
                let context = RtcpContext {
                    nack_list,
                    ..self.rtcp_context(mask)
                };
                if let Err(e) = self.send_rtcp_with(mask, context) {
                    debug!(session = %self.id, error = %e, "Periodic RTCP failed");
                }
            }
        }

        if self.history.has_pending_resends() {
            self.resend_pending(now_ms);
        }
        self.process_timeouts(now_ms);

        if self.sending() {
            if let Some(keepalive) = self.sender.keepalive_due(now_ms) {
                if let Err(e) = self.send_rtp_bytes(&keepalive.data) {
                    debug!(session = %self.id, error = %e, "Keepalive failed");
                }
            }
        }
        Ok(())
    }
}

impl RtpModule for RtpSession {
    fn ssrc(&self) -> u32 {
        self.sender.ssrc()
    }

    fn sending(&self) -> bool {
        RtpSession::sending(self)
    }

    fn remote_ssrc(&self) -> Option<u32> {
        self.receiver.remote_ssrc()
    }

    fn set_remb_data(&self, bitrate_bps: u32, ssrcs: &[u32]) -> TransportResult<()> {
        self.rtcp.set_remb_data(bitrate_bps, ssrcs)?;
        self.send_rtcp(RtcpPacketMask::REMB)
    }

    fn bitrate_sent(&self) -> u32 {
        self.sender.bitrate_sent(self.clock.now_ms()).total_bps
    }

    fn set_send_bitrate(&self, start_bps: u32, min_kbps: u32, max_kbps: u32) -> TransportResult<()> {
        let to_kbps = |kbps: u32| {
            u16::try_from(kbps).map_err(|_| {
                TransportError::ConfigError(format!("bitrate {} kbps out of range", kbps))
            })
        };
        lock(&self.bandwidth).set_send_bitrate(start_bps, to_kbps(min_kbps)?, to_kbps(max_kbps)?)
    }
}

impl Drop for RtpSession {
    fn drop(&mut self) {
        let closed = self.session_state().closed;
        if !closed {
            trace!(session = %self.id, "RTP session dropped without close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use crate::rtcp::{serialize_compound, Nack, Pli, RtcpPacket, SenderInfo, SenderReport};
    use crate::rtp_handler::{RtpHeader, RtpPacket};
    use bytes::Bytes;

    #[derive(Default)]
    struct CapturingTransport {
        rtp: Mutex<Vec<Vec<u8>>>,
        rtcp: Mutex<Vec<Vec<u8>>>,
    }

    impl CapturingTransport {
        fn rtp(&self) -> Vec<Vec<u8>> {
            self.rtp.lock().unwrap().clone()
        }

        fn rtcp(&self) -> Vec<Vec<RtcpPacket>> {
            self.rtcp
                .lock()
                .unwrap()
                .iter()
                .map(|p| parse_compound(p).unwrap())
                .collect()
        }
    }

    impl Transport for CapturingTransport {
        fn send_rtp(&self, packet: &[u8]) -> bool {
            self.rtp.lock().unwrap().push(packet.to_vec());
            true
        }

        fn send_rtcp(&self, packet: &[u8]) -> bool {
            self.rtcp.lock().unwrap().push(packet.to_vec());
            true
        }
    }

    #[derive(Default)]
    struct Recorder {
        intra: Mutex<Vec<(IntraRequestKind, u8)>>,
        payloads: Mutex<Vec<Vec<u8>>>,
        ssrc_changes: Mutex<Vec<u32>>,
        timeouts: Mutex<u32>,
        alive: Mutex<Vec<AliveState>>,
        lip_sync: Mutex<Vec<i32>>,
    }

    impl VideoFeedback for Recorder {
        fn on_received_intra_frame_request(&self, kind: IntraRequestKind, stream_idx: u8) {
            self.intra.lock().unwrap().push((kind, stream_idx));
        }
    }

    impl RtpData for Recorder {
        fn on_received_payload_data(&self, payload: &[u8], _info: &crate::callbacks::RtpHeaderInfo) {
            self.payloads.lock().unwrap().push(payload.to_vec());
        }
    }

    impl RtpFeedback for Recorder {
        fn on_incoming_ssrc_changed(&self, ssrc: u32) {
            self.ssrc_changes.lock().unwrap().push(ssrc);
        }

        fn on_packet_timeout(&self) {
            *self.timeouts.lock().unwrap() += 1;
        }

        fn on_periodic_dead_or_alive(&self, state: AliveState) {
            self.alive.lock().unwrap().push(state);
        }
    }

    impl RtcpFeedback for Recorder {
        fn on_lip_sync_update(&self, offset_ms: i32) {
            self.lip_sync.lock().unwrap().push(offset_ms);
        }
    }

    fn session(clock: &Arc<SimulatedClock>, audio: bool, seed: u64) -> (Arc<RtpSession>, Arc<CapturingTransport>) {
        let session = RtpSession::new(SessionOptions::new(audio, clock.clone()).with_seed(seed));
        let transport = Arc::new(CapturingTransport::default());
        let dyn_transport: Arc<dyn Transport> = transport.clone();
        session.register_transport(&dyn_transport).unwrap();
        (session, transport)
    }

    fn video_session(clock: &Arc<SimulatedClock>) -> (Arc<RtpSession>, Arc<CapturingTransport>) {
        let (session, transport) = session(clock, false, 11);
        session.register_send_payload(PayloadSpec::video(100, "VP8")).unwrap();
        session.register_receive_payload(PayloadSpec::video(100, "VP8")).unwrap();
        session.set_rtcp_status(RtcpMode::Compound);
        session.set_cname("video@test").unwrap();
        (session, transport)
    }

    fn rtp(pt: u8, seq: u16, ts: u32, ssrc: u32, payload: &[u8]) -> Vec<u8> {
        RtpPacket {
            header: RtpHeader::new(pt, seq, ts, ssrc),
            payload: Bytes::copy_from_slice(payload),
            padding_len: 0,
        }
        .serialize()
        .to_vec()
    }

    fn rtcp(packets: &[RtcpPacket]) -> Vec<u8> {
        serialize_compound(packets).unwrap().to_vec()
    }

    #[test]
    fn test_send_requires_transport() {
        let clock = Arc::new(SimulatedClock::new(1000));
        let session = RtpSession::new(SessionOptions::new(false, clock));
        session.register_send_payload(PayloadSpec::video(100, "VP8")).unwrap();
        assert!(matches!(
            session.send_outgoing_data(FrameType::KeyFrame, 100, 0, b"x", None),
            Err(TransportError::NotRegistered(_))
        ));
    }

    #[test]
    fn test_sent_packets_reach_transport_and_history() {
        let clock = Arc::new(SimulatedClock::new(1000));
        let (session, transport) = video_session(&clock);
        session.set_store_packets_status(true, 100).unwrap();
        session
            .send_outgoing_data(FrameType::KeyFrame, 100, 0, b"frame", None)
            .unwrap();
        assert_eq!(transport.rtp().len(), 1);
        assert_eq!(session.retransmission_stats().stored_packets, 1);
        assert_eq!(session.send_data_counters().packets, 1);
    }

    #[test]
    fn test_nack_triggers_single_resend() {
        let clock = Arc::new(SimulatedClock::new(1000));
        let (session, transport) = video_session(&clock);
        session.set_store_packets_status(true, 100).unwrap();
        session.set_sequence_number(500);
        session
            .send_outgoing_data(FrameType::KeyFrame, 100, 0, b"frame", None)
            .unwrap();
        let sent = transport.rtp()[0].clone();

        // Learn the remote SSRC so the NACK is addressed to us
        session.incoming_packet(&rtp(100, 1, 0, 0xBEEF, b"x")).unwrap();
        let nack = rtcp(&[RtcpPacket::Nack(Nack {
            sender_ssrc: 0xBEEF,
            media_ssrc: session.ssrc(),
            lost: vec![500],
        })]);
        session.incoming_packet(&nack).unwrap();
        session.incoming_packet(&nack).unwrap();

        let rtp_packets = transport.rtp();
        assert_eq!(rtp_packets.len(), 2);
        assert_eq!(rtp_packets[1], sent);
        assert_eq!(session.bitrate_sent_detail().nack_bps, sent.len() as u32 * 8);
    }

    #[test]
    fn test_stopping_sends_bye() {
        let clock = Arc::new(SimulatedClock::new(1000));
        let (session, transport) = video_session(&clock);
        session.set_sending_status(true).unwrap();
        session.set_sending_status(true).unwrap();
        assert!(transport.rtcp().is_empty());
        session.set_sending_status(false).unwrap();
        let sent = transport.rtcp();
        assert_eq!(sent.len(), 1);
        assert!(sent[0]
            .iter()
            .any(|p| matches!(p, RtcpPacket::Goodbye(bye) if bye.ssrcs.contains(&session.ssrc()))));
    }

    #[test]
    fn test_restart_regenerates_ssrc_unless_fixed() {
        let clock = Arc::new(SimulatedClock::new(1000));
        let (session, _transport) = video_session(&clock);
        session.set_sending_status(true).unwrap();
        let first = session.ssrc();
        session.set_sending_status(false).unwrap();
        session.set_sending_status(true).unwrap();
        assert_ne!(session.ssrc(), first);

        session.set_ssrc(1234);
        session.set_sending_status(false).unwrap();
        session.set_sending_status(true).unwrap();
        assert_eq!(session.ssrc(), 1234);
    }

    #[test]
    fn test_incoming_media_delivered_and_ssrc_change_reported() {
        let clock = Arc::new(SimulatedClock::new(1000));
        let (session, _transport) = video_session(&clock);
        let recorder = Arc::new(Recorder::default());
        let data: Arc<dyn RtpData> = recorder.clone();
        let feedback: Arc<dyn RtpFeedback> = recorder.clone();
        session.register_incoming_data_callback(&data).unwrap();
        session.register_rtp_feedback(&feedback).unwrap();
        assert!(matches!(
            session.register_rtp_feedback(&feedback),
            Err(TransportError::AlreadyRegistered(_))
        ));

        session.incoming_packet(&rtp(100, 1, 0, 7, b"one")).unwrap();
        session.incoming_packet(&rtp(100, 1, 0, 8, b"two")).unwrap();
        assert_eq!(*recorder.payloads.lock().unwrap(), vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(*recorder.ssrc_changes.lock().unwrap(), vec![8]);
        assert_eq!(session.remote_ssrc(), Some(8));
    }

    #[test]
    fn test_pli_reaches_video_feedback() {
        let clock = Arc::new(SimulatedClock::new(1000));
        let (session, _transport) = video_session(&clock);
        let recorder = Arc::new(Recorder::default());
        let feedback: Arc<dyn VideoFeedback> = recorder.clone();
        session.register_video_feedback(&feedback).unwrap();

        session
            .incoming_packet(&rtcp(&[RtcpPacket::Pli(Pli {
                sender_ssrc: 9,
                media_ssrc: session.ssrc(),
            })]))
            .unwrap();
        assert_eq!(*recorder.intra.lock().unwrap(), vec![(IntraRequestKind::Pli, 0)]);

        // FIR over RTP arrives on the media path
        session
            .incoming_packet(&[0x80, 192, 0, 1, 0, 0, 0, 9])
            .unwrap();
        assert_eq!(recorder.intra.lock().unwrap()[1].0, IntraRequestKind::FirOverRtp);
    }

    #[test]
    fn test_key_frame_request_methods() {
        let clock = Arc::new(SimulatedClock::new(1000));
        let (session, transport) = video_session(&clock);
        session.incoming_packet(&rtp(100, 1, 0, 0xBEEF, b"x")).unwrap();

        session.request_key_frame().unwrap();
        assert!(transport.rtcp()[0]
            .iter()
            .any(|p| matches!(p, RtcpPacket::Pli(pli) if pli.media_ssrc == 0xBEEF)));

        session.set_key_frame_request_method(KeyFrameRequestMethod::FirRtcp);
        session.request_key_frame().unwrap();
        assert!(transport.rtcp()[1].iter().any(|p| matches!(p, RtcpPacket::Fir(_))));

        session.set_key_frame_request_method(KeyFrameRequestMethod::FirRtp);
        session.request_key_frame().unwrap();
        let fir = transport.rtp().pop().unwrap();
        assert!(is_fir_over_rtp(&fir));
    }

    #[test]
    fn test_default_module_receives_child_feedback() {
        let clock = Arc::new(SimulatedClock::new(1000));
        let (parent, _) = video_session(&clock);
        let (child, _) = session(&clock, false, 12);
        child.set_rtcp_status(RtcpMode::Compound);
        child.set_simulcast_index(1);

        let recorder = Arc::new(Recorder::default());
        let feedback: Arc<dyn VideoFeedback> = recorder.clone();
        parent.register_video_feedback(&feedback).unwrap();
        child.register_default_module(&parent).unwrap();
        assert!(child.register_default_module(&parent).is_err());
        assert_eq!(parent.child_count(), 1);

        child
            .incoming_packet(&rtcp(&[RtcpPacket::Pli(Pli {
                sender_ssrc: 9,
                media_ssrc: child.ssrc(),
            })]))
            .unwrap();
        assert_eq!(*recorder.intra.lock().unwrap(), vec![(IntraRequestKind::Pli, 1)]);

        assert!(matches!(parent.close(), Err(TransportError::InvalidState { .. })));
        child.deregister_default_module().unwrap();
        assert_eq!(parent.child_count(), 0);
        parent.close().unwrap();
    }

    #[test]
    fn test_process_sends_periodic_report_with_sdes() {
        let clock = Arc::new(SimulatedClock::new(1000));
        let (session, transport) = video_session(&clock);
        session.process().unwrap();
        let sent = transport.rtcp();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0][0], RtcpPacket::ReceiverReport(_)));
        assert!(matches!(sent[0][1], RtcpPacket::SourceDescription(_)));

        // Next report is at least half an interval away
        session.process().unwrap();
        assert_eq!(transport.rtcp().len(), 1);
        assert!(session.time_until_next_process() <= 5);
    }

    #[test]
    fn test_sender_report_while_sending() {
        let clock = Arc::new(SimulatedClock::new(1000));
        let (session, transport) = video_session(&clock);
        session.set_sending_status(true).unwrap();
        session
            .send_outgoing_data(FrameType::KeyFrame, 100, 0, &[0u8; 100], None)
            .unwrap();
        session.send_rtcp(RtcpPacketMask::REPORT).unwrap();
        match &transport.rtcp()[0][0] {
            RtcpPacket::SenderReport(sr) => {
                assert_eq!(sr.ssrc, session.ssrc());
                assert_eq!(sr.sender_info.packet_count, 1);
                assert_eq!(sr.sender_info.octet_count, 100);
            }
            other => panic!("expected SR, got {:?}", other),
        }
    }

    #[test]
    fn test_packet_timeout_and_dead_or_alive() {
        let clock = Arc::new(SimulatedClock::new(1000));
        let (session, _transport) = video_session(&clock);
        session.set_rtcp_status(RtcpMode::Off);
        let recorder = Arc::new(Recorder::default());
        let feedback: Arc<dyn RtpFeedback> = recorder.clone();
        session.register_rtp_feedback(&feedback).unwrap();
        session.set_packet_timeout(500, 0);
        session.set_periodic_dead_or_alive_status(true, 1).unwrap();

        session.incoming_packet(&rtp(100, 1, 0, 7, b"x")).unwrap();
        clock.advance_ms(1000);
        session.process().unwrap();
        session.process().unwrap();
        assert_eq!(*recorder.timeouts.lock().unwrap(), 1);
        assert_eq!(*recorder.alive.lock().unwrap(), vec![AliveState::Alive]);

        clock.advance_ms(1000);
        session.process().unwrap();
        assert_eq!(
            *recorder.alive.lock().unwrap(),
            vec![AliveState::Alive, AliveState::Dead]
        );
        assert!(session.set_periodic_dead_or_alive_status(true, 0).is_err());
    }

    #[test]
    fn test_keepalive_sent_while_idle() {
        let clock = Arc::new(SimulatedClock::new(1000));
        let (session, transport) = video_session(&clock);
        session.set_rtcp_status(RtcpMode::Off);
        assert!(session.set_keepalive_status(true, 100, 500).is_err());
        session.set_keepalive_status(true, 20, 500).unwrap();
        session.set_sending_status(true).unwrap();

        session.process().unwrap();
        assert_eq!(transport.rtp().len(), 1);
        clock.advance_ms(200);
        session.process().unwrap();
        assert_eq!(transport.rtp().len(), 1);
        clock.advance_ms(400);
        session.process().unwrap();
        assert_eq!(transport.rtp().len(), 2);
        assert_eq!(transport.rtp()[1][1] & 0x7F, 20);
    }

    #[test]
    fn test_lip_sync_offset_from_sender_reports() {
        let clock = Arc::new(SimulatedClock::new(10_000));
        let (video, _) = video_session(&clock);
        let (audio, _) = session(&clock, true, 13);
        audio.set_rtcp_status(RtcpMode::Compound);
        audio
            .register_receive_payload(PayloadSpec::audio(0, "PCMU", 8000, 1))
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        let feedback: Arc<dyn RtcpFeedback> = recorder.clone();
        video.register_rtcp_feedback(&feedback).unwrap();
        video.register_sync_module(&audio).unwrap();
        assert!(video.register_sync_module(&video).is_err());

        let sender_report = |ssrc: u32, capture_ms: i64, rtp_timestamp: u32| {
            let ntp = NtpTime::from_unix_ms(capture_ms);
            rtcp(&[RtcpPacket::SenderReport(SenderReport {
                ssrc,
                sender_info: SenderInfo {
                    ntp_seconds: ntp.seconds,
                    ntp_fraction: ntp.fraction,
                    rtp_timestamp,
                    packet_count: 1,
                    octet_count: 1,
                },
                report_blocks: Vec::new(),
            })])
        };

        audio.incoming_packet(&rtp(0, 1, 8000, 0xA, &[0u8; 160])).unwrap();
        audio.incoming_packet(&sender_report(0xA, 5000, 8000)).unwrap();
        video.incoming_packet(&rtp(100, 1, 90_000, 0xB, b"frame")).unwrap();
        video.incoming_packet(&sender_report(0xB, 4900, 90_000)).unwrap();

        assert_eq!(*recorder.lip_sync.lock().unwrap(), vec![100]);
    }

    #[test]
    fn test_send_bitrate_bounds_checked() {
        let clock = Arc::new(SimulatedClock::new(0));
        let (session, _) = video_session(&clock);
        assert!(session.max_configured_bitrate_kbps().is_err());
        RtpModule::set_send_bitrate(session.as_ref(), 300_000, 30, 2000).unwrap();
        assert_eq!(session.max_configured_bitrate_kbps().unwrap(), 2000);
        assert!(RtpModule::set_send_bitrate(session.as_ref(), 300_000, 30, 70_000).is_err());
    }
}
