//! RTCP report engine
//!
//! Builds outgoing compound RTCP from the session's state and digests
//! incoming RTCP into report-block, round-trip and feedback information.
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


use crate::clock::{compact_ntp_to_ms, ms_to_compact_ntp, Clock, NtpTime};
use crate::error::{TransportError, TransportResult};
use crate::rtcp::{
    serialize_compound, ApplicationData, ExtendedReport, Fir, FirEntry, Goodbye, Nack, Pli,
    ReceiverReport, Remb, ReportBlock, Rpsi, RtcpPacket, SdesChunk, SenderInfo, SenderReport,
    Sli, Tmmb, TmmbItem, VoipMetric, MAX_CNAME_LEN, MAX_REPORT_BLOCKS,
};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rtcstack_config::RtpConfig;
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::{BitOr, BitOrAssign};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

/// Received FIRs closer together than one frame are duplicates
const MIN_FRAME_LENGTH_MS: i64 = 17;

/// Received TMMBR candidates expire after this many report intervals
const TMMBR_TIMEOUT_INTERVALS: i64 = 5;

/// How RTCP is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpMode {
    /// No RTCP at all, and no round-trip measurement
    Off,
    /// Every packet is a compound packet led by SR/RR and SDES
    Compound,
    /// Feedback may be sent without a leading report
    NonCompound,
}

/// Set of RTCP sections, used both to request sections and to describe received ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RtcpPacketMask(u32);

impl RtcpPacketMask {
    pub const NONE: Self = Self(0);
    /// SR or RR, whichever applies
    pub const REPORT: Self = Self(0x0001);
    pub const SR: Self = Self(0x0002);
    pub const RR: Self = Self(0x0004);
    pub const BYE: Self = Self(0x0008);
    pub const PLI: Self = Self(0x0010);
    pub const NACK: Self = Self(0x0020);
    pub const FIR: Self = Self(0x0040);
    pub const TMMBR: Self = Self(0x0080);
    pub const TMMBN: Self = Self(0x0100);
    pub const SR_REQ: Self = Self(0x0200);
    pub const XR_VOIP_METRIC: Self = Self(0x0400);
    pub const APP: Self = Self(0x0800);
    pub const SLI: Self = Self(0x4000);
    pub const RPSI: Self = Self(0x8000);
    pub const REMB: Self = Self(0x1_0000);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for RtcpPacketMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for RtcpPacketMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Relationship with the remote end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    NoPeer,
    /// Something was received from the remote end
    PeerKnown,
    /// A round trip has been measured
    Active,
}

/// Round-trip statistics for one remote SSRC, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RttStats {
    pub last_ms: i64,
    pub avg_ms: i64,
    pub min_ms: i64,
    pub max_ms: i64,
}

/// Latest report block received from one remote SSRC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteReportBlock {
    /// SSRC of the remote end that sent the report
    pub remote_ssrc: u32,
    pub block: ReportBlock,
    pub max_jitter: u32,
    pub rtt: RttStats,
    rtt_samples: u32,
}

/// Sender-side counters for the SR sender-info section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SenderStats {
    /// RTP timestamp corresponding to the SR's NTP time
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

/// Inputs the session gathers before building RTCP
#[derive(Debug, Clone, Default)]
pub struct RtcpContext {
    /// Present while media is being sent
    pub sender_stats: Option<SenderStats>,
    /// Reception report for the remote SSRC, LSR/DLSR are filled in here
    pub receive_block: Option<ReportBlock>,
    pub nack_list: Vec<u16>,
    pub slice_loss_picture_id: Option<u8>,
    /// Payload type and picture id for RPSI
    pub reference_picture: Option<(u8, u64)>,
}

/// Remote sender report, as last received
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteSenderInfo {
    pub ssrc: u32,
    pub info: SenderInfo,
    /// Local NTP time the report arrived
    pub received_ntp: NtpTime,
    received_ms: i64,
}

/// Digest of one incoming compound packet, acted on by the session outside any lock
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RtcpPacketInformation {
    pub flags: RtcpPacketMask,
    pub remote_ssrc: Option<u32>,
    pub fraction_lost: Option<u8>,
    pub rtt_ms: Option<i64>,
    pub extended_highest_sequence: Option<u32>,
    pub jitter: Option<u32>,
    pub nack_sequence_numbers: Vec<u16>,
    pub sli_picture_id: Option<u8>,
    pub rpsi_picture_id: Option<u64>,
    pub remb_bitrate_bps: Option<u32>,
    pub application: Option<ApplicationData>,
    pub voip_metric: Option<VoipMetric>,
    pub goodbye_ssrcs: Vec<u32>,
}

#[derive(Debug, Clone)]
struct TmmbrCandidate {
    item: TmmbItem,
    received_ms: i64,
}

struct RtcpState {
    mode: RtcpMode,
    sending: bool,
    ssrc: u32,
    remote_ssrc: Option<u32>,
    cname: String,
    mixed_cnames: BTreeMap<u32, String>,
    csrcs: Vec<u32>,
    include_csrcs: bool,
    external_report_blocks: BTreeMap<u32, ReportBlock>,
    next_time_to_send_ms: i64,
    last_sr_sent: Option<(NtpTime, i64)>,
    rng: StdRng,

    fir_sequence_number: u8,
    remb_enabled: bool,
    remb_pending: Option<Remb>,
    tmmbr_enabled: bool,
    tmmbr_request: Option<TmmbItem>,
    tmmbn_pending: Option<Vec<TmmbItem>>,
    app_pending: Option<ApplicationData>,
    voip_metric: Option<VoipMetric>,

    peer_state: PeerState,
    last_received_ms: Option<i64>,
    timeout_reported: bool,
    remote_sender: Option<RemoteSenderInfo>,
    report_blocks: BTreeMap<u32, RemoteReportBlock>,
    received_cnames: BTreeMap<u32, String>,
    tmmbr_candidates: BTreeMap<u32, TmmbrCandidate>,
    received_bounding_set: Vec<TmmbItem>,
    last_fir_received: BTreeMap<u32, (i64, u8)>,
}

/// RTCP sender and receiver state of one session
pub struct RtcpEngine {
    clock: Arc<dyn Clock>,
    report_interval_ms: i64,
    inner: Mutex<RtcpState>,
}

impl RtcpEngine {
    pub fn new(clock: Arc<dyn Clock>, audio: bool, config: &RtpConfig, ssrc: u32, seed: u64) -> Self {
        let report_interval_ms = if audio {
            i64::from(config.rtcp_interval_audio_ms)
        } else {
            i64::from(config.rtcp_interval_video_ms)
        };
        Self {
            clock,
            report_interval_ms,
            inner: Mutex::new(RtcpState {
                mode: RtcpMode::Off,
                sending: false,
                ssrc,
                remote_ssrc: None,
                cname: String::new(),
                mixed_cnames: BTreeMap::new(),
                csrcs: Vec::new(),
                include_csrcs: true,
                external_report_blocks: BTreeMap::new(),
                next_time_to_send_ms: 0,
                last_sr_sent: None,
                rng: StdRng::seed_from_u64(seed),
                fir_sequence_number: 0,
                remb_enabled: false,
                remb_pending: None,
                tmmbr_enabled: false,
                tmmbr_request: None,
                tmmbn_pending: None,
                app_pending: None,
                voip_metric: None,
                peer_state: PeerState::NoPeer,
                last_received_ms: None,
                timeout_reported: false,
                remote_sender: None,
                report_blocks: BTreeMap::new(),
                received_cnames: BTreeMap::new(),
                tmmbr_candidates: BTreeMap::new(),
                received_bounding_set: Vec::new(),
                last_fir_received: BTreeMap::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RtcpState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mode(&self) -> RtcpMode {
        self.state().mode
    }

    pub fn set_rtcp_status(&self, mode: RtcpMode) {
        let now_ms = self.clock.now_ms();
        let mut state = self.state();
        if state.mode == RtcpMode::Off && mode != RtcpMode::Off {
            // First report goes out on the next tick
            state.next_time_to_send_ms = now_ms;
        }
        state.mode = mode;
    }

    pub fn set_sending(&self, sending: bool) {
        self.state().sending = sending;
    }

    pub fn set_ssrc(&self, ssrc: u32) {
        let mut state = self.state();
        state.ssrc = ssrc;
        // Reports about the old SSRC are meaningless now
        state.report_blocks.clear();
    }

    pub fn set_remote_ssrc(&self, ssrc: u32) {
        let mut state = self.state();
        if state.remote_ssrc != Some(ssrc) {
            state.remote_sender = None;
        }
        state.remote_ssrc = Some(ssrc);
        if state.peer_state == PeerState::NoPeer {
            state.peer_state = PeerState::PeerKnown;
        }
    }

    pub fn remote_ssrc(&self) -> Option<u32> {
        self.state().remote_ssrc
    }

    pub fn peer_state(&self) -> PeerState {
        self.state().peer_state
    }

    pub fn cname(&self) -> String {
        self.state().cname.clone()
    }

    pub fn set_cname(&self, cname: &str) -> TransportResult<()> {
        check_cname(cname)?;
        self.state().cname = cname.to_string();
        Ok(())
    }

    /// CNAME of a contributing source, sent alongside ours in SDES
    pub fn add_mixed_cname(&self, ssrc: u32, cname: &str) -> TransportResult<()> {
        check_cname(cname)?;
        let mut state = self.state();
        if state.mixed_cnames.len() + 1 >= MAX_REPORT_BLOCKS {
            return Err(TransportError::ConfigError(
                "too many mixed CNAMEs".to_string(),
            ));
        }
        state.mixed_cnames.insert(ssrc, cname.to_string());
        Ok(())
    }

    pub fn remove_mixed_cname(&self, ssrc: u32) -> TransportResult<()> {
        self.state()
            .mixed_cnames
            .remove(&ssrc)
            .map(|_| ())
            .ok_or(TransportError::SsrcNotFound { ssrc })
    }

    /// CNAME announced by a remote source
    pub fn remote_cname(&self, ssrc: u32) -> TransportResult<String> {
        self.state()
            .received_cnames
            .get(&ssrc)
            .cloned()
            .ok_or(TransportError::SsrcNotFound { ssrc })
    }

    pub fn set_csrcs(&self, csrcs: &[u32]) {
        self.state().csrcs = csrcs.to_vec();
    }

    pub fn set_csrc_status(&self, include: bool) {
        self.state().include_csrcs = include;
    }

    /// Report block relayed on behalf of another source
    pub fn add_report_block(&self, ssrc: u32, block: ReportBlock) -> TransportResult<()> {
        let mut state = self.state();
        if !state.external_report_blocks.contains_key(&ssrc)
            && state.external_report_blocks.len() + 1 >= MAX_REPORT_BLOCKS
        {
            return Err(TransportError::ConfigError(
                "too many report blocks".to_string(),
            ));
        }
        state
            .external_report_blocks
            .insert(ssrc, ReportBlock { ssrc, ..block });
        Ok(())
    }

    pub fn remove_report_block(&self, ssrc: u32) -> TransportResult<()> {
        self.state()
            .external_report_blocks
            .remove(&ssrc)
            .map(|_| ())
            .ok_or(TransportError::SsrcNotFound { ssrc })
    }

    pub fn set_remb_status(&self, enable: bool) {
        let mut state = self.state();
        state.remb_enabled = enable;
        if !enable {
            state.remb_pending = None;
        }
    }

    pub fn remb(&self) -> bool {
        self.state().remb_enabled
    }

    /// Queue a REMB for the next RTCP packet
    pub fn set_remb_data(&self, bitrate_bps: u32, ssrcs: &[u32]) -> TransportResult<()> {
        let mut state = self.state();
        if !state.remb_enabled {
            return Err(TransportError::InvalidState {
                state: "REMB disabled".to_string(),
            });
        }
        state.remb_pending = Some(Remb {
            sender_ssrc: state.ssrc,
            bitrate_bps: u64::from(bitrate_bps),
            ssrcs: ssrcs.to_vec(),
        });
        Ok(())
    }

    pub fn set_tmmbr_status(&self, enable: bool) {
        let mut state = self.state();
        state.tmmbr_enabled = enable;
        if !enable {
            state.tmmbr_request = None;
            state.tmmbr_candidates.clear();
        }
    }

    pub fn tmmbr(&self) -> bool {
        self.state().tmmbr_enabled
    }

    /// Ask the remote sender to stay below `bitrate_kbps`
    pub fn request_tmmbr(&self, bitrate_kbps: u32, packet_overhead: u16) -> TransportResult<()> {
        let mut state = self.state();
        if !state.tmmbr_enabled {
            return Err(TransportError::InvalidState {
                state: "TMMBR disabled".to_string(),
            });
        }
        let Some(remote_ssrc) = state.remote_ssrc else {
            return Err(TransportError::NotAvailable("remote SSRC".to_string()));
        };
        state.tmmbr_request = Some(TmmbItem {
            ssrc: remote_ssrc,
            bitrate_bps: u64::from(bitrate_kbps) * 1000,
            packet_overhead,
        });
        Ok(())
    }

    /// Queue application-defined data; the payload must be whole 32-bit words
    pub fn set_application_specific_data(
        &self,
        subtype: u8,
        name: [u8; 4],
        data: &[u8],
    ) -> TransportResult<()> {
        if subtype > 31 {
            return Err(TransportError::ConfigError(format!(
                "APP subtype {} does not fit in 5 bits",
                subtype
            )));
        }
        if data.len() % 4 != 0 {
            return Err(TransportError::ConfigError(format!(
                "APP data length {} is not a multiple of 4",
                data.len()
            )));
        }
        let mut state = self.state();
        if state.mode == RtcpMode::Off {
            return Err(TransportError::RtcpOff);
        }
        state.app_pending = Some(ApplicationData {
            subtype,
            ssrc: state.ssrc,
            name,
            data: Bytes::copy_from_slice(data),
        });
        Ok(())
    }

    pub fn set_voip_metrics(&self, metric: VoipMetric) -> TransportResult<()> {
        let mut state = self.state();
        if state.mode == RtcpMode::Off {
            return Err(TransportError::RtcpOff);
        }
        state.voip_metric = Some(metric);
        Ok(())
    }

    /// Whether the periodic report is due
    pub fn time_to_send_rtcp_report(&self) -> bool {
        let state = self.state();
        state.mode != RtcpMode::Off && self.clock.now_ms() >= state.next_time_to_send_ms
    }

    pub fn next_report_time_ms(&self) -> Option<i64> {
        let state = self.state();
        (state.mode != RtcpMode::Off).then_some(state.next_time_to_send_ms)
    }

    /// Sections that should ride along with the next periodic report
    pub fn pending_sections(&self) -> RtcpPacketMask {
        let state = self.state();
        let mut mask = RtcpPacketMask::NONE;
        if state.remb_pending.is_some() {
            mask |= RtcpPacketMask::REMB;
        }
        if state.tmmbr_request.is_some() {
            mask |= RtcpPacketMask::TMMBR;
        }
        if state.tmmbn_pending.is_some() {
            mask |= RtcpPacketMask::TMMBN;
        }
        if state.app_pending.is_some() {
            mask |= RtcpPacketMask::APP;
        }
        if state.voip_metric.is_some() {
            mask |= RtcpPacketMask::XR_VOIP_METRIC;
        }
        mask
    }

    /// Build a compound packet holding the requested sections
    ///
    /// Sections that have nothing to carry are left out. Returns `None` when
    /// nothing at all could be built.
    pub fn build_rtcp(
        &self,
        mut mask: RtcpPacketMask,
        context: &RtcpContext,
    ) -> TransportResult<Option<Bytes>> {
        let now_ms = self.clock.now_ms();
        let now_ntp = self.clock.current_ntp();
        let mut state = self.state();

        match state.mode {
            RtcpMode::Off => return Err(TransportError::RtcpOff),
            RtcpMode::Compound => mask |= RtcpPacketMask::REPORT,
            RtcpMode::NonCompound => {}
        }

        let mut packets = Vec::new();
        let wants_report = mask.contains(RtcpPacketMask::REPORT)
            || mask.contains(RtcpPacketMask::SR)
            || mask.contains(RtcpPacketMask::RR);
        if wants_report {
            let blocks = report_blocks(&state, context, now_ms);
            match (state.sending, context.sender_stats) {
                (true, Some(stats)) => {
                    packets.push(RtcpPacket::SenderReport(SenderReport {
                        ssrc: state.ssrc,
                        sender_info: SenderInfo {
                            ntp_seconds: now_ntp.seconds,
                            ntp_fraction: now_ntp.fraction,
                            rtp_timestamp: stats.rtp_timestamp,
                            packet_count: stats.packet_count,
                            octet_count: stats.octet_count,
                        },
                        report_blocks: blocks,
                    }));
                    state.last_sr_sent = Some((now_ntp, now_ms));
                }
                _ => packets.push(RtcpPacket::ReceiverReport(ReceiverReport {
                    ssrc: state.ssrc,
                    report_blocks: blocks,
                })),
            }
            if !state.cname.is_empty() {
                let mut chunks = vec![SdesChunk {
                    ssrc: state.ssrc,
                    cname: state.cname.clone(),
                }];
                chunks.extend(state.mixed_cnames.iter().map(|(&ssrc, cname)| SdesChunk {
                    ssrc,
                    cname: cname.clone(),
                }));
                packets.push(RtcpPacket::SourceDescription(chunks));
            }

            let interval = state.rng.gen_range(0.5..1.5) * self.report_interval_ms as f64;
            state.next_time_to_send_ms = now_ms + interval as i64;
        }

        let sender_ssrc = state.ssrc;
        let media_ssrc = state.remote_ssrc;
        if let Some(media_ssrc) = media_ssrc {
            if mask.contains(RtcpPacketMask::PLI) {
                packets.push(RtcpPacket::Pli(Pli {
                    sender_ssrc,
                    media_ssrc,
                }));
            }
            if let (true, Some(picture_id)) = (
                mask.contains(RtcpPacketMask::SLI),
                context.slice_loss_picture_id,
            ) {
                packets.push(RtcpPacket::Sli(Sli {
                    sender_ssrc,
                    media_ssrc,
                    first: 0,
                    number: 0x1FFF,
                    picture_id: picture_id & 0x3F,
                }));
            }
            if let (true, Some((payload_type, picture_id))) = (
                mask.contains(RtcpPacketMask::RPSI),
                context.reference_picture,
            ) {
                packets.push(RtcpPacket::Rpsi(Rpsi {
                    sender_ssrc,
                    media_ssrc,
                    payload_type,
                    picture_id,
                }));
            }
            if mask.contains(RtcpPacketMask::FIR) {
                state.fir_sequence_number = state.fir_sequence_number.wrapping_add(1);
                packets.push(RtcpPacket::Fir(Fir {
                    sender_ssrc,
                    requests: vec![FirEntry {
                        ssrc: media_ssrc,
                        sequence_number: state.fir_sequence_number,
                    }],
                }));
            }
        }
        if mask.contains(RtcpPacketMask::REMB) {
            if let Some(remb) = state.remb_pending.take() {
                packets.push(RtcpPacket::Remb(Remb {
                    sender_ssrc,
                    ..remb
                }));
            }
        }
        if mask.contains(RtcpPacketMask::TMMBR) {
            if let Some(item) = state.tmmbr_request.take() {
                packets.push(RtcpPacket::Tmmbr(Tmmb {
                    sender_ssrc,
                    items: vec![item],
                }));
            }
        }
        if mask.contains(RtcpPacketMask::TMMBN) {
            if let Some(items) = state.tmmbn_pending.take() {
                packets.push(RtcpPacket::Tmmbn(Tmmb { sender_ssrc, items }));
            }
        }
        if let (true, Some(media_ssrc)) = (mask.contains(RtcpPacketMask::NACK), media_ssrc) {
            if !context.nack_list.is_empty() {
                packets.push(RtcpPacket::Nack(Nack {
                    sender_ssrc,
                    media_ssrc,
                    lost: context.nack_list.clone(),
                }));
            }
        }
        if mask.contains(RtcpPacketMask::APP) {
            if let Some(app) = state.app_pending.take() {
                packets.push(RtcpPacket::App(ApplicationData {
                    ssrc: sender_ssrc,
                    ..app
                }));
            }
        }
        if mask.contains(RtcpPacketMask::XR_VOIP_METRIC) {
            if let Some(voip_metric) = state.voip_metric.take() {
                packets.push(RtcpPacket::ExtendedReport(ExtendedReport {
                    sender_ssrc,
                    voip_metric,
                }));
            }
        }
        if mask.contains(RtcpPacketMask::BYE) {
            let mut ssrcs = vec![sender_ssrc];
            if state.include_csrcs {
                ssrcs.extend(state.csrcs.iter().copied());
            }
            packets.push(RtcpPacket::Goodbye(Goodbye {
                ssrcs,
                reason: None,
            }));
        }

        if packets.is_empty() {
            return Ok(None);
        }
        trace!(ssrc = sender_ssrc, sections = packets.len(), "Built RTCP");
        serialize_compound(&packets).map(Some)
    }

    /// Digest a parsed compound packet
    pub fn incoming_rtcp(&self, packets: &[RtcpPacket]) -> RtcpPacketInformation {
        let now_ms = self.clock.now_ms();
        let now_ntp = self.clock.current_ntp();
        let mut state = self.state();
        let mut info = RtcpPacketInformation::default();

        state.last_received_ms = Some(now_ms);
        state.timeout_reported = false;

        for packet in packets {
            match packet {
                RtcpPacket::SenderReport(sr) => {
                    info.remote_ssrc = Some(sr.ssrc);
                    if state.remote_ssrc == Some(sr.ssrc) {
                        info.flags |= RtcpPacketMask::SR;
                        state.remote_sender = Some(RemoteSenderInfo {
                            ssrc: sr.ssrc,
                            info: sr.sender_info,
                            received_ntp: now_ntp,
                            received_ms: now_ms,
                        });
                    } else {
                        info.flags |= RtcpPacketMask::RR;
                    }
                    mark_peer_known(&mut state);
                    handle_report_blocks(&mut state, sr.ssrc, &sr.report_blocks, now_ntp, &mut info);
                }
                RtcpPacket::ReceiverReport(rr) => {
                    info.remote_ssrc = Some(rr.ssrc);
                    info.flags |= RtcpPacketMask::RR;
                    mark_peer_known(&mut state);
                    handle_report_blocks(&mut state, rr.ssrc, &rr.report_blocks, now_ntp, &mut info);
                }
                RtcpPacket::SourceDescription(chunks) => {
                    for chunk in chunks {
                        state.received_cnames.insert(chunk.ssrc, chunk.cname.clone());
                    }
                }
                RtcpPacket::Goodbye(bye) => {
                    info.flags |= RtcpPacketMask::BYE;
                    for ssrc in &bye.ssrcs {
                        state.report_blocks.remove(ssrc);
                        state.received_cnames.remove(ssrc);
                        state.tmmbr_candidates.remove(ssrc);
                        if state.remote_sender.map(|s| s.ssrc) == Some(*ssrc) {
                            state.remote_sender = None;
                        }
                    }
                    info.goodbye_ssrcs.extend(bye.ssrcs.iter().copied());
                }
                RtcpPacket::App(app) => {
                    info.flags |= RtcpPacketMask::APP;
                    info.application = Some(app.clone());
                }
                RtcpPacket::Nack(nack) if nack.media_ssrc == state.ssrc => {
                    info.flags |= RtcpPacketMask::NACK;
                    info.nack_sequence_numbers.extend(nack.lost.iter().copied());
                }
                RtcpPacket::Pli(pli) if pli.media_ssrc == state.ssrc => {
                    info.flags |= RtcpPacketMask::PLI;
                }
                RtcpPacket::Sli(sli) if sli.media_ssrc == state.ssrc => {
                    info.flags |= RtcpPacketMask::SLI;
                    info.sli_picture_id = Some(sli.picture_id);
                }
                RtcpPacket::Rpsi(rpsi) if rpsi.media_ssrc == state.ssrc => {
                    info.flags |= RtcpPacketMask::RPSI;
                    info.rpsi_picture_id = Some(rpsi.picture_id);
                }
                RtcpPacket::Fir(fir) => {
                    let ssrc = state.ssrc;
                    for entry in fir.requests.iter().filter(|e| e.ssrc == ssrc) {
                        let fresh = match state.last_fir_received.get(&fir.sender_ssrc) {
                            Some(&(last_ms, last_seq)) => {
                                last_seq != entry.sequence_number
                                    && now_ms - last_ms > MIN_FRAME_LENGTH_MS
                            }
                            None => true,
                        };
                        if fresh {
                            state
                                .last_fir_received
                                .insert(fir.sender_ssrc, (now_ms, entry.sequence_number));
                            info.flags |= RtcpPacketMask::FIR;
                        }
                    }
                }
                RtcpPacket::Tmmbr(tmmbr) => {
                    let ssrc = state.ssrc;
                    for item in tmmbr
                        .items
                        .iter()
                        .filter(|i| i.ssrc == ssrc && i.bitrate_bps > 0)
                    {
                        state.tmmbr_candidates.insert(
                            tmmbr.sender_ssrc,
                            TmmbrCandidate {
                                item: TmmbItem {
                                    ssrc: tmmbr.sender_ssrc,
                                    ..*item
                                },
                                received_ms: now_ms,
                            },
                        );
                        info.flags |= RtcpPacketMask::TMMBR;
                    }
                }
                RtcpPacket::Tmmbn(tmmbn) => {
                    info.flags |= RtcpPacketMask::TMMBN;
                    state.received_bounding_set = tmmbn.items.clone();
                }
                RtcpPacket::Remb(remb) => {
                    info.flags |= RtcpPacketMask::REMB;
                    info.remb_bitrate_bps = Some(remb.bitrate_bps.min(u64::from(u32::MAX)) as u32);
                }
                RtcpPacket::ExtendedReport(xr) => {
                    info.flags |= RtcpPacketMask::XR_VOIP_METRIC;
                    info.voip_metric = Some(xr.voip_metric);
                }
                other => {
                    trace!(packet = ?other, "Ignoring RTCP feedback not addressed to us");
                }
            }
        }

        if info.flags.contains(RtcpPacketMask::TMMBR) && state.tmmbr_enabled {
            let bounding_set = bounding_set(&live_candidates(
                &mut state,
                now_ms,
                self.report_interval_ms,
            ));
            state.tmmbn_pending = Some(bounding_set);
        }
        info
    }

    /// Non-dominated set of the live received TMMBR requests
    pub fn tmmbr_bounding_set(&self) -> Vec<TmmbItem> {
        let now_ms = self.clock.now_ms();
        let mut state = self.state();
        bounding_set(&live_candidates(&mut state, now_ms, self.report_interval_ms))
    }

    /// Tightest bound among the live received TMMBR requests, in kbps
    pub fn tmmbr_bound_kbps(&self) -> Option<u32> {
        self.tmmbr_bounding_set()
            .iter()
            .map(|item| (item.bitrate_bps / 1000).min(u64::from(u32::MAX)) as u32)
            .min()
    }

    /// Bounding set the remote end announced in its last TMMBN
    pub fn received_bounding_set(&self) -> Vec<TmmbItem> {
        self.state().received_bounding_set.clone()
    }

    /// Round-trip statistics towards `remote_ssrc`
    pub fn rtt(&self, remote_ssrc: u32) -> TransportResult<RttStats> {
        let state = self.state();
        if state.mode == RtcpMode::Off {
            return Err(TransportError::RtcpOff);
        }
        let block = state
            .report_blocks
            .get(&remote_ssrc)
            .ok_or(TransportError::SsrcNotFound { ssrc: remote_ssrc })?;
        if block.rtt_samples == 0 {
            return Err(TransportError::NotAvailable("round-trip time".to_string()));
        }
        Ok(block.rtt)
    }

    /// Latest RTT towards any remote, zero if nothing was measured yet
    pub fn last_rtt_ms(&self) -> i64 {
        self.state()
            .report_blocks
            .values()
            .filter(|b| b.rtt_samples > 0)
            .map(|b| b.rtt.last_ms)
            .max()
            .unwrap_or(0)
    }

    pub fn reset_rtt(&self, remote_ssrc: u32) -> TransportResult<()> {
        let mut state = self.state();
        let block = state
            .report_blocks
            .get_mut(&remote_ssrc)
            .ok_or(TransportError::SsrcNotFound { ssrc: remote_ssrc })?;
        block.rtt = RttStats::default();
        block.rtt_samples = 0;
        Ok(())
    }

    /// Report blocks received from remote ends
    pub fn remote_report_blocks(&self) -> Vec<RemoteReportBlock> {
        self.state().report_blocks.values().cloned().collect()
    }

    pub fn remote_sender_info(&self) -> TransportResult<RemoteSenderInfo> {
        self.state()
            .remote_sender
            .ok_or_else(|| TransportError::NotAvailable("remote sender report".to_string()))
    }

    /// NTP time of the last SR this engine sent
    pub fn last_sent_report(&self) -> Option<NtpTime> {
        self.state().last_sr_sent.map(|(ntp, _)| ntp)
    }

    pub fn last_received_ms(&self) -> Option<i64> {
        self.state().last_received_ms
    }

    /// True once per silence longer than `timeout_ms`
    pub fn check_rtcp_timeout(&self, timeout_ms: i64) -> bool {
        if timeout_ms <= 0 {
            return false;
        }
        let now_ms = self.clock.now_ms();
        let mut state = self.state();
        match state.last_received_ms {
            Some(last) if !state.timeout_reported && now_ms - last > timeout_ms => {
                state.timeout_reported = true;
                true
            }
            _ => false,
        }
    }

    /// Forget everything learned from the remote end
    pub fn reset(&self) {
        let mut state = self.state();
        state.peer_state = PeerState::NoPeer;
        state.remote_ssrc = None;
        state.remote_sender = None;
        state.report_blocks.clear();
        state.received_cnames.clear();
        state.tmmbr_candidates.clear();
        state.received_bounding_set.clear();
        state.last_fir_received.clear();
        state.last_received_ms = None;
        state.timeout_reported = false;
        debug!(ssrc = state.ssrc, "RTCP receive state reset");
    }
}

fn check_cname(cname: &str) -> TransportResult<()> {
    if cname.is_empty() || cname.len() > MAX_CNAME_LEN {
        return Err(TransportError::ConfigError(format!(
            "CNAME must be 1..={} bytes",
            MAX_CNAME_LEN
        )));
    }
    Ok(())
}

fn mark_peer_known(state: &mut RtcpState) {
    if state.peer_state == PeerState::NoPeer {
        state.peer_state = PeerState::PeerKnown;
    }
}

fn report_blocks(state: &RtcpState, context: &RtcpContext, now_ms: i64) -> Vec<ReportBlock> {
    let mut blocks = Vec::new();
    if let (Some(remote_ssrc), Some(block)) = (state.remote_ssrc, context.receive_block) {
        let (last_sr, delay_since_last_sr) = match state.remote_sender {
            Some(sender) if sender.ssrc == remote_ssrc => (
                NtpTime::new(sender.info.ntp_seconds, sender.info.ntp_fraction).compact(),
                ms_to_compact_ntp(now_ms - sender.received_ms),
            ),
            _ => (0, 0),
        };
        blocks.push(ReportBlock {
            ssrc: remote_ssrc,
            last_sr,
            delay_since_last_sr,
            ..block
        });
    }
    blocks.extend(
        state
            .external_report_blocks
            .values()
            .copied()
            .take(MAX_REPORT_BLOCKS - blocks.len()),
    );
    blocks
}

fn handle_report_blocks(
    state: &mut RtcpState,
    remote_ssrc: u32,
    blocks: &[ReportBlock],
    now_ntp: NtpTime,
    info: &mut RtcpPacketInformation,
) {
    let ssrc = state.ssrc;
    for block in blocks {
        // With several blocks only the one about us matters
        if blocks.len() > 1 && block.ssrc != ssrc {
            continue;
        }
        let entry = state
            .report_blocks
            .entry(remote_ssrc)
            .or_insert_with(|| RemoteReportBlock {
                remote_ssrc,
                block: *block,
                max_jitter: 0,
                rtt: RttStats::default(),
                rtt_samples: 0,
            });
        entry.block = *block;
        entry.max_jitter = entry.max_jitter.max(block.jitter);

        if block.ssrc != ssrc {
            continue;
        }
        let mut rtt_ms = None;
        if block.last_sr != 0 {
            let rtt = round_trip_ms(now_ntp.compact(), block.last_sr, block.delay_since_last_sr);
            update_rtt(entry, rtt);
            rtt_ms = Some(rtt);
            if state.peer_state != PeerState::Active {
                state.peer_state = PeerState::Active;
            }
        }
        trace!(
            remote_ssrc,
            fraction_lost = block.fraction_lost,
            rtt_ms = ?rtt_ms,
            "Received report block"
        );
        info.fraction_lost = Some(block.fraction_lost);
        info.rtt_ms = rtt_ms;
        info.extended_highest_sequence = Some(block.extended_highest_sequence);
        info.jitter = Some(block.jitter);
    }
}

/// RFC 3550 A.8: arrival − LSR − DLSR, in compact NTP, clamped at zero
pub fn round_trip_ms(arrival_compact: u32, last_sr: u32, delay_since_last_sr: u32) -> i64 {
    let raw = arrival_compact
        .wrapping_sub(last_sr)
        .wrapping_sub(delay_since_last_sr) as i32;
    if raw <= 0 {
        0
    } else {
        compact_ntp_to_ms(raw as u32)
    }
}

fn update_rtt(entry: &mut RemoteReportBlock, rtt_ms: i64) {
    let stats = &mut entry.rtt;
    if entry.rtt_samples == 0 {
        stats.min_ms = rtt_ms;
        stats.max_ms = rtt_ms;
        stats.avg_ms = rtt_ms;
    } else {
        stats.min_ms = stats.min_ms.min(rtt_ms);
        stats.max_ms = stats.max_ms.max(rtt_ms);
        let n = f64::from(entry.rtt_samples);
        let avg = (n / (n + 1.0)) * stats.avg_ms as f64 + rtt_ms as f64 / (n + 1.0);
        stats.avg_ms = (avg + 0.5) as i64;
    }
    stats.last_ms = rtt_ms;
    entry.rtt_samples += 1;
}

fn live_candidates(state: &mut RtcpState, now_ms: i64, interval_ms: i64) -> Vec<TmmbItem> {
    let timeout_ms = TMMBR_TIMEOUT_INTERVALS * interval_ms;
    state
        .tmmbr_candidates
        .retain(|_, c| now_ms - c.received_ms <= timeout_ms);
    state.tmmbr_candidates.values().map(|c| c.item).collect()
}

/// Requests not dominated by another one with lower or equal rate and overhead
pub fn bounding_set(candidates: &[TmmbItem]) -> Vec<TmmbItem> {
    let mut sorted = candidates.to_vec();
    sorted.sort_by_key(|item| (item.bitrate_bps, item.packet_overhead));
    let mut set: Vec<TmmbItem> = Vec::new();
    for item in sorted {
        let dominated = set
            .iter()
            .any(|kept| kept.packet_overhead <= item.packet_overhead);
        if !dominated {
            set.push(item);
        }
    }
    set
}
