//! Simulcast fan-out
//!
//! The base layer is sent by the parent session; every further layer gets a
//! child session that uses the parent as its default module, so key-frame
//! requests and loss feedback from any layer reach one encoder.
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


use crate::callbacks::Transport;
use crate::error::{TransportError, TransportResult};
use crate::module::{Module, ProcessThread, RtpModule};
use crate::payload_registry::{PayloadKind, PayloadSpec};
use crate::rtcp_engine::RtcpMode;
use crate::rtp_retransmission::DEFAULT_HISTORY_SIZE;
use crate::session::{NackMethod, RtpSession, SessionOptions};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Most layers one codec may be sent in
pub const MAX_SIMULCAST_STREAMS: usize = 4;

/// One simulcast layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulcastStream {
    pub width: u16,
    pub height: u16,
    pub min_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
}

/// Send codec with its optional simulcast layers, lowest layer first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoCodec {
    pub payload_type: u8,
    pub name: String,
    pub start_bitrate_kbps: u32,
    pub min_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub simulcast_streams: Vec<SimulcastStream>,
}

impl VideoCodec {
    pub fn new(payload_type: u8, name: &str, start_bitrate_kbps: u32) -> Self {
        Self {
            payload_type,
            name: name.to_string(),
            start_bitrate_kbps,
            min_bitrate_kbps: 0,
            max_bitrate_kbps: 0,
            simulcast_streams: Vec::new(),
        }
    }

    pub fn with_simulcast(mut self, streams: Vec<SimulcastStream>) -> Self {
        self.simulcast_streams = streams;
        self
    }

    fn payload_spec(&self) -> PayloadSpec {
        PayloadSpec::video(self.payload_type, &self.name)
    }

    fn validate(&self) -> TransportResult<()> {
        let spec = self.payload_spec();
        spec.validate()?;
        if spec.kind() != PayloadKind::Media {
            return Err(TransportError::ConfigError(format!(
                "{} cannot be used as a send codec",
                self.name
            )));
        }
        if self.simulcast_streams.len() > MAX_SIMULCAST_STREAMS {
            return Err(TransportError::ConfigError(format!(
                "{} simulcast streams, at most {} supported",
                self.simulcast_streams.len(),
                MAX_SIMULCAST_STREAMS
            )));
        }
        if self.max_bitrate_kbps != 0 && self.min_bitrate_kbps > self.max_bitrate_kbps {
            return Err(TransportError::ConfigError(format!(
                "minimum bitrate {} kbps above maximum {} kbps",
                self.min_bitrate_kbps, self.max_bitrate_kbps
            )));
        }
        for kbps in [self.min_bitrate_kbps, self.max_bitrate_kbps] {
            if u16::try_from(kbps).is_err() {
                return Err(TransportError::ConfigError(format!(
                    "bitrate {} kbps out of range",
                    kbps
                )));
            }
        }
        for (idx, stream) in self.simulcast_streams.iter().enumerate() {
            if stream.max_bitrate_kbps == 0 || stream.min_bitrate_kbps > stream.max_bitrate_kbps {
                return Err(TransportError::ConfigError(format!(
                    "simulcast stream {} has bitrate range {}..{} kbps",
                    idx, stream.min_bitrate_kbps, stream.max_bitrate_kbps
                )));
            }
            if u16::try_from(stream.max_bitrate_kbps).is_err() {
                return Err(TransportError::ConfigError(format!(
                    "simulcast stream {} maximum {} kbps out of range",
                    idx, stream.max_bitrate_kbps
                )));
            }
        }
        Ok(())
    }

    /// Split the start bitrate over the layers in order, each up to its maximum
    pub fn partition_bitrate(&self) -> Vec<u32> {
        let mut remaining_bps = u64::from(self.start_bitrate_kbps) * 1000;
        self.simulcast_streams
            .iter()
            .map(|stream| {
                let allotted = remaining_bps.min(u64::from(stream.max_bitrate_kbps) * 1000);
                remaining_bps -= allotted;
                allotted as u32
            })
            .collect()
    }
}

/// Settings every session of the group carries
struct GroupState {
    children: Vec<Arc<RtpSession>>,
    transport: Option<Arc<dyn Transport>>,
    rtcp_mode: RtcpMode,
    mtu: Option<u16>,
    payloads: Vec<PayloadSpec>,
    nack: NackMethod,
    fec: Option<(u8, u8)>,
    codec: Option<VideoCodec>,
}

/// A parent session plus one child session per extra simulcast layer
pub struct SimulcastGroup {
    parent: Arc<RtpSession>,
    child_options: SessionOptions,
    process_thread: Option<Arc<ProcessThread>>,
    state: Mutex<GroupState>,
}

impl SimulcastGroup {
    /// `child_options` are used for every child session created later
    pub fn new(
        parent: Arc<RtpSession>,
        child_options: SessionOptions,
        process_thread: Option<Arc<ProcessThread>>,
    ) -> Self {
        let rtcp_mode = parent.rtcp_status();
        let nack = parent.nack_method();
        Self {
            parent,
            child_options,
            process_thread,
            state: Mutex::new(GroupState {
                children: Vec::new(),
                transport: None,
                rtcp_mode,
                mtu: None,
                payloads: Vec::new(),
                nack,
                fec: None,
                codec: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn parent(&self) -> &Arc<RtpSession> {
        &self.parent
    }

    /// Child sessions, second layer first
    pub fn children(&self) -> Vec<Arc<RtpSession>> {
        self.state().children.clone()
    }

    /// Sessions carrying media: the parent and every child
    pub fn stream_count(&self) -> usize {
        1 + self.state().children.len()
    }

    pub fn send_codec(&self) -> Option<VideoCodec> {
        self.state().codec.clone()
    }

    pub fn register_transport(&self, transport: &Arc<dyn Transport>) -> TransportResult<()> {
        self.parent.register_transport(transport)?;
        let mut state = self.state();
        for child in &state.children {
            child.deregister_transport();
            child.register_transport(transport)?;
        }
        state.transport = Some(transport.clone());
        Ok(())
    }

    /// Apply a send codec, growing or shrinking the group to its layer count
    ///
    /// Returns the bitrate given to each layer. Nothing changes if the codec
    /// is rejected.
    pub fn set_send_codec(&self, codec: &VideoCodec) -> TransportResult<Vec<u32>> {
        codec.validate()?;
        let spec = codec.payload_spec();
        let mut state = self.state();

        let sessions = std::iter::once(&self.parent).chain(state.children.iter());
        for session in sessions {
            if session
                .keepalive_status()
                .is_some_and(|(payload_type, _)| payload_type == codec.payload_type)
            {
                return Err(TransportError::ConfigError(format!(
                    "payload type {} is used for keepalive",
                    codec.payload_type
                )));
            }
        }

        let wanted = codec.simulcast_streams.len().saturating_sub(1);
        let mut created = Vec::new();
        for idx in state.children.len() + 1..=wanted {
            match self.create_child(&state, idx) {
                Ok(child) => created.push(child),
                Err(e) => {
                    for child in &created {
                        self.destroy_child(child);
                    }
                    return Err(e);
                }
            }
        }

        // Past this point every call has been checked above
        let previous_payload_type = state
            .codec
            .as_ref()
            .map(|previous| previous.payload_type)
            .filter(|pt| *pt != codec.payload_type)
            .filter(|pt| !state.payloads.iter().any(|extra| extra.payload_type == *pt));
        while state.children.len() > wanted {
            if let Some(child) = state.children.pop() {
                self.destroy_child(&child);
            }
        }
        state.children.extend(created);
        self.parent.set_simulcast_index(0);
        let sessions: Vec<Arc<RtpSession>> = std::iter::once(self.parent.clone())
            .chain(state.children.iter().cloned())
            .collect();
        for session in &sessions {
            if let Some(pt) = previous_payload_type {
                if session.send_payload(pt).is_ok() {
                    session.deregister_send_payload(pt)?;
                }
            }
            if session.send_payload(codec.payload_type).is_ok() {
                session.deregister_send_payload(codec.payload_type)?;
            }
            session.register_send_payload(spec.clone())?;
        }

        let allocations = if codec.simulcast_streams.is_empty() {
            self.parent.set_send_bitrate(
                codec.start_bitrate_kbps.saturating_mul(1000),
                codec.min_bitrate_kbps,
                codec.max_bitrate_kbps,
            )?;
            vec![codec.start_bitrate_kbps.saturating_mul(1000)]
        } else {
            let allocations = codec.partition_bitrate();
            for ((session, stream), allotted) in sessions
                .iter()
                .zip(&codec.simulcast_streams)
                .zip(&allocations)
            {
                session.set_send_bitrate(
                    *allotted,
                    stream.min_bitrate_kbps,
                    stream.max_bitrate_kbps,
                )?;
            }
            allocations
        };

        info!(
            session = %self.parent.id(),
            codec = %codec.name,
            streams = sessions.len(),
            ?allocations,
            "Send codec applied"
        );
        state.codec = Some(codec.clone());
        Ok(allocations)
    }

    fn create_child(&self, state: &GroupState, idx: usize) -> TransportResult<Arc<RtpSession>> {
        let child = RtpSession::new(self.child_options.clone());
        child.set_simulcast_index(idx as u8);
        child.register_default_module(&self.parent)?;
        if let Some(transport) = &state.transport {
            child.register_transport(transport)?;
        }
        child.set_rtcp_status(state.rtcp_mode);
        if let Some(mtu) = state.mtu {
            child.set_max_transfer_unit(mtu)?;
        }
        for spec in &state.payloads {
            child.register_send_payload(spec.clone())?;
        }
        apply_nack(&child, state.nack)?;
        if let Some((red, fec)) = state.fec {
            child.set_generic_fec_status(true, red, fec)?;
        }
        if let Some(process_thread) = &self.process_thread {
            let module: Arc<dyn Module> = child.clone();
            process_thread.register_module(module)?;
        }
        debug!(parent = %self.parent.id(), child = %child.id(), idx, "Created simulcast child");
        Ok(child)
    }

    fn destroy_child(&self, child: &Arc<RtpSession>) {
        if let Some(process_thread) = &self.process_thread {
            if let Err(e) = process_thread.deregister_module(child.as_ref()) {
                debug!(child = %child.id(), error = %e, "Child was not scheduled");
            }
        }
        if let Err(e) = child.close() {
            warn!(child = %child.id(), error = %e, "Closing simulcast child failed");
        }
        debug!(parent = %self.parent.id(), child = %child.id(), "Destroyed simulcast child");
    }

    pub fn set_rtcp_mode(&self, mode: RtcpMode) {
        let mut state = self.state();
        self.parent.set_rtcp_status(mode);
        for child in &state.children {
            child.set_rtcp_status(mode);
        }
        state.rtcp_mode = mode;
    }

    pub fn set_mtu(&self, mtu: u16) -> TransportResult<()> {
        let mut state = self.state();
        self.parent.set_max_transfer_unit(mtu)?;
        for child in &state.children {
            child.set_max_transfer_unit(mtu)?;
        }
        state.mtu = Some(mtu);
        Ok(())
    }

    /// Register an extra send payload (RED, ULPFEC, ...) on every session
    pub fn register_send_payload(&self, spec: PayloadSpec) -> TransportResult<()> {
        spec.validate()?;
        let mut state = self.state();
        self.parent.register_send_payload(spec.clone())?;
        for child in &state.children {
            child.register_send_payload(spec.clone())?;
        }
        state.payloads.push(spec);
        Ok(())
    }

    /// NACK on every session; sent packets are kept for resends while on
    pub fn set_nack_status(&self, method: NackMethod) -> TransportResult<()> {
        let mut state = self.state();
        apply_nack(&self.parent, method)?;
        for child in &state.children {
            apply_nack(child, method)?;
        }
        state.nack = method;
        Ok(())
    }

    pub fn set_fec_status(&self, enable: bool, red_payload_type: u8, fec_payload_type: u8) -> TransportResult<()> {
        let mut state = self.state();
        self.parent
            .set_generic_fec_status(enable, red_payload_type, fec_payload_type)?;
        for child in &state.children {
            child.set_generic_fec_status(enable, red_payload_type, fec_payload_type)?;
        }
        state.fec = enable.then_some((red_payload_type, fec_payload_type));
        Ok(())
    }

    /// Tear down every child; the parent is left to its owner
    pub fn close(&self) {
        let children = std::mem::take(&mut self.state().children);
        for child in &children {
            self.destroy_child(child);
        }
    }
}

fn apply_nack(session: &RtpSession, method: NackMethod) -> TransportResult<()> {
    session.set_nack_status(method);
    session.set_store_packets_status(method == NackMethod::Rtcp, DEFAULT_HISTORY_SIZE)
}

impl Drop for SimulcastGroup {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::{IntraRequestKind, VideoFeedback};
    use crate::clock::SimulatedClock;
    use crate::rtcp::{parse_compound, serialize_compound, Pli, RtcpPacket};
    use crate::rtcp_engine::RtcpPacketMask;

    #[derive(Default)]
    struct NullTransport {
        rtcp: Mutex<Vec<Vec<u8>>>,
    }

    impl Transport for NullTransport {
        fn send_rtp(&self, _packet: &[u8]) -> bool {
            true
        }

        fn send_rtcp(&self, packet: &[u8]) -> bool {
            self.rtcp.lock().unwrap().push(packet.to_vec());
            true
        }
    }

    #[derive(Default)]
    struct IntraRecorder {
        requests: Mutex<Vec<(IntraRequestKind, u8)>>,
    }

    impl VideoFeedback for IntraRecorder {
        fn on_received_intra_frame_request(&self, kind: IntraRequestKind, stream_idx: u8) {
            self.requests.lock().unwrap().push((kind, stream_idx));
        }
    }

    fn stream(max_bitrate_kbps: u32) -> SimulcastStream {
        SimulcastStream {
            width: 320,
            height: 180,
            min_bitrate_kbps: 30,
            max_bitrate_kbps,
        }
    }

    fn group() -> (SimulcastGroup, Arc<ProcessThread>) {
        let clock = Arc::new(SimulatedClock::new(1000));
        let options = SessionOptions::new(false, clock);
        let parent = RtpSession::new(options.clone().with_seed(1));
        let process_thread = Arc::new(ProcessThread::new());
        let group = SimulcastGroup::new(parent, options, Some(process_thread.clone()));
        (group, process_thread)
    }

    #[test]
    fn test_children_follow_stream_count() {
        let (group, process_thread) = group();
        let codec = VideoCodec::new(100, "VP8", 1000)
            .with_simulcast(vec![stream(150), stream(500), stream(1200)]);
        group.set_send_codec(&codec).unwrap();
        assert_eq!(group.stream_count(), 3);
        assert_eq!(group.parent().child_count(), 2);
        assert_eq!(process_thread.module_count(), 2);
        for child in group.children() {
            assert!(child.send_payload(100).is_ok());
        }

        group
            .set_send_codec(&codec.clone().with_simulcast(vec![stream(150), stream(500)]))
            .unwrap();
        assert_eq!(group.stream_count(), 2);
        assert_eq!(process_thread.module_count(), 1);

        group.set_send_codec(&VideoCodec::new(100, "VP8", 500)).unwrap();
        assert_eq!(group.stream_count(), 1);
        assert_eq!(group.parent().child_count(), 0);
    }

    #[test]
    fn test_bitrate_partitioned_in_layer_order() {
        let codec = VideoCodec::new(100, "VP8", 1000)
            .with_simulcast(vec![stream(150), stream(500), stream(1200)]);
        assert_eq!(codec.partition_bitrate(), vec![150_000, 500_000, 350_000]);

        let starved = VideoCodec::new(100, "VP8", 100).with_simulcast(vec![stream(150), stream(500)]);
        assert_eq!(starved.partition_bitrate(), vec![100_000, 0]);

        let (group, _) = group();
        let applied = group.set_send_codec(&codec).unwrap();
        assert_eq!(applied, vec![150_000, 500_000, 350_000]);
        assert_eq!(group.parent().current_send_bitrate_bps(), 150_000);
        assert_eq!(group.children()[1].current_send_bitrate_bps(), 350_000);
        assert_eq!(group.children()[1].max_configured_bitrate_kbps().unwrap(), 1200);
    }

    #[test]
    fn test_invalid_codec_changes_nothing() {
        let (group, _) = group();
        let codec = VideoCodec::new(100, "VP8", 1000).with_simulcast(vec![stream(150), stream(500)]);
        group.set_send_codec(&codec).unwrap();

        let too_many = codec.clone().with_simulcast(vec![stream(100); MAX_SIMULCAST_STREAMS + 1]);
        assert!(group.set_send_codec(&too_many).is_err());
        let red = VideoCodec::new(116, "red", 1000);
        assert!(group.set_send_codec(&red).is_err());
        let bad_pt = VideoCodec::new(200, "VP8", 1000);
        assert!(group.set_send_codec(&bad_pt).is_err());

        assert_eq!(group.stream_count(), 2);
        assert_eq!(group.send_codec(), Some(codec));
        assert!(group.parent().send_payload(116).is_err());
    }

    #[test]
    fn test_codec_with_out_of_range_bitrate_is_rejected_whole() {
        let (group, process_thread) = group();
        let codec = VideoCodec::new(100, "VP8", 1000).with_simulcast(vec![stream(150), stream(500)]);
        group.set_send_codec(&codec).unwrap();

        let mut too_fast = VideoCodec::new(101, "VP9", 1000);
        too_fast.max_bitrate_kbps = 70_000;
        assert!(matches!(
            group.set_send_codec(&too_fast),
            Err(TransportError::ConfigError(_))
        ));
        assert!(group.parent().send_payload(101).is_err());
        assert!(group.parent().send_payload(100).is_ok());
        assert_eq!(group.stream_count(), 2);
        assert_eq!(process_thread.module_count(), 1);
        assert_eq!(group.send_codec(), Some(codec));
    }

    #[test]
    fn test_keepalive_payload_type_rejected_as_codec() {
        let (group, _) = group();
        group.parent().set_keepalive_status(true, 101, 1000).unwrap();
        let codec = VideoCodec::new(101, "VP9", 1000).with_simulcast(vec![stream(150), stream(500)]);
        assert!(group.set_send_codec(&codec).is_err());
        assert_eq!(group.stream_count(), 1);
        assert_eq!(group.send_codec(), None);
    }

    #[test]
    fn test_new_payload_type_replaces_previous_codec() {
        let (group, _) = group();
        group.register_send_payload(PayloadSpec::video(116, "red")).unwrap();
        let vp8 = VideoCodec::new(100, "VP8", 1000).with_simulcast(vec![stream(150), stream(500)]);
        group.set_send_codec(&vp8).unwrap();

        let vp9 = VideoCodec::new(101, "VP9", 1000).with_simulcast(vec![stream(150), stream(500)]);
        group.set_send_codec(&vp9).unwrap();
        let child = &group.children()[0];
        for session in [group.parent(), child] {
            assert!(session.send_payload(100).is_err());
            assert!(session.send_payload(101).is_ok());
            assert!(session.send_payload(116).is_ok());
        }
    }

    #[test]
    fn test_settings_mirrored_to_new_and_existing_children() {
        let (group, _) = group();
        group.set_rtcp_mode(RtcpMode::Compound);
        group.set_mtu(1200).unwrap();
        group.set_nack_status(NackMethod::Rtcp).unwrap();
        group.register_send_payload(PayloadSpec::video(116, "red")).unwrap();
        group.register_send_payload(PayloadSpec::video(117, "ulpfec")).unwrap();
        group.set_fec_status(true, 116, 117).unwrap();

        let codec = VideoCodec::new(100, "VP8", 1000).with_simulcast(vec![stream(150), stream(500)]);
        group.set_send_codec(&codec).unwrap();
        let child = &group.children()[0];
        assert_eq!(child.rtcp_status(), RtcpMode::Compound);
        assert_eq!(child.max_transfer_unit(), 1200);
        assert_eq!(child.nack_method(), NackMethod::Rtcp);
        assert!(child.store_packets());
        assert!(child.generic_fec_status().is_some());

        group.set_mtu(1000).unwrap();
        group.set_rtcp_mode(RtcpMode::NonCompound);
        assert_eq!(child.max_transfer_unit(), 1000);
        assert_eq!(child.rtcp_status(), RtcpMode::NonCompound);
        assert!(group.set_mtu(10).is_err());
    }

    #[test]
    fn test_child_key_frame_request_reaches_parent_feedback() {
        let (group, _) = group();
        let transport = Arc::new(NullTransport::default());
        let dyn_transport: Arc<dyn Transport> = transport.clone();
        group.register_transport(&dyn_transport).unwrap();
        group.set_rtcp_mode(RtcpMode::Compound);
        let recorder = Arc::new(IntraRecorder::default());
        let feedback: Arc<dyn VideoFeedback> = recorder.clone();
        group.parent().register_video_feedback(&feedback).unwrap();

        let codec = VideoCodec::new(100, "VP8", 1000)
            .with_simulcast(vec![stream(150), stream(500), stream(1200)]);
        group.set_send_codec(&codec).unwrap();

        let child = group.children()[1].clone();
        let pli = serialize_compound(&[RtcpPacket::Pli(Pli {
            sender_ssrc: 42,
            media_ssrc: child.ssrc(),
        })])
        .unwrap();
        child.incoming_packet(&pli).unwrap();
        assert_eq!(*recorder.requests.lock().unwrap(), vec![(IntraRequestKind::Pli, 2)]);

        // Children send through the shared transport
        child.send_rtcp(RtcpPacketMask::REPORT).unwrap();
        let sent = transport.rtcp.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        let packets = parse_compound(&sent[0]).unwrap();
        assert!(matches!(&packets[0], RtcpPacket::ReceiverReport(rr) if rr.ssrc == child.ssrc()));
    }

    #[test]
    fn test_close_releases_children() {
        let (group, process_thread) = group();
        let codec = VideoCodec::new(100, "VP8", 1000).with_simulcast(vec![stream(150), stream(500)]);
        group.set_send_codec(&codec).unwrap();
        group.close();
        assert_eq!(group.stream_count(), 1);
        assert_eq!(process_thread.module_count(), 0);
        group.parent().close().unwrap();
    }
}
