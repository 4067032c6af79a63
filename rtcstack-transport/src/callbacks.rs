//! Collaborator interfaces consumed by a session
//!
//! The session keeps only weak references to its collaborators; the
//! application owns them.
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
use crate::module::object_key;
use crate::rtcp::VoipMetric;
use crate::rtp_handler::{HeaderExtensions, RtpHeader};
use std::sync::{Arc, Weak};

/// Network side of a session
pub trait Transport: Send + Sync {
    /// Returns false if the packet could not be handed to the network
    fn send_rtp(&self, packet: &[u8]) -> bool;

    fn send_rtcp(&self, packet: &[u8]) -> bool;
}

/// Header details accompanying a received payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeaderInfo {
    pub header: RtpHeader,
    pub extensions: HeaderExtensions,
    /// Clock rate of the payload type, zero if unregistered
    pub payload_frequency_hz: u32,
    /// Recovered through FEC rather than received
    pub recovered: bool,
}

/// Consumer of received media payloads
pub trait RtpData: Send + Sync {
    fn on_received_payload_data(&self, payload: &[u8], info: &RtpHeaderInfo);
}

/// Liveness of the remote end as seen on the periodic check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliveState {
    Alive,
    /// Only comfort noise or keepalive packets arrived
    NoMedia,
    Dead,
}

/// Receive-side stream events
pub trait RtpFeedback: Send + Sync {
    /// A payload type was seen for the first time
    fn on_initialize_decoder(&self, _payload_type: u8, _name: &str, _clock_rate_hz: u32, _channels: u8) {}

    /// No RTP arrived within the configured timeout
    fn on_packet_timeout(&self) {}

    /// First RTP packet after a timeout
    fn on_received_packet(&self) {}

    fn on_periodic_dead_or_alive(&self, _state: AliveState) {}

    fn on_incoming_ssrc_changed(&self, _ssrc: u32) {}

    fn on_incoming_csrc_changed(&self, _csrc: u32, _added: bool) {}
}

/// RTCP-derived notifications
pub trait RtcpFeedback: Send + Sync {
    /// Audio/video offset derived from two sessions' sender reports
    fn on_lip_sync_update(&self, _offset_ms: i32) {}

    /// Tightest bound of the received TMMBR bounding set
    fn on_tmmbr_received(&self, _bitrate_kbps: u32) {}

    fn on_application_data_received(&self, _subtype: u8, _name: [u8; 4], _data: &[u8]) {}

    fn on_xr_voip_metric_received(&self, _metric: &VoipMetric) {}

    fn on_sender_report_received(&self, _ssrc: u32) {}

    fn on_receiver_report_received(&self, _ssrc: u32) {}

    /// No RTCP arrived within the configured timeout
    fn on_rtcp_packet_timeout(&self) {}
}

/// How a key frame was requested by the remote end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntraRequestKind {
    Pli,
    Fir,
    FirOverRtp,
}

/// Encoder-facing feedback
pub trait VideoFeedback: Send + Sync {
    fn on_received_intra_frame_request(&self, _kind: IntraRequestKind, _stream_idx: u8) {}

    fn on_network_changed(&self, _bitrate_bps: u32, _fraction_lost: u8, _rtt_ms: u32) {}

    fn on_received_slice_loss_indication(&self, _picture_id: u8) {}

    fn on_received_reference_picture_selection(&self, _picture_id: u64) {}
}

/// DTMF notifications
pub trait AudioFeedback: Send + Sync {
    /// Fired once when an event starts and once when it ends
    fn on_received_telephone_event(&self, _event: u8, _end_of_event: bool) {}

    fn on_play_telephone_event(&self, _event: u8, _length_ms: u16, _volume: u8) {}
}

/// Weak slot for one collaborator
pub(crate) struct CallbackSlot<T: ?Sized> {
    entry: Option<(usize, Weak<T>)>,
}

impl<T: ?Sized> Default for CallbackSlot<T> {
    fn default() -> Self {
        Self { entry: None }
    }
}

impl<T: ?Sized> CallbackSlot<T> {
    /// Install `callback`; registering the same object twice is an error
    pub(crate) fn register(&mut self, callback: &Arc<T>, what: &str) -> TransportResult<()> {
        let key = object_key(callback.as_ref());
        if let Some((existing, weak)) = &self.entry {
            if *existing == key && weak.strong_count() > 0 {
                return Err(TransportError::AlreadyRegistered(what.to_string()));
            }
        }
        self.entry = Some((key, Arc::downgrade(callback)));
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        self.entry = None;
    }

    pub(crate) fn get(&self) -> Option<Arc<T>> {
        self.entry.as_ref().and_then(|(_, weak)| weak.upgrade())
    }
}
