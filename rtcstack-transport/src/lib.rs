//! RTP/RTCP transport and timing core
//!
//! This crate provides the media transport layer of a real-time engine:
//! - RTP packetization, header extensions, RED/ULPFEC and telephone events
//! - Receive statistics, NACK generation and retransmission from a packet history
//! - RTCP compound reports, feedback messages and round-trip time
//! - Receive-side REMB aggregation and loss-based send rate control
//! - Jitter buffer render timing
//! - Sessions, default-module feedback routing and simulcast fan-out
//!
//! Components are poll driven: anything with periodic work implements
//! [`Module`] and is serviced by a [`ProcessThread`].
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


pub mod bandwidth_estimation;
pub mod callbacks;
pub mod clock;
pub mod error;
pub mod fec;
pub mod module;
pub mod nack;
pub mod payload_registry;
pub mod remb;
pub mod rtcp;
pub mod rtcp_engine;
pub mod rtp_handler;
pub mod rtp_receiver;
pub mod rtp_retransmission;
pub mod rtp_sender;
pub mod seq_num;
pub mod session;
pub mod simulcast;
pub mod timestamp_extrapolator;
pub mod timing;

// Re-export main types
pub use bandwidth_estimation::{BandwidthManager, BandwidthUpdate};
pub use callbacks::{
    AliveState, AudioFeedback, IntraRequestKind, RtcpFeedback, RtpData, RtpFeedback,
    RtpHeaderInfo, Transport, VideoFeedback,
};
pub use clock::{Clock, NtpTime, SimulatedClock, SystemClock};
pub use error::{TransportError, TransportResult};
pub use module::{Module, ProcessThread, RtpModule};
pub use payload_registry::{PayloadKind, PayloadSpec};
pub use remb::RembAggregator;
pub use rtcp::{RtcpPacket, VoipMetric};
pub use rtcp_engine::{RtcpEngine, RtcpMode, RtcpPacketMask, RttStats};
pub use rtp_handler::{RtpExtensionType, RtpHeader, RtpPacket};
pub use rtp_receiver::{RtpReceiver, RtpStatistics};
pub use rtp_retransmission::RtpPacketHistory;
pub use rtp_sender::{FrameType, RtpSender};
pub use session::{KeyFrameRequestMethod, NackMethod, RtpSession, SessionId, SessionOptions};
pub use simulcast::{SimulcastGroup, SimulcastStream, VideoCodec, MAX_SIMULCAST_STREAMS};
pub use timing::TimingEstimator;
