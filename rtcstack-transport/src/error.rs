//! Error types for the RTP/RTCP transport
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


use thiserror::Error;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors that can occur in the transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// RTP packet parsing error
    #[error("RTP packet parse error: {0}")]
    RtpParseError(String),

    /// RTCP packet parsing error
    #[error("RTCP packet parse error: {0}")]
    RtcpParseError(String),

    /// Invalid packet format
    #[error("Invalid packet format: {0}")]
    InvalidPacket(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Payload type outside 0..=127 or clashing with RTCP
    #[error("Invalid payload type: {payload_type}")]
    InvalidPayloadType { payload_type: u8 },

    /// Value is not available yet; poll again later
    #[error("Not available yet: {0}")]
    NotAvailable(String),

    /// No state for the given remote SSRC
    #[error("Unknown SSRC: {ssrc:#010x}")]
    SsrcNotFound { ssrc: u32 },

    /// RTCP is switched off for this session
    #[error("RTCP is off")]
    RtcpOff,

    /// Observer, module or payload already registered
    #[error("Already registered: {0}")]
    AlreadyRegistered(String),

    /// Observer, module or payload not registered
    #[error("Not registered: {0}")]
    NotRegistered(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {state}")]
    InvalidState { state: String },

    /// RTP timestamp jumped further ahead than the render clock tolerates
    #[error("Timestamp discontinuity: render time {ahead_ms} ms ahead")]
    TimestampDiscontinuity { ahead_ms: i64 },

    /// Transport collaborator refused or is gone
    #[error("Transport failed: {0}")]
    TransportFailed(String),
}

impl TransportError {
    /// Whether the caller should simply retry later instead of treating this as a fault
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::NotAvailable(_) | TransportError::TimestampDiscontinuity { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::NotAvailable("rtt".into()).is_transient());
        assert!(!TransportError::RtcpOff.is_transient());
        assert!(!TransportError::SsrcNotFound { ssrc: 1 }.is_transient());
    }

    #[test]
    fn test_ssrc_display_is_hex() {
        let err = TransportError::SsrcNotFound { ssrc: 0x1234 };
        assert_eq!(err.to_string(), "Unknown SSRC: 0x00001234");
    }
}
