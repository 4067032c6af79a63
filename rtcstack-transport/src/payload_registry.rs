//! Payload type table shared by the send and receive paths
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
use std::collections::BTreeMap;

/// Longest payload name, excluding the terminator of the wire field
pub const MAX_PAYLOAD_NAME_LEN: usize = 31;

/// Highest value that fits the 7-bit payload type field
pub const MAX_PAYLOAD_TYPE: u8 = 127;

/// Payload types that collide with RTCP packet types 200..=204 once the marker bit is set
const RTCP_COLLISION_RANGE: std::ops::RangeInclusive<u8> = 72..=76;

/// What the stack does with packets of a payload type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Handed to the codec collaborator
    Media,
    /// RFC 2198 redundant encoding
    Red,
    /// RFC 5109 FEC
    Ulpfec,
    /// RFC 4733 DTMF events
    TelephoneEvent,
    /// RFC 3389 comfort noise
    ComfortNoise,
}

impl PayloadKind {
    fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "red" => PayloadKind::Red,
            "ulpfec" => PayloadKind::Ulpfec,
            "telephone-event" => PayloadKind::TelephoneEvent,
            "cn" => PayloadKind::ComfortNoise,
            _ => PayloadKind::Media,
        }
    }
}

/// One registered payload type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadSpec {
    pub payload_type: u8,
    pub name: String,
    pub clock_rate_hz: u32,
    /// Zero for video
    pub channels: u8,
    /// Nominal codec rate, zero if unknown
    pub rate_bps: u32,
}

impl PayloadSpec {
    pub fn audio(payload_type: u8, name: &str, clock_rate_hz: u32, channels: u8) -> Self {
        Self {
            payload_type,
            name: name.to_string(),
            clock_rate_hz,
            channels,
            rate_bps: 0,
        }
    }

    /// Video payloads always run on the 90 kHz clock
    pub fn video(payload_type: u8, name: &str) -> Self {
        Self {
            payload_type,
            name: name.to_string(),
            clock_rate_hz: 90_000,
            channels: 0,
            rate_bps: 0,
        }
    }

    pub fn with_rate(mut self, rate_bps: u32) -> Self {
        self.rate_bps = rate_bps;
        self
    }

    pub fn kind(&self) -> PayloadKind {
        PayloadKind::from_name(&self.name)
    }

    pub fn is_video(&self) -> bool {
        self.channels == 0
    }

    /// Check the spec without registering it
    pub fn validate(&self) -> TransportResult<()> {
        validate_payload_type(self.payload_type)?;
        if self.name.is_empty() || self.name.len() > MAX_PAYLOAD_NAME_LEN {
            return Err(TransportError::ConfigError(format!(
                "payload name must be 1..={} bytes, got {}",
                MAX_PAYLOAD_NAME_LEN,
                self.name.len()
            )));
        }
        if self.clock_rate_hz == 0 {
            return Err(TransportError::ConfigError(format!(
                "payload {} has a zero clock rate",
                self.name
            )));
        }
        Ok(())
    }
}

/// Reject payload types the RTP header cannot carry unambiguously
pub fn validate_payload_type(payload_type: u8) -> TransportResult<()> {
    if payload_type > MAX_PAYLOAD_TYPE || RTCP_COLLISION_RANGE.contains(&payload_type) {
        return Err(TransportError::InvalidPayloadType { payload_type });
    }
    Ok(())
}

/// Payload type → codec description
#[derive(Debug, Clone, Default)]
pub struct PayloadRegistry {
    payloads: BTreeMap<u8, PayloadSpec>,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a payload; re-registering an identical spec is accepted
    pub fn register(&mut self, spec: PayloadSpec) -> TransportResult<()> {
        spec.validate()?;
        match self.payloads.get(&spec.payload_type) {
            Some(existing) if *existing == spec => Ok(()),
            Some(existing) => Err(TransportError::AlreadyRegistered(format!(
                "payload type {} ({})",
                existing.payload_type, existing.name
            ))),
            None => {
                self.payloads.insert(spec.payload_type, spec);
                Ok(())
            }
        }
    }

    pub fn deregister(&mut self, payload_type: u8) -> TransportResult<PayloadSpec> {
        self.payloads
            .remove(&payload_type)
            .ok_or_else(|| TransportError::NotRegistered(format!("payload type {}", payload_type)))
    }

    pub fn get(&self, payload_type: u8) -> Option<&PayloadSpec> {
        self.payloads.get(&payload_type)
    }

    pub fn contains(&self, payload_type: u8) -> bool {
        self.payloads.contains_key(&payload_type)
    }

    /// Look up the payload type registered for a codec
    pub fn payload_type_of(&self, name: &str, clock_rate_hz: u32, channels: u8) -> Option<u8> {
        self.payloads
            .values()
            .find(|spec| {
                spec.name.eq_ignore_ascii_case(name)
                    && spec.clock_rate_hz == clock_rate_hz
                    && spec.channels == channels
            })
            .map(|spec| spec.payload_type)
    }

    /// First payload type of the given kind
    pub fn payload_type_of_kind(&self, kind: PayloadKind) -> Option<u8> {
        self.payloads
            .values()
            .find(|spec| spec.kind() == kind)
            .map(|spec| spec.payload_type)
    }

    /// Smallest payload type not in use, for keepalive packets
    pub fn unused_payload_type(&self) -> Option<u8> {
        (0..=MAX_PAYLOAD_TYPE)
            .filter(|pt| !RTCP_COLLISION_RANGE.contains(pt))
            .find(|pt| !self.payloads.contains_key(pt))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PayloadSpec> {
        self.payloads.values()
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}
