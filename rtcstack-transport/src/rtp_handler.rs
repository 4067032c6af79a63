//! RTP header, header extensions and packet framing (RFC 3550, RFC 5285)
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
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// RTP version carried in every packet
pub const RTP_VERSION: u8 = 2;

/// Maximum number of CSRC identifiers in one header
pub const MAX_CSRCS: usize = 15;

/// Profile marker of the one-byte header extension form
pub const ONE_BYTE_EXTENSION_PROFILE: u16 = 0xBEDE;

/// RTP header as defined in RFC 3550
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// RTP version (must be 2)
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Extension flag
    pub extension: bool,
    /// CSRC count
    pub csrc_count: u8,
    /// Marker bit
    pub marker: bool,
    /// Payload type (7 bits)
    pub payload_type: u8,
    /// Sequence number (16 bits, wraps)
    pub sequence_number: u16,
    /// Timestamp (32 bits, wraps, RTP clock units)
    pub timestamp: u32,
    /// SSRC (Synchronization Source) identifier
    pub ssrc: u32,
    /// CSRC (Contributing Source) identifiers
    pub csrc: Vec<u32>,
    /// Extension header (optional)
    pub extension_header: Option<ExtensionHeader>,
}

/// Raw RTP extension header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionHeader {
    /// Extension profile identifier
    pub profile: u16,
    /// Extension data, a multiple of 4 bytes on the wire
    pub data: Bytes,
}

/// Complete RTP packet
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub header: RtpHeader,
    /// Payload with padding stripped
    pub payload: Bytes,
    /// Number of padding bytes that followed the payload
    pub padding_len: u8,
}

impl RtpHeader {
    /// Minimum RTP header size (12 bytes)
    pub const MIN_SIZE: usize = 12;

    /// Header with no CSRCs and no extension
    pub fn new(payload_type: u8, sequence_number: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            version: RTP_VERSION,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type: payload_type & 0x7F,
            sequence_number,
            timestamp,
            ssrc,
            csrc: Vec::new(),
            extension_header: None,
        }
    }

    /// Parse RTP header, returning the bytes that follow it
    pub fn parse(data: &[u8]) -> TransportResult<(Self, &[u8])> {
        if data.len() < Self::MIN_SIZE {
            return Err(TransportError::RtpParseError(format!(
                "RTP header too short: {} bytes",
                data.len()
            )));
        }
        let mut buf = data;

        // V(2) P(1) X(1) CC(4)
        let first_byte = buf.get_u8();
        let version = first_byte >> 6;
        if version != RTP_VERSION {
            return Err(TransportError::RtpParseError(format!(
                "Invalid RTP version: {}",
                version
            )));
        }
        let padding = first_byte & 0x20 != 0;
        let extension = first_byte & 0x10 != 0;
        let csrc_count = first_byte & 0x0F;

        // M(1) PT(7)
        let second_byte = buf.get_u8();
        let marker = second_byte & 0x80 != 0;
        let payload_type = second_byte & 0x7F;

        let sequence_number = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        if buf.remaining() < csrc_count as usize * 4 {
            return Err(TransportError::RtpParseError(
                "Incomplete CSRC list".to_string(),
            ));
        }
        let csrc = (0..csrc_count).map(|_| buf.get_u32()).collect();

        let extension_header = if extension {
            if buf.remaining() < 4 {
                return Err(TransportError::RtpParseError(
                    "Incomplete extension header".to_string(),
                ));
            }
            let profile = buf.get_u16();
            let ext_len = buf.get_u16() as usize * 4;
            if buf.remaining() < ext_len {
                return Err(TransportError::RtpParseError(
                    "Incomplete extension data".to_string(),
                ));
            }
            let data = Bytes::copy_from_slice(&buf[..ext_len]);
            buf.advance(ext_len);
            Some(ExtensionHeader { profile, data })
        } else {
            None
        };

        let header = RtpHeader {
            version,
            padding,
            extension,
            csrc_count,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension_header,
        };

        Ok((header, buf))
    }

    /// Append the serialized header to `buf`
    pub fn write_to(&self, buf: &mut BytesMut) {
        let csrc_count = self.csrc.len().min(MAX_CSRCS);
        let mut first_byte = RTP_VERSION << 6;
        if self.padding {
            first_byte |= 0x20;
        }
        if self.extension_header.is_some() {
            first_byte |= 0x10;
        }
        first_byte |= csrc_count as u8;
        buf.put_u8(first_byte);

        let mut second_byte = self.payload_type & 0x7F;
        if self.marker {
            second_byte |= 0x80;
        }
        buf.put_u8(second_byte);
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        for &csrc_id in self.csrc.iter().take(MAX_CSRCS) {
            buf.put_u32(csrc_id);
        }

        if let Some(ref ext) = self.extension_header {
            let padding = (4 - ext.data.len() % 4) % 4;
            buf.put_u16(ext.profile);
            buf.put_u16(((ext.data.len() + padding) / 4) as u16);
            buf.put_slice(&ext.data);
            buf.put_bytes(0, padding);
        }
    }

    /// Serialize RTP header to bytes
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.size());
        self.write_to(&mut buf);
        buf
    }

    /// Header size in bytes
    pub fn size(&self) -> usize {
        let mut size = Self::MIN_SIZE + self.csrc.len().min(MAX_CSRCS) * 4;
        if let Some(ref ext) = self.extension_header {
            size += 4 + ext.data.len() + (4 - ext.data.len() % 4) % 4;
        }
        size
    }

    /// Decode registered one-byte extensions
    pub fn extensions(&self, map: &HeaderExtensionMap) -> HeaderExtensions {
        match self.extension_header {
            Some(ref ext) if ext.profile == ONE_BYTE_EXTENSION_PROFILE => {
                HeaderExtensions::parse(&ext.data, map)
            }
            _ => HeaderExtensions::default(),
        }
    }
}

impl RtpPacket {
    /// Parse RTP packet from bytes
    pub fn parse(data: &[u8]) -> TransportResult<Self> {
        let (header, payload_data) = RtpHeader::parse(data)?;

        let padding_len = if header.padding {
            let Some(&last) = payload_data.last() else {
                return Err(TransportError::RtpParseError(
                    "Packet has padding flag but no payload".to_string(),
                ));
            };
            if last == 0 || last as usize > payload_data.len() {
                return Err(TransportError::RtpParseError(format!(
                    "Invalid padding length: {}",
                    last
                )));
            }
            last
        } else {
            0
        };

        let payload =
            Bytes::copy_from_slice(&payload_data[..payload_data.len() - padding_len as usize]);
        Ok(RtpPacket {
            header,
            payload,
            padding_len,
        })
    }

    /// Serialize RTP packet to bytes
    pub fn serialize(&self) -> BytesMut {
        let mut buf =
            BytesMut::with_capacity(self.header.size() + self.payload.len() + self.padding_len as usize);
        let mut header = self.header.clone();
        header.padding = self.padding_len > 0;
        header.write_to(&mut buf);
        buf.put_slice(&self.payload);
        if self.padding_len > 0 {
            buf.put_bytes(0, self.padding_len as usize - 1);
            buf.put_u8(self.padding_len);
        }
        buf
    }
}

/// Header extensions this stack understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RtpExtensionType {
    /// 24-bit signed offset between capture and send time, RTP units (RFC 5450)
    TransmissionTimeOffset,
    /// Voice activity flag and level in -dBov (RFC 6464)
    AudioLevel,
}

impl RtpExtensionType {
    /// Element payload length in bytes
    pub(crate) fn data_len(self) -> usize {
        match self {
            RtpExtensionType::TransmissionTimeOffset => 3,
            RtpExtensionType::AudioLevel => 1,
        }
    }
}

/// Negotiated extension id table (ids 1..=14)
#[derive(Debug, Clone, Default)]
pub struct HeaderExtensionMap {
    ids: [Option<RtpExtensionType>; 15],
}

impl HeaderExtensionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, ty: RtpExtensionType, id: u8) -> TransportResult<()> {
        if !(1..=14).contains(&id) {
            return Err(TransportError::ConfigError(format!(
                "extension id {} outside 1..=14",
                id
            )));
        }
        match self.ids[id as usize] {
            Some(existing) if existing == ty => return Ok(()),
            Some(_) => {
                return Err(TransportError::AlreadyRegistered(format!(
                    "extension id {}",
                    id
                )))
            }
            None => {}
        }
        self.deregister(ty);
        self.ids[id as usize] = Some(ty);
        Ok(())
    }

    pub fn deregister(&mut self, ty: RtpExtensionType) {
        for slot in self.ids.iter_mut() {
            if *slot == Some(ty) {
                *slot = None;
            }
        }
    }

    pub fn id_of(&self, ty: RtpExtensionType) -> Option<u8> {
        self.ids
            .iter()
            .position(|slot| *slot == Some(ty))
            .map(|id| id as u8)
    }

    pub fn type_of(&self, id: u8) -> Option<RtpExtensionType> {
        self.ids.get(id as usize).copied().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.iter().all(Option::is_none)
    }
}

/// Audio level indication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioLevel {
    pub voice_activity: bool,
    /// 0..=127, in -dBov
    pub level: u8,
}

/// Decoded header extension values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderExtensions {
    pub transmission_time_offset: Option<i32>,
    pub audio_level: Option<AudioLevel>,
}

impl HeaderExtensions {
    pub fn is_empty(&self) -> bool {
        self.transmission_time_offset.is_none() && self.audio_level.is_none()
    }

    /// Parse one-byte form elements; unknown ids are skipped
    pub fn parse(mut data: &[u8], map: &HeaderExtensionMap) -> Self {
        let mut extensions = HeaderExtensions::default();
        while let Some(&byte) = data.first() {
            if byte == 0 {
                data = &data[1..];
                continue;
            }
            let id = byte >> 4;
            let len = (byte & 0x0F) as usize + 1;
            if id == 15 || data.len() < 1 + len {
                break;
            }
            let element = &data[1..1 + len];
            match map.type_of(id) {
                Some(RtpExtensionType::TransmissionTimeOffset) if len == 3 => {
                    let raw = (u32::from(element[0]) << 16)
                        | (u32::from(element[1]) << 8)
                        | u32::from(element[2]);
                    // sign-extend 24 bits
                    extensions.transmission_time_offset = Some(((raw << 8) as i32) >> 8);
                }
                Some(RtpExtensionType::AudioLevel) if len == 1 => {
                    extensions.audio_level = Some(AudioLevel {
                        voice_activity: element[0] & 0x80 != 0,
                        level: element[0] & 0x7F,
                    });
                }
                _ => {}
            }
            data = &data[1 + len..];
        }
        extensions
    }

    /// Build the one-byte form extension block, if any registered value is set
    pub fn to_extension_header(&self, map: &HeaderExtensionMap) -> Option<ExtensionHeader> {
        let mut data = BytesMut::new();
        if let (Some(offset), Some(id)) = (
            self.transmission_time_offset,
            map.id_of(RtpExtensionType::TransmissionTimeOffset),
        ) {
            let len = RtpExtensionType::TransmissionTimeOffset.data_len();
            data.put_u8((id << 4) | (len as u8 - 1));
            let raw = (offset as u32) & 0x00FF_FFFF;
            data.put_u8((raw >> 16) as u8);
            data.put_u16(raw as u16);
        }
        if let (Some(level), Some(id)) = (self.audio_level, map.id_of(RtpExtensionType::AudioLevel)) {
            let len = RtpExtensionType::AudioLevel.data_len();
            data.put_u8((id << 4) | (len as u8 - 1));
            data.put_u8((u8::from(level.voice_activity) << 7) | (level.level & 0x7F));
        }
        if data.is_empty() {
            return None;
        }
        let padding = (4 - data.len() % 4) % 4;
        data.put_bytes(0, padding);
        Some(ExtensionHeader {
            profile: ONE_BYTE_EXTENSION_PROFILE,
            data: data.freeze(),
        })
    }
}
