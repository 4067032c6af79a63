//! RED encapsulation (RFC 2198) and ULPFEC (RFC 5109)
//!
//! Media packets are protected per frame with XOR parity packets. The
//! receiver recovers a packet whenever exactly one of the packets protected
//! by a parity packet is missing.
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
use crate::seq_num::sequence_number_diff;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Fixed RTP header length the FEC computations operate on
const RTP_FIXED_HEADER: usize = 12;

/// FEC header (RFC 5109 Section 7.3)
pub const FEC_HEADER_SIZE: usize = 10;

/// Level-0 header with a 16-bit mask
const ULP_HEADER_SIZE_SHORT: usize = 4;

/// Level-0 header with a 48-bit mask
const ULP_HEADER_SIZE_LONG: usize = 8;

/// Media packets one FEC packet can cover with the short mask
const SHORT_MASK_PACKETS: usize = 16;

/// Media packets one FEC packet can cover at all
pub const MAX_MEDIA_PACKETS: usize = 48;

/// Stored media packets kept for recovery
const MAX_STORED_MEDIA: usize = 512;

/// Parsed ULPFEC packet (the RED block, without RTP header)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FecPacket {
    /// P, X and CC bits recovered
    pub bits_recovery: u8,
    /// Marker and payload type recovered
    pub marker_pt_recovery: u8,
    pub sequence_base: u16,
    pub timestamp_recovery: u32,
    pub length_recovery: u16,
    /// Bit 47 protects `sequence_base`, bit 46 the next packet and so on
    pub mask: u64,
    pub long_mask: bool,
    pub payload: Bytes,
}

impl FecPacket {
    pub fn parse(data: &[u8]) -> TransportResult<Self> {
        if data.len() < FEC_HEADER_SIZE + ULP_HEADER_SIZE_SHORT {
            return Err(TransportError::InvalidPacket(format!(
                "FEC packet too short: {} bytes",
                data.len()
            )));
        }
        let mut buf = data;
        let first = buf.get_u8();
        let long_mask = first & 0x40 != 0;
        let marker_pt_recovery = buf.get_u8();
        let sequence_base = buf.get_u16();
        let timestamp_recovery = buf.get_u32();
        let length_recovery = buf.get_u16();

        let ulp_len = if long_mask {
            ULP_HEADER_SIZE_LONG
        } else {
            ULP_HEADER_SIZE_SHORT
        };
        if buf.len() < ulp_len {
            return Err(TransportError::InvalidPacket(
                "FEC level header truncated".to_string(),
            ));
        }
        let protection_length = usize::from(buf.get_u16());
        let mask = if long_mask {
            (u64::from(buf.get_u16()) << 32 | u64::from(buf.get_u32())) & 0xFFFF_FFFF_FFFF
        } else {
            u64::from(buf.get_u16()) << 32
        };
        if buf.len() < protection_length {
            return Err(TransportError::InvalidPacket(format!(
                "FEC protection length {} exceeds payload {}",
                protection_length,
                buf.len()
            )));
        }
        Ok(Self {
            bits_recovery: first & 0x3F,
            marker_pt_recovery,
            sequence_base,
            timestamp_recovery,
            length_recovery,
            mask,
            long_mask,
            payload: Bytes::copy_from_slice(&buf[..protection_length]),
        })
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            FEC_HEADER_SIZE + ULP_HEADER_SIZE_LONG + self.payload.len(),
        );
        let l_bit = if self.long_mask { 0x40 } else { 0 };
        buf.put_u8(l_bit | (self.bits_recovery & 0x3F));
        buf.put_u8(self.marker_pt_recovery);
        buf.put_u16(self.sequence_base);
        buf.put_u32(self.timestamp_recovery);
        buf.put_u16(self.length_recovery);
        buf.put_u16(self.payload.len() as u16);
        if self.long_mask {
            buf.put_u16((self.mask >> 32) as u16);
            buf.put_u32(self.mask as u32);
        } else {
            buf.put_u16((self.mask >> 32) as u16);
        }
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Sequence numbers this packet protects
    pub fn protected_sequences(&self) -> Vec<u16> {
        (0..MAX_MEDIA_PACKETS)
            .filter(|&i| self.protects_offset(i))
            .map(|i| self.sequence_base.wrapping_add(i as u16))
            .collect()
    }

    fn protects_offset(&self, offset: usize) -> bool {
        offset < MAX_MEDIA_PACKETS && (self.mask >> (47 - offset)) & 1 == 1
    }
}

/// Number of FEC packets for `media_packets` at a protection factor out of 255
pub fn fec_packet_count(media_packets: usize, protection_factor: u8) -> usize {
    if protection_factor == 0 || media_packets == 0 {
        return 0;
    }
    let count = (media_packets * usize::from(protection_factor) + (1 << 7)) >> 8;
    count.clamp(1, media_packets)
}

/// Builds ULPFEC packets for one frame
#[derive(Debug, Default)]
pub struct FecEncoder {
    packets_generated: u64,
}

impl FecEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate parity for the serialized media packets of one frame
    ///
    /// Packets are interleaved across the FEC packets. With unequal
    /// protection every FEC packet also covers the first media packet.
    pub fn generate(
        &mut self,
        media_packets: &[Bytes],
        protection_factor: u8,
        use_uep: bool,
    ) -> TransportResult<Vec<FecPacket>> {
        if media_packets.len() > MAX_MEDIA_PACKETS {
            return Err(TransportError::InvalidPacket(format!(
                "{} media packets exceed the FEC mask",
                media_packets.len()
            )));
        }
        if let Some(short) = media_packets.iter().find(|p| p.len() < RTP_FIXED_HEADER) {
            return Err(TransportError::InvalidPacket(format!(
                "media packet of {} bytes",
                short.len()
            )));
        }
        let count = fec_packet_count(media_packets.len(), protection_factor);
        if count == 0 {
            return Ok(Vec::new());
        }

        let sequence_base = u16::from_be_bytes([media_packets[0][2], media_packets[0][3]]);
        let long_mask = media_packets.len() > SHORT_MASK_PACKETS;

        let mut fec_packets = Vec::with_capacity(count);
        for fec_index in 0..count {
            let protected: Vec<usize> = (0..media_packets.len())
                .filter(|&i| i % count == fec_index || (use_uep && i == 0))
                .collect();

            let mut mask = 0u64;
            let mut bits = 0u8;
            let mut marker_pt = 0u8;
            let mut timestamp = 0u32;
            let mut length = 0u16;
            let mut payload: Vec<u8> = Vec::new();
            for &i in &protected {
                let media = &media_packets[i];
                mask |= 1 << (47 - i);
                bits ^= media[0] & 0x3F;
                marker_pt ^= media[1];
                timestamp ^= u32::from_be_bytes([media[4], media[5], media[6], media[7]]);
                length ^= (media.len() - RTP_FIXED_HEADER) as u16;
                xor_into(&mut payload, &media[RTP_FIXED_HEADER..]);
            }
            fec_packets.push(FecPacket {
                bits_recovery: bits,
                marker_pt_recovery: marker_pt,
                sequence_base,
                timestamp_recovery: timestamp,
                length_recovery: length,
                mask,
                long_mask,
                payload: Bytes::from(payload),
            });
        }
        self.packets_generated += fec_packets.len() as u64;
        trace!(
            media = media_packets.len(),
            fec = fec_packets.len(),
            "Generated FEC packets"
        );
        Ok(fec_packets)
    }

    pub fn packets_generated(&self) -> u64 {
        self.packets_generated
    }
}

fn xor_into(acc: &mut Vec<u8>, data: &[u8]) {
    if data.len() > acc.len() {
        acc.resize(data.len(), 0);
    }
    for (a, b) in acc.iter_mut().zip(data) {
        *a ^= b;
    }
}

/// One block of a RED payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedBlock {
    pub payload_type: u8,
    pub data: Bytes,
}

/// Prefix a payload with a single primary RED header
pub fn red_encapsulate(payload_type: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.put_u8(payload_type & 0x7F);
    buf.put_slice(payload);
    buf.freeze()
}

/// Split a RED payload into its blocks
///
/// Supports the primary-only form and one redundant block with a zero
/// timestamp offset followed by the primary block.
pub fn parse_red(payload: &[u8]) -> TransportResult<Vec<RedBlock>> {
    let Some(&first) = payload.first() else {
        return Err(TransportError::InvalidPacket("empty RED payload".to_string()));
    };
    if first & 0x80 == 0 {
        return Ok(vec![RedBlock {
            payload_type: first & 0x7F,
            data: Bytes::copy_from_slice(&payload[1..]),
        }]);
    }
    if payload.len() < 5 {
        return Err(TransportError::InvalidPacket(
            "RED header truncated".to_string(),
        ));
    }
    let timestamp_offset = (u16::from(payload[1]) << 8 | u16::from(payload[2])) >> 2;
    if timestamp_offset != 0 {
        return Err(TransportError::InvalidPacket(format!(
            "RED timestamp offset {} not supported",
            timestamp_offset
        )));
    }
    if payload[4] & 0x80 != 0 {
        return Err(TransportError::InvalidPacket(
            "more than two RED blocks".to_string(),
        ));
    }
    let block_length = usize::from(payload[2] & 0x03) << 8 | usize::from(payload[3]);
    let body = &payload[5..];
    if block_length > body.len() {
        return Err(TransportError::InvalidPacket(format!(
            "RED block length {} exceeds payload {}",
            block_length,
            body.len()
        )));
    }
    Ok(vec![
        RedBlock {
            payload_type: first & 0x7F,
            data: Bytes::copy_from_slice(&body[..block_length]),
        },
        RedBlock {
            payload_type: payload[4] & 0x7F,
            data: Bytes::copy_from_slice(&body[block_length..]),
        },
    ])
}

#[derive(Debug)]
struct StoredFec {
    ssrc: u32,
    packet: FecPacket,
    received_ms: i64,
}

/// Receive-side recovery state
#[derive(Debug)]
pub struct FecDecoder {
    /// Serialized media packets by sequence number
    media: BTreeMap<u16, (Bytes, i64)>,
    fec: Vec<StoredFec>,
    timeout_ms: i64,
    recovered_total: u64,
}

impl FecDecoder {
    pub fn new(timeout_ms: u32) -> Self {
        Self {
            media: BTreeMap::new(),
            fec: Vec::new(),
            timeout_ms: i64::from(timeout_ms),
            recovered_total: 0,
        }
    }

    /// Remember a received (or recovered) media packet
    pub fn add_media_packet(&mut self, sequence_number: u16, packet: Bytes, now_ms: i64) {
        self.media.insert(sequence_number, (packet, now_ms));
        if self.media.len() > MAX_STORED_MEDIA {
            // Evict the packet furthest behind the newest one
            let newest = sequence_number;
            if let Some(&oldest) = self
                .media
                .keys()
                .max_by_key(|&&seq| i32::from(newest.wrapping_sub(seq)))
            {
                self.media.remove(&oldest);
            }
        }
    }

    pub fn add_fec_packet(&mut self, ssrc: u32, packet: FecPacket, now_ms: i64) {
        self.fec.push(StoredFec {
            ssrc,
            packet,
            received_ms: now_ms,
        });
    }

    /// Recover whatever the stored parity allows; returns serialized RTP packets
    pub fn recover(&mut self, now_ms: i64) -> Vec<Bytes> {
        self.purge(now_ms);
        let mut recovered = Vec::new();
        loop {
            let mut progress = false;
            let mut index = 0;
            while index < self.fec.len() {
                let protected = self.fec[index].packet.protected_sequences();
                let missing: Vec<u16> = protected
                    .iter()
                    .copied()
                    .filter(|seq| !self.media.contains_key(seq))
                    .collect();
                match missing.as_slice() {
                    [] => {
                        // Everything arrived, parity no longer needed
                        self.fec.swap_remove(index);
                    }
                    [seq] => {
                        let stored = self.fec.swap_remove(index);
                        match self.recover_one(&stored, &protected, *seq) {
                            Some(packet) => {
                                debug!(seq = *seq, "Recovered packet through FEC");
                                self.media.insert(*seq, (packet.clone(), now_ms));
                                recovered.push(packet);
                                self.recovered_total += 1;
                                progress = true;
                            }
                            None => trace!(seq = *seq, "FEC recovery failed"),
                        }
                    }
                    _ => index += 1,
                }
            }
            if !progress {
                break;
            }
        }
        recovered
    }

    fn recover_one(&self, stored: &StoredFec, protected: &[u16], missing: u16) -> Option<Bytes> {
        let fec = &stored.packet;
        let mut bits = fec.bits_recovery;
        let mut marker_pt = fec.marker_pt_recovery;
        let mut timestamp = fec.timestamp_recovery;
        let mut length = fec.length_recovery;
        let mut payload = fec.payload.to_vec();

        for seq in protected.iter().filter(|&&s| s != missing) {
            let (media, _) = self.media.get(seq)?;
            if media.len() < RTP_FIXED_HEADER {
                return None;
            }
            bits ^= media[0] & 0x3F;
            marker_pt ^= media[1];
            timestamp ^= u32::from_be_bytes([media[4], media[5], media[6], media[7]]);
            length ^= (media.len() - RTP_FIXED_HEADER) as u16;
            xor_into(&mut payload, &media[RTP_FIXED_HEADER..]);
        }
        let length = usize::from(length);
        if length > payload.len() {
            return None;
        }

        let mut buf = BytesMut::with_capacity(RTP_FIXED_HEADER + length);
        buf.put_u8(0x80 | (bits & 0x3F));
        buf.put_u8(marker_pt);
        buf.put_u16(missing);
        buf.put_u32(timestamp);
        buf.put_u32(stored.ssrc);
        buf.put_slice(&payload[..length]);
        Some(buf.freeze())
    }

    fn purge(&mut self, now_ms: i64) {
        let timeout_ms = self.timeout_ms;
        self.fec.retain(|f| now_ms - f.received_ms <= timeout_ms);
        self.media.retain(|_, (_, t)| now_ms - *t <= timeout_ms);
        // Parity far behind the newest media can never help
        if let Some(newest) = self.media.keys().copied().reduce(|a, b| {
            if sequence_number_diff(b, a) > 0 {
                b
            } else {
                a
            }
        }) {
            self.fec.retain(|f| {
                sequence_number_diff(newest, f.packet.sequence_base) < MAX_STORED_MEDIA as i32
            });
        }
    }

    pub fn pending_fec_packets(&self) -> usize {
        self.fec.len()
    }

    pub fn recovered_total(&self) -> u64 {
        self.recovered_total
    }

    pub fn reset(&mut self) {
        self.media.clear();
        self.fec.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp_handler::RtpPacket;

    fn media_packet(seq: u16, marker: bool, payload: &[u8]) -> Bytes {
        let mut packet = RtpPacket {
            header: crate::rtp_handler::RtpHeader::new(96, seq, 3000, 0xABCD),
            payload: Bytes::copy_from_slice(payload),
            padding_len: 0,
        };
        packet.header.marker = marker;
        packet.serialize().freeze()
    }

    #[test]
    fn test_packet_count_rounding() {
        assert_eq!(fec_packet_count(5, 0), 0);
        assert_eq!(fec_packet_count(1, 10), 1);
        assert_eq!(fec_packet_count(10, 128), 5);
        assert_eq!(fec_packet_count(4, 255), 4);
    }

    #[test]
    fn test_fec_packet_serialization() {
        let mut encoder = FecEncoder::new();
        let media: Vec<Bytes> = (0..3).map(|i| media_packet(100 + i, i == 2, &[i as u8; 20])).collect();
        let fec = encoder.generate(&media, 255, false).unwrap();
        assert_eq!(fec.len(), 3);
        let parsed = FecPacket::parse(&fec[1].serialize()).unwrap();
        assert_eq!(parsed, fec[1]);
        assert_eq!(parsed.protected_sequences(), vec![101]);
        assert_eq!(encoder.packets_generated(), 3);
    }

    #[test]
    fn test_recovers_single_loss() {
        let mut encoder = FecEncoder::new();
        let media = vec![
            media_packet(65534, false, b"first packet"),
            media_packet(65535, false, b"second, longer packet"),
            media_packet(0, true, b"last"),
        ];
        let fec = encoder.generate(&media, 85, false).unwrap();
        assert_eq!(fec.len(), 1);
        assert_eq!(fec[0].protected_sequences(), vec![65534, 65535, 0]);

        let mut decoder = FecDecoder::new(30_000);
        decoder.add_media_packet(65534, media[0].clone(), 0);
        decoder.add_media_packet(0, media[2].clone(), 0);
        decoder.add_fec_packet(0xABCD, fec[0].clone(), 0);

        let recovered = decoder.recover(10);
        assert_eq!(recovered, vec![media[1].clone()]);
        assert_eq!(decoder.pending_fec_packets(), 0);
        assert_eq!(decoder.recovered_total(), 1);
    }

    #[test]
    fn test_two_losses_under_one_parity_not_recovered() {
        let mut encoder = FecEncoder::new();
        let media: Vec<Bytes> = (0..3).map(|i| media_packet(i, false, &[7; 8])).collect();
        let fec = encoder.generate(&media, 85, false).unwrap();

        let mut decoder = FecDecoder::new(30_000);
        decoder.add_media_packet(0, media[0].clone(), 0);
        decoder.add_fec_packet(0xABCD, fec[0].clone(), 0);
        assert!(decoder.recover(0).is_empty());
        assert_eq!(decoder.pending_fec_packets(), 1);

        // Stale parity is dropped
        assert!(decoder.recover(30_001).is_empty());
        assert_eq!(decoder.pending_fec_packets(), 0);
    }

    #[test]
    fn test_uep_protects_first_packet_everywhere() {
        let mut encoder = FecEncoder::new();
        let media: Vec<Bytes> = (0..4).map(|i| media_packet(i, false, &[i as u8; 4])).collect();
        let fec = encoder.generate(&media, 128, true).unwrap();
        assert_eq!(fec.len(), 2);
        assert_eq!(fec[0].protected_sequences(), vec![0, 2]);
        assert_eq!(fec[1].protected_sequences(), vec![0, 1, 3]);
    }

    #[test]
    fn test_long_mask_above_sixteen_packets() {
        let mut encoder = FecEncoder::new();
        let media: Vec<Bytes> = (0..20).map(|i| media_packet(i, false, &[1; 4])).collect();
        let fec = encoder.generate(&media, 13, false).unwrap();
        assert_eq!(fec.len(), 1);
        assert!(fec[0].long_mask);
        let parsed = FecPacket::parse(&fec[0].serialize()).unwrap();
        assert_eq!(parsed.protected_sequences().len(), 20);
    }

    #[test]
    fn test_red_round_trip_and_two_blocks() {
        let red = red_encapsulate(96, b"abc");
        assert_eq!(
            parse_red(&red).unwrap(),
            vec![RedBlock {
                payload_type: 96,
                data: Bytes::from_static(b"abc"),
            }]
        );

        // Redundant media block of 2 bytes, then an FEC primary block
        let two = [0x80 | 96, 0x00, 0x00, 0x02, 97, b'x', b'y', 9, 9];
        let blocks = parse_red(&two).unwrap();
        assert_eq!(blocks[0].data, Bytes::from_static(b"xy"));
        assert_eq!(blocks[1].payload_type, 97);
        assert_eq!(blocks[1].data.len(), 2);

        assert!(parse_red(&[]).is_err());
        assert!(parse_red(&[0x80 | 96, 0x04, 0x00, 0x02, 97]).is_err());
    }
}
