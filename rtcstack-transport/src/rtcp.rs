//! RTCP wire format: compound packets, reports and feedback messages
//!
//! Covers RFC 3550 (SR, RR, SDES, BYE, APP), RFC 4585 (NACK, PLI, SLI, RPSI),
//! RFC 5104 (FIR, TMMBR, TMMBN), RFC 3611 VoIP metrics and the REMB
//! application-layer feedback message.
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

/// Longest CNAME that fits the 256-byte SDES field
pub const MAX_CNAME_LEN: usize = 255;

/// Report blocks that fit the 5-bit count field
pub const MAX_REPORT_BLOCKS: usize = 31;

/// RTPFB format: generic NACK
pub const RTPFB_NACK: u8 = 1;
/// RTPFB format: TMMBR
pub const RTPFB_TMMBR: u8 = 3;
/// RTPFB format: TMMBN
pub const RTPFB_TMMBN: u8 = 4;
/// PSFB format: picture loss indication
pub const PSFB_PLI: u8 = 1;
/// PSFB format: slice loss indication
pub const PSFB_SLI: u8 = 2;
/// PSFB format: reference picture selection indication
pub const PSFB_RPSI: u8 = 3;
/// PSFB format: full intra request
pub const PSFB_FIR: u8 = 4;
/// PSFB format: application layer feedback (REMB)
pub const PSFB_AFB: u8 = 15;
/// XR block type: VoIP metrics
pub const XR_VOIP_METRICS: u8 = 7;

const REMB_NAME: &[u8; 4] = b"REMB";
const SDES_CNAME: u8 = 1;

/// RTCP packet types (RFC 3550 Section 6, RFC 4585, RFC 3611)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpPacketType {
    /// Sender Report (SR) - 200
    SenderReport = 200,
    /// Receiver Report (RR) - 201
    ReceiverReport = 201,
    /// Source Description (SDES) - 202
    SourceDescription = 202,
    /// Goodbye (BYE) - 203
    Goodbye = 203,
    /// Application Defined (APP) - 204
    ApplicationDefined = 204,
    /// Transport layer feedback (RTPFB) - 205
    TransportFeedback = 205,
    /// Payload specific feedback (PSFB) - 206
    PayloadFeedback = 206,
    /// Extended report (XR) - 207
    ExtendedReport = 207,
}

impl TryFrom<u8> for RtcpPacketType {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            200 => RtcpPacketType::SenderReport,
            201 => RtcpPacketType::ReceiverReport,
            202 => RtcpPacketType::SourceDescription,
            203 => RtcpPacketType::Goodbye,
            204 => RtcpPacketType::ApplicationDefined,
            205 => RtcpPacketType::TransportFeedback,
            206 => RtcpPacketType::PayloadFeedback,
            207 => RtcpPacketType::ExtendedReport,
            other => {
                return Err(TransportError::RtcpParseError(format!(
                    "Unknown RTCP packet type: {}",
                    other
                )))
            }
        })
    }
}

/// RTCP packet header (RFC 3550 Section 6.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpHeader {
    /// Version (must be 2)
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Report count, source count, subtype or feedback format
    pub count: u8,
    /// Raw packet type byte
    pub packet_type: u8,
    /// Length in 32-bit words minus 1
    pub length: u16,
}

impl RtcpHeader {
    pub const SIZE: usize = 4;

    pub fn parse(data: &[u8]) -> TransportResult<Self> {
        if data.len() < Self::SIZE {
            return Err(TransportError::RtcpParseError(
                "RTCP header too short".to_string(),
            ));
        }
        let version = data[0] >> 6;
        if version != 2 {
            return Err(TransportError::RtcpParseError(format!(
                "Invalid RTCP version: {}",
                version
            )));
        }
        Ok(Self {
            version,
            padding: data[0] & 0x20 != 0,
            count: data[0] & 0x1F,
            packet_type: data[1],
            length: u16::from_be_bytes([data[2], data[3]]),
        })
    }

    /// Total packet size in bytes, header included
    pub fn packet_size(&self) -> usize {
        (self.length as usize + 1) * 4
    }
}

/// Sender information block of an SR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SenderInfo {
    /// NTP timestamp, most significant word
    pub ntp_seconds: u32,
    /// NTP timestamp, least significant word
    pub ntp_fraction: u32,
    pub rtp_timestamp: u32,
    /// Sender's packet count
    pub packet_count: u32,
    /// Sender's payload octet count
    pub octet_count: u32,
}

/// Reception report block (RFC 3550 Section 6.4.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportBlock {
    /// SSRC of the source this block reports on
    pub ssrc: u32,
    /// Fraction lost since the previous report (0-255 scale)
    pub fraction_lost: u8,
    /// Cumulative number of packets lost (24 bits, signed)
    pub cumulative_lost: i32,
    /// Extended highest sequence number received
    pub extended_highest_sequence: u32,
    /// Interarrival jitter in RTP timestamp units
    pub jitter: u32,
    /// Last SR timestamp (LSR, compact NTP)
    pub last_sr: u32,
    /// Delay since last SR (DLSR, 1/65536 s)
    pub delay_since_last_sr: u32,
}

impl ReportBlock {
    pub const SIZE: usize = 24;

    fn parse(buf: &mut &[u8]) -> Self {
        let ssrc = buf.get_u32();
        let lost_word = buf.get_u32();
        Self {
            ssrc,
            fraction_lost: (lost_word >> 24) as u8,
            // sign-extend the 24-bit field
            cumulative_lost: ((lost_word << 8) as i32) >> 8,
            extended_highest_sequence: buf.get_u32(),
            jitter: buf.get_u32(),
            last_sr: buf.get_u32(),
            delay_since_last_sr: buf.get_u32(),
        }
    }

    fn write_to(&self, buf: &mut BytesMut) {
        let lost = self.cumulative_lost.clamp(-0x80_0000, 0x7F_FFFF) as u32 & 0x00FF_FFFF;
        buf.put_u32(self.ssrc);
        buf.put_u32((u32::from(self.fraction_lost) << 24) | lost);
        buf.put_u32(self.extended_highest_sequence);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sr);
        buf.put_u32(self.delay_since_last_sr);
    }
}

/// RTCP Sender Report (RFC 3550 Section 6.4.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub sender_info: SenderInfo,
    /// Reception report blocks (0-31)
    pub report_blocks: Vec<ReportBlock>,
}

/// RTCP Receiver Report (RFC 3550 Section 6.4.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    pub ssrc: u32,
    /// Reception report blocks (0-31)
    pub report_blocks: Vec<ReportBlock>,
}

/// SDES chunk; only the CNAME item is retained
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    pub ssrc: u32,
    pub cname: String,
}

/// RTCP Goodbye (BYE) packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Goodbye {
    pub ssrcs: Vec<u32>,
    pub reason: Option<String>,
}

/// RTCP APP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationData {
    /// 5-bit subtype
    pub subtype: u8,
    pub ssrc: u32,
    /// Four ASCII characters
    pub name: [u8; 4],
    /// Opaque data, a multiple of 4 bytes
    pub data: Bytes,
}

/// Generic NACK (RFC 4585 Section 6.2.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nack {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    /// Missing sequence numbers in ascending (wrap-aware) order
    pub lost: Vec<u16>,
}

/// Picture loss indication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pli {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
}

/// Slice loss indication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sli {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    /// First lost macroblock (13 bits)
    pub first: u16,
    /// Number of lost macroblocks (13 bits)
    pub number: u16,
    /// Six least significant bits of the picture id
    pub picture_id: u8,
}

/// Reference picture selection indication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rpsi {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub payload_type: u8,
    pub picture_id: u64,
}

/// One FIR request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirEntry {
    pub ssrc: u32,
    pub sequence_number: u8,
}

/// Full intra request (RFC 5104 Section 4.3.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fir {
    pub sender_ssrc: u32,
    pub requests: Vec<FirEntry>,
}

/// One TMMBR/TMMBN tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TmmbItem {
    pub ssrc: u32,
    pub bitrate_bps: u64,
    /// Per-packet overhead in bytes (9 bits)
    pub packet_overhead: u16,
}

/// TMMBR or TMMBN body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tmmb {
    pub sender_ssrc: u32,
    pub items: Vec<TmmbItem>,
}

/// Receiver estimated maximum bitrate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remb {
    pub sender_ssrc: u32,
    pub bitrate_bps: u64,
    pub ssrcs: Vec<u32>,
}

/// VoIP metrics report block (RFC 3611 Section 4.7)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VoipMetric {
    pub ssrc: u32,
    pub loss_rate: u8,
    pub discard_rate: u8,
    pub burst_density: u8,
    pub gap_density: u8,
    pub burst_duration: u16,
    pub gap_duration: u16,
    pub round_trip_delay: u16,
    pub end_system_delay: u16,
    pub signal_level: u8,
    pub noise_level: u8,
    pub rerl: u8,
    pub gmin: u8,
    pub r_factor: u8,
    pub ext_r_factor: u8,
    pub mos_lq: u8,
    pub mos_cq: u8,
    pub rx_config: u8,
    pub jb_nominal: u16,
    pub jb_maximum: u16,
    pub jb_abs_max: u16,
}

impl VoipMetric {
    /// Block size including the 4-byte block header
    pub const BLOCK_SIZE: usize = 36;
}

/// XR packet carrying a VoIP metrics block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedReport {
    pub sender_ssrc: u32,
    pub voip_metric: VoipMetric,
}

/// One packet of a compound RTCP datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    SourceDescription(Vec<SdesChunk>),
    Goodbye(Goodbye),
    App(ApplicationData),
    Nack(Nack),
    Tmmbr(Tmmb),
    Tmmbn(Tmmb),
    Pli(Pli),
    Sli(Sli),
    Rpsi(Rpsi),
    Fir(Fir),
    Remb(Remb),
    ExtendedReport(ExtendedReport),
}

impl RtcpPacket {
    /// Append this packet, header and length included
    pub fn write_to(&self, buf: &mut BytesMut) -> TransportResult<()> {
        let start = buf.len();
        match self {
            RtcpPacket::SenderReport(sr) => {
                check_block_count(sr.report_blocks.len())?;
                put_header(buf, sr.report_blocks.len() as u8, RtcpPacketType::SenderReport);
                buf.put_u32(sr.ssrc);
                let info = &sr.sender_info;
                buf.put_u32(info.ntp_seconds);
                buf.put_u32(info.ntp_fraction);
                buf.put_u32(info.rtp_timestamp);
                buf.put_u32(info.packet_count);
                buf.put_u32(info.octet_count);
                for block in &sr.report_blocks {
                    block.write_to(buf);
                }
            }
            RtcpPacket::ReceiverReport(rr) => {
                check_block_count(rr.report_blocks.len())?;
                put_header(buf, rr.report_blocks.len() as u8, RtcpPacketType::ReceiverReport);
                buf.put_u32(rr.ssrc);
                for block in &rr.report_blocks {
                    block.write_to(buf);
                }
            }
            RtcpPacket::SourceDescription(chunks) => {
                if chunks.len() > MAX_REPORT_BLOCKS {
                    return Err(TransportError::InvalidPacket(
                        "too many SDES chunks".to_string(),
                    ));
                }
                put_header(buf, chunks.len() as u8, RtcpPacketType::SourceDescription);
                for chunk in chunks {
                    if chunk.cname.len() > MAX_CNAME_LEN {
                        return Err(TransportError::InvalidPacket(format!(
                            "CNAME of {} bytes exceeds {}",
                            chunk.cname.len(),
                            MAX_CNAME_LEN
                        )));
                    }
                    let chunk_start = buf.len();
                    buf.put_u32(chunk.ssrc);
                    buf.put_u8(SDES_CNAME);
                    buf.put_u8(chunk.cname.len() as u8);
                    buf.put_slice(chunk.cname.as_bytes());
                    // end-of-items marker, then pad to a word boundary
                    let used = buf.len() - chunk_start;
                    buf.put_bytes(0, 4 - used % 4);
                }
            }
            RtcpPacket::Goodbye(bye) => {
                if bye.ssrcs.len() > MAX_REPORT_BLOCKS {
                    return Err(TransportError::InvalidPacket(
                        "too many BYE sources".to_string(),
                    ));
                }
                put_header(buf, bye.ssrcs.len() as u8, RtcpPacketType::Goodbye);
                for &ssrc in &bye.ssrcs {
                    buf.put_u32(ssrc);
                }
                if let Some(ref reason) = bye.reason {
                    let reason = &reason.as_bytes()[..reason.len().min(255)];
                    buf.put_u8(reason.len() as u8);
                    buf.put_slice(reason);
                    buf.put_bytes(0, (4 - (reason.len() + 1) % 4) % 4);
                }
            }
            RtcpPacket::App(app) => {
                if app.data.len() % 4 != 0 {
                    return Err(TransportError::InvalidPacket(format!(
                        "APP data length {} is not a multiple of 4",
                        app.data.len()
                    )));
                }
                put_header(buf, app.subtype & 0x1F, RtcpPacketType::ApplicationDefined);
                buf.put_u32(app.ssrc);
                buf.put_slice(&app.name);
                buf.put_slice(&app.data);
            }
            RtcpPacket::Nack(nack) => {
                put_header(buf, RTPFB_NACK, RtcpPacketType::TransportFeedback);
                buf.put_u32(nack.sender_ssrc);
                buf.put_u32(nack.media_ssrc);
                for (pid, blp) in pack_nack_pairs(&nack.lost) {
                    buf.put_u16(pid);
                    buf.put_u16(blp);
                }
            }
            RtcpPacket::Tmmbr(tmmb) | RtcpPacket::Tmmbn(tmmb) => {
                let fmt = if matches!(self, RtcpPacket::Tmmbr(_)) {
                    RTPFB_TMMBR
                } else {
                    RTPFB_TMMBN
                };
                put_header(buf, fmt, RtcpPacketType::TransportFeedback);
                buf.put_u32(tmmb.sender_ssrc);
                buf.put_u32(0);
                for item in &tmmb.items {
                    let (exp, mantissa) = encode_exp_mantissa(item.bitrate_bps, 17);
                    buf.put_u32(item.ssrc);
                    buf.put_u32(
                        (u32::from(exp) << 26)
                            | (mantissa << 9)
                            | u32::from(item.packet_overhead & 0x1FF),
                    );
                }
            }
            RtcpPacket::Pli(pli) => {
                put_header(buf, PSFB_PLI, RtcpPacketType::PayloadFeedback);
                buf.put_u32(pli.sender_ssrc);
                buf.put_u32(pli.media_ssrc);
            }
            RtcpPacket::Sli(sli) => {
                put_header(buf, PSFB_SLI, RtcpPacketType::PayloadFeedback);
                buf.put_u32(sli.sender_ssrc);
                buf.put_u32(sli.media_ssrc);
                buf.put_u32(
                    (u32::from(sli.first & 0x1FFF) << 19)
                        | (u32::from(sli.number & 0x1FFF) << 6)
                        | u32::from(sli.picture_id & 0x3F),
                );
            }
            RtcpPacket::Rpsi(rpsi) => {
                put_header(buf, PSFB_RPSI, RtcpPacketType::PayloadFeedback);
                buf.put_u32(rpsi.sender_ssrc);
                buf.put_u32(rpsi.media_ssrc);
                let bit_string = encode_picture_id(rpsi.picture_id);
                let padding_bytes = (4 - (2 + bit_string.len()) % 4) % 4;
                buf.put_u8((padding_bytes * 8) as u8);
                buf.put_u8(rpsi.payload_type & 0x7F);
                buf.put_slice(&bit_string);
                buf.put_bytes(0, padding_bytes);
            }
            RtcpPacket::Fir(fir) => {
                put_header(buf, PSFB_FIR, RtcpPacketType::PayloadFeedback);
                buf.put_u32(fir.sender_ssrc);
                buf.put_u32(0);
                for entry in &fir.requests {
                    buf.put_u32(entry.ssrc);
                    buf.put_u8(entry.sequence_number);
                    buf.put_bytes(0, 3);
                }
            }
            RtcpPacket::Remb(remb) => {
                if remb.ssrcs.len() > u8::MAX as usize {
                    return Err(TransportError::InvalidPacket(
                        "too many REMB SSRCs".to_string(),
                    ));
                }
                put_header(buf, PSFB_AFB, RtcpPacketType::PayloadFeedback);
                buf.put_u32(remb.sender_ssrc);
                buf.put_u32(0);
                buf.put_slice(REMB_NAME);
                let (exp, mantissa) = encode_exp_mantissa(remb.bitrate_bps, 18);
                buf.put_u8(remb.ssrcs.len() as u8);
                buf.put_u8((exp << 2) | (mantissa >> 16) as u8);
                buf.put_u16(mantissa as u16);
                for &ssrc in &remb.ssrcs {
                    buf.put_u32(ssrc);
                }
            }
            RtcpPacket::ExtendedReport(xr) => {
                put_header(buf, 0, RtcpPacketType::ExtendedReport);
                buf.put_u32(xr.sender_ssrc);
                let m = &xr.voip_metric;
                buf.put_u8(XR_VOIP_METRICS);
                buf.put_u8(0);
                buf.put_u16((VoipMetric::BLOCK_SIZE / 4 - 1) as u16);
                buf.put_u32(m.ssrc);
                buf.put_slice(&[m.loss_rate, m.discard_rate, m.burst_density, m.gap_density]);
                buf.put_u16(m.burst_duration);
                buf.put_u16(m.gap_duration);
                buf.put_u16(m.round_trip_delay);
                buf.put_u16(m.end_system_delay);
                buf.put_slice(&[m.signal_level, m.noise_level, m.rerl, m.gmin]);
                buf.put_slice(&[m.r_factor, m.ext_r_factor, m.mos_lq, m.mos_cq]);
                buf.put_u8(m.rx_config);
                buf.put_u8(0);
                buf.put_u16(m.jb_nominal);
                buf.put_u16(m.jb_maximum);
                buf.put_u16(m.jb_abs_max);
            }
        }
        patch_length(buf, start);
        Ok(())
    }

    pub fn serialize(&self) -> TransportResult<BytesMut> {
        let mut buf = BytesMut::new();
        self.write_to(&mut buf)?;
        Ok(buf)
    }
}

/// Serialize packets back to back into one compound datagram
pub fn serialize_compound(packets: &[RtcpPacket]) -> TransportResult<Bytes> {
    let mut buf = BytesMut::with_capacity(256);
    for packet in packets {
        packet.write_to(&mut buf)?;
    }
    Ok(buf.freeze())
}

/// Parse every packet of a (possibly compound) RTCP datagram
///
/// Packet types and feedback formats this stack does not act on are skipped.
pub fn parse_compound(data: &[u8]) -> TransportResult<Vec<RtcpPacket>> {
    let mut packets = Vec::new();
    let mut rest = data;
    if rest.is_empty() {
        return Err(TransportError::RtcpParseError("empty RTCP datagram".to_string()));
    }
    while !rest.is_empty() {
        let header = RtcpHeader::parse(rest)?;
        let size = header.packet_size();
        if rest.len() < size {
            return Err(TransportError::RtcpParseError(format!(
                "RTCP packet claims {} bytes, {} available",
                size,
                rest.len()
            )));
        }
        let mut body = &rest[RtcpHeader::SIZE..size];
        if header.padding {
            let pad = body.last().copied().unwrap_or(0) as usize;
            if pad == 0 || pad > body.len() {
                return Err(TransportError::RtcpParseError(format!(
                    "invalid RTCP padding: {}",
                    pad
                )));
            }
            body = &body[..body.len() - pad];
        }
        if let Some(packet) = parse_packet(&header, body)? {
            packets.push(packet);
        }
        rest = &rest[size..];
    }
    Ok(packets)
}

/// Quick check for demultiplexing RTP and RTCP on one port (RFC 5761)
pub fn is_rtcp(data: &[u8]) -> bool {
    data.len() >= RtcpHeader::SIZE
        && data[0] >> 6 == 2
        && (192..=223).contains(&data[1])
}

fn parse_packet(header: &RtcpHeader, body: &[u8]) -> TransportResult<Option<RtcpPacket>> {
    let Ok(packet_type) = RtcpPacketType::try_from(header.packet_type) else {
        return Ok(None);
    };
    let mut buf = body;
    let short = |what: &str| TransportError::RtcpParseError(format!("truncated {}", what));

    let packet = match packet_type {
        RtcpPacketType::SenderReport => {
            if buf.remaining() < 24 + header.count as usize * ReportBlock::SIZE {
                return Err(short("sender report"));
            }
            let ssrc = buf.get_u32();
            let sender_info = SenderInfo {
                ntp_seconds: buf.get_u32(),
                ntp_fraction: buf.get_u32(),
                rtp_timestamp: buf.get_u32(),
                packet_count: buf.get_u32(),
                octet_count: buf.get_u32(),
            };
            let report_blocks = (0..header.count)
                .map(|_| ReportBlock::parse(&mut buf))
                .collect();
            RtcpPacket::SenderReport(SenderReport {
                ssrc,
                sender_info,
                report_blocks,
            })
        }
        RtcpPacketType::ReceiverReport => {
            if buf.remaining() < 4 + header.count as usize * ReportBlock::SIZE {
                return Err(short("receiver report"));
            }
            let ssrc = buf.get_u32();
            let report_blocks = (0..header.count)
                .map(|_| ReportBlock::parse(&mut buf))
                .collect();
            RtcpPacket::ReceiverReport(ReceiverReport { ssrc, report_blocks })
        }
        RtcpPacketType::SourceDescription => {
            RtcpPacket::SourceDescription(parse_sdes(header.count, body)?)
        }
        RtcpPacketType::Goodbye => {
            if buf.remaining() < header.count as usize * 4 {
                return Err(short("BYE"));
            }
            let ssrcs = (0..header.count).map(|_| buf.get_u32()).collect();
            let reason = match buf.first() {
                Some(&len) if len > 0 && buf.len() > len as usize => Some(
                    String::from_utf8_lossy(&buf[1..1 + len as usize]).into_owned(),
                ),
                _ => None,
            };
            RtcpPacket::Goodbye(Goodbye { ssrcs, reason })
        }
        RtcpPacketType::ApplicationDefined => {
            if buf.remaining() < 8 {
                return Err(short("APP"));
            }
            let ssrc = buf.get_u32();
            let mut name = [0u8; 4];
            buf.copy_to_slice(&mut name);
            RtcpPacket::App(ApplicationData {
                subtype: header.count,
                ssrc,
                name,
                data: Bytes::copy_from_slice(buf),
            })
        }
        RtcpPacketType::TransportFeedback => {
            if buf.remaining() < 8 {
                return Err(short("RTPFB"));
            }
            let sender_ssrc = buf.get_u32();
            let media_ssrc = buf.get_u32();
            match header.count {
                RTPFB_NACK => {
                    let mut pairs = Vec::with_capacity(buf.len() / 4);
                    while buf.remaining() >= 4 {
                        pairs.push((buf.get_u16(), buf.get_u16()));
                    }
                    RtcpPacket::Nack(Nack {
                        sender_ssrc,
                        media_ssrc,
                        lost: unpack_nack_pairs(&pairs),
                    })
                }
                RTPFB_TMMBR | RTPFB_TMMBN => {
                    let mut items = Vec::with_capacity(buf.len() / 8);
                    while buf.remaining() >= 8 {
                        let ssrc = buf.get_u32();
                        let word = buf.get_u32();
                        let exp = word >> 26;
                        let mantissa = u64::from((word >> 9) & 0x1FFFF);
                        items.push(TmmbItem {
                            ssrc,
                            bitrate_bps: mantissa.checked_shl(exp).unwrap_or(u64::MAX),
                            packet_overhead: (word & 0x1FF) as u16,
                        });
                    }
                    let tmmb = Tmmb { sender_ssrc, items };
                    if header.count == RTPFB_TMMBR {
                        RtcpPacket::Tmmbr(tmmb)
                    } else {
                        RtcpPacket::Tmmbn(tmmb)
                    }
                }
                _ => return Ok(None),
            }
        }
        RtcpPacketType::PayloadFeedback => {
            if buf.remaining() < 8 {
                return Err(short("PSFB"));
            }
            let sender_ssrc = buf.get_u32();
            let media_ssrc = buf.get_u32();
            match header.count {
                PSFB_PLI => RtcpPacket::Pli(Pli {
                    sender_ssrc,
                    media_ssrc,
                }),
                PSFB_SLI => {
                    if buf.remaining() < 4 {
                        return Err(short("SLI"));
                    }
                    let word = buf.get_u32();
                    RtcpPacket::Sli(Sli {
                        sender_ssrc,
                        media_ssrc,
                        first: (word >> 19) as u16,
                        number: ((word >> 6) & 0x1FFF) as u16,
                        picture_id: (word & 0x3F) as u8,
                    })
                }
                PSFB_RPSI => {
                    if buf.remaining() < 4 {
                        return Err(short("RPSI"));
                    }
                    let padding_bits = buf.get_u8() as usize;
                    let payload_type = buf.get_u8() & 0x7F;
                    let bit_string_len = buf.len().saturating_sub(padding_bits / 8);
                    let picture_id = decode_picture_id(&buf[..bit_string_len]);
                    RtcpPacket::Rpsi(Rpsi {
                        sender_ssrc,
                        media_ssrc,
                        payload_type,
                        picture_id,
                    })
                }
                PSFB_FIR => {
                    let mut requests = Vec::with_capacity(buf.len() / 8);
                    while buf.remaining() >= 8 {
                        let ssrc = buf.get_u32();
                        let sequence_number = buf.get_u8();
                        buf.advance(3);
                        requests.push(FirEntry {
                            ssrc,
                            sequence_number,
                        });
                    }
                    RtcpPacket::Fir(Fir {
                        sender_ssrc,
                        requests,
                    })
                }
                PSFB_AFB => {
                    if buf.remaining() < 8 || &buf[..4] != REMB_NAME {
                        return Ok(None);
                    }
                    buf.advance(4);
                    let num_ssrcs = buf.get_u8() as usize;
                    let exp_byte = buf.get_u8();
                    let exp = u32::from(exp_byte >> 2);
                    let mantissa = (u64::from(exp_byte & 0x03) << 16) | u64::from(buf.get_u16());
                    if buf.remaining() < num_ssrcs * 4 {
                        return Err(short("REMB"));
                    }
                    let ssrcs = (0..num_ssrcs).map(|_| buf.get_u32()).collect();
                    RtcpPacket::Remb(Remb {
                        sender_ssrc,
                        bitrate_bps: mantissa.checked_shl(exp).unwrap_or(u64::MAX),
                        ssrcs,
                    })
                }
                _ => return Ok(None),
            }
        }
        RtcpPacketType::ExtendedReport => {
            if buf.remaining() < 4 {
                return Err(short("XR"));
            }
            let sender_ssrc = buf.get_u32();
            let mut voip_metric = None;
            while buf.remaining() >= 4 {
                let block_type = buf.get_u8();
                buf.advance(1);
                let block_len = buf.get_u16() as usize * 4;
                if buf.remaining() < block_len {
                    return Err(short("XR block"));
                }
                let mut block = &buf[..block_len];
                buf.advance(block_len);
                if block_type == XR_VOIP_METRICS && block_len == VoipMetric::BLOCK_SIZE - 4 {
                    voip_metric = Some(parse_voip_metric(&mut block));
                }
            }
            match voip_metric {
                Some(voip_metric) => RtcpPacket::ExtendedReport(ExtendedReport {
                    sender_ssrc,
                    voip_metric,
                }),
                None => return Ok(None),
            }
        }
    };
    Ok(Some(packet))
}

fn parse_voip_metric(buf: &mut &[u8]) -> VoipMetric {
    let ssrc = buf.get_u32();
    let mut bytes = [0u8; 4];
    buf.copy_to_slice(&mut bytes);
    let [loss_rate, discard_rate, burst_density, gap_density] = bytes;
    let burst_duration = buf.get_u16();
    let gap_duration = buf.get_u16();
    let round_trip_delay = buf.get_u16();
    let end_system_delay = buf.get_u16();
    buf.copy_to_slice(&mut bytes);
    let [signal_level, noise_level, rerl, gmin] = bytes;
    buf.copy_to_slice(&mut bytes);
    let [r_factor, ext_r_factor, mos_lq, mos_cq] = bytes;
    let rx_config = buf.get_u8();
    buf.advance(1);
    VoipMetric {
        ssrc,
        loss_rate,
        discard_rate,
        burst_density,
        gap_density,
        burst_duration,
        gap_duration,
        round_trip_delay,
        end_system_delay,
        signal_level,
        noise_level,
        rerl,
        gmin,
        r_factor,
        ext_r_factor,
        mos_lq,
        mos_cq,
        rx_config,
        jb_nominal: buf.get_u16(),
        jb_maximum: buf.get_u16(),
        jb_abs_max: buf.get_u16(),
    }
}

fn parse_sdes(count: u8, body: &[u8]) -> TransportResult<Vec<SdesChunk>> {
    let mut chunks = Vec::with_capacity(count as usize);
    let mut offset = 0;
    for _ in 0..count {
        if body.len() < offset + 4 {
            return Err(TransportError::RtcpParseError("truncated SDES chunk".to_string()));
        }
        let chunk_start = offset;
        let ssrc = u32::from_be_bytes([
            body[offset],
            body[offset + 1],
            body[offset + 2],
            body[offset + 3],
        ]);
        offset += 4;
        let mut cname = String::new();
        loop {
            let Some(&item_type) = body.get(offset) else {
                return Err(TransportError::RtcpParseError("unterminated SDES chunk".to_string()));
            };
            if item_type == 0 {
                offset += 1;
                break;
            }
            let Some(&len) = body.get(offset + 1) else {
                return Err(TransportError::RtcpParseError("truncated SDES item".to_string()));
            };
            let value_start = offset + 2;
            let value_end = value_start + len as usize;
            if value_end > body.len() {
                return Err(TransportError::RtcpParseError("truncated SDES item".to_string()));
            }
            if item_type == SDES_CNAME {
                cname = String::from_utf8_lossy(&body[value_start..value_end]).into_owned();
            }
            offset = value_end;
        }
        // chunks are word aligned
        offset = chunk_start + (offset - chunk_start + 3) / 4 * 4;
        chunks.push(SdesChunk { ssrc, cname });
    }
    Ok(chunks)
}

fn put_header(buf: &mut BytesMut, count: u8, packet_type: RtcpPacketType) {
    buf.put_u8(0x80 | (count & 0x1F));
    buf.put_u8(packet_type as u8);
    // length patched once the body is written
    buf.put_u16(0);
}

fn patch_length(buf: &mut BytesMut, start: usize) {
    let words = ((buf.len() - start) / 4 - 1) as u16;
    buf[start + 2..start + 4].copy_from_slice(&words.to_be_bytes());
}

fn check_block_count(count: usize) -> TransportResult<()> {
    if count > MAX_REPORT_BLOCKS {
        return Err(TransportError::InvalidPacket(format!(
            "{} report blocks exceed {}",
            count, MAX_REPORT_BLOCKS
        )));
    }
    Ok(())
}

/// Split a bitrate into a 6-bit exponent and a mantissa of `mantissa_bits`
pub fn encode_exp_mantissa(bitrate_bps: u64, mantissa_bits: u32) -> (u8, u32) {
    let max_mantissa = (1u64 << mantissa_bits) - 1;
    let mut exp = 0u8;
    let mut mantissa = bitrate_bps;
    while mantissa > max_mantissa && exp < 63 {
        mantissa >>= 1;
        exp += 1;
    }
    (exp, mantissa.min(max_mantissa) as u32)
}

/// Pack an ascending list of sequence numbers into (PID, BLP) pairs
pub fn pack_nack_pairs(lost: &[u16]) -> Vec<(u16, u16)> {
    let mut pairs: Vec<(u16, u16)> = Vec::new();
    for &seq in lost {
        if let Some((pid, blp)) = pairs.last_mut() {
            let diff = sequence_number_diff(seq, *pid);
            if diff == 0 {
                continue;
            }
            if (1..=16).contains(&diff) {
                *blp |= 1 << (diff - 1);
                continue;
            }
        }
        pairs.push((seq, 0));
    }
    pairs
}

/// Expand (PID, BLP) pairs into the sequence numbers they name
pub fn unpack_nack_pairs(pairs: &[(u16, u16)]) -> Vec<u16> {
    let mut lost = Vec::with_capacity(pairs.len() * 2);
    for &(pid, blp) in pairs {
        lost.push(pid);
        for bit in 0..16u16 {
            if blp & (1 << bit) != 0 {
                lost.push(pid.wrapping_add(bit + 1));
            }
        }
    }
    lost
}

/// RPSI native bit string: 7 bits per byte, most significant group first
fn encode_picture_id(picture_id: u64) -> Vec<u8> {
    let mut groups = Vec::new();
    let mut value = picture_id;
    loop {
        groups.push((value & 0x7F) as u8);
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    groups.reverse();
    let last = groups.len() - 1;
    for group in &mut groups[..last] {
        *group |= 0x80;
    }
    groups
}

fn decode_picture_id(bit_string: &[u8]) -> u64 {
    let mut picture_id = 0u64;
    for &byte in bit_string {
        picture_id = (picture_id << 7) | u64::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            break;
        }
    }
    picture_id
}
