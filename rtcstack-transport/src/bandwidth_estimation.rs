//! Loss-based send bandwidth estimation
//!
//! Receiver reports drive the send bitrate: low loss grows it slowly, heavy
//! loss shrinks it multiplicatively, never below what TCP-friendly rate
//! control (RFC 3448) would allow. Remote estimates (REMB, TMMBR) cap it.
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
use tracing::{debug, trace};

/// Loss reports are averaged until they cover this many packets
const MIN_ACCUMULATED_PACKETS: u32 = 10;

/// Below this loss (Q8, ~2 %) the rate grows
const LOW_LOSS_Q8: u8 = 5;

/// Above this loss (Q8, ~10 %) the rate shrinks
const HIGH_LOSS_Q8: u8 = 26;

/// Upper bound used when no maximum is configured
const UNLIMITED_BPS: u32 = 1_000_000_000;

/// Packet size assumed by the TFRC floor
const TFRC_PACKET_SIZE_BYTES: u32 = 1000;

/// Outcome of a loss report that changed the send rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthUpdate {
    pub bitrate_bps: u32,
    pub fraction_lost: u8,
    pub rtt_ms: u32,
}

/// Send-side rate controller fed by RTCP
#[derive(Debug, Clone, Default)]
pub struct BandwidthManager {
    bitrate_bps: u32,
    min_bitrate_bps: u32,
    max_bitrate_bps: u32,

    last_extended_highest_sequence: Option<u32>,
    last_report_all_lost: bool,
    last_loss: u8,
    accumulated_lost_q8: u32,
    accumulated_expected: u32,

    last_fraction_lost: u8,
    last_rtt_ms: u32,
    /// Tightest bound received from the remote end (REMB/TMMBR), 0 if none
    remote_estimate_bps: u32,
}

impl BandwidthManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start rate in bps, bounds in kbps; a zero maximum means unbounded
    pub fn set_send_bitrate(&mut self, start_bps: u32, min_kbps: u16, max_kbps: u16) -> TransportResult<()> {
        if max_kbps != 0 && min_kbps > max_kbps {
            return Err(TransportError::ConfigError(format!(
                "minimum bitrate {} kbps above maximum {} kbps",
                min_kbps, max_kbps
            )));
        }
        self.bitrate_bps = start_bps;
        self.min_bitrate_bps = u32::from(min_kbps) * 1000;
        self.max_bitrate_bps = if max_kbps == 0 {
            UNLIMITED_BPS
        } else {
            u32::from(max_kbps) * 1000
        };
        debug!(
            start_bps,
            min_kbps, max_kbps, "Send bitrate configured"
        );
        Ok(())
    }

    pub fn bitrate_bps(&self) -> u32 {
        self.bitrate_bps
    }

    pub fn max_configured_bitrate_kbps(&self) -> TransportResult<u32> {
        if self.max_bitrate_bps == 0 {
            return Err(TransportError::NotAvailable(
                "send bitrate not configured".to_string(),
            ));
        }
        Ok(self.max_bitrate_bps / 1000)
    }

    /// Apply a bound received from the remote end; returns the new rate if it dropped
    pub fn update_remote_estimate(&mut self, bound_bps: u32) -> Option<BandwidthUpdate> {
        self.remote_estimate_bps = bound_bps;
        if self.bitrate_bps == 0 || bound_bps == 0 || self.bitrate_bps <= bound_bps {
            return None;
        }
        self.bitrate_bps = bound_bps;
        debug!(bitrate_bps = bound_bps, "Send bitrate capped by remote estimate");
        Some(self.current_update())
    }

    /// Digest a report block about our stream
    ///
    /// Returns the new rate, or `None` while no rate is configured.
    pub fn update_packet_loss(
        &mut self,
        extended_highest_sequence: u32,
        fraction_lost: u8,
        rtt_ms: u32,
    ) -> Option<BandwidthUpdate> {
        self.last_fraction_lost = fraction_lost;
        self.last_rtt_ms = rtt_ms;
        if self.bitrate_bps == 0 {
            return None;
        }

        let mut loss = fraction_lost;
        if let Some(last) = self.last_extended_highest_sequence {
            if extended_highest_sequence >= last {
                let expected = extended_highest_sequence - last;
                // Repeated "everything lost" reports are counted once
                if !(self.last_report_all_lost && fraction_lost == 255) {
                    self.last_report_all_lost = fraction_lost == 255;
                    self.accumulated_lost_q8 += u32::from(fraction_lost) * expected;
                    self.accumulated_expected += expected;
                    if self.accumulated_expected >= MIN_ACCUMULATED_PACKETS {
                        loss = (self.accumulated_lost_q8 / self.accumulated_expected).min(255) as u8;
                        self.accumulated_lost_q8 = 0;
                        self.accumulated_expected = 0;
                    } else {
                        loss = self.last_loss;
                    }
                }
            }
        }
        self.last_loss = loss;
        self.last_extended_highest_sequence = Some(extended_highest_sequence);

        self.bitrate_bps = self.shape_simple(loss, rtt_ms);
        trace!(loss, rtt_ms, bitrate_bps = self.bitrate_bps, "Send bitrate updated");
        Some(self.current_update())
    }

    fn shape_simple(&self, loss: u8, rtt_ms: u32) -> u32 {
        let current = u64::from(self.bitrate_bps);
        let (mut bitrate, reducing) = if loss > HIGH_LOSS_Q8 {
            (current * (512 - u64::from(loss)) / 512, true)
        } else if loss > LOW_LOSS_Q8 {
            (current, false)
        } else {
            ((current * 105 + 50) / 100 + 1000, false)
        };

        if reducing {
            if let Some(tfrc) = tfrc_bps(TFRC_PACKET_SIZE_BYTES, rtt_ms, loss) {
                if u64::from(tfrc) > bitrate {
                    bitrate = current;
                }
            }
        }
        if self.remote_estimate_bps > 0 {
            bitrate = bitrate.min(u64::from(self.remote_estimate_bps));
        }
        bitrate
            .min(u64::from(self.max_bitrate_bps))
            .max(u64::from(self.min_bitrate_bps))
            .min(u64::from(u32::MAX)) as u32
    }

    fn current_update(&self) -> BandwidthUpdate {
        BandwidthUpdate {
            bitrate_bps: self.bitrate_bps,
            fraction_lost: self.last_fraction_lost,
            rtt_ms: self.last_rtt_ms,
        }
    }
}

/// Rate TCP would achieve under the same conditions (RFC 3448 Section 3.1)
pub fn tfrc_bps(packet_size_bytes: u32, rtt_ms: u32, loss_q8: u8) -> Option<u32> {
    if packet_size_bytes == 0 || rtt_ms == 0 || loss_q8 == 0 {
        return None;
    }
    let r = f64::from(rtt_ms) / 1000.0;
    let p = f64::from(loss_q8) / 255.0;
    let s = f64::from(packet_size_bytes);
    let t_rto = 4.0 * r;
    let x = s
        / (r * (2.0 * p / 3.0).sqrt()
            + t_rto * (3.0 * (3.0 * p / 8.0).sqrt() * p * (1.0 + 32.0 * p * p)));
    Some((x * 8.0) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(start_bps: u32) -> BandwidthManager {
        let mut manager = BandwidthManager::new();
        manager.set_send_bitrate(start_bps, 30, 2000).unwrap();
        manager
    }

    #[test]
    fn test_unconfigured_manager_does_nothing() {
        let mut manager = BandwidthManager::new();
        assert!(manager.update_packet_loss(100, 0, 50).is_none());
        assert!(manager.max_configured_bitrate_kbps().is_err());
    }

    #[test]
    fn test_low_loss_increases_rate() {
        let mut manager = manager(300_000);
        let update = manager.update_packet_loss(100, 0, 50).unwrap();
        assert_eq!(update.bitrate_bps, 316_000);
    }

    #[test]
    fn test_moderate_loss_holds_rate() {
        let mut manager = manager(300_000);
        manager.update_packet_loss(100, 0, 50);
        let held = manager.bitrate_bps();
        // 20 packets at ~5 % loss
        let update = manager.update_packet_loss(120, 13, 50).unwrap();
        assert_eq!(update.bitrate_bps, held);
    }

    #[test]
    fn test_high_loss_decreases_rate() {
        let mut manager = manager(1_000_000);
        manager.update_packet_loss(100, 0, 0);
        let before = manager.bitrate_bps();
        // No RTT, so no TFRC floor
        let update = manager.update_packet_loss(200, 128, 0).unwrap();
        assert_eq!(update.bitrate_bps, (u64::from(before) * 384 / 512) as u32);
    }

    #[test]
    fn test_loss_accumulates_until_enough_packets() {
        let mut manager = manager(300_000);
        manager.update_packet_loss(100, 0, 50);
        let first = manager.bitrate_bps();
        // Only 4 packets: the previous (zero) loss is reused
        let update = manager.update_packet_loss(104, 255, 50).unwrap();
        assert!(update.bitrate_bps > first);
    }

    #[test]
    fn test_clamped_to_configured_bounds() {
        let mut manager = BandwidthManager::new();
        manager.set_send_bitrate(1_990_000, 30, 2000).unwrap();
        manager.update_packet_loss(1, 0, 50);
        assert_eq!(manager.bitrate_bps(), 2_000_000);
        assert!(manager.set_send_bitrate(100_000, 500, 200).is_err());
    }

    #[test]
    fn test_remote_estimate_caps_rate() {
        let mut manager = manager(500_000);
        assert!(manager.update_remote_estimate(600_000).is_none());
        let update = manager.update_remote_estimate(400_000).unwrap();
        assert_eq!(update.bitrate_bps, 400_000);
        manager.update_packet_loss(100, 0, 50);
        assert_eq!(manager.bitrate_bps(), 400_000);
    }

    #[test]
    fn test_tfrc() {
        assert_eq!(tfrc_bps(1000, 0, 10), None);
        let slow = tfrc_bps(1000, 200, 50).unwrap();
        let fast = tfrc_bps(1000, 20, 50).unwrap();
        assert!(fast > slow);
    }
}
