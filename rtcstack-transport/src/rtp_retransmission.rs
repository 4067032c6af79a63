//! Sent-packet history and NACK-driven retransmission scheduling
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
use bytes::Bytes;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tracing::{debug, trace};

/// Default number of packets kept for retransmission
pub const DEFAULT_HISTORY_SIZE: u16 = 200;

/// Fixed part of the minimum interval between two resends of one packet
pub const MIN_RESEND_INTERVAL_BASE_MS: i64 = 5;

/// A packet retained for retransmission
#[derive(Debug, Clone)]
pub struct StoredPacket {
    pub sequence_number: u16,
    /// Raw RTP packet as handed to the transport
    pub data: Bytes,
    pub sent_ms: i64,
    pub last_resend_ms: Option<i64>,
    pub resend_count: u32,
}

/// Packet due for retransmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResendPacket {
    pub sequence_number: u16,
    pub data: Bytes,
}

/// Retransmission statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetransmissionStats {
    pub stored_packets: usize,
    pub capacity: usize,
    pub resends_scheduled: u64,
    pub packets_resent: u64,
    /// NACKed sequence numbers no longer (or never) in the history
    pub unknown_requests: u64,
    /// NACKed sequence numbers already scheduled or resent too recently
    pub suppressed_requests: u64,
}

#[derive(Debug)]
struct HistoryState {
    enabled: bool,
    capacity: usize,
    packets: HashMap<u16, StoredPacket>,
    /// Insertion order, oldest first
    order: VecDeque<u16>,
    /// (due time, sequence number), earliest first
    pending: VecDeque<(i64, u16)>,
    pending_set: HashSet<u16>,
    stats: RetransmissionStats,
}

impl HistoryState {
    fn clear(&mut self) {
        self.packets.clear();
        self.order.clear();
        self.pending.clear();
        self.pending_set.clear();
    }
}

/// Ring of recently sent RTP packets, answering NACK requests
///
/// Disabled by default; enable with [`RtpPacketHistory::set_store_packets_status`].
#[derive(Debug)]
pub struct RtpPacketHistory {
    inner: Mutex<HistoryState>,
}

impl Default for RtpPacketHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl RtpPacketHistory {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HistoryState {
                enabled: false,
                capacity: DEFAULT_HISTORY_SIZE as usize,
                packets: HashMap::new(),
                order: VecDeque::new(),
                pending: VecDeque::new(),
                pending_set: HashSet::new(),
                stats: RetransmissionStats::default(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HistoryState> {
        // a poisoned history only holds copies of sent packets
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enable or disable storage; disabling drops every stored packet
    pub fn set_store_packets_status(&self, enable: bool, history_size: u16) -> TransportResult<()> {
        if enable && history_size == 0 {
            return Err(TransportError::ConfigError(
                "packet history size must be non-zero".to_string(),
            ));
        }
        let mut state = self.lock();
        state.enabled = enable;
        state.clear();
        if enable {
            let capacity = history_size as usize;
            state.capacity = capacity;
            state.packets.reserve(capacity);
        }
        debug!(enabled = enable, history_size, "Packet storage status changed");
        Ok(())
    }

    pub fn store_packets(&self) -> bool {
        self.lock().enabled
    }

    /// Record a sent packet, evicting the oldest at capacity
    pub fn on_packet_sent(&self, sequence_number: u16, data: Bytes, now_ms: i64) {
        let mut state = self.lock();
        if !state.enabled {
            return;
        }
        if state.packets.contains_key(&sequence_number) {
            state.order.retain(|&seq| seq != sequence_number);
        }
        while state.order.len() >= state.capacity {
            if let Some(oldest) = state.order.pop_front() {
                state.packets.remove(&oldest);
            }
        }
        state.order.push_back(sequence_number);
        state.packets.insert(
            sequence_number,
            StoredPacket {
                sequence_number,
                data,
                sent_ms: now_ms,
                last_resend_ms: None,
                resend_count: 0,
            },
        );
    }

    /// Schedule resends for NACKed packets still in the history
    ///
    /// A packet is not rescheduled while a resend is pending or within
    /// `5 + rtt_ms` of its previous resend. Returns the number scheduled.
    pub fn on_nack_received(&self, sequence_numbers: &[u16], rtt_ms: i64, now_ms: i64) -> usize {
        let mut state = self.lock();
        if !state.enabled {
            return 0;
        }
        let min_interval = MIN_RESEND_INTERVAL_BASE_MS + rtt_ms.max(0);
        let mut scheduled = 0;
        for &seq in sequence_numbers {
            if state.pending_set.contains(&seq) {
                state.stats.suppressed_requests += 1;
                continue;
            }
            let Some(packet) = state.packets.get(&seq) else {
                trace!(seq, "NACK for packet not in history");
                state.stats.unknown_requests += 1;
                continue;
            };
            if let Some(last) = packet.last_resend_ms {
                if now_ms - last < min_interval {
                    state.stats.suppressed_requests += 1;
                    continue;
                }
            }
            state.pending.push_back((now_ms, seq));
            state.pending_set.insert(seq);
            state.stats.resends_scheduled += 1;
            scheduled += 1;
        }
        scheduled
    }

    /// Pop the earliest due resend
    pub fn next_packet_to_resend(&self, now_ms: i64) -> Option<ResendPacket> {
        let mut state = self.lock();
        while let Some(&(due_ms, seq)) = state.pending.front() {
            if due_ms > now_ms {
                return None;
            }
            state.pending.pop_front();
            state.pending_set.remove(&seq);
            // evicted while waiting
            let Some(packet) = state.packets.get_mut(&seq) else {
                continue;
            };
            packet.last_resend_ms = Some(now_ms);
            packet.resend_count += 1;
            let resend = ResendPacket {
                sequence_number: seq,
                data: packet.data.clone(),
            };
            state.stats.packets_resent += 1;
            return Some(resend);
        }
        None
    }

    /// Copy of a stored packet
    pub fn get_packet(&self, sequence_number: u16) -> TransportResult<Bytes> {
        let state = self.lock();
        if !state.enabled {
            return Err(TransportError::NotAvailable(
                "packet storage disabled".to_string(),
            ));
        }
        state
            .packets
            .get(&sequence_number)
            .map(|p| p.data.clone())
            .ok_or_else(|| {
                TransportError::NotAvailable(format!("packet {} not in history", sequence_number))
            })
    }

    pub fn has_pending_resends(&self) -> bool {
        !self.lock().pending.is_empty()
    }

    pub fn stats(&self) -> RetransmissionStats {
        let state = self.lock();
        RetransmissionStats {
            stored_packets: state.packets.len(),
            capacity: state.capacity,
            ..state.stats.clone()
        }
    }
}

/// Caps retransmission traffic to the target send bitrate over a sliding second
#[derive(Debug, Default)]
pub struct NackBitrateLimiter {
    window: VecDeque<(i64, usize)>,
    bytes_in_window: usize,
}

impl NackBitrateLimiter {
    const WINDOW_MS: i64 = 1000;

    pub fn new() -> Self {
        Self::default()
    }

    fn prune(&mut self, now_ms: i64) {
        while let Some(&(sent_ms, bytes)) = self.window.front() {
            if now_ms - sent_ms < Self::WINDOW_MS {
                break;
            }
            self.window.pop_front();
            self.bytes_in_window -= bytes;
        }
    }

    /// Whether another resend fits the budget (unlimited when no target is set)
    pub fn can_send(&mut self, now_ms: i64, target_bitrate_bps: u32) -> bool {
        self.prune(now_ms);
        if target_bitrate_bps == 0 {
            return true;
        }
        (self.bytes_in_window as u64) * 8 < u64::from(target_bitrate_bps)
    }

    pub fn on_resent(&mut self, now_ms: i64, bytes: usize) {
        self.window.push_back((now_ms, bytes));
        self.bytes_in_window += bytes;
    }

    /// Bitrate spent on resends over the last second
    pub fn bitrate_bps(&mut self, now_ms: i64) -> u32 {
        self.prune(now_ms);
        (self.bytes_in_window * 8).min(u32::MAX as usize) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_packet(seq: u16) -> Bytes {
        let mut data = vec![0x80, 96];
        data.extend_from_slice(&seq.to_be_bytes());
        data.extend_from_slice(&[0; 8]);
        data.extend_from_slice(b"payload");
        Bytes::from(data)
    }

    fn enabled_history(size: u16) -> RtpPacketHistory {
        let history = RtpPacketHistory::new();
        history.set_store_packets_status(true, size).unwrap();
        history
    }

    #[test]
    fn test_store_and_resend() {
        let history = enabled_history(DEFAULT_HISTORY_SIZE);
        history.on_packet_sent(10, create_test_packet(10), 0);

        assert_eq!(history.on_nack_received(&[10], 50, 100), 1);
        let resend = history.next_packet_to_resend(100).unwrap();
        assert_eq!(resend.sequence_number, 10);
        assert_eq!(resend.data, create_test_packet(10));
        assert!(history.next_packet_to_resend(100).is_none());
    }

    #[test]
    fn test_duplicate_nack_resent_once_within_interval() {
        let history = enabled_history(DEFAULT_HISTORY_SIZE);
        history.on_packet_sent(7, create_test_packet(7), 0);

        // Both NACKs arrive before the resend goes out
        assert_eq!(history.on_nack_received(&[7], 100, 10), 1);
        assert_eq!(history.on_nack_received(&[7], 100, 11), 0);
        assert!(history.next_packet_to_resend(11).is_some());
        assert!(history.next_packet_to_resend(11).is_none());

        // And again shortly after the resend
        assert_eq!(history.on_nack_received(&[7], 100, 50), 0);

        // Past 5 + rtt the packet may go out again
        assert_eq!(history.on_nack_received(&[7], 100, 11 + 105), 1);
        assert_eq!(history.stats().resends_scheduled, 2);
    }

    #[test]
    fn test_unknown_sequence_numbers_ignored() {
        let history = enabled_history(DEFAULT_HISTORY_SIZE);
        history.on_packet_sent(1, create_test_packet(1), 0);
        assert_eq!(history.on_nack_received(&[2, 3], 0, 0), 0);
        assert_eq!(history.stats().unknown_requests, 2);
    }

    #[test]
    fn test_eviction_at_capacity() {
        let history = enabled_history(3);
        for seq in 65534..=65535u16 {
            history.on_packet_sent(seq, create_test_packet(seq), 0);
        }
        history.on_packet_sent(0, create_test_packet(0), 0);
        history.on_packet_sent(1, create_test_packet(1), 0);

        assert!(history.get_packet(65534).is_err());
        assert!(history.get_packet(65535).is_ok());
        assert!(history.get_packet(1).is_ok());
        assert_eq!(history.stats().stored_packets, 3);
    }

    #[test]
    fn test_disabled_storage_is_not_available() {
        let history = RtpPacketHistory::new();
        history.on_packet_sent(1, create_test_packet(1), 0);
        assert!(matches!(
            history.get_packet(1),
            Err(TransportError::NotAvailable(_))
        ));
        assert_eq!(history.on_nack_received(&[1], 0, 0), 0);
        assert!(history.next_packet_to_resend(0).is_none());
    }

    #[test]
    fn test_disabling_drops_packets() {
        let history = enabled_history(10);
        history.on_packet_sent(1, create_test_packet(1), 0);
        history.on_nack_received(&[1], 0, 0);
        history.set_store_packets_status(false, 0).unwrap();
        history.set_store_packets_status(true, 10).unwrap();
        assert!(history.get_packet(1).is_err());
        assert!(!history.has_pending_resends());
    }

    #[test]
    fn test_zero_history_rejected() {
        let history = RtpPacketHistory::new();
        assert!(history.set_store_packets_status(true, 0).is_err());
    }

    #[test]
    fn test_nack_bitrate_limiter() {
        let mut limiter = NackBitrateLimiter::new();
        // 8 kbps budget = 1000 bytes per second
        assert!(limiter.can_send(0, 8000));
        limiter.on_resent(0, 1000);
        assert!(!limiter.can_send(500, 8000));
        assert!(limiter.can_send(1000, 8000));
        assert!(limiter.can_send(1000, 0));
    }
}
