//! Receive-side loss tracking that drives outgoing NACK requests
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


use crate::seq_num::SequenceNumberUnwrapper;
use rtcstack_config::RtpConfig;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Floor for the interval between two requests for the same packet
const MIN_RETRY_INTERVAL_MS: i64 = 5;

/// NACK configuration
#[derive(Debug, Clone)]
pub struct NackConfig {
    /// Requests per missing packet before giving up
    pub max_retries: u8,
    /// Missing entries tracked at once; older ones are dropped beyond this
    pub max_list_size: usize,
}

impl Default for NackConfig {
    fn default() -> Self {
        Self::from(&RtpConfig::default())
    }
}

impl From<&RtpConfig> for NackConfig {
    fn from(config: &RtpConfig) -> Self {
        Self {
            max_retries: config.nack_max_retries,
            max_list_size: config.nack_max_list_size as usize,
        }
    }
}

/// Missing packet information
#[derive(Debug, Clone)]
struct MissingPacket {
    detected_ms: i64,
    last_requested_ms: Option<i64>,
    retry_count: u8,
}

/// What an arriving sequence number did to the list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackListEvent {
    /// Next expected packet (or the first one)
    InOrder,
    /// Jumped ahead, this many packets are now missing
    GapDetected(usize),
    /// A packet previously marked missing arrived
    Recovered,
    /// Old or duplicate packet that was never missing
    Late,
    /// Gap larger than the list; tracking restarted, a key frame is needed
    Overflow,
}

/// NACK statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NackStats {
    pub missing: usize,
    pub recovered: u64,
    pub requests_sent: u64,
    pub abandoned: u64,
}

/// Ordered set of missing sequence numbers with per-entry retry state
#[derive(Debug)]
pub struct NackList {
    config: NackConfig,
    unwrapper: SequenceNumberUnwrapper,
    highest: Option<i64>,
    missing: BTreeMap<i64, MissingPacket>,
    stats: NackStats,
}

impl NackList {
    pub fn new(config: NackConfig) -> Self {
        Self {
            config,
            unwrapper: SequenceNumberUnwrapper::new(),
            highest: None,
            missing: BTreeMap::new(),
            stats: NackStats::default(),
        }
    }

    /// Account for a received sequence number
    pub fn on_received(&mut self, sequence_number: u16, now_ms: i64) -> NackListEvent {
        let seq = self.unwrapper.unwrap(sequence_number);
        let Some(highest) = self.highest else {
            self.highest = Some(seq);
            return NackListEvent::InOrder;
        };

        if seq <= highest {
            if self.missing.remove(&seq).is_some() {
                self.stats.recovered += 1;
                return NackListEvent::Recovered;
            }
            return NackListEvent::Late;
        }

        self.highest = Some(seq);
        let gap = (seq - highest - 1) as usize;
        if gap == 0 {
            return NackListEvent::InOrder;
        }
        if gap > self.config.max_list_size {
            debug!(gap, max = self.config.max_list_size, "NACK list overflow");
            self.missing.clear();
            return NackListEvent::Overflow;
        }
        for missing in highest + 1..seq {
            self.missing.insert(
                missing,
                MissingPacket {
                    detected_ms: now_ms,
                    last_requested_ms: None,
                    retry_count: 0,
                },
            );
        }
        while self.missing.len() > self.config.max_list_size {
            self.missing.pop_first();
        }
        NackListEvent::GapDetected(gap)
    }

    /// Sequence numbers due for a (re)request, ascending
    ///
    /// An entry is re-requested once per round-trip; entries that exhausted
    /// their retries are dropped.
    pub fn get_nack_list(&mut self, now_ms: i64, rtt_ms: i64) -> Vec<u16> {
        let retry_interval = rtt_ms.max(MIN_RETRY_INTERVAL_MS);
        let max_retries = self.config.max_retries;
        let mut abandoned = 0;
        let mut due = Vec::new();

        self.missing.retain(|&seq, entry| {
            if let Some(last) = entry.last_requested_ms {
                if now_ms - last < retry_interval {
                    return true;
                }
            }
            if entry.retry_count >= max_retries {
                abandoned += 1;
                return false;
            }
            entry.retry_count += 1;
            entry.last_requested_ms = Some(now_ms);
            due.push(seq as u16);
            true
        });

        self.stats.abandoned += abandoned;
        self.stats.requests_sent += due.len() as u64;
        due
    }

    /// Oldest missing entry age, if any
    pub fn oldest_missing_age_ms(&self, now_ms: i64) -> Option<i64> {
        self.missing.values().map(|m| now_ms - m.detected_ms).max()
    }

    pub fn len(&self) -> usize {
        self.missing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn stats(&self) -> NackStats {
        NackStats {
            missing: self.missing.len(),
            ..self.stats.clone()
        }
    }

    pub fn reset(&mut self) {
        self.unwrapper.reset();
        self.highest = None;
        self.missing.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_nack_list() -> NackList {
        NackList::new(NackConfig {
            max_retries: 2,
            max_list_size: 50,
        })
    }

    #[test]
    fn test_nack_detect_loss() {
        let mut list = create_nack_list();
        assert_eq!(list.on_received(100, 0), NackListEvent::InOrder);
        assert_eq!(list.on_received(101, 0), NackListEvent::InOrder);
        assert_eq!(list.on_received(104, 0), NackListEvent::GapDetected(2));
        assert_eq!(list.get_nack_list(0, 50), vec![102, 103]);
    }

    #[test]
    fn test_nack_across_wrap() {
        let mut list = create_nack_list();
        list.on_received(65534, 0);
        list.on_received(1, 0);
        assert_eq!(list.get_nack_list(0, 50), vec![65535, 0]);
    }

    #[test]
    fn test_nack_mark_received() {
        let mut list = create_nack_list();
        list.on_received(1, 0);
        list.on_received(4, 0);
        assert_eq!(list.on_received(2, 5), NackListEvent::Recovered);
        assert_eq!(list.on_received(2, 6), NackListEvent::Late);
        assert_eq!(list.get_nack_list(10, 50), vec![3]);
        assert_eq!(list.stats().recovered, 1);
    }

    #[test]
    fn test_nack_retry_interval_and_limit() {
        let mut list = create_nack_list();
        list.on_received(1, 0);
        list.on_received(3, 0);
        assert_eq!(list.get_nack_list(0, 100), vec![2]);
        // Not again within one RTT
        assert!(list.get_nack_list(50, 100).is_empty());
        assert_eq!(list.get_nack_list(100, 100), vec![2]);
        // Two retries used up
        assert!(list.get_nack_list(200, 100).is_empty());
        assert!(list.is_empty());
        assert_eq!(list.stats().abandoned, 1);
    }

    #[test]
    fn test_nack_overflow_restarts_tracking() {
        let mut list = create_nack_list();
        list.on_received(0, 0);
        list.on_received(5, 0);
        assert_eq!(list.on_received(500, 0), NackListEvent::Overflow);
        assert!(list.is_empty());
        assert_eq!(list.on_received(501, 0), NackListEvent::InOrder);
    }
}
