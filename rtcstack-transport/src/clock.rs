//! Injectable wall clock and NTP time helpers
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


use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970)
pub const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

/// Source of "now" for every time-dependent component
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> i64;

    /// Current time in NTP format
    fn current_ntp(&self) -> NtpTime {
        NtpTime::from_unix_ms(self.now_ms())
    }
}

/// Wall clock backed by `SystemTime`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for deterministic tests and simulations
#[derive(Debug)]
pub struct SimulatedClock {
    now_ms: AtomicI64,
}

impl SimulatedClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn advance_ms(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set_ms(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for SimulatedClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// 64-bit NTP timestamp (RFC 5905)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtpTime {
    pub seconds: u32,
    pub fraction: u32,
}

impl NtpTime {
    pub fn new(seconds: u32, fraction: u32) -> Self {
        Self { seconds, fraction }
    }

    /// Convert Unix milliseconds to NTP
    pub fn from_unix_ms(unix_ms: i64) -> Self {
        let unix_ms = unix_ms.max(0) as u64;
        let seconds = (unix_ms / 1000 + NTP_UNIX_OFFSET_SECS) as u32;
        let fraction = (((unix_ms % 1000) << 32) / 1000) as u32;
        Self { seconds, fraction }
    }

    /// Milliseconds since the Unix epoch
    pub fn to_unix_ms(self) -> i64 {
        let frac_ms = ((u64::from(self.fraction) * 1000 + (1 << 31)) >> 32) as i64;
        (i64::from(self.seconds) - NTP_UNIX_OFFSET_SECS as i64) * 1000 + frac_ms
    }

    /// Middle 32 bits, as carried in LSR fields
    pub fn compact(self) -> u32 {
        (self.seconds << 16) | (self.fraction >> 16)
    }

    pub fn is_zero(self) -> bool {
        self.seconds == 0 && self.fraction == 0
    }
}

/// Convert a compact (16.16 fixed point) NTP interval to milliseconds
pub fn compact_ntp_to_ms(compact: u32) -> i64 {
    let seconds = i64::from(compact >> 16);
    let fraction = i64::from(compact & 0xFFFF);
    seconds * 1000 + (fraction * 1000 + 0x8000) / 0x10000
}

/// Convert milliseconds to a compact NTP interval, saturating on overflow
pub fn ms_to_compact_ntp(ms: i64) -> u32 {
    let ms = ms.max(0);
    let value = (ms << 16) / 1000;
    value.min(i64::from(u32::MAX)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_clock_advances() {
        let clock = SimulatedClock::new(1000);
        clock.advance_ms(250);
        assert_eq!(clock.now_ms(), 1250);
        clock.set_ms(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[test]
    fn test_ntp_unix_round_trip_keeps_millis() {
        let ntp = NtpTime::from_unix_ms(1_700_000_000_123);
        assert_eq!(ntp.to_unix_ms(), 1_700_000_000_123);
    }

    #[test]
    fn test_compact_ntp_rfc3550_values() {
        // 5.25 seconds from the RFC 3550 A.8 example
        assert_eq!(compact_ntp_to_ms(0x0005_4000), 5250);
        assert_eq!(ms_to_compact_ntp(5250), 0x0005_4000);
    }

    #[test]
    fn test_compact_takes_middle_bits() {
        let ntp = NtpTime::new(0xAABB_CCDD, 0x1122_3344);
        assert_eq!(ntp.compact(), 0xCCDD_1122);
    }
}
