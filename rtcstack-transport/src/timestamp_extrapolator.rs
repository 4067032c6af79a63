//! Maps RTP timestamps to local arrival time with a recursive least-squares fit
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


use crate::seq_num::TimestampUnwrapper;
use tracing::trace;

/// Arrival silence after which the fit starts over
const RESET_AFTER_SILENCE_MS: i64 = 10_000;
/// Packets before the fit is trusted over the previous sample
const STARTUP_FILTER_DELAY_PACKETS: u32 = 2;
/// Offset uncertainty restored when a delay change is detected
const P11: f64 = 1e10;
const LAMBDA: f64 = 1.0;
const ALARM_THRESHOLD: f64 = 60e3;
const ACC_DRIFT: f64 = 6600.0;
const ACC_MAX_ERROR: f64 = 7000.0;

/// Linear model `ts = w0 * t + w1` of the remote clock against local time
#[derive(Debug)]
pub struct TimestampExtrapolator {
    start_ms: i64,
    prev_ms: i64,
    first_timestamp: i64,
    prev_unwrapped: Option<i64>,
    unwrapper: TimestampUnwrapper,
    w: [f64; 2],
    p: [[f64; 2]; 2],
    first_after_reset: bool,
    packet_count: u32,
    detector_pos: f64,
    detector_neg: f64,
}

impl TimestampExtrapolator {
    pub fn new(start_ms: i64) -> Self {
        let mut extrapolator = Self {
            start_ms,
            prev_ms: start_ms,
            first_timestamp: 0,
            prev_unwrapped: None,
            unwrapper: TimestampUnwrapper::new(),
            w: [90.0, 0.0],
            p: [[1.0, 0.0], [0.0, P11]],
            first_after_reset: true,
            packet_count: 0,
            detector_pos: 0.0,
            detector_neg: 0.0,
        };
        extrapolator.reset(start_ms);
        extrapolator
    }

    pub fn reset(&mut self, now_ms: i64) {
        self.start_ms = now_ms;
        self.prev_ms = now_ms;
        self.first_timestamp = 0;
        self.prev_unwrapped = None;
        self.unwrapper.reset();
        self.w = [90.0, 0.0];
        self.p = [[1.0, 0.0], [0.0, P11]];
        self.first_after_reset = true;
        self.packet_count = 0;
        self.detector_pos = 0.0;
        self.detector_neg = 0.0;
    }

    /// Feed the arrival of the first packet of a frame
    pub fn update(&mut self, now_ms: i64, timestamp: u32) {
        if now_ms - self.prev_ms > RESET_AFTER_SILENCE_MS {
            trace!(now_ms, prev_ms = self.prev_ms, "Extrapolator reset after silence");
            self.reset(now_ms);
        } else {
            self.prev_ms = now_ms;
        }

        let unwrapped = self.unwrapper.peek(timestamp);
        if matches!(self.prev_unwrapped, Some(prev) if unwrapped < prev) {
            // reordered frame, keep the fit
            return;
        }
        self.unwrapper.unwrap(timestamp);

        // offset removed to keep the matrices well scaled
        let t = (now_ms - self.start_ms) as f64;
        if self.first_after_reset {
            self.w[1] = -self.w[0] * t;
            self.first_timestamp = unwrapped;
            self.first_after_reset = false;
        }

        let residual = (unwrapped - self.first_timestamp) as f64 - t * self.w[0] - self.w[1];
        if self.delay_change_detected(residual)
            && self.packet_count >= STARTUP_FILTER_DELAY_PACKETS
        {
            self.p[1][1] = P11;
        }

        let p = self.p;
        let mut k = [p[0][0] * t + p[0][1], p[1][0] * t + p[1][1]];
        let tpt = LAMBDA + t * k[0] + k[1];
        k[0] /= tpt;
        k[1] /= tpt;

        self.w[0] += k[0] * residual;
        self.w[1] += k[1] * residual;

        self.p = [
            [
                (p[0][0] - (k[0] * t * p[0][0] + k[0] * p[1][0])) / LAMBDA,
                (p[0][1] - (k[0] * t * p[0][1] + k[0] * p[1][1])) / LAMBDA,
            ],
            [
                (p[1][0] - (k[1] * t * p[0][0] + k[1] * p[1][0])) / LAMBDA,
                (p[1][1] - (k[1] * t * p[0][1] + k[1] * p[1][1])) / LAMBDA,
            ],
        ];

        if self.packet_count < STARTUP_FILTER_DELAY_PACKETS {
            self.packet_count += 1;
        }
        self.prev_unwrapped = Some(unwrapped);
    }

    /// Local time at which a frame with `timestamp` is expected to arrive
    ///
    /// `None` until the first update.
    pub fn extrapolate_local_time(&self, timestamp: u32) -> Option<i64> {
        let unwrapped = self.unwrapper.peek(timestamp);
        let prev_unwrapped = self.prev_unwrapped?;
        if self.packet_count < STARTUP_FILTER_DELAY_PACKETS {
            let delta_ms = (unwrapped - prev_unwrapped) as f64 / 90.0;
            return Some(self.prev_ms + (delta_ms + 0.5).floor() as i64);
        }
        if self.w[0] < 1e-3 {
            return Some(self.start_ms);
        }
        let ts_diff = (unwrapped - self.first_timestamp) as f64;
        Some(self.start_ms + ((ts_diff - self.w[1]) / self.w[0] + 0.5).floor() as i64)
    }

    /// CUSUM test for a sudden shift in network delay
    fn delay_change_detected(&mut self, error: f64) -> bool {
        let error = error.clamp(-ACC_MAX_ERROR, ACC_MAX_ERROR);
        self.detector_pos = (self.detector_pos + error - ACC_DRIFT).max(0.0);
        self.detector_neg = (self.detector_neg + error + ACC_DRIFT).min(0.0);
        if self.detector_pos > ALARM_THRESHOLD || self.detector_neg < -ALARM_THRESHOLD {
            self.detector_pos = 0.0;
            self.detector_neg = 0.0;
            return true;
        }
        false
    }
}
