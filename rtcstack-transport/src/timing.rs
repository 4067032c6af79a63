//! Render timing: ramped playout delay, decode-time tracking and render deadlines
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


use crate::clock::Clock;
use crate::error::{TransportError, TransportResult};
use crate::seq_num::timestamp_diff;
use crate::timestamp_extrapolator::TimestampExtrapolator;
use rtcstack_config::TimingConfig;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Video RTP clock rate
pub const VIDEO_CLOCK_RATE_KHZ: i64 = 90;

const DECODE_BUCKET_MS: i64 = 1000;
const DECODE_HISTORY_BUCKETS: usize = 20;
const DECODE_HISTORY_WINDOW_MS: i64 = 20_000;

/// Rolling maximum of decode durations
///
/// Keeps the per-second maximum for the last 20 seconds. The very first
/// sample after a reset is ignored since it usually includes decoder setup.
#[derive(Debug, Default)]
struct DecodeTimeFilter {
    first_sample_seen: bool,
    /// (bucket start, max in bucket), newest first
    buckets: VecDeque<(i64, i64)>,
}

impl DecodeTimeFilter {
    fn add_sample(&mut self, decode_ms: i64, now_ms: i64) {
        if !self.first_sample_seen {
            self.first_sample_seen = true;
            return;
        }
        match self.buckets.front_mut() {
            Some((start, max)) if now_ms - *start < DECODE_BUCKET_MS => {
                *max = (*max).max(decode_ms);
            }
            _ => {
                self.buckets.push_front((now_ms, decode_ms));
                self.buckets.truncate(DECODE_HISTORY_BUCKETS);
            }
        }
    }

    fn max_decode_ms(&self, now_ms: i64) -> i64 {
        self.buckets
            .iter()
            .take_while(|(start, _)| now_ms - start <= DECODE_HISTORY_WINDOW_MS)
            .map(|&(_, max)| max)
            .max()
            .unwrap_or(0)
    }

    fn reset(&mut self) {
        self.first_sample_seen = false;
        self.buckets.clear();
    }
}

#[derive(Debug)]
struct TimingState {
    extrapolator: TimestampExtrapolator,
    decode_filter: DecodeTimeFilter,
    render_delay_ms: i64,
    min_total_delay_ms: i64,
    required_delay_ms: i64,
    current_delay_ms: i64,
    prev_frame_timestamp: u32,
}

impl TimingState {
    fn max_decode_ms(&self, now_ms: i64) -> i64 {
        self.decode_filter.max_decode_ms(now_ms)
    }

    /// Jitter target plus decode and render allowances, without the minimum floor
    fn target_delay(&self, now_ms: i64) -> i64 {
        self.required_delay_ms + self.max_decode_ms(now_ms) + self.render_delay_ms
    }
}

/// Per-decode-pipeline render timing
///
/// The applied delay follows the target at no more than
/// `delay_max_change_ms_per_s` per second of media time.
pub struct TimingEstimator {
    clock: Arc<dyn Clock>,
    config: TimingConfig,
    inner: Mutex<TimingState>,
}

impl TimingEstimator {
    pub fn new(clock: Arc<dyn Clock>, config: TimingConfig) -> Self {
        let now_ms = clock.now_ms();
        let render_delay_ms = i64::from(config.render_delay_ms);
        Self {
            clock,
            config,
            inner: Mutex::new(TimingState {
                extrapolator: TimestampExtrapolator::new(now_ms),
                decode_filter: DecodeTimeFilter::default(),
                render_delay_ms,
                min_total_delay_ms: 0,
                required_delay_ms: 0,
                current_delay_ms: 0,
                prev_frame_timestamp: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TimingState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Clear all accumulated state; `None` resets at the clock's current time
    pub fn reset(&self, now_ms: Option<i64>) {
        let now_ms = now_ms.unwrap_or_else(|| self.clock.now_ms());
        let mut state = self.lock();
        state.extrapolator.reset(now_ms);
        state.decode_filter.reset();
        state.render_delay_ms = i64::from(self.config.render_delay_ms);
        state.min_total_delay_ms = 0;
        state.required_delay_ms = 0;
        state.current_delay_ms = 0;
        state.prev_frame_timestamp = 0;
    }

    /// Jitter buffer delay to ramp toward
    pub fn set_required_delay(&self, delay_ms: u32) {
        let mut state = self.lock();
        if state.required_delay_ms != i64::from(delay_ms) {
            debug!(required_delay_ms = delay_ms, "Required delay changed");
            state.required_delay_ms = i64::from(delay_ms);
        }
    }

    /// Floor on the applied delay; does not change [`Self::target_video_delay`]
    pub fn set_minimum_total_delay(&self, delay_ms: u32) {
        self.lock().min_total_delay_ms = i64::from(delay_ms);
    }

    pub fn set_render_delay(&self, delay_ms: u32) {
        self.lock().render_delay_ms = i64::from(delay_ms);
    }

    /// Record the arrival of a new frame's first packet
    pub fn incoming_timestamp(&self, timestamp: u32, now_ms: i64) {
        self.lock().extrapolator.update(now_ms, timestamp);
    }

    /// Record a completed decode; returns its duration
    pub fn stop_decode_timer(
        &self,
        timestamp: u32,
        decode_start_ms: i64,
        now_ms: i64,
    ) -> TransportResult<i64> {
        let decode_ms = now_ms - decode_start_ms;
        if decode_ms < 0 {
            warn!(timestamp, decode_ms, "Negative decode time");
            return Err(TransportError::InvalidState {
                state: format!("decode of frame {} ended before it started", timestamp),
            });
        }
        self.lock().decode_filter.add_sample(decode_ms, now_ms);
        Ok(decode_ms)
    }

    /// Move the applied delay toward the target, capped by elapsed media time
    pub fn update_current_delay(&self, frame_timestamp: u32) {
        let now_ms = self.clock.now_ms();
        let max_change_per_s = i64::from(self.config.delay_max_change_ms_per_s);
        let mut state = self.lock();

        let target = state.target_delay(now_ms).max(state.min_total_delay_ms);
        if state.current_delay_ms == 0 {
            state.current_delay_ms = target;
        } else if target != state.current_delay_ms {
            let elapsed_ticks = timestamp_diff(frame_timestamp, state.prev_frame_timestamp);
            let max_change = max_change_per_s * elapsed_ticks / (VIDEO_CLOCK_RATE_KHZ * 1000);
            if max_change <= 0 {
                // out of order or same frame
                return;
            }
            let delta = (target - state.current_delay_ms).clamp(-max_change, max_change);
            state.current_delay_ms += delta;
        }
        state.prev_frame_timestamp = frame_timestamp;
    }

    /// Correct the applied delay after a frame decoded later than planned
    pub fn update_current_delay_after_decode(&self, render_time_ms: i64, actual_decode_time_ms: i64) {
        let now_ms = self.clock.now_ms();
        let mut state = self.lock();
        let planned_decode_ms =
            render_time_ms - state.max_decode_ms(now_ms) - state.render_delay_ms;
        let delayed_ms = actual_decode_time_ms - planned_decode_ms;
        if delayed_ms < 0 {
            return;
        }
        let target = state.target_delay(now_ms);
        state.current_delay_ms = (state.current_delay_ms + delayed_ms).min(target);
    }

    /// Wall-clock time at which the frame should be rendered
    ///
    /// Fails with [`TransportError::TimestampDiscontinuity`] when the frame
    /// would land further ahead than `max_video_delay_ms`.
    pub fn render_time_ms(&self, frame_timestamp: u32, now_ms: i64) -> TransportResult<i64> {
        let state = self.lock();
        let estimated = state
            .extrapolator
            .extrapolate_local_time(frame_timestamp)
            .unwrap_or(now_ms);
        let ahead_ms = estimated - now_ms;
        if ahead_ms > i64::from(self.config.max_video_delay_ms) {
            debug!(frame_timestamp, ahead_ms, "Render time out of range");
            return Err(TransportError::TimestampDiscontinuity { ahead_ms });
        }
        Ok(estimated + state.current_delay_ms)
    }

    /// How long the decoder may still wait before it must start on the frame
    pub fn max_waiting_time(&self, render_time_ms: i64, now_ms: i64) -> u32 {
        let state = self.lock();
        let wait = render_time_ms - now_ms - state.max_decode_ms(now_ms) - state.render_delay_ms;
        wait.clamp(0, i64::from(u32::MAX)) as u32
    }

    /// Whether the decoder's recent worst case fits in the time available
    pub fn enough_time_to_decode(&self, available_ms: u32) -> bool {
        let now_ms = self.clock.now_ms();
        let max_decode = self.lock().max_decode_ms(now_ms).max(1);
        i64::from(available_ms) > max_decode
    }

    /// Target delay without the minimum-total-delay floor
    pub fn target_video_delay(&self) -> u32 {
        let now_ms = self.clock.now_ms();
        self.lock().target_delay(now_ms).max(0) as u32
    }

    /// Delay currently applied to render times
    pub fn current_delay(&self) -> u32 {
        self.lock().current_delay_ms.max(0) as u32
    }

    pub fn max_decode_time_ms(&self) -> u32 {
        let now_ms = self.clock.now_ms();
        self.lock().max_decode_ms(now_ms).max(0) as u32
    }
}
