//! Receive-side bandwidth aggregation into REMB reports
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
use crate::error::TransportResult;
use crate::module::{object_key, Module, RtpModule};
use rtcstack_config::RembConfig;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, trace};

/// Aggregate reporting state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RembState {
    /// No REMB has been sent yet
    NoReport,
    /// At least one REMB has been sent
    Reporting,
}

type ModuleList = Vec<(usize, Weak<dyn RtpModule>)>;

struct RembInner {
    receive_modules: ModuleList,
    send_modules: ModuleList,
    /// Latest estimate per remote SSRC
    bitrates: BTreeMap<u32, u32>,
    last_remb_time_ms: i64,
    last_send_bitrate: Option<u32>,
    state: RembState,
}

/// Folds per-stream bitrate estimates into one REMB and decides when to send it
///
/// Only estimates of currently registered receive channels count. An
/// aggregate falling beyond the configured threshold below the last sent
/// value is reported on the next `process`; anything else waits for the
/// regular interval.
pub struct RembAggregator {
    clock: Arc<dyn Clock>,
    config: RembConfig,
    inner: Mutex<RembInner>,
}

impl RembAggregator {
    pub fn new(clock: Arc<dyn Clock>, config: RembConfig) -> Self {
        let now_ms = clock.now_ms();
        Self {
            clock,
            config,
            inner: Mutex::new(RembInner {
                receive_modules: Vec::new(),
                send_modules: Vec::new(),
                bitrates: BTreeMap::new(),
                last_remb_time_ms: now_ms,
                last_send_bitrate: None,
                state: RembState::NoReport,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, RembInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn interval_ms(&self) -> i64 {
        i64::from(self.config.send_interval_ms)
    }

    /// Register a stream whose estimate contributes to the aggregate
    pub fn add_receive_channel(&self, module: Arc<dyn RtpModule>) {
        let mut inner = self.inner();
        if !insert_module(&mut inner.receive_modules, &module) {
            debug!(ssrc = module.ssrc(), "Receive channel already registered");
        }
    }

    /// Unregister a stream and drop its last estimate from the aggregate
    pub fn remove_receive_channel(&self, module: &dyn RtpModule) {
        let remote_ssrc = module.remote_ssrc();
        let key = object_key(module);
        let mut inner = self.inner();
        inner
            .receive_modules
            .retain(|(k, m)| *k != key && m.strong_count() > 0);
        if let Some(ssrc) = remote_ssrc {
            inner.bitrates.remove(&ssrc);
        }
    }

    /// Register a stream that may transmit the REMB
    pub fn add_send_channel(&self, module: Arc<dyn RtpModule>) {
        let mut inner = self.inner();
        if !insert_module(&mut inner.send_modules, &module) {
            debug!(ssrc = module.ssrc(), "Send channel already registered");
        }
    }

    pub fn remove_send_channel(&self, module: &dyn RtpModule) {
        let key = object_key(module);
        self.inner()
            .send_modules
            .retain(|(k, m)| *k != key && m.strong_count() > 0);
    }

    /// Record a new estimate for `ssrc`
    ///
    /// Only a drop of the aggregate below the last sent value makes the
    /// next `process` due early.
    pub fn on_receive_bitrate_changed(&self, ssrc: u32, bitrate_bps: u32) {
        let factor = self.config.decrease_factor();
        let now_ms = self.clock.now_ms();
        let owned = self.registered_ssrcs();
        let mut inner = self.inner();

        inner.bitrates.insert(ssrc, bitrate_bps);
        let total = aggregate(&inner.bitrates, &owned);
        let aggregate_decreased = inner
            .last_send_bitrate
            .is_some_and(|last| (total as f64) < f64::from(last) * factor);

        trace!(ssrc, bitrate_bps, total, "Receive bitrate updated");
        if aggregate_decreased {
            // Make the next process call due immediately
            inner.last_remb_time_ms = now_ms - self.interval_ms();
        }
    }

    /// Whether an estimate has been received for `ssrc`
    pub fn is_estimating(&self, ssrc: u32) -> bool {
        self.inner().bitrates.contains_key(&ssrc)
    }

    pub fn state(&self) -> RembState {
        self.inner().state
    }

    /// Sum of the latest estimates of all registered streams
    pub fn total_bitrate(&self) -> u32 {
        let owned = self.registered_ssrcs();
        aggregate(&self.inner().bitrates, &owned)
    }

    pub fn last_send_bitrate(&self) -> Option<u32> {
        self.inner().last_send_bitrate
    }

    /// Remote SSRCs of the receive channels still alive
    fn registered_ssrcs(&self) -> BTreeSet<u32> {
        let modules = live_modules(&self.inner().receive_modules);
        // Module callbacks run without our lock held
        modules.iter().filter_map(|m| m.remote_ssrc()).collect()
    }
}

/// Add `module` unless it is already listed; dead entries are pruned first
fn insert_module(list: &mut ModuleList, module: &Arc<dyn RtpModule>) -> bool {
    let key = object_key(module.as_ref());
    list.retain(|(_, m)| m.strong_count() > 0);
    if list.iter().any(|(k, _)| *k == key) {
        return false;
    }
    list.push((key, Arc::downgrade(module)));
    true
}

fn aggregate(bitrates: &BTreeMap<u32, u32>, owned: &BTreeSet<u32>) -> u32 {
    let total: u64 = bitrates
        .iter()
        .filter(|(ssrc, _)| owned.contains(ssrc))
        .map(|(_, &b)| u64::from(b))
        .sum();
    total.min(u64::from(u32::MAX)) as u32
}

fn live_modules(list: &ModuleList) -> Vec<Arc<dyn RtpModule>> {
    list.iter().filter_map(|(_, m)| m.upgrade()).collect()
}

impl Module for RembAggregator {
    fn time_until_next_process(&self) -> i64 {
        let last = self.inner().last_remb_time_ms;
        (last + self.interval_ms() - self.clock.now_ms()).max(0)
    }

    fn process(&self) -> TransportResult<()> {
        let now_ms = self.clock.now_ms();
        let (candidates, fallback) = {
            let inner = self.inner();
            if now_ms - inner.last_remb_time_ms < self.interval_ms() {
                return Ok(());
            }
            (
                live_modules(&inner.send_modules),
                live_modules(&inner.receive_modules),
            )
        };

        // Module callbacks run without our lock held
        let owned: BTreeSet<u32> = fallback.iter().filter_map(|m| m.remote_ssrc()).collect();
        {
            let mut inner = self.inner();
            inner.bitrates.retain(|ssrc, _| owned.contains(ssrc));
            if inner.bitrates.is_empty() {
                return Ok(());
            }
        }

        let sender = candidates
            .into_iter()
            .find(|m| m.sending())
            .or_else(|| fallback.into_iter().find(|m| m.sending()));
        let Some(sender) = sender else {
            return Ok(());
        };

        let (total, ssrcs) = {
            let mut inner = self.inner();
            if now_ms - inner.last_remb_time_ms < self.interval_ms() {
                return Ok(());
            }
            let total = aggregate(&inner.bitrates, &owned);
            inner.last_remb_time_ms = now_ms;
            inner.last_send_bitrate = Some(total);
            inner.state = RembState::Reporting;
            let ssrcs: Vec<u32> = inner
                .bitrates
                .keys()
                .copied()
                .filter(|ssrc| owned.contains(ssrc))
                .collect();
            (total, ssrcs)
        };

        debug!(
            bitrate_bps = total,
            ssrcs = ?ssrcs,
            sender_ssrc = sender.ssrc(),
            "Sending REMB"
        );
        sender.set_remb_data(total, &ssrcs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeRtpModule {
        ssrc: u32,
        remote_ssrc: Option<u32>,
        sending: AtomicBool,
        rembs: Mutex<Vec<(u32, Vec<u32>)>>,
    }

    impl FakeRtpModule {
        fn new(ssrc: u32, remote_ssrc: u32, sending: bool) -> Arc<Self> {
            Arc::new(Self {
                ssrc,
                remote_ssrc: Some(remote_ssrc),
                sending: AtomicBool::new(sending),
                rembs: Mutex::new(Vec::new()),
            })
        }

        fn rembs(&self) -> Vec<(u32, Vec<u32>)> {
            self.rembs.lock().unwrap().clone()
        }
    }

    impl RtpModule for FakeRtpModule {
        fn ssrc(&self) -> u32 {
            self.ssrc
        }

        fn sending(&self) -> bool {
            self.sending.load(Ordering::SeqCst)
        }

        fn remote_ssrc(&self) -> Option<u32> {
            self.remote_ssrc
        }

        fn set_remb_data(&self, bitrate_bps: u32, ssrcs: &[u32]) -> TransportResult<()> {
            self.rembs
                .lock()
                .unwrap()
                .push((bitrate_bps, ssrcs.to_vec()));
            Ok(())
        }

        fn bitrate_sent(&self) -> u32 {
            0
        }

        fn set_send_bitrate(&self, _: u32, _: u32, _: u32) -> TransportResult<()> {
            Ok(())
        }
    }

    fn setup() -> (Arc<SimulatedClock>, RembAggregator) {
        let clock = Arc::new(SimulatedClock::new(10_000));
        let remb = RembAggregator::new(clock.clone(), RembConfig::default());
        (clock, remb)
    }

    #[test]
    fn test_one_module_sends_after_interval() {
        let (clock, remb) = setup();
        let rtp = FakeRtpModule::new(1, 1234, true);
        remb.add_receive_channel(rtp.clone());
        remb.add_send_channel(rtp.clone());

        remb.on_receive_bitrate_changed(1234, 456);
        remb.process().unwrap();
        assert!(rtp.rembs().is_empty());
        assert_eq!(remb.state(), RembState::NoReport);

        clock.advance_ms(1010);
        assert_eq!(remb.time_until_next_process(), 0);
        remb.process().unwrap();
        assert_eq!(rtp.rembs(), vec![(456, vec![1234])]);
        assert_eq!(remb.state(), RembState::Reporting);

        // Lower estimate goes out without waiting
        remb.on_receive_bitrate_changed(1234, 356);
        remb.process().unwrap();
        assert_eq!(rtp.rembs().last(), Some(&(356, vec![1234])));
    }

    #[test]
    fn test_increase_waits_for_interval() {
        let (clock, remb) = setup();
        let rtp = FakeRtpModule::new(1, 1234, true);
        remb.add_receive_channel(rtp.clone());

        remb.on_receive_bitrate_changed(1234, 456);
        clock.advance_ms(1010);
        remb.process().unwrap();
        assert_eq!(rtp.rembs().len(), 1);

        for bitrate in [600, 900, 5000] {
            remb.on_receive_bitrate_changed(1234, bitrate);
            clock.advance_ms(100);
            remb.process().unwrap();
        }
        assert_eq!(rtp.rembs().len(), 1);

        clock.advance_ms(800);
        remb.process().unwrap();
        assert_eq!(rtp.rembs().last(), Some(&(5000, vec![1234])));
    }

    #[test]
    fn test_lower_estimate_before_first_report_waits_for_first_interval() {
        let (clock, remb) = setup();
        let rtp = FakeRtpModule::new(1, 1234, true);
        remb.add_receive_channel(rtp.clone());

        remb.on_receive_bitrate_changed(1234, 456);
        clock.advance_ms(1010);
        remb.process().unwrap();

        remb.on_receive_bitrate_changed(1234, 356);
        remb.process().unwrap();
        assert_eq!(rtp.rembs(), vec![(456, vec![1234]), (356, vec![1234])]);
    }

    #[test]
    fn test_combined_estimate_uses_first_receive_module() {
        let (clock, remb) = setup();
        let rtp_0 = FakeRtpModule::new(1, 1234, true);
        let rtp_1 = FakeRtpModule::new(2, 2345, true);
        remb.add_receive_channel(rtp_0.clone());
        remb.add_receive_channel(rtp_1.clone());

        remb.on_receive_bitrate_changed(1234, 456);
        remb.on_receive_bitrate_changed(2345, 889);
        clock.advance_ms(1010);
        remb.process().unwrap();

        remb.on_receive_bitrate_changed(2345, 789);
        remb.process().unwrap();
        assert_eq!(rtp_0.rembs().last(), Some(&(1245, vec![1234, 2345])));
        assert!(rtp_1.rembs().is_empty());
        assert_eq!(remb.total_bitrate(), 1245);
    }

    #[test]
    fn test_no_remb_for_small_decrease_after_increase() {
        let (clock, remb) = setup();
        let rtp_0 = FakeRtpModule::new(1, 1234, true);
        let rtp_1 = FakeRtpModule::new(2, 2345, true);
        remb.add_receive_channel(rtp_0.clone());
        remb.add_receive_channel(rtp_1.clone());

        remb.on_receive_bitrate_changed(1234, 456);
        remb.on_receive_bitrate_changed(2345, 789);
        clock.advance_ms(1010);
        remb.process().unwrap();
        assert_eq!(rtp_0.rembs(), vec![(1245, vec![1234, 2345])]);

        remb.on_receive_bitrate_changed(1234, 457);
        remb.process().unwrap();
        remb.on_receive_bitrate_changed(1234, 446);
        remb.process().unwrap();
        assert_eq!(rtp_0.rembs().len(), 1);
    }

    #[test]
    fn test_change_send_module_after_removal() {
        let (clock, remb) = setup();
        let rtp_0 = FakeRtpModule::new(1, 1234, true);
        let rtp_1 = FakeRtpModule::new(2, 2345, true);
        remb.add_receive_channel(rtp_0.clone());
        remb.add_receive_channel(rtp_1.clone());

        remb.on_receive_bitrate_changed(1234, 456);
        remb.on_receive_bitrate_changed(2345, 789);
        clock.advance_ms(1010);
        remb.process().unwrap();

        remb.on_receive_bitrate_changed(1234, 356);
        remb.process().unwrap();
        assert_eq!(rtp_0.rembs().last(), Some(&(1145, vec![1234, 2345])));

        remb.remove_receive_channel(rtp_0.as_ref());
        assert!(!remb.is_estimating(1234));
        remb.add_receive_channel(rtp_0.clone());
        remb.on_receive_bitrate_changed(1234, 356);

        remb.on_receive_bitrate_changed(2345, 689);
        remb.process().unwrap();
        assert_eq!(rtp_1.rembs(), vec![(1045, vec![1234, 2345])]);
        assert_eq!(rtp_0.rembs().len(), 2);
    }

    #[test]
    fn test_only_one_remb_for_double_process() {
        let (clock, remb) = setup();
        let rtp = FakeRtpModule::new(1, 1234, true);
        remb.add_receive_channel(rtp.clone());

        remb.on_receive_bitrate_changed(1234, 456);
        clock.advance_ms(1010);
        remb.process().unwrap();
        remb.process().unwrap();
        assert_eq!(rtp.rembs().len(), 1);
        assert_eq!(remb.time_until_next_process(), 1000);
    }

    #[test]
    fn test_no_estimate_means_no_remb() {
        let (clock, remb) = setup();
        let rtp = FakeRtpModule::new(1, 1234, true);
        remb.add_receive_channel(rtp.clone());
        clock.advance_ms(1010);
        remb.process().unwrap();
        assert!(rtp.rembs().is_empty());
    }

    #[test]
    fn test_no_sending_module_means_no_remb() {
        let (clock, remb) = setup();
        let rtp = FakeRtpModule::new(1, 1234, false);
        remb.add_receive_channel(rtp.clone());
        remb.on_receive_bitrate_changed(1234, 456);
        clock.advance_ms(1010);
        remb.process().unwrap();
        assert!(rtp.rembs().is_empty());

        // Timer not consumed, a sender coming up reports at once
        rtp.sending.store(true, Ordering::SeqCst);
        remb.process().unwrap();
        assert_eq!(rtp.rembs(), vec![(456, vec![1234])]);
    }

    #[test]
    fn test_send_channel_preferred_over_receive_channel() {
        let (clock, remb) = setup();
        let receiver = FakeRtpModule::new(1, 1234, true);
        let sender = FakeRtpModule::new(2, 9999, true);
        remb.add_receive_channel(receiver.clone());
        remb.add_send_channel(sender.clone());

        remb.on_receive_bitrate_changed(1234, 500);
        clock.advance_ms(1000);
        remb.process().unwrap();
        assert_eq!(sender.rembs().len(), 1);
        assert!(receiver.rembs().is_empty());

        remb.remove_send_channel(sender.as_ref());
        clock.advance_ms(1000);
        remb.process().unwrap();
        assert_eq!(receiver.rembs().len(), 1);
    }

    #[test]
    fn test_dropped_module_is_not_used() {
        let (clock, remb) = setup();
        let rtp = FakeRtpModule::new(1, 1234, true);
        remb.add_receive_channel(rtp.clone());
        remb.on_receive_bitrate_changed(1234, 456);
        drop(rtp);
        clock.advance_ms(1010);
        remb.process().unwrap();
        assert_eq!(remb.state(), RembState::NoReport);
    }

    #[test]
    fn test_aggregate_counts_only_registered_live_channels() {
        let (clock, remb) = setup();
        let rtp = FakeRtpModule::new(1, 1234, true);
        let dropped = FakeRtpModule::new(2, 2345, true);
        remb.add_receive_channel(rtp.clone());
        remb.add_receive_channel(dropped.clone());

        remb.on_receive_bitrate_changed(1234, 456);
        remb.on_receive_bitrate_changed(7777, 100_000);
        remb.on_receive_bitrate_changed(2345, 789);
        drop(dropped);
        assert_eq!(remb.total_bitrate(), 456);

        clock.advance_ms(1010);
        remb.process().unwrap();
        assert_eq!(rtp.rembs(), vec![(456, vec![1234])]);
        assert!(!remb.is_estimating(7777));
        assert!(!remb.is_estimating(2345));
    }

    #[test]
    fn test_stream_decrease_above_last_sent_waits_for_interval() {
        let (clock, remb) = setup();
        let rtp_0 = FakeRtpModule::new(1, 1234, true);
        let rtp_1 = FakeRtpModule::new(2, 2345, true);
        remb.add_receive_channel(rtp_0.clone());
        remb.add_receive_channel(rtp_1.clone());

        remb.on_receive_bitrate_changed(1234, 500);
        remb.on_receive_bitrate_changed(2345, 500);
        clock.advance_ms(1010);
        remb.process().unwrap();
        assert_eq!(rtp_0.rembs(), vec![(1000, vec![1234, 2345])]);

        for bitrate in [2000, 1900] {
            remb.on_receive_bitrate_changed(1234, bitrate);
            clock.advance_ms(10);
            remb.process().unwrap();
        }
        assert_eq!(rtp_0.rembs().len(), 1);

        clock.advance_ms(1000);
        remb.process().unwrap();
        assert_eq!(rtp_0.rembs().last(), Some(&(2400, vec![1234, 2345])));
    }

    #[test]
    fn test_dead_channels_pruned_on_registration() {
        let (clock, remb) = setup();
        for remote_ssrc in [1111, 2222, 3333] {
            remb.add_receive_channel(FakeRtpModule::new(1, remote_ssrc, true));
            remb.add_send_channel(FakeRtpModule::new(1, remote_ssrc, true));
        }
        let rtp = FakeRtpModule::new(1, 1234, true);
        remb.add_receive_channel(rtp.clone());
        remb.add_send_channel(rtp.clone());
        assert_eq!(remb.inner().receive_modules.len(), 1);
        assert_eq!(remb.inner().send_modules.len(), 1);

        remb.on_receive_bitrate_changed(1234, 456);
        clock.advance_ms(1010);
        remb.process().unwrap();
        assert_eq!(rtp.rembs(), vec![(456, vec![1234])]);
    }
}
