//! Poll-driven module scheduling and the narrow RTP module seam
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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Longest the process task sleeps even when every module is idle
pub const MAX_IDLE_PROCESS_MS: i64 = 100;

/// A component serviced periodically by a [`ProcessThread`]
pub trait Module: Send + Sync {
    /// Milliseconds until `process` should run again; zero or negative means now
    fn time_until_next_process(&self) -> i64;

    fn process(&self) -> TransportResult<()>;
}

/// What bandwidth feedback needs from an RTP session
pub trait RtpModule: Send + Sync {
    fn ssrc(&self) -> u32;

    fn sending(&self) -> bool;

    /// SSRC of the remote sender, once learned
    fn remote_ssrc(&self) -> Option<u32>;

    /// Transmit a REMB carrying `bitrate_bps` for `ssrcs`
    fn set_remb_data(&self, bitrate_bps: u32, ssrcs: &[u32]) -> TransportResult<()>;

    /// Current send bitrate in bits per second
    fn bitrate_sent(&self) -> u32;

    /// Configure the send-side bandwidth estimator
    fn set_send_bitrate(&self, start_bps: u32, min_kbps: u32, max_kbps: u32)
        -> TransportResult<()>;
}

/// Identity of a trait object, independent of its vtable
pub(crate) fn object_key<T: ?Sized>(object: &T) -> usize {
    object as *const T as *const () as usize
}

struct ModuleEntry {
    key: usize,
    module: Weak<dyn Module>,
}

/// Result of one scheduling pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessPass {
    /// Modules whose `process` ran
    pub processed: usize,
    /// Earliest `time_until_next_process` after the pass
    pub next_wake_ms: i64,
}

#[derive(Default)]
struct ProcessShared {
    modules: Mutex<Vec<ModuleEntry>>,
    wake: Notify,
    shutdown: AtomicBool,
}

impl ProcessShared {
    fn modules(&self) -> MutexGuard<'_, Vec<ModuleEntry>> {
        self.modules.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn process_due_modules(&self) -> ProcessPass {
        let live: Vec<Arc<dyn Module>> = {
            let mut modules = self.modules();
            modules.retain(|entry| entry.module.strong_count() > 0);
            modules.iter().filter_map(|entry| entry.module.upgrade()).collect()
        };

        let mut processed = 0;
        let mut next_wake_ms = MAX_IDLE_PROCESS_MS;
        for module in live {
            if module.time_until_next_process() <= 0 {
                if let Err(e) = module.process() {
                    warn!(error = %e, "Module process failed");
                }
                processed += 1;
            }
            next_wake_ms = next_wake_ms.min(module.time_until_next_process());
        }
        ProcessPass {
            processed,
            next_wake_ms,
        }
    }
}

/// Services many modules from one tokio task
///
/// Modules are held weakly; a dropped module disappears on the next pass.
pub struct ProcessThread {
    shared: Arc<ProcessShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Default for ProcessThread {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessThread {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ProcessShared::default()),
            handle: Mutex::new(None),
        }
    }

    pub fn register_module(&self, module: Arc<dyn Module>) -> TransportResult<()> {
        let key = object_key(module.as_ref());
        let mut modules = self.shared.modules();
        modules.retain(|entry| entry.module.strong_count() > 0);
        if modules.iter().any(|entry| entry.key == key) {
            return Err(TransportError::AlreadyRegistered(
                "process module".to_string(),
            ));
        }
        modules.push(ModuleEntry {
            key,
            module: Arc::downgrade(&module),
        });
        drop(modules);
        self.shared.wake.notify_one();
        Ok(())
    }

    pub fn deregister_module(&self, module: &dyn Module) -> TransportResult<()> {
        let key = object_key(module);
        let mut modules = self.shared.modules();
        let before = modules.len();
        modules.retain(|entry| entry.key != key);
        if modules.len() == before {
            return Err(TransportError::NotRegistered("process module".to_string()));
        }
        Ok(())
    }

    pub fn module_count(&self) -> usize {
        self.shared
            .modules()
            .iter()
            .filter(|entry| entry.module.strong_count() > 0)
            .count()
    }

    /// Run one pass synchronously
    pub fn process_due_modules(&self) -> ProcessPass {
        self.shared.process_due_modules()
    }

    /// Spawn the scheduling task on the current tokio runtime
    pub fn start(&self) -> TransportResult<()> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| TransportError::InvalidState {
                state: "process thread started outside a tokio runtime".to_string(),
            })?;
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_some() {
            return Err(TransportError::InvalidState {
                state: "process thread already running".to_string(),
            });
        }
        self.shared.shutdown.store(false, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        *handle = Some(runtime.spawn(async move {
            debug!("Process thread started");
            while !shared.shutdown.load(Ordering::SeqCst) {
                let pass = shared.process_due_modules();
                let wait_ms = pass.next_wake_ms.clamp(1, MAX_IDLE_PROCESS_MS) as u64;
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
                    _ = shared.wake.notified() => {}
                }
            }
            debug!("Process thread stopped");
        }));
        info!("Process thread running");
        Ok(())
    }

    /// Stop the scheduling task and wait for it to finish
    pub async fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Process thread ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingModule {
        due: AtomicBool,
        calls: AtomicUsize,
    }

    impl CountingModule {
        fn new(due: bool) -> Arc<Self> {
            Arc::new(Self {
                due: AtomicBool::new(due),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Module for CountingModule {
        fn time_until_next_process(&self) -> i64 {
            if self.due.load(Ordering::SeqCst) {
                0
            } else {
                10
            }
        }

        fn process(&self) -> TransportResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.due.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_only_due_modules_are_processed() {
        let thread = ProcessThread::new();
        let due = CountingModule::new(true);
        let idle = CountingModule::new(false);
        thread.register_module(due.clone()).unwrap();
        thread.register_module(idle.clone()).unwrap();

        let pass = thread.process_due_modules();
        assert_eq!(pass.processed, 1);
        assert_eq!(pass.next_wake_ms, 10);
        assert_eq!(due.calls.load(Ordering::SeqCst), 1);
        assert_eq!(idle.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_double_registration_rejected() {
        let thread = ProcessThread::new();
        let module = CountingModule::new(true);
        thread.register_module(module.clone()).unwrap();
        assert!(matches!(
            thread.register_module(module.clone()),
            Err(TransportError::AlreadyRegistered(_))
        ));
        thread.deregister_module(module.as_ref()).unwrap();
        assert!(thread.deregister_module(module.as_ref()).is_err());
    }

    #[test]
    fn test_dropped_modules_are_forgotten() {
        let thread = ProcessThread::new();
        let module = CountingModule::new(true);
        thread.register_module(module.clone()).unwrap();
        assert_eq!(thread.module_count(), 1);
        drop(module);
        assert_eq!(thread.module_count(), 0);
        assert_eq!(thread.process_due_modules().processed, 0);
    }

    #[test]
    fn test_start_requires_runtime() {
        let thread = ProcessThread::new();
        assert!(matches!(
            thread.start(),
            Err(TransportError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_background_task_processes_modules() {
        let thread = ProcessThread::new();
        let module = CountingModule::new(true);
        thread.register_module(module.clone()).unwrap();
        thread.start().unwrap();
        assert!(thread.start().is_err());

        for _ in 0..100 {
            if module.calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        thread.stop().await;
        assert_eq!(module.calls.load(Ordering::SeqCst), 1);
        assert!(!thread.is_running());
    }
}
