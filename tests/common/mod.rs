/*!
 * Shared Test Fixtures
 * Process-wide runtime setup and busy worker threads
 */

#![allow(dead_code)]

use signal_suspend::{NativeThreadId, SignalRuntime, SuspendConfig, ThreadRecord};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Install the process-wide runtime once per test binary
pub fn runtime_with(config: SuspendConfig) -> &'static SignalRuntime {
    static RUNTIME: OnceLock<&'static SignalRuntime> = OnceLock::new();
    RUNTIME.get_or_init(|| SignalRuntime::init(config).expect("runtime init"))
}

/// Hybrid runtime on platform-chosen signals
pub fn runtime() -> &'static SignalRuntime {
    runtime_with(SuspendConfig::hybrid())
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Attached thread spinning on a counter
pub struct Worker {
    pub record: Arc<ThreadRecord>,
    pub counter: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(runtime: &'static SignalRuntime) -> Self {
        let counter = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<NativeThreadId>();

        let handle = {
            let counter = counter.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let record = runtime.attach_current_thread().expect("attach");
                tx.send(record.tid()).expect("report tid");
                while !stop.load(Ordering::Relaxed) {
                    counter.fetch_add(1, Ordering::Relaxed);
                    std::hint::spin_loop();
                }
                runtime.detach_current_thread().expect("detach");
            })
        };

        let tid = rx.recv().expect("worker attached");
        let record = runtime.coordinator().thread(tid).expect("worker record");
        Self {
            record,
            counter,
            stop,
            handle: Some(handle),
        }
    }

    pub fn count(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Wait until the counter moves past `from`
    pub fn advances_past(&self, from: u64) -> bool {
        wait_until(Duration::from_secs(2), || self.count() > from)
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.join().expect("worker panicked");
        }
    }
}
