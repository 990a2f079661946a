// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Liveness watchdog.
//!
//! A background thread repeatedly posts a probe onto the main thread's work queue and sleeps for
//! the configured timeout. A probe still unacknowledged when the thread wakes up means the main
//! thread stopped draining its queue: the stacks of the main thread, then of the other threads,
//! are captured and reported as a liveness violation.

mod historical;
mod queue;
mod sampler;

pub use historical::{
    check_historical_violations, JsonTerminationHistory, TerminationHistory, TerminationReason,
    TerminationRecord, WatermarkStore,
};
pub use queue::{channel, ChannelQueue, MainLoop, Probe, TokioQueue, WorkQueue};
#[cfg(target_os = "linux")]
pub use sampler::ProcStackSampler;
pub use sampler::{default_sampler, NoopStackSampler, SamplerError, StackSampler};

use crate::crash_info::{Detection, LivenessViolationRecord, ThreadStack};
use crate::shared::configuration::WatchdogConfig;
use crate::shared::threading::{get_current_thread_id, get_current_thread_name};
use crate::telemetry::TelemetrySink;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub type DebuggerCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// The thread whose responsiveness is being watched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryThread {
    pub tid: i64,
    pub name: String,
}

impl PrimaryThread {
    /// The calling thread.
    pub fn current() -> Self {
        Self {
            tid: get_current_thread_id(),
            name: get_current_thread_name(),
        }
    }
}

/// Whether a debugger is attached to this process.
pub fn debugger_attached() -> bool {
    is_being_traced().unwrap_or(false)
}

#[cfg(target_os = "linux")]
fn is_being_traced() -> std::io::Result<bool> {
    use std::io::{BufRead, BufReader};

    let file = std::fs::File::open("/proc/self/status")?;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.starts_with("TracerPid:") {
            let tracer_pid = line.split_whitespace().nth(1).unwrap_or("0");
            return Ok(tracer_pid != "0");
        }
    }
    Ok(false)
}

#[cfg(not(target_os = "linux"))]
fn is_being_traced() -> std::io::Result<bool> {
    Ok(false)
}

pub struct LivenessWatchdog {
    config: WatchdogConfig,
    queue: Arc<dyn WorkQueue>,
    primary: PrimaryThread,
    sink: Arc<dyn TelemetrySink>,
    sampler: Arc<dyn StackSampler>,
    debugger_check: DebuggerCheck,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LivenessWatchdog {
    pub fn new(
        config: WatchdogConfig,
        queue: Arc<dyn WorkQueue>,
        primary: PrimaryThread,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            config,
            queue,
            primary,
            sink,
            sampler: default_sampler(),
            debugger_check: Arc::new(debugger_attached),
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn StackSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_debugger_check(
        mut self,
        debugger_check: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Self {
        self.debugger_check = Arc::new(debugger_check);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(SeqCst)
    }

    /// Starts the watchdog thread. Starting a running watchdog does nothing.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut thread = match self.thread.lock() {
            Ok(thread) => thread,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.running.swap(true, SeqCst) {
            return Ok(());
        }
        let cycle = Cycle {
            config: self.config.clone(),
            queue: self.queue.clone(),
            primary: self.primary.clone(),
            sink: self.sink.clone(),
            sampler: self.sampler.clone(),
            debugger_check: self.debugger_check.clone(),
            running: self.running.clone(),
            acknowledged: Arc::new(AtomicU64::new(0)),
            next_generation: 0,
        };
        match thread::Builder::new()
            .name("liveness-watchdog".to_string())
            .spawn(move || cycle.run())
        {
            Ok(handle) => {
                *thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, SeqCst);
                Err(anyhow::anyhow!("Unable to spawn the watchdog thread: {e}"))
            }
        }
    }

    /// Stops the watchdog thread, waking it up if it is sleeping. Stopping a stopped watchdog
    /// does nothing.
    pub fn stop(&self) {
        let mut thread = match self.thread.lock() {
            Ok(thread) => thread,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !self.running.swap(false, SeqCst) {
            return;
        }
        if let Some(handle) = thread.take() {
            handle.thread().unpark();
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                debug!("Watchdog thread panicked");
            }
        }
    }
}

impl Drop for LivenessWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Cycle {
    config: WatchdogConfig,
    queue: Arc<dyn WorkQueue>,
    primary: PrimaryThread,
    sink: Arc<dyn TelemetrySink>,
    sampler: Arc<dyn StackSampler>,
    debugger_check: DebuggerCheck,
    running: Arc<AtomicBool>,
    // Highest generation the main thread has run. A late probe from an earlier cycle can never
    // acknowledge a later one.
    acknowledged: Arc<AtomicU64>,
    next_generation: u64,
}

impl Cycle {
    fn run(mut self) {
        let own_tid = get_current_thread_id();
        // Generation of a probe already reported as a violation and not yet acknowledged.
        let mut stalled: Option<u64> = None;
        while self.running.load(SeqCst) {
            if self.config.skip_when_debugged() && (self.debugger_check)() {
                if !self.sleep(self.config.timeout()) {
                    break;
                }
                continue;
            }
            let generation = match stalled {
                Some(generation) => generation,
                None => self.post_probe(),
            };
            if !self.sleep(self.config.timeout()) {
                break;
            }
            if self.acknowledged.load(SeqCst) >= generation {
                if stalled.take().is_some() {
                    debug!(thread.id = self.primary.tid, "Main thread recovered");
                }
                continue;
            }
            if stalled.is_none() {
                self.report_violation(own_tid);
                stalled = Some(generation);
            }
        }
    }

    fn post_probe(&mut self) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        let acknowledged = self.acknowledged.clone();
        if !self.queue.post(Box::new(move || {
            acknowledged.fetch_max(generation, SeqCst);
        })) {
            debug!("Work queue rejected the liveness probe");
        }
        generation
    }

    /// Returns false if the watchdog was stopped while sleeping.
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while self.running.load(SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::park_timeout(deadline - now);
        }
        false
    }

    fn report_violation(&self, own_tid: i64) {
        // The main thread first: its state is what the report is about, and it may recover at
        // any moment.
        let main_thread = match self.sampler.capture(self.primary.tid) {
            Ok(stack) => Some(ThreadStack {
                name: self.primary.name.clone(),
                ..stack
            }),
            Err(e) => {
                debug!(thread.id = self.primary.tid, error = %e, "Unable to capture main thread");
                None
            }
        };
        let other_threads = self.capture_other_threads(own_tid);

        let record = LivenessViolationRecord {
            threshold: self.config.timeout(),
            main_thread,
            other_threads,
            detection: Detection::Watchdog,
        };
        let report = record.to_report();
        warn!(
            thread.id = self.primary.tid,
            threads.other.count = record.other_threads.len(),
            "{}",
            report.message
        );
        self.sink.emit_report(&report);
    }

    fn capture_other_threads(&self, own_tid: i64) -> Vec<ThreadStack> {
        let tids = match self.sampler.list_threads() {
            Ok(tids) => tids,
            Err(e) => {
                debug!(error = %e, "Unable to list threads");
                return vec![];
            }
        };
        tids.into_iter()
            .filter(|tid| *tid != self.primary.tid && *tid != own_tid)
            .filter_map(|tid| match self.sampler.capture(tid) {
                Ok(stack) => Some(stack),
                Err(e) => {
                    debug!(thread.id = tid, error = %e, "Unable to capture thread");
                    None
                }
            })
            .take(self.config.max_other_threads())
            .collect()
    }
}
