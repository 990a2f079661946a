// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stacks of other live threads, captured from the watchdog thread.

use crate::crash_info::ThreadStack;
use crate::shared::constants::UNKNOWN_VALUE;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("Failed to read thread information: {0}")]
    Io(#[from] std::io::Error),
    #[error("Thread {0} did not record its stack in time")]
    Timeout(i64),
    #[error("Unable to signal thread {tid}: {source}")]
    Signal { tid: i64, source: nix::Error },
    #[error("Unable to install the sampling handler: {0}")]
    Install(String),
}

pub trait StackSampler: Send + Sync {
    /// Ids of every live thread of this process.
    fn list_threads(&self) -> Result<Vec<i64>, SamplerError>;

    /// Name, scheduler state and symbolized stack of thread `tid`.
    fn capture(&self, tid: i64) -> Result<ThreadStack, SamplerError>;
}

/// Knows no threads and captures empty stacks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStackSampler;

impl StackSampler for NoopStackSampler {
    fn list_threads(&self) -> Result<Vec<i64>, SamplerError> {
        Ok(vec![])
    }

    fn capture(&self, tid: i64) -> Result<ThreadStack, SamplerError> {
        Ok(ThreadStack {
            name: UNKNOWN_VALUE.to_string(),
            tid,
            state: UNKNOWN_VALUE.to_string(),
            stack_trace: String::new(),
        })
    }
}

pub fn default_sampler() -> Arc<dyn StackSampler> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(linux::ProcStackSampler::new())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(NoopStackSampler)
    }
}

/// Renders resolved frames one per line, `at <symbol> (<file>:<line>)`, falling back to the raw
/// address for frames without symbols.
pub(crate) fn symbolize(ips: &[usize]) -> String {
    let mut lines = Vec::with_capacity(ips.len());
    for ip in ips {
        let mut resolved = false;
        backtrace::resolve(*ip as *mut std::ffi::c_void, |symbol| {
            resolved = true;
            let name = symbol
                .name()
                .map_or_else(|| format!("{ip:#x}"), |name| name.to_string());
            match (symbol.filename(), symbol.lineno()) {
                (Some(file), Some(line)) => {
                    lines.push(format!("at {name} ({}:{line})", file.display()))
                }
                _ => lines.push(format!("at {name}")),
            }
        });
        if !resolved {
            lines.push(format!("at {ip:#x}"));
        }
    }
    lines.join("\n")
}

#[cfg(target_os = "linux")]
pub use linux::ProcStackSampler;

#[cfg(target_os = "linux")]
mod linux {
    use super::{symbolize, SamplerError, StackSampler};
    use crate::crash_info::ThreadStack;
    use crate::shared::constants::{MAX_BACKTRACE_FRAMES, STACK_SAMPLE_TIMEOUT, UNKNOWN_VALUE};
    use crate::shared::threading::get_current_thread_id;
    use libc::{c_int, c_void, siginfo_t};
    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, Signal};
    use std::fs;
    use std::ptr;
    use std::sync::atomic::Ordering::SeqCst;
    use std::sync::atomic::{AtomicI64, AtomicU8, AtomicUsize};
    use std::sync::{Mutex, OnceLock};
    use std::time::{Duration, Instant};

    /// Directed at one thread with `tgkill`. Ignored by default, so a stray delivery is harmless.
    const SAMPLE_SIGNAL: Signal = Signal::SIGURG;

    const IDLE: u8 = 0;
    const REQUESTED: u8 = 1;
    const WRITING: u8 = 2;
    const DONE: u8 = 3;

    // Written only by the sampled thread's signal handler between REQUESTED and DONE.
    static mut SAMPLE_FRAMES: [usize; MAX_BACKTRACE_FRAMES] = [0; MAX_BACKTRACE_FRAMES];
    static SAMPLE_DEPTH: AtomicUsize = AtomicUsize::new(0);
    static SAMPLE_STATE: AtomicU8 = AtomicU8::new(IDLE);
    static SAMPLE_TARGET: AtomicI64 = AtomicI64::new(0);
    // One sample in flight per process.
    static SAMPLE_LOCK: Mutex<()> = Mutex::new(());
    static HANDLER_INSTALLED: OnceLock<Result<(), String>> = OnceLock::new();

    extern "C" fn handle_sample_signal(_signum: c_int, _info: *mut siginfo_t, _ctx: *mut c_void) {
        if SAMPLE_TARGET.load(SeqCst) != get_current_thread_id() {
            return;
        }
        if SAMPLE_STATE
            .compare_exchange(REQUESTED, WRITING, SeqCst, SeqCst)
            .is_err()
        {
            return;
        }
        let frames = ptr::addr_of_mut!(SAMPLE_FRAMES).cast::<usize>();
        let mut depth = 0;
        // SAFETY: the state machine gives this handler exclusive access to the frame buffer.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                *frames.add(depth) = frame.ip() as usize;
                depth += 1;
                depth < MAX_BACKTRACE_FRAMES
            });
        }
        SAMPLE_DEPTH.store(depth, SeqCst);
        SAMPLE_STATE.store(DONE, SeqCst);
    }

    fn install_handler() -> Result<(), SamplerError> {
        HANDLER_INSTALLED
            .get_or_init(|| {
                // SA_RESTART keeps restartable syscalls of the sampled thread from seeing EINTR.
                let action = SigAction::new(
                    SigHandler::SigAction(handle_sample_signal),
                    SaFlags::SA_RESTART,
                    signal::SigSet::empty(),
                );
                // SAFETY: the handler only touches atomics and the pre-allocated frame buffer.
                unsafe { signal::sigaction(SAMPLE_SIGNAL, &action) }
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            })
            .clone()
            .map_err(SamplerError::Install)
    }

    /// Reads thread names and states from `/proc/self/task`, and stacks by asking the thread to
    /// walk its own stack from a signal handler.
    ///
    /// The first capture installs a SIGURG handler for the whole process, replacing any handler
    /// the host had. `SA_RESTART` covers restartable syscalls only: a sampled thread blocked in
    /// `poll`, `epoll_wait`, `select` or `nanosleep` sees it fail with `EINTR`. Hosts that
    /// cannot tolerate either should use [`super::NoopStackSampler`].
    #[derive(Debug, Clone)]
    pub struct ProcStackSampler {
        timeout: Duration,
    }

    impl Default for ProcStackSampler {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ProcStackSampler {
        pub fn new() -> Self {
            Self {
                timeout: STACK_SAMPLE_TIMEOUT,
            }
        }

        pub fn with_timeout(timeout: Duration) -> Self {
            Self { timeout }
        }

        fn sample(&self, tid: i64) -> Result<Vec<usize>, SamplerError> {
            install_handler()?;
            let _guard = match SAMPLE_LOCK.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            SAMPLE_TARGET.store(tid, SeqCst);
            SAMPLE_STATE.store(REQUESTED, SeqCst);

            // SAFETY: tgkill has no memory safety preconditions.
            let rval = unsafe {
                libc::syscall(
                    libc::SYS_tgkill,
                    libc::getpid(),
                    tid,
                    SAMPLE_SIGNAL as c_int,
                )
            };
            if rval != 0 {
                SAMPLE_STATE.store(IDLE, SeqCst);
                return Err(SamplerError::Signal {
                    tid,
                    source: nix::Error::last(),
                });
            }

            let deadline = Instant::now() + self.timeout;
            while SAMPLE_STATE.load(SeqCst) != DONE {
                if Instant::now() >= deadline
                    && SAMPLE_STATE
                        .compare_exchange(REQUESTED, IDLE, SeqCst, SeqCst)
                        .is_ok()
                {
                    return Err(SamplerError::Timeout(tid));
                }
                // Once WRITING, the walk is bounded and finishes shortly.
                std::thread::sleep(Duration::from_millis(1));
            }

            let depth = SAMPLE_DEPTH.load(SeqCst).min(MAX_BACKTRACE_FRAMES);
            let frames = ptr::addr_of!(SAMPLE_FRAMES).cast::<usize>();
            // SAFETY: DONE means the handler finished writing `depth` frames, and no new sample
            // can start while the lock is held.
            let ips = unsafe { std::slice::from_raw_parts(frames, depth) }.to_vec();
            SAMPLE_STATE.store(IDLE, SeqCst);
            Ok(ips)
        }
    }

    impl StackSampler for ProcStackSampler {
        fn list_threads(&self) -> Result<Vec<i64>, SamplerError> {
            let mut tids = vec![];
            for entry in fs::read_dir("/proc/self/task")? {
                if let Some(tid) = entry?
                    .file_name()
                    .to_str()
                    .and_then(|name| name.parse().ok())
                {
                    tids.push(tid);
                }
            }
            tids.sort_unstable();
            Ok(tids)
        }

        fn capture(&self, tid: i64) -> Result<ThreadStack, SamplerError> {
            let name = fs::read_to_string(format!("/proc/self/task/{tid}/comm"))?
                .trim_end()
                .to_string();
            let stat = fs::read_to_string(format!("/proc/self/task/{tid}/stat"))?;
            let stack_trace = if tid == get_current_thread_id() {
                let mut ips = vec![];
                backtrace::trace(|frame| {
                    ips.push(frame.ip() as usize);
                    ips.len() < MAX_BACKTRACE_FRAMES
                });
                symbolize(&ips)
            } else {
                symbolize(&self.sample(tid)?)
            };
            Ok(ThreadStack {
                name,
                tid,
                state: parse_state(&stat).unwrap_or(UNKNOWN_VALUE).to_string(),
                stack_trace,
            })
        }
    }

    /// The state letter follows the parenthesized command name, which may itself contain spaces
    /// and parentheses.
    pub(super) fn parse_state(stat: &str) -> Option<&str> {
        let (_, rest) = stat.rsplit_once(')')?;
        rest.split_whitespace().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_sampler() -> anyhow::Result<()> {
        let sampler = NoopStackSampler;
        assert!(sampler.list_threads()?.is_empty());
        let stack = sampler.capture(7)?;
        assert_eq!(stack.tid, 7);
        assert_eq!(stack.name, "unknown");
        assert!(stack.stack_trace.is_empty());
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_symbolize_unknown_address() {
        assert_eq!(symbolize(&[0x1]), "at 0x1");
        assert_eq!(symbolize(&[]), "");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parse_state() {
        assert_eq!(linux::parse_state("42 (main) S 1 42 42"), Some("S"));
        assert_eq!(linux::parse_state("43 (tokio (worker) 1) R 1"), Some("R"));
        assert_eq!(linux::parse_state("garbage"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_capture_blocked_thread() -> anyhow::Result<()> {
        use crate::shared::threading::get_current_thread_id;
        use std::sync::mpsc;

        let (tid_tx, tid_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let blocked = std::thread::Builder::new()
            .name("blocked".to_string())
            .spawn(move || {
                tid_tx.send(get_current_thread_id()).unwrap();
                release_rx.recv().unwrap();
            })?;
        let tid = tid_rx.recv()?;

        let sampler = ProcStackSampler::with_timeout(std::time::Duration::from_secs(5));
        assert!(sampler.list_threads()?.contains(&tid));
        let stack = sampler.capture(tid)?;
        assert_eq!(stack.tid, tid);
        assert_eq!(stack.name, "blocked");
        assert!(!stack.stack_trace.is_empty());

        release_tx.send(())?;
        blocked.join().unwrap();
        Ok(())
    }
}
