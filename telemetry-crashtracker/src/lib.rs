// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Crash and liveness reporting for long-running processes.
//!
//! Failures are captured on the failing thread, persisted to disk, and reported to a
//! [`TelemetrySink`] at the next process start, since the failing process may die before a live
//! report could be delivered. Each kind of failure has a single slot on disk:
//! 1. Panics reaching the process panic hook are written as runtime crashes. The hook chains to
//!    the one installed before it, so default panic output and any host hook still run.
//! 2. Panics inside tasks started with [`collector::spawn`] or [`collector::supervise`] are
//!    written as async-task crashes, with the task name and cancellation state.
//! 3. Fatal signals (SIGSEGV, SIGABRT, SIGBUS, SIGFPE, SIGILL, SIGTRAP) are written from inside
//!    the signal handler, where nothing may allocate or lock. All buffers are pre-allocated when
//!    the handler is armed, the return addresses are left unsymbolicated, and the signal is then
//!    re-raised with its original disposition so the process dies the way it would have anyway.
//!    <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
//!
//! Liveness is watched live rather than after the fact: [`watchdog::LivenessWatchdog`] posts a
//! probe to the main thread's work queue and reports, with thread stacks, when the probe is not
//! run within the timeout. Violations the platform recorded while nobody was watching are
//! reconciled at start-up by [`watchdog::check_historical_violations`].
//!
//! [`init`] drains pending records, then arms every capture path.
#![cfg(unix)]

mod api;
pub mod collector;
pub mod crash_info;
mod shared;
pub mod store;
pub mod telemetry;
pub mod watchdog;

pub use api::*;
pub use crash_info::{CrashKind, CrashRecord, Report, Severity};
pub use shared::configuration::{CrashtrackerConfiguration, WatchdogConfig};
pub use shared::constants;
pub use store::CrashStore;
pub use telemetry::{JsonFileSink, MemorySink, TelemetrySink, TracingSink};
