// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::collector::{register_crash_handlers, AsyncTaskExceptionHandler, UnhandledPanicHandler};
use crate::shared::configuration::CrashtrackerConfiguration;
use crate::store::{reader, CrashStore};
use crate::telemetry::TelemetrySink;
use anyhow::Context;
use std::fs;
use std::sync::Arc;
use tracing::debug;

/// Reports whatever the previous run of this process left behind, then arms every capture path.
///
/// The order matters: records must be drained before the handler for their kind is armed, or a
/// crash right after start-up could replace (or be mistaken for) the previous one.
///
/// PRECONDITIONS:
///     None
/// SAFETY:
///     Crash-tracking functions are not guaranteed to be reentrant.
///     No other crash-handler functions should be called concurrently.
/// ATOMICITY:
///     Arming is one-shot per process. A second call fails once the first has installed the
///     panic hook.
pub fn init(
    config: &CrashtrackerConfiguration,
    sink: &dyn TelemetrySink,
) -> anyhow::Result<Arc<CrashStore>> {
    fs::create_dir_all(config.crash_dir()).with_context(|| {
        format!(
            "Unable to create crash directory {}",
            config.crash_dir().display()
        )
    })?;
    let store = Arc::new(CrashStore::from_config(config));

    let reported = reader::report_pending_crashes(&store, sink);
    debug!(reported, crash_dir = %config.crash_dir().display(), "Drained pending crash records");

    UnhandledPanicHandler::install(store.clone())?;
    AsyncTaskExceptionHandler::global().set_store(store.clone());
    register_crash_handlers(config)?;
    Ok(store)
}

/// Drains every pending crash record to `sink`. Returns the number of reports emitted.
///
/// PRECONDITIONS:
///     Must run before the native handler is armed, which truncates the native record.
pub fn report_pending_crashes(
    config: &CrashtrackerConfiguration,
    sink: &dyn TelemetrySink,
) -> usize {
    reader::report_pending_crashes(&CrashStore::from_config(config), sink)
}

/// Reads an unmapped address, so the process dies of SIGSEGV.
/// Only meant for end-to-end verification of the native handler.
#[inline(never)]
pub fn trigger_native_crash_for_testing() {
    // Non-null, so the fault comes from the MMU and not from a debug-build null check.
    let address = std::hint::black_box(1usize) as *const u8;
    // SAFETY: none. Faulting is the point.
    unsafe {
        std::ptr::read_volatile(address);
    }
}
