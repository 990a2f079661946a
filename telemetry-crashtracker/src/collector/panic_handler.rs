// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::async_task;
use crate::crash_info::RuntimeCrashRecord;
use crate::shared::threading::{get_current_thread_id, get_current_thread_name};
use crate::store::CrashStore;
use std::any::Any;
use std::panic::{self, Location, PanicHookInfo};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;
use tracing::debug;

pub type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Sync + Send + 'static>;

/// Exception type recorded for panics carrying a message.
pub const PANIC_TYPE: &str = "std::panic::Panic";
/// Exception type recorded for panics carrying any other payload.
pub const OPAQUE_PANIC_TYPE: &str = "core::any::Any";

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Records panics as runtime crashes, then hands them to the hook that was registered before it.
pub struct UnhandledPanicHandler {
    store: Arc<CrashStore>,
    previous: Option<PanicHook>,
}

impl UnhandledPanicHandler {
    pub fn new(store: Arc<CrashStore>, previous: Option<PanicHook>) -> Self {
        Self { store, previous }
    }

    /// Replaces the process panic hook with a handler chaining to the current one.
    ///
    /// PRECONDITIONS:
    ///     None
    /// ATOMICITY:
    ///     Only one handler may ever be installed. A second call returns an error and leaves the
    ///     installed hook untouched.
    pub fn install(store: Arc<CrashStore>) -> anyhow::Result<()> {
        anyhow::ensure!(
            INSTALLED
                .compare_exchange(false, true, SeqCst, SeqCst)
                .is_ok(),
            "Attempted to install the panic handler twice"
        );
        let handler = Self::new(store, Some(panic::take_hook()));
        panic::set_hook(Box::new(move |panic_info| handler.handle(panic_info)));
        Ok(())
    }

    /// Persists the panic, then chains. The previous hook runs whatever happened while persisting.
    ///
    /// Nothing on this path may panic: a panic inside the panic hook aborts the process.
    pub fn handle(&self, panic_info: &PanicHookInfo<'_>) {
        self.capture(panic_info);
        if let Some(previous) = &self.previous {
            previous(panic_info);
        }
    }

    fn capture(&self, panic_info: &PanicHookInfo<'_>) {
        // Panics inside a supervised task belong to the async-task handler.
        if async_task::stash_supervised_panic(panic_info) {
            debug!("Panic raised in a supervised task, deferring to the task handler");
            return;
        }
        let stack_trace = capture_stack_trace(panic_info.location());
        let record = runtime_record(panic_info.payload(), stack_trace);
        self.store.write_runtime_crash(&record);
    }
}

/// Splits a panic payload into an exception type and a message.
pub(crate) fn describe_payload(payload: &(dyn Any + Send)) -> (String, String) {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (PANIC_TYPE.to_string(), message.to_string())
    } else if let Some(message) = payload.downcast_ref::<String>() {
        (PANIC_TYPE.to_string(), message.clone())
    } else {
        (OPAQUE_PANIC_TYPE.to_string(), "Box<dyn Any>".to_string())
    }
}

/// Symbolized backtrace of the calling thread, headed by the panic location when known.
pub(crate) fn capture_stack_trace(location: Option<&Location<'_>>) -> String {
    let backtrace = backtrace::Backtrace::new();
    match location {
        Some(location) => format!("panicked at {location}\n{backtrace:?}"),
        None => format!("{backtrace:?}"),
    }
}

fn runtime_record(payload: &(dyn Any + Send), stack_trace: String) -> RuntimeCrashRecord {
    let (exception_type, message) = describe_payload(payload);
    RuntimeCrashRecord {
        exception_type,
        message,
        thread_name: get_current_thread_name(),
        thread_id: get_current_thread_id(),
        stack_trace,
    }
}
