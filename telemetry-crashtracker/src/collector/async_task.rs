// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Capture of panics raised inside supervised tokio tasks.
//!
//! A supervised task runs with a [`TaskContext`] in task-local storage. When it panics, the
//! process panic hook notices the context, stashes the failing site (thread and backtrace) into it
//! and leaves persistence to [`supervise`], which reports the failure through the process-wide
//! [`AsyncTaskExceptionHandler`] once the unwind is caught, then resumes the unwind so the task's
//! `JoinHandle` still observes the panic.

use super::panic_handler::{capture_stack_trace, describe_payload};
use crate::crash_info::AsyncTaskCrashRecord;
use crate::shared::constants::UNKNOWN_VALUE;
use crate::shared::threading::{get_current_thread_id, get_current_thread_name};
use crate::store::CrashStore;
use arc_swap::ArcSwapOption;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe, PanicHookInfo};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Best-effort description of the task that failed.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    pub name: Option<String>,
    pub cancellation: Option<CancellationToken>,
}

impl TaskContext {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            cancellation: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn task_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| UNKNOWN_VALUE.to_string())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

/// Where a task panicked, captured on the failing thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicSite {
    pub thread_name: String,
    pub thread_id: i64,
    pub stack_trace: String,
}

impl PanicSite {
    fn capture(stack_trace: String) -> Self {
        Self {
            thread_name: get_current_thread_name(),
            thread_id: get_current_thread_id(),
            stack_trace,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub exception_type: String,
    pub message: String,
    pub site: PanicSite,
}

impl TaskFailure {
    /// Builds a failure from a caught panic payload. Without a stashed site, the site is the
    /// current thread and backtrace.
    pub fn from_panic(payload: &(dyn Any + Send), site: Option<PanicSite>) -> Self {
        let (exception_type, message) = describe_payload(payload);
        let site = site.unwrap_or_else(|| PanicSite::capture(capture_stack_trace(None)));
        Self {
            exception_type,
            message,
            site,
        }
    }
}

/// Process-wide entry point for async-task failures.
///
/// May be looked up before any store exists; until one is bound, failures are dropped.
pub struct AsyncTaskExceptionHandler {
    store: ArcSwapOption<CrashStore>,
}

static HANDLER: OnceLock<AsyncTaskExceptionHandler> = OnceLock::new();

impl AsyncTaskExceptionHandler {
    fn new() -> Self {
        Self {
            store: ArcSwapOption::empty(),
        }
    }

    pub fn global() -> &'static AsyncTaskExceptionHandler {
        HANDLER.get_or_init(Self::new)
    }

    pub fn set_store(&self, store: Arc<CrashStore>) {
        self.store.store(Some(store));
    }

    pub fn clear_store(&self) {
        self.store.store(None);
    }

    pub fn has_store(&self) -> bool {
        self.store.load().is_some()
    }

    /// Persists `failure` as an async-task crash. A silent no-op while no store is bound.
    pub fn handle(&self, context: &TaskContext, failure: &TaskFailure) {
        let guard = self.store.load();
        let Some(store) = &*guard else {
            return;
        };
        let record = AsyncTaskCrashRecord {
            exception_type: failure.exception_type.clone(),
            message: failure.message.clone(),
            thread_name: failure.site.thread_name.clone(),
            thread_id: failure.site.thread_id,
            task_name: context.task_name(),
            cancelled: context.is_cancelled(),
            stack_trace: failure.site.stack_trace.clone(),
        };
        store.write_async_task_crash(&record);
    }
}

struct TaskScope {
    context: TaskContext,
    site: Mutex<Option<PanicSite>>,
}

impl TaskScope {
    fn take_site(&self) -> Option<PanicSite> {
        match self.site.lock() {
            Ok(mut site) => site.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

tokio::task_local! {
    static TASK_SCOPE: Arc<TaskScope>;
}

/// Called from the panic hook. Returns whether the panic happened inside a supervised task, in
/// which case the failing site was stashed for [`supervise`].
pub(crate) fn stash_supervised_panic(panic_info: &PanicHookInfo<'_>) -> bool {
    TASK_SCOPE
        .try_with(|scope| {
            let site = PanicSite::capture(capture_stack_trace(panic_info.location()));
            match scope.site.lock() {
                Ok(mut slot) => *slot = Some(site),
                Err(poisoned) => *poisoned.into_inner() = Some(site),
            }
        })
        .is_ok()
}

/// Runs `future`, reporting a panic through [`AsyncTaskExceptionHandler::global`] before
/// propagating it unchanged.
pub async fn supervise<F>(context: TaskContext, future: F) -> F::Output
where
    F: Future,
{
    let scope = Arc::new(TaskScope {
        context,
        site: Mutex::new(None),
    });
    let outcome = TASK_SCOPE
        .scope(scope.clone(), AssertUnwindSafe(future).catch_unwind())
        .await;
    match outcome {
        Ok(output) => output,
        Err(payload) => {
            let failure = TaskFailure::from_panic(payload.as_ref(), scope.take_site());
            debug!(
                task.name = %scope.context.task_name(),
                exception.message = %failure.message,
                "Supervised task panicked"
            );
            AsyncTaskExceptionHandler::global().handle(&scope.context, &failure);
            panic::resume_unwind(payload)
        }
    }
}

/// Spawns `future` on the current tokio runtime under [`supervise`].
pub fn spawn<F>(context: TaskContext, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(supervise(context, future))
}
