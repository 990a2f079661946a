// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod async_task;
mod crash_handler;
mod panic_handler;
mod signal_handler_manager;

pub use async_task::{
    spawn, supervise, AsyncTaskExceptionHandler, PanicSite, TaskContext, TaskFailure,
};
pub use panic_handler::{PanicHook, UnhandledPanicHandler, OPAQUE_PANIC_TYPE, PANIC_TYPE};
pub use signal_handler_manager::{crash_handlers_registered, register_crash_handlers};
