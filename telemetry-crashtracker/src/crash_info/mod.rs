// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod records;
mod report;
mod sig_info;

pub use records::*;
pub use report::*;
pub use sig_info::*;

use crate::shared::constants;
use serde::{Deserialize, Serialize};

/// The kinds of crash that are persisted and drained at the next process start.
/// At most one record per kind is pending on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CrashKind {
    Runtime,
    AsyncTask,
    Native,
}

impl CrashKind {
    pub const ALL: [CrashKind; 3] = [CrashKind::Runtime, CrashKind::AsyncTask, CrashKind::Native];

    pub const fn file_name(&self) -> &'static str {
        match self {
            CrashKind::Runtime => constants::RUNTIME_CRASH_FILE,
            CrashKind::AsyncTask => constants::ASYNC_TASK_CRASH_FILE,
            CrashKind::Native => constants::NATIVE_CRASH_FILE,
        }
    }
}

/// A record of any persisted kind, as read back from disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrashRecord {
    Runtime(RuntimeCrashRecord),
    AsyncTask(AsyncTaskCrashRecord),
    Native(NativeCrashRecord),
}

impl CrashRecord {
    pub fn kind(&self) -> CrashKind {
        match self {
            CrashRecord::Runtime(_) => CrashKind::Runtime,
            CrashRecord::AsyncTask(_) => CrashKind::AsyncTask,
            CrashRecord::Native(_) => CrashKind::Native,
        }
    }

    pub fn to_report(&self) -> Report {
        match self {
            CrashRecord::Runtime(r) => r.to_report(),
            CrashRecord::AsyncTask(r) => r.to_report(),
            CrashRecord::Native(r) => r.to_report(),
        }
    }
}
