// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Disk-backed store-and-forward of crash records.
//!
//! Each crash kind owns a single slot (one file). Writing a record truncates the slot, so a second
//! crash before the first is drained replaces it. The writer runs on the failing thread and never
//! propagates a failure back into the crash path.

pub mod format;
pub mod reader;

use crate::crash_info::{AsyncTaskCrashRecord, CrashKind, NativeCrashRecord, RuntimeCrashRecord};
use crate::shared::configuration::CrashtrackerConfiguration;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to create crash directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write crash record {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashStore {
    dir: PathBuf,
}

impl CrashStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn from_config(config: &CrashtrackerConfiguration) -> Self {
        Self::new(config.crash_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, kind: CrashKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    /// Persists a runtime crash. Failures are logged and discarded.
    pub fn write_runtime_crash(&self, record: &RuntimeCrashRecord) {
        self.write_discarding(CrashKind::Runtime, &format::encode_runtime(record))
    }

    /// Persists an async-task crash. Failures are logged and discarded.
    pub fn write_async_task_crash(&self, record: &AsyncTaskCrashRecord) {
        self.write_discarding(CrashKind::AsyncTask, &format::encode_async_task(record))
    }

    /// Persists a native crash outside of signal context, in the layout the signal handler uses.
    pub fn write_native_crash(&self, record: &NativeCrashRecord) {
        self.write_discarding(CrashKind::Native, &format::encode_native(record))
    }

    fn write_discarding(&self, kind: CrashKind, contents: &str) {
        if let Err(e) = self.try_write(kind, contents) {
            debug!(crash.kind = ?kind, error = %e, "Discarding crash record");
        }
    }

    /// Truncates the slot for `kind` and writes `contents`, syncing before returning so the record
    /// survives the process dying right afterwards.
    pub fn try_write(&self, kind: CrashKind, contents: &str) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| StoreError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.path(kind);
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&path)?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()
        };
        write().map_err(|source| StoreError::Write {
            path: path.clone(),
            source,
        })
    }
}
