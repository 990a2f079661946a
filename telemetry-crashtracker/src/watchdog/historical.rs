// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cold-start reconciliation of liveness violations recorded by the platform while this process
//! was not running to see them.

use crate::crash_info::{Detection, LivenessViolationRecord};
use crate::shared::configuration::CrashtrackerConfiguration;
use crate::shared::constants::DEFAULT_WATCHDOG_TIMEOUT;
use crate::telemetry::TelemetrySink;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    LivenessViolation,
    Crash,
    NativeCrash,
    LowMemory,
    ExitSelf,
    Signaled,
    Other,
}

/// One past abnormal termination, as the platform remembers it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationRecord {
    pub reason: TerminationReason,
    pub timestamp_ms: i64,
    pub description: String,
    pub pid: i32,
}

pub trait TerminationHistory {
    fn recent_terminations(&self) -> anyhow::Result<Vec<TerminationRecord>>;
}

/// Termination history kept by the host as a JSON array of [`TerminationRecord`].
/// A missing file is an empty history.
#[derive(Debug, Clone)]
pub struct JsonTerminationHistory {
    path: PathBuf,
}

impl JsonTerminationHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TerminationHistory for JsonTerminationHistory {
    fn recent_terminations(&self) -> anyhow::Result<Vec<TerminationRecord>> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Malformed termination history {}", self.path.display())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(vec![]),
            Err(e) => Err(e.into()),
        }
    }
}

/// Timestamp, in milliseconds, of the newest historical violation already reported.
/// It only ever moves forward.
#[derive(Debug, Clone)]
pub struct WatermarkStore {
    path: PathBuf,
}

impl WatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_config(config: &CrashtrackerConfiguration) -> Self {
        Self::new(config.watermark_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `0` until a watermark has been written. An unreadable value is treated the same way.
    pub fn load(&self) -> anyhow::Result<i64> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents.trim().parse().unwrap_or_else(|e| {
                debug!(path = %self.path.display(), error = %e, "Ignoring malformed watermark");
                0
            })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e).with_context(|| format!("Unable to read {}", self.path.display())),
        }
    }

    /// Moves the watermark to `timestamp_ms` if that is newer. Returns whether it moved.
    pub fn advance(&self, timestamp_ms: i64) -> anyhow::Result<bool> {
        if timestamp_ms <= self.load()? {
            return Ok(false);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&self.path)
            .with_context(|| format!("Unable to write {}", self.path.display()))?;
        file.write_all(timestamp_ms.to_string().as_bytes())?;
        file.sync_all()?;
        Ok(true)
    }
}

/// Reports every liveness violation in `history` newer than the watermark, oldest first, then
/// advances the watermark to the newest one. Returns the number of reports emitted.
///
/// Diagnostic only: any failure is logged and swallowed.
pub fn check_historical_violations(
    history: &dyn TerminationHistory,
    watermark: &WatermarkStore,
    sink: &dyn TelemetrySink,
) -> usize {
    match report_newer_than_watermark(history, watermark, sink) {
        Ok(reported) => reported,
        Err(e) => {
            debug!(error = ?e, "Historical liveness check failed");
            0
        }
    }
}

fn report_newer_than_watermark(
    history: &dyn TerminationHistory,
    watermark: &WatermarkStore,
    sink: &dyn TelemetrySink,
) -> anyhow::Result<usize> {
    let since = watermark.load()?;
    let mut violations: Vec<TerminationRecord> = history
        .recent_terminations()?
        .into_iter()
        .filter(|t| t.reason == TerminationReason::LivenessViolation && t.timestamp_ms > since)
        .collect();
    violations.sort_by_key(|t| t.timestamp_ms);

    for violation in &violations {
        let record = LivenessViolationRecord {
            threshold: DEFAULT_WATCHDOG_TIMEOUT,
            main_thread: None,
            other_threads: vec![],
            detection: Detection::Historical {
                timestamp_ms: violation.timestamp_ms,
                description: violation.description.clone(),
                pid: violation.pid,
            },
        };
        sink.emit_report(&record.to_report());
    }
    if let Some(newest) = violations.last() {
        watermark.advance(newest.timestamp_ms)?;
    }
    Ok(violations.len())
}
