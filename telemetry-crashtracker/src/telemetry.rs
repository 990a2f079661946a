// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The structured-telemetry sink that ultimately receives every report.
//!
//! Delivery is the sink's concern: the crashtracker hands each report over exactly once and never
//! retries.

use crate::crash_info::{AttributeValue, Report, Severity};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, info};

pub trait TelemetrySink: Send + Sync {
    fn emit(&self, severity: Severity, message: &str, attributes: &BTreeMap<String, AttributeValue>);

    fn emit_report(&self, report: &Report) {
        self.emit(report.severity, &report.message, &report.attributes)
    }
}

/// Emits reports as `tracing` events, with the attributes rendered as a JSON object.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, severity: Severity, message: &str, attributes: &BTreeMap<String, AttributeValue>) {
        let attributes = serde_json::to_string(attributes).unwrap_or_default();
        match severity {
            Severity::Info => info!(severity = severity.as_str(), %attributes, "{message}"),
            Severity::Error | Severity::Fatal => {
                error!(severity = severity.as_str(), %attributes, "{message}")
            }
        }
    }
}

/// Appends each report as one JSON object per line.
#[derive(Debug)]
pub struct JsonFileSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, report: &Report) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(report)?;
        line.push('\n');
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("json sink lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

impl TelemetrySink for JsonFileSink {
    fn emit(&self, severity: Severity, message: &str, attributes: &BTreeMap<String, AttributeValue>) {
        let report = Report {
            severity,
            message: message.to_string(),
            attributes: attributes.clone(),
        };
        if let Err(e) = self.append(&report) {
            debug!(sink.path = %self.path.display(), error = %e, "Failed to append report");
        }
    }
}

/// Keeps every report in memory; useful for hosts that forward reports themselves.
#[derive(Debug, Default)]
pub struct MemorySink {
    reports: Mutex<Vec<Report>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<Report> {
        match self.reports.lock() {
            Ok(reports) => reports.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn take(&self) -> Vec<Report> {
        match self.reports.lock() {
            Ok(mut reports) => std::mem::take(&mut *reports),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    pub fn len(&self) -> usize {
        self.reports().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TelemetrySink for MemorySink {
    fn emit(&self, severity: Severity, message: &str, attributes: &BTreeMap<String, AttributeValue>) {
        let report = Report {
            severity,
            message: message.to_string(),
            attributes: attributes.clone(),
        };
        match self.reports.lock() {
            Ok(mut reports) => reports.push(report),
            Err(poisoned) => poisoned.into_inner().push(report),
        }
    }
}
