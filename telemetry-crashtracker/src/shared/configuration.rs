// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use crate::crash_info::{default_signals, signal_from_signum, CrashKind};
use crate::shared::constants;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashtrackerConfiguration {
    // Directory holding one pending record per crash kind, plus the liveness watermark
    crash_dir: PathBuf,
    create_alt_stack: bool,
    signals: Vec<i32>,
    use_alt_stack: bool,
}

impl CrashtrackerConfiguration {
    pub fn new(
        crash_dir: impl Into<PathBuf>,
        create_alt_stack: bool,
        use_alt_stack: bool,
        mut signals: Vec<i32>,
    ) -> anyhow::Result<Self> {
        // Requesting to create, but not use, the altstack is considered paradoxical.
        anyhow::ensure!(
            !create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        let crash_dir = crash_dir.into();
        anyhow::ensure!(
            !crash_dir.as_os_str().is_empty(),
            "The crash directory must not be empty"
        );
        if signals.is_empty() {
            signals = default_signals();
        } else {
            // Ensure we don't have double elements in the signals list.
            let before_len = signals.len();
            signals.sort();
            signals.dedup();
            anyhow::ensure!(
                before_len == signals.len(),
                "Signals contained duplicate elements"
            );
            // Only the fatal signals can be tracked
            signals
                .iter()
                .try_for_each(|x| signal_from_signum(*x).map(|_| ()))?;
        }

        Ok(Self {
            crash_dir,
            create_alt_stack,
            signals,
            use_alt_stack,
        })
    }

    /// A configuration with the default signal set and an alternate stack, which is what
    /// most hosts want.
    pub fn with_crash_dir(crash_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        Self::new(crash_dir, true, true, vec![])
    }

    pub fn crash_dir(&self) -> &Path {
        &self.crash_dir
    }

    pub fn record_path(&self, kind: CrashKind) -> PathBuf {
        self.crash_dir.join(kind.file_name())
    }

    pub fn watermark_path(&self) -> PathBuf {
        self.crash_dir.join(constants::LIVENESS_WATERMARK_FILE)
    }

    pub fn create_alt_stack(&self) -> bool {
        self.create_alt_stack
    }

    pub fn use_alt_stack(&self) -> bool {
        self.use_alt_stack
    }

    pub fn signals(&self) -> &Vec<i32> {
        &self.signals
    }

    pub fn set_create_alt_stack(&mut self, create_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            !create_alt_stack || self.use_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.create_alt_stack = create_alt_stack;
        Ok(())
    }

    pub fn set_use_alt_stack(&mut self, use_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.use_alt_stack = use_alt_stack;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// A probe not drained by the main thread within this duration is a violation.
    timeout: Duration,
    /// Cap on the number of non-main threads whose stacks end up in a report.
    max_other_threads: usize,
    /// A stalled main thread under a debugger is expected, so cycles are skipped.
    skip_when_debugged: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout: constants::DEFAULT_WATCHDOG_TIMEOUT,
            max_other_threads: constants::DEFAULT_MAX_OTHER_THREADS,
            skip_when_debugged: true,
        }
    }
}

impl WatchdogConfig {
    pub fn new(
        timeout: Duration,
        max_other_threads: usize,
        skip_when_debugged: bool,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(!timeout.is_zero(), "The watchdog timeout must be positive");
        Ok(Self {
            timeout,
            max_other_threads,
            skip_when_debugged,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_other_threads(&self) -> usize {
        self.max_other_threads
    }

    pub fn skip_when_debugged(&self) -> bool {
        self.skip_when_debugged
    }
}
