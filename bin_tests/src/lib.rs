// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helpers for tests that need a whole process to crash.
//!
//! The `crashtracker_bin_test` binary arms the crashtracker and then fails in the way its mode
//! asks for. Running it again in [`Mode::Report`] drains what the first run left behind into a
//! JSON-lines report file, which the tests then inspect.

use anyhow::Context;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::str::FromStr;
use telemetry_crashtracker::Report;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Arms the crashtracker, reporting anything pending, and exits normally.
    Report,
    /// Reads an unmapped address.
    Segfault,
    /// Calls `abort`.
    Abort,
    /// Panics on the main thread.
    Panic,
    /// Panics inside a supervised tokio task, then exits normally.
    AsyncPanic,
    /// Installs a SIGSEGV handler exiting with [`CHAINED_EXIT_CODE`] before arming, then
    /// segfaults.
    Chaining,
}

/// Exit code of the handler installed in [`Mode::Chaining`].
pub const CHAINED_EXIT_CODE: i32 = 42;

impl Mode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Mode::Report => "report",
            Mode::Segfault => "segfault",
            Mode::Abort => "abort",
            Mode::Panic => "panic",
            Mode::AsyncPanic => "async_panic",
            Mode::Chaining => "chaining",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "report" => Mode::Report,
            "segfault" => Mode::Segfault,
            "abort" => Mode::Abort,
            "panic" => Mode::Panic,
            "async_panic" => Mode::AsyncPanic,
            "chaining" => Mode::Chaining,
            other => anyhow::bail!("Unknown mode {other}"),
        })
    }
}

/// A scratch directory holding the crash records and the report file of one test.
pub struct TestFixtures {
    _tmpdir: tempfile::TempDir,
    pub crash_dir: PathBuf,
    pub reports_path: PathBuf,
}

impl TestFixtures {
    pub fn new() -> anyhow::Result<Self> {
        let tmpdir = tempfile::TempDir::new()?;
        let crash_dir = tmpdir.path().join("crashes");
        let reports_path = tmpdir.path().join("reports.jsonl");
        Ok(Self {
            _tmpdir: tmpdir,
            crash_dir,
            reports_path,
        })
    }

    /// Runs `binary` in `mode` against these fixtures and waits for it.
    pub fn run(&self, binary: &Path, mode: Mode) -> anyhow::Result<process::ExitStatus> {
        process::Command::new(binary)
            .arg(mode.as_str())
            .arg(&self.crash_dir)
            .arg(&self.reports_path)
            .status()
            .with_context(|| format!("Unable to run {} in {mode} mode", binary.display()))
    }

    /// Every report emitted so far, in order. No report file means no reports.
    pub fn read_reports(&self) -> anyhow::Result<Vec<Report>> {
        let contents = match fs::read_to_string(&self.reports_path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e).context("reading the report file"),
        };
        contents
            .lines()
            .map(|line| serde_json::from_str(line).context("deserializing a report"))
            .collect()
    }
}

#[macro_export]
macro_rules! timeit {
    ($op_name:literal, $op:block) => {{
        let start = std::time::Instant::now();
        let res = $op;
        let delta = start.elapsed();
        println!(
            concat!($op_name, " took {} ms"),
            delta.as_secs_f64() * 1000.0
        );
        res
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_names_round_trip() {
        for mode in [
            Mode::Report,
            Mode::Segfault,
            Mode::Abort,
            Mode::Panic,
            Mode::AsyncPanic,
            Mode::Chaining,
        ] {
            assert_eq!(mode.as_str().parse::<Mode>().unwrap(), mode);
        }
        "explode".parse::<Mode>().unwrap_err();
    }
}
