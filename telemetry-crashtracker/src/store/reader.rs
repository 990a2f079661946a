// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{format, CrashStore};
use crate::crash_info::CrashKind;
use crate::telemetry::TelemetrySink;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::debug;

/// Drains the record of `kind` stored at `path`, if any, and emits it to `sink`.
///
/// Returns whether a record was reported. A missing or empty file is a no-op. Any file that had
/// content is deleted before the report is emitted, including files that fail to parse, so a
/// record is never reported twice and a poison file never fails every subsequent start.
pub fn check_and_report(kind: CrashKind, path: &Path, sink: &dyn TelemetrySink) -> bool {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return false,
        Err(e) => {
            debug!(crash.kind = ?kind, path = %path.display(), error = %e, "Unreadable crash record");
            remove_record(path);
            return false;
        }
    };
    if bytes.is_empty() {
        return false;
    }

    let decoded = format::decode(kind, &bytes);
    remove_record(path);
    match decoded {
        Ok(record) => {
            sink.emit_report(&record.to_report());
            true
        }
        Err(e) => {
            debug!(crash.kind = ?kind, path = %path.display(), error = %e, "Dropping malformed crash record");
            false
        }
    }
}

/// Drains every kind of pending record. Returns the number of reports emitted.
///
/// Must run before the handlers are armed: arming the native handler truncates its slot.
pub fn report_pending_crashes(store: &CrashStore, sink: &dyn TelemetrySink) -> usize {
    CrashKind::ALL
        .iter()
        .filter(|kind| check_and_report(**kind, &store.path(**kind), sink))
        .count()
}

fn remove_record(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            debug!(path = %path.display(), error = %e, "Failed to delete crash record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash_info::{
        AsyncTaskCrashRecord, AttributeValue, NativeCrashRecord, RuntimeCrashRecord, Severity,
    };
    use crate::telemetry::MemorySink;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_runtime_crash_scenario() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = CrashStore::new(tmp.path());
        store.write_runtime_crash(&RuntimeCrashRecord {
            exception_type: "example.NullRef".to_string(),
            message: "x was null".to_string(),
            thread_name: "main".to_string(),
            thread_id: 1,
            stack_trace: "at a()\nat b()".to_string(),
        });

        let sink = MemorySink::new();
        let path = store.path(CrashKind::Runtime);
        assert!(check_and_report(CrashKind::Runtime, &path, &sink));
        assert!(!path.exists());

        let reports = sink.take();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.severity, Severity::Error);
        assert_eq!(report.message, "Runtime Crash: NullRef: x was null");
        assert_eq!(
            report.attribute("exception.type"),
            Some(&AttributeValue::from("example.NullRef"))
        );
        assert_eq!(
            report.attribute("thread.name"),
            Some(&AttributeValue::from("main"))
        );
        assert_eq!(report.attribute("thread.id"), Some(&AttributeValue::Int(1)));
        assert_eq!(
            report.attribute("exception.stacktrace"),
            Some(&AttributeValue::from("at a()\nat b()"))
        );
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_reported_stack_trace_keeps_its_last_newline() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = CrashStore::new(tmp.path());
        let sink = MemorySink::new();
        for stack_trace in ["at a()\nat b()\n", "at a()\r\nat b()"] {
            store.write_runtime_crash(&RuntimeCrashRecord {
                exception_type: "example.NullRef".to_string(),
                message: "x was null".to_string(),
                thread_name: "main".to_string(),
                thread_id: 1,
                stack_trace: stack_trace.to_string(),
            });
            let path = store.path(CrashKind::Runtime);
            assert!(check_and_report(CrashKind::Runtime, &path, &sink));
            let reports = sink.take();
            assert_eq!(
                reports[0].attribute("exception.stacktrace"),
                Some(&AttributeValue::from(stack_trace))
            );
            assert_eq!(
                reports[0].attribute("thread.name"),
                Some(&AttributeValue::from("main"))
            );
        }
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_drain_is_idempotent() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = CrashStore::new(tmp.path());
        store.write_async_task_crash(&AsyncTaskCrashRecord {
            exception_type: "std::panic::Panic".to_string(),
            message: "boom".to_string(),
            thread_name: "tokio-runtime-worker".to_string(),
            thread_id: 9,
            task_name: "uploader".to_string(),
            cancelled: false,
            stack_trace: String::new(),
        });

        let sink = MemorySink::new();
        let path = store.path(CrashKind::AsyncTask);
        assert!(check_and_report(CrashKind::AsyncTask, &path, &sink));
        assert!(!path.exists());
        assert!(!check_and_report(CrashKind::AsyncTask, &path, &sink));
        assert_eq!(sink.len(), 1);
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_missing_and_empty_files_are_no_ops() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let sink = MemorySink::new();
        let missing = tmp.path().join("missing.txt");
        assert!(!check_and_report(CrashKind::Runtime, &missing, &sink));

        // The native handler pre-opens (and so creates) its slot when it is armed
        let empty = tmp.path().join("empty.txt");
        fs::write(&empty, "")?;
        assert!(!check_and_report(CrashKind::Native, &empty, &sink));
        assert!(sink.is_empty());
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_truncated_file_reports_defaults_and_is_deleted() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("async.txt");
        fs::write(&path, "example.Oops\nbad state")?;

        let sink = MemorySink::new();
        assert!(check_and_report(CrashKind::AsyncTask, &path, &sink));
        assert!(!path.exists());
        let report = &sink.reports()[0];
        assert_eq!(
            report.attribute("task.name"),
            Some(&AttributeValue::from("unknown"))
        );
        assert_eq!(report.attribute("thread.id"), Some(&AttributeValue::Int(0)));
        assert_eq!(
            report.attribute("task.cancelled"),
            Some(&AttributeValue::Bool(false))
        );
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_malformed_file_is_deleted_without_report() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("native.txt");
        fs::write(&path, [0xc3, 0x28, b'\n', b'0'])?;

        let sink = MemorySink::new();
        assert!(!check_and_report(CrashKind::Native, &path, &sink));
        assert!(!path.exists());
        assert!(sink.is_empty());
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_report_pending_crashes_drains_every_kind() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = CrashStore::new(tmp.path());
        store.write_runtime_crash(&RuntimeCrashRecord {
            exception_type: "std::panic::Panic".to_string(),
            message: "main panicked".to_string(),
            thread_name: "main".to_string(),
            thread_id: 1,
            stack_trace: String::new(),
        });
        store.write_native_crash(&NativeCrashRecord {
            signal_name: "SIGBUS".to_string(),
            fault_address: "0xdead".to_string(),
            backtrace: vec!["0x1".to_string()],
        });

        let sink = MemorySink::new();
        assert_eq!(report_pending_crashes(&store, &sink), 2);
        assert_eq!(report_pending_crashes(&store, &sink), 0);

        let reports = sink.take();
        assert_eq!(reports[0].message, "Runtime Crash: Panic: main panicked");
        assert_eq!(reports[1].severity, Severity::Fatal);
        assert_eq!(reports[1].message, "Native Crash: SIGBUS at 0xdead");
        Ok(())
    }
}
