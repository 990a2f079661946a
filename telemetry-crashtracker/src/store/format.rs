// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Positional, newline-delimited layout of the stored crash records.
//!
//! Runtime crash:    0 exception type, 1 message, 2 thread name, 3 thread id, 4+ stack trace.
//! Async-task crash: 0 exception type, 1 message, 2 thread name, 3 thread id, 4 task name,
//!                   5 cancelled (`true`/`false`), 6+ stack trace.
//! Native crash:     0 signal name, 1 fault address (hex), 2+ one return address per line.
//!
//! The last field is a multi-line payload written verbatim. Every other field is a single line,
//! so line breaks inside those fields are replaced before writing.

use crate::crash_info::{
    AsyncTaskCrashRecord, CrashKind, CrashRecord, NativeCrashRecord, RuntimeCrashRecord,
};
use crate::shared::constants::UNKNOWN_VALUE;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("Record is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("Native crash record has no signal name")]
    MissingSignalName,
}

fn single_line(field: &str) -> String {
    field.replace(['\r', '\n'], " ")
}

pub fn encode_runtime(record: &RuntimeCrashRecord) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}",
        single_line(&record.exception_type),
        single_line(&record.message),
        single_line(&record.thread_name),
        record.thread_id,
        record.stack_trace
    )
}

pub fn encode_async_task(record: &AsyncTaskCrashRecord) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}\n{}\n{}",
        single_line(&record.exception_type),
        single_line(&record.message),
        single_line(&record.thread_name),
        record.thread_id,
        single_line(&record.task_name),
        record.cancelled,
        record.stack_trace
    )
}

/// Same layout the signal handler produces byte by byte.
pub fn encode_native(record: &NativeCrashRecord) -> String {
    let mut out = format!(
        "{}\n{}\n",
        single_line(&record.signal_name),
        single_line(&record.fault_address)
    );
    for address in &record.backtrace {
        out.push_str(address);
        out.push('\n');
    }
    out
}

/// Positional view over the lines of a record. Every accessor has a default, so a short or
/// truncated record never indexes out of bounds.
///
/// Lines are split on `\n` only, so the trailing multi-line field comes back byte for byte,
/// including a final newline or `\r\n` pairs.
struct Fields<'a> {
    lines: Vec<&'a str>,
}

impl<'a> Fields<'a> {
    fn new(content: &'a str) -> Self {
        Self {
            lines: content.split('\n').collect(),
        }
    }

    /// A single-line field. The empty segment after a terminating newline is not a field.
    fn line(&self, index: usize) -> Option<&'a str> {
        let line = *self.lines.get(index)?;
        if line.is_empty() && index + 1 == self.lines.len() {
            return None;
        }
        Some(line.strip_suffix('\r').unwrap_or(line))
    }

    fn string(&self, index: usize) -> String {
        self.line(index)
            .map_or_else(|| UNKNOWN_VALUE.to_string(), str::to_string)
    }

    fn int(&self, index: usize) -> i64 {
        self.line(index)
            .and_then(|line| line.trim().parse().ok())
            .unwrap_or(0)
    }

    fn bool(&self, index: usize) -> bool {
        self.line(index).is_some_and(|line| line.trim() == "true")
    }

    fn trailing(&self, from: usize) -> String {
        self.lines.get(from..).unwrap_or_default().join("\n")
    }
}

pub fn decode(kind: CrashKind, bytes: &[u8]) -> Result<CrashRecord, FormatError> {
    let content = std::str::from_utf8(bytes)?;
    let fields = Fields::new(content);
    let record = match kind {
        CrashKind::Runtime => CrashRecord::Runtime(RuntimeCrashRecord {
            exception_type: fields.string(0),
            message: fields.string(1),
            thread_name: fields.string(2),
            thread_id: fields.int(3),
            stack_trace: fields.trailing(4),
        }),
        CrashKind::AsyncTask => CrashRecord::AsyncTask(AsyncTaskCrashRecord {
            exception_type: fields.string(0),
            message: fields.string(1),
            thread_name: fields.string(2),
            thread_id: fields.int(3),
            task_name: fields.string(4),
            cancelled: fields.bool(5),
            stack_trace: fields.trailing(6),
        }),
        CrashKind::Native => {
            let signal_name = fields.string(0);
            if signal_name.trim().is_empty() {
                return Err(FormatError::MissingSignalName);
            }
            CrashRecord::Native(NativeCrashRecord {
                signal_name: signal_name.trim().to_string(),
                fault_address: fields.string(1).trim().to_string(),
                backtrace: fields
                    .lines
                    .get(2..)
                    .unwrap_or_default()
                    .iter()
                    .map(|line| line.trim())
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect(),
            })
        }
    };
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime_record() -> RuntimeCrashRecord {
        RuntimeCrashRecord {
            exception_type: "example.NullRef".to_string(),
            message: "x was null".to_string(),
            thread_name: "main".to_string(),
            thread_id: 1,
            stack_trace: "at a()\nat b()".to_string(),
        }
    }

    #[test]
    fn test_runtime_layout() {
        assert_eq!(
            encode_runtime(&runtime_record()),
            "example.NullRef\nx was null\nmain\n1\nat a()\nat b()"
        );
    }

    #[test]
    fn test_async_task_layout() {
        let record = AsyncTaskCrashRecord {
            exception_type: "std::panic::Panic".to_string(),
            message: "boom".to_string(),
            thread_name: "tokio-runtime-worker".to_string(),
            thread_id: 77,
            task_name: "uploader".to_string(),
            cancelled: true,
            stack_trace: "at upload()".to_string(),
        };
        let encoded = encode_async_task(&record);
        assert_eq!(
            encoded,
            "std::panic::Panic\nboom\ntokio-runtime-worker\n77\nuploader\ntrue\nat upload()"
        );
        let decoded = decode(CrashKind::AsyncTask, encoded.as_bytes()).unwrap();
        assert_eq!(decoded, CrashRecord::AsyncTask(record));
    }

    #[test]
    fn test_single_line_fields_cannot_shift_the_layout() {
        let mut record = runtime_record();
        record.message = "line one\nline two\r\n".to_string();
        let decoded = decode(CrashKind::Runtime, encode_runtime(&record).as_bytes()).unwrap();
        let CrashRecord::Runtime(decoded) = decoded else {
            panic!("wrong kind");
        };
        assert_eq!(decoded.message, "line one line two  ");
        assert_eq!(decoded.thread_name, "main");
        assert_eq!(decoded.thread_id, 1);
        assert_eq!(decoded.stack_trace, "at a()\nat b()");
    }

    #[test]
    fn test_stack_trace_comes_back_verbatim() {
        for stack_trace in ["at a()\nat b()\n", "at a()\r\nat b()", "at a()\n\n", ""] {
            let mut record = runtime_record();
            record.stack_trace = stack_trace.to_string();
            let decoded = decode(CrashKind::Runtime, encode_runtime(&record).as_bytes()).unwrap();
            assert_eq!(decoded, CrashRecord::Runtime(record));
        }

        let record = AsyncTaskCrashRecord {
            exception_type: "std::panic::Panic".to_string(),
            message: String::new(),
            thread_name: "main".to_string(),
            thread_id: 3,
            task_name: "uploader".to_string(),
            cancelled: false,
            stack_trace: "panicked at src/lib.rs:1:1\n   0: upload\n".to_string(),
        };
        let decoded = decode(CrashKind::AsyncTask, encode_async_task(&record).as_bytes()).unwrap();
        assert_eq!(decoded, CrashRecord::AsyncTask(record));
    }

    #[test]
    fn test_crlf_single_line_fields() {
        let content = b"example.NullRef\r\nx was null\r\nmain\r\n4\r\n";
        let decoded = decode(CrashKind::Runtime, content).unwrap();
        let CrashRecord::Runtime(decoded) = decoded else {
            panic!("wrong kind");
        };
        assert_eq!(decoded.exception_type, "example.NullRef");
        assert_eq!(decoded.message, "x was null");
        assert_eq!(decoded.thread_id, 4);
        assert_eq!(decoded.stack_trace, "");
    }

    #[test]
    fn test_truncated_runtime_record_uses_defaults() {
        let decoded = decode(CrashKind::Runtime, b"example.NullRef\nx was null\n").unwrap();
        assert_eq!(
            decoded,
            CrashRecord::Runtime(RuntimeCrashRecord {
                exception_type: "example.NullRef".to_string(),
                message: "x was null".to_string(),
                thread_name: "unknown".to_string(),
                thread_id: 0,
                stack_trace: String::new(),
            })
        );
    }

    #[test]
    fn test_truncated_async_task_record_uses_defaults() {
        let decoded = decode(CrashKind::AsyncTask, b"T\nm\nworker\nnot-a-number").unwrap();
        let CrashRecord::AsyncTask(decoded) = decoded else {
            panic!("wrong kind");
        };
        assert_eq!(decoded.thread_id, 0);
        assert_eq!(decoded.task_name, "unknown");
        assert!(!decoded.cancelled);
        assert_eq!(decoded.stack_trace, "");
    }

    #[test]
    fn test_native_layout() {
        let content = b"SIGSEGV\n0x0\n0x55d0c0ffee\n0x55d0c0ffef\n";
        let decoded = decode(CrashKind::Native, content).unwrap();
        let expected = NativeCrashRecord {
            signal_name: "SIGSEGV".to_string(),
            fault_address: "0x0".to_string(),
            backtrace: vec!["0x55d0c0ffee".to_string(), "0x55d0c0ffef".to_string()],
        };
        assert_eq!(encode_native(&expected).as_bytes(), content);
        assert_eq!(decoded, CrashRecord::Native(expected));
    }

    #[test]
    fn test_native_without_backtrace() {
        let decoded = decode(CrashKind::Native, b"SIGABRT").unwrap();
        assert_eq!(
            decoded,
            CrashRecord::Native(NativeCrashRecord {
                signal_name: "SIGABRT".to_string(),
                fault_address: "unknown".to_string(),
                backtrace: vec![],
            })
        );
    }

    #[test]
    fn test_malformed_records() {
        decode(CrashKind::Native, b"\n0x0\n").unwrap_err();
        decode(CrashKind::Runtime, &[0xff, 0xfe, b'\n']).unwrap_err();
    }
}
