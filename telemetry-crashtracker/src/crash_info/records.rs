// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use super::report::{short_type_name, Report, Severity};
use super::sig_info::SignalNames;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A panic that reached the process panic hook outside of any supervised task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeCrashRecord {
    pub exception_type: String,
    pub message: String,
    pub thread_name: String,
    pub thread_id: i64,
    pub stack_trace: String,
}

/// A panic raised inside a supervised async task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncTaskCrashRecord {
    pub exception_type: String,
    pub message: String,
    pub thread_name: String,
    pub thread_id: i64,
    pub task_name: String,
    pub cancelled: bool,
    pub stack_trace: String,
}

/// A fatal signal, as written from inside the signal handler.
/// Addresses are left unsymbolicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeCrashRecord {
    pub signal_name: String,
    pub fault_address: String,
    pub backtrace: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadStack {
    pub name: String,
    pub tid: i64,
    pub state: String,
    pub stack_trace: String,
}

impl ThreadStack {
    fn render(&self) -> String {
        format!(
            "\"{}\" tid={} state={}\n{}",
            self.name, self.tid, self.state, self.stack_trace
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Detection {
    /// Detected live by the watchdog thread.
    Watchdog,
    /// Reconciled at cold start from the platform's list of past terminations.
    Historical {
        timestamp_ms: i64,
        description: String,
        pid: i32,
    },
}

impl Detection {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Detection::Watchdog => "watchdog",
            Detection::Historical { .. } => "historical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessViolationRecord {
    pub threshold: Duration,
    pub main_thread: Option<ThreadStack>,
    pub other_threads: Vec<ThreadStack>,
    pub detection: Detection,
}

impl RuntimeCrashRecord {
    pub fn to_report(&self) -> Report {
        Report::new(
            Severity::Error,
            format!(
                "Runtime Crash: {}: {}",
                short_type_name(&self.exception_type),
                self.message
            ),
        )
        .with_attribute("crash.kind", "runtime")
        .with_attribute("exception.type", self.exception_type.as_str())
        .with_attribute("exception.message", self.message.as_str())
        .with_attribute("exception.stacktrace", self.stack_trace.as_str())
        .with_attribute("thread.name", self.thread_name.as_str())
        .with_attribute("thread.id", self.thread_id)
    }
}

impl AsyncTaskCrashRecord {
    pub fn to_report(&self) -> Report {
        Report::new(
            Severity::Error,
            format!(
                "Async Task Crash: {}: {}",
                short_type_name(&self.exception_type),
                self.message
            ),
        )
        .with_attribute("crash.kind", "async_task")
        .with_attribute("exception.type", self.exception_type.as_str())
        .with_attribute("exception.message", self.message.as_str())
        .with_attribute("exception.stacktrace", self.stack_trace.as_str())
        .with_attribute("thread.name", self.thread_name.as_str())
        .with_attribute("thread.id", self.thread_id)
        .with_attribute("task.name", self.task_name.as_str())
        .with_attribute("task.cancelled", self.cancelled)
    }
}

impl NativeCrashRecord {
    pub fn signal(&self) -> SignalNames {
        SignalNames::from_name(&self.signal_name)
    }

    pub fn to_report(&self) -> Report {
        Report::new(
            Severity::Fatal,
            format!(
                "Native Crash: {} at {}",
                self.signal_name, self.fault_address
            ),
        )
        .with_attribute("crash.kind", "native")
        .with_attribute("signal.name", self.signal_name.as_str())
        .with_attribute("fault.address", self.fault_address.as_str())
        .with_attribute("backtrace", self.backtrace.join("\n"))
        .with_attribute("backtrace.depth", self.backtrace.len())
    }
}

impl LivenessViolationRecord {
    pub fn to_report(&self) -> Report {
        let threshold_ms = i64::try_from(self.threshold.as_millis()).unwrap_or(i64::MAX);
        let message = match &self.detection {
            Detection::Watchdog => {
                format!("Liveness Violation: main thread blocked for {threshold_ms}ms")
            }
            Detection::Historical { description, .. } => {
                format!("Liveness Violation (historical): {description}")
            }
        };
        let mut report = Report::new(Severity::Error, message)
            .with_attribute("crash.kind", "liveness")
            .with_attribute("liveness.detection", self.detection.as_str())
            .with_attribute("liveness.threshold_ms", threshold_ms);

        if let Some(main_thread) = &self.main_thread {
            report = report
                .with_attribute("thread.main.stacktrace", main_thread.stack_trace.as_str())
                .with_attribute("thread.main.state", main_thread.state.as_str())
                .with_attribute("thread.name", main_thread.name.as_str())
                .with_attribute("thread.id", main_thread.tid);
        }
        if !self.other_threads.is_empty() {
            let rendered: Vec<String> = self.other_threads.iter().map(ThreadStack::render).collect();
            report = report
                .with_attribute("threads.other", rendered.join("\n\n"))
                .with_attribute("threads.other.count", self.other_threads.len());
        }
        if let Detection::Historical {
            timestamp_ms,
            description,
            pid,
        } = &self.detection
        {
            report = report
                .with_attribute("liveness.timestamp_ms", *timestamp_ms)
                .with_attribute("liveness.description", description.as_str())
                .with_attribute("process.pid", *pid);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash_info::AttributeValue;

    #[test]
    fn test_runtime_report() {
        let record = RuntimeCrashRecord {
            exception_type: "example.NullRef".to_string(),
            message: "x was null".to_string(),
            thread_name: "main".to_string(),
            thread_id: 1,
            stack_trace: "at a()\nat b()".to_string(),
        };
        let report = record.to_report();
        assert_eq!(report.severity, Severity::Error);
        assert_eq!(report.message, "Runtime Crash: NullRef: x was null");
        assert_eq!(
            report.attribute("exception.type"),
            Some(&AttributeValue::from("example.NullRef"))
        );
        assert_eq!(report.attribute("thread.id"), Some(&AttributeValue::Int(1)));
    }

    #[test]
    fn test_native_report() {
        let record = NativeCrashRecord {
            signal_name: "SIGSEGV".to_string(),
            fault_address: "0x0".to_string(),
            backtrace: vec!["0x1000".to_string(), "0x2000".to_string()],
        };
        assert_eq!(record.signal(), SignalNames::SIGSEGV);
        let report = record.to_report();
        assert_eq!(report.severity, Severity::Fatal);
        assert_eq!(report.message, "Native Crash: SIGSEGV at 0x0");
        assert_eq!(
            report.attribute("backtrace"),
            Some(&AttributeValue::from("0x1000\n0x2000"))
        );
        assert_eq!(
            report.attribute("backtrace.depth"),
            Some(&AttributeValue::Int(2))
        );
    }

    #[test]
    fn test_liveness_reports() {
        let main_thread = ThreadStack {
            name: "main".to_string(),
            tid: 42,
            state: "S".to_string(),
            stack_trace: "at wait()".to_string(),
        };
        let worker = ThreadStack {
            name: "worker".to_string(),
            tid: 43,
            state: "R".to_string(),
            stack_trace: "at spin()".to_string(),
        };
        let live = LivenessViolationRecord {
            threshold: Duration::from_millis(5000),
            main_thread: Some(main_thread),
            other_threads: vec![worker],
            detection: Detection::Watchdog,
        };
        let report = live.to_report();
        assert_eq!(
            report.message,
            "Liveness Violation: main thread blocked for 5000ms"
        );
        assert_eq!(
            report.attribute("liveness.detection"),
            Some(&AttributeValue::from("watchdog"))
        );
        assert_eq!(
            report.attribute("threads.other"),
            Some(&AttributeValue::from("\"worker\" tid=43 state=R\nat spin()"))
        );
        assert_eq!(report.attribute("liveness.timestamp_ms"), None);

        let historical = LivenessViolationRecord {
            threshold: Duration::from_millis(5000),
            main_thread: None,
            other_threads: vec![],
            detection: Detection::Historical {
                timestamp_ms: 1_700_000_000_000,
                description: "Input dispatching timed out".to_string(),
                pid: 321,
            },
        };
        let report = historical.to_report();
        assert_eq!(
            report.message,
            "Liveness Violation (historical): Input dispatching timed out"
        );
        assert_eq!(
            report.attribute("process.pid"),
            Some(&AttributeValue::Int(321))
        );
        assert_eq!(report.attribute("threads.other.count"), None);
    }
}
