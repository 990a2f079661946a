// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Error,
    Fatal,
}

impl Severity {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    String(String),
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        AttributeValue::Int(value.into())
    }
}

impl From<usize> for AttributeValue {
    fn from(value: usize) -> Self {
        AttributeValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

/// The common shape every record kind is normalized to before it reaches a
/// [`crate::TelemetrySink`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl Report {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }
}

/// Derives the display name of a fully qualified type: `example.NullRef` becomes `NullRef`,
/// `std::panic::Panic` becomes `Panic`.
pub fn short_type_name(fully_qualified: &str) -> &str {
    let after_dot = fully_qualified
        .rsplit('.')
        .next()
        .unwrap_or(fully_qualified);
    let short = after_dot.rsplit("::").next().unwrap_or(after_dot);
    if short.is_empty() {
        fully_qualified
    } else {
        short
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name("example.NullRef"), "NullRef");
        assert_eq!(short_type_name("std::panic::Panic"), "Panic");
        assert_eq!(short_type_name("Plain"), "Plain");
        assert_eq!(short_type_name("trailing."), "trailing.");
        assert_eq!(short_type_name(""), "");
    }

    #[test]
    fn test_report_serialization() -> anyhow::Result<()> {
        let report = Report::new(Severity::Fatal, "Native Crash: SIGSEGV at 0x0")
            .with_attribute("signal.name", "SIGSEGV")
            .with_attribute("backtrace.depth", 3usize)
            .with_attribute("task.cancelled", false);
        let json = serde_json::to_value(&report)?;
        assert_eq!(
            json,
            serde_json::json!({
                "severity": "FATAL",
                "message": "Native Crash: SIGSEGV at 0x0",
                "attributes": {
                    "backtrace.depth": 3,
                    "signal.name": "SIGSEGV",
                    "task.cancelled": false,
                }
            })
        );
        let back: Report = serde_json::from_value(json)?;
        assert_eq!(back, report);
        Ok(())
    }
}
