// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// The fatal signals a native crash record can name.
/// See <https://man7.org/linux/man-pages/man7/signal.7.html>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
#[repr(C)]
pub enum SignalNames {
    SIGSEGV,
    SIGABRT,
    SIGBUS,
    SIGFPE,
    SIGILL,
    SIGTRAP,
    UNKNOWN,
}

impl SignalNames {
    /// Static name of the signal. Does not allocate, so it may be used inside a signal handler.
    pub const fn as_str(&self) -> &'static str {
        match self {
            SignalNames::SIGSEGV => "SIGSEGV",
            SignalNames::SIGABRT => "SIGABRT",
            SignalNames::SIGBUS => "SIGBUS",
            SignalNames::SIGFPE => "SIGFPE",
            SignalNames::SIGILL => "SIGILL",
            SignalNames::SIGTRAP => "SIGTRAP",
            SignalNames::UNKNOWN => "UNKNOWN",
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "SIGSEGV" => SignalNames::SIGSEGV,
            "SIGABRT" => SignalNames::SIGABRT,
            "SIGBUS" => SignalNames::SIGBUS,
            "SIGFPE" => SignalNames::SIGFPE,
            "SIGILL" => SignalNames::SIGILL,
            "SIGTRAP" => SignalNames::SIGTRAP,
            _ => SignalNames::UNKNOWN,
        }
    }
}

impl std::fmt::Display for SignalNames {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<libc::c_int> for SignalNames {
    fn from(value: libc::c_int) -> Self {
        match value {
            libc::SIGSEGV => SignalNames::SIGSEGV,
            libc::SIGABRT => SignalNames::SIGABRT,
            libc::SIGBUS => SignalNames::SIGBUS,
            libc::SIGFPE => SignalNames::SIGFPE,
            libc::SIGILL => SignalNames::SIGILL,
            libc::SIGTRAP => SignalNames::SIGTRAP,
            _ => SignalNames::UNKNOWN,
        }
    }
}

/// Segmentation violation, abort, bus error, floating-point exception, illegal instruction
/// and trap.
pub fn default_signals() -> Vec<libc::c_int> {
    vec![
        libc::SIGSEGV,
        libc::SIGABRT,
        libc::SIGBUS,
        libc::SIGFPE,
        libc::SIGILL,
        libc::SIGTRAP,
    ]
}

pub fn signal_from_signum(value: libc::c_int) -> anyhow::Result<nix::sys::signal::Signal> {
    let rval = match value {
        libc::SIGSEGV => nix::sys::signal::Signal::SIGSEGV,
        libc::SIGABRT => nix::sys::signal::Signal::SIGABRT,
        libc::SIGBUS => nix::sys::signal::Signal::SIGBUS,
        libc::SIGFPE => nix::sys::signal::Signal::SIGFPE,
        libc::SIGILL => nix::sys::signal::Signal::SIGILL,
        libc::SIGTRAP => nix::sys::signal::Signal::SIGTRAP,
        _ => anyhow::bail!("Unexpected signal number {value}"),
    };
    Ok(rval)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names_round_trip_through_text() {
        for signum in default_signals() {
            let name = SignalNames::from(signum);
            assert_ne!(name, SignalNames::UNKNOWN);
            assert_eq!(SignalNames::from_name(name.as_str()), name);
        }
        assert_eq!(SignalNames::from(libc::SIGINT), SignalNames::UNKNOWN);
        assert_eq!(SignalNames::from_name("SIGWHAT"), SignalNames::UNKNOWN);
    }

    #[test]
    fn test_signal_from_signum() {
        assert_eq!(
            signal_from_signum(libc::SIGBUS).unwrap(),
            nix::sys::signal::Signal::SIGBUS
        );
        signal_from_signum(libc::SIGTERM).unwrap_err();
    }
}
