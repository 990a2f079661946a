// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use super::crash_handler::{handle_posix_sigaction, prepare_crash_file};
use crate::crash_info::{signal_from_signum, CrashKind};
use crate::shared::configuration::CrashtrackerConfiguration;
use anyhow::Context;
use libc::{
    c_int, mmap, sigaltstack, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE,
    SIGSTKSZ,
};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler};
use std::ptr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;

// Linux seems to have the most, supporting up to 64 inclusive
// https://man7.org/linux/man-pages/man7/signal.7.html
const MAX_SIGNALS: usize = 65;
static mut HANDLERS: [Option<(signal::Signal, SigAction)>; MAX_SIGNALS] = [None; MAX_SIGNALS];
static INIT_STARTED: AtomicBool = AtomicBool::new(false);
static INIT_FINISHED: AtomicBool = AtomicBool::new(false);

/// Arms the native crash handler for the configured fatal signals.
///
/// Arming is one-shot per process and never torn down: a second call returns an error.
/// PRECONDITIONS:
///     Pending native records must already have been drained. Arming truncates the record file.
/// ATOMICITY:
///     Installing the handlers is not atomic. A crash while this function runs may find a handler
///     installed whose previous disposition is not saved yet; in that case the handler falls back
///     to the default disposition before re-raising.
pub fn register_crash_handlers(config: &CrashtrackerConfiguration) -> anyhow::Result<()> {
    // Guarantee that the handlers are only mutated once.
    anyhow::ensure!(
        INIT_STARTED
            .compare_exchange(false, true, SeqCst, SeqCst)
            .is_ok(),
        "Attempted to double register crash handlers"
    );

    // Validate signal numbers will fit in the array.
    for signum in config.signals() {
        anyhow::ensure!(*signum >= 0 && *signum < MAX_SIGNALS as i32);
    }

    let crash_path = config.record_path(CrashKind::Native);
    // SAFETY: guarded by `INIT_STARTED`, and no handler is installed yet.
    unsafe { prepare_crash_file(&crash_path) }
        .with_context(|| format!("Unable to prepare {}", crash_path.display()))?;

    if config.create_alt_stack() {
        // Safety: This function has no documented preconditions.
        unsafe { create_alt_stack()? };
    }

    let mut errors = vec![];
    for signum in config.signals() {
        let index = *signum as usize;
        // Safety: This function has no documented preconditions.
        match unsafe { register_signal_handler(*signum, config) } {
            // SAFETY: `HANDLERS` is written only here, behind `INIT_STARTED`, and read only once
            // `INIT_FINISHED` is set below.
            Ok(handler) => unsafe { HANDLERS[index] = Some(handler) },
            Err(e) => errors.push(format!("Unable to register signal for {signum}: {e:?}")),
        };
    }
    INIT_FINISHED.store(true, SeqCst);
    anyhow::ensure!(
        errors.is_empty(),
        "Errors registering signal handlers {errors:?}"
    );
    Ok(())
}

/// Whether the native crash handler has been armed in this process.
pub fn crash_handlers_registered() -> bool {
    INIT_FINISHED.load(SeqCst)
}

/// Puts back the disposition `signum` had before arming, then raises it again so the process
/// meets its usual fate (core dump, debugger, termination).
/// A signal with no saved disposition is reset to the default one.
pub(crate) unsafe fn restore_and_reraise(signum: c_int) {
    let saved = if INIT_FINISHED.load(SeqCst) && signum >= 0 && signum < MAX_SIGNALS as i32 {
        // SAFETY: `INIT_FINISHED` is set, so nothing mutates `HANDLERS` anymore.
        unsafe { HANDLERS[signum as usize] }
    } else {
        None
    };
    let restored = match saved {
        // SAFETY: restoring a disposition obtained from `sigaction` itself.
        Some((signal, sigaction)) => unsafe { signal::sigaction(signal, &sigaction) }.is_ok(),
        None => false,
    };
    // SAFETY: No preconditions.
    unsafe {
        if !restored {
            libc::signal(signum, libc::SIG_DFL);
        }
        // Signals are only delivered once. A crashing instruction would fault again on return,
        // but a signal sent with `raise` or `kill` would be lost without this.
        libc::raise(signum);
    }
}

/// Allocates a signal altstack, and puts a guard page at the end.
/// Inspired by https://github.com/rust-lang/rust/pull/69969/files
unsafe fn create_alt_stack() -> anyhow::Result<()> {
    // The handler walks the stack and writes the record from the altstack, so it gets the greater
    // of 16 pages or SIGSTKSZ.
    let page_size = page_size::get();
    let stack_size = std::cmp::max(SIGSTKSZ, 16 * page_size);
    let stackp = mmap(
        ptr::null_mut(),
        stack_size + page_size,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANON,
        -1,
        0,
    );
    anyhow::ensure!(
        stackp != MAP_FAILED,
        "failed to allocate an alternative stack"
    );
    let guard_result = libc::mprotect(stackp, page_size, PROT_NONE);
    anyhow::ensure!(
        guard_result == 0,
        "failed to set up alternative stack guard page"
    );
    let stackp = stackp.add(page_size);

    let stack = libc::stack_t {
        ss_sp: stackp,
        ss_flags: 0,
        ss_size: stack_size,
    };
    let rval = sigaltstack(&stack, ptr::null_mut());
    anyhow::ensure!(rval == 0, "sigaltstack failed {rval}");
    Ok(())
}

unsafe fn register_signal_handler(
    signum: i32,
    config: &CrashtrackerConfiguration,
) -> anyhow::Result<(signal::Signal, SigAction)> {
    let signal_type = signal_from_signum(signum)?;

    // Some runtimes install an altstack of their own and expect the handler to run on it, so
    // using the altstack does not imply creating one.
    let extra_saflags = if config.use_alt_stack() {
        SaFlags::SA_ONSTACK
    } else {
        SaFlags::empty()
    };

    // `SigHandler::SigAction` implies SA_SIGINFO.
    let sig_action = SigAction::new(
        SigHandler::SigAction(handle_posix_sigaction),
        SaFlags::SA_NODEFER | extra_saflags,
        signal::SigSet::empty(),
    );

    let old_handler = signal::sigaction(signal_type, &sig_action)?;
    Ok((signal_type, old_handler))
}

#[cfg(test)]
mod tests {
    #[cfg(target_os = "linux")]
    #[test]
    fn test_max_signals() {
        assert!(super::MAX_SIGNALS as libc::c_int > libc::SIGRTMAX());
    }
}
