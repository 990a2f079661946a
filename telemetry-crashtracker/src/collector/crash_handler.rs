// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::signal_handler_manager::restore_and_reraise;
use crate::crash_info::SignalNames;
use crate::shared::threading::get_current_thread_id;
use crate::shared::constants::{
    CRASH_PATH_BUFFER_SIZE, HEX_BUFFER_SIZE, MAX_BACKTRACE_FRAMES, MAX_WRITER_WAIT_MS,
};
use libc::{c_char, c_int, c_void, siginfo_t};
use nix::errno::Errno;
use std::fs::{self, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::IntoRawFd;
use std::path::Path;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64};

// Note that this file makes use of the following async-signal safe functions in a signal handler.
// <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
// - open
// - write
// - lseek
// - ftruncate
// - fsync
// - close
// - nanosleep
// - sigaction
// - raise

// Every buffer the signal path touches is allocated here and filled in before the handlers are
// installed. After that, only the signal path writes to them, and only once per process.
static mut CRASH_PATH: [u8; CRASH_PATH_BUFFER_SIZE] = [0; CRASH_PATH_BUFFER_SIZE];
static mut FRAMES: [usize; MAX_BACKTRACE_FRAMES] = [0; MAX_BACKTRACE_FRAMES];
static FALLBACK_FD: AtomicI32 = AtomicI32::new(-1);

/// Copies the crash path into its pre-allocated buffer and pre-opens it as a fallback for
/// platforms where `open` cannot be relied upon in signal context.
///
/// Opening truncates the file, so pending records must have been drained already.
/// SAFETY:
///     Must only be called once, before any handler using [handle_posix_sigaction] is installed.
pub(crate) unsafe fn prepare_crash_file(path: &Path) -> anyhow::Result<()> {
    let bytes = path.as_os_str().as_bytes();
    // Leave room for the NUL terminator
    anyhow::ensure!(
        bytes.len() < CRASH_PATH_BUFFER_SIZE,
        "Crash path is longer than {} bytes: {}",
        CRASH_PATH_BUFFER_SIZE - 1,
        path.display()
    );
    anyhow::ensure!(
        !bytes.contains(&0),
        "Crash path contains a NUL byte: {}",
        path.display()
    );
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)?;

    let buffer = ptr::addr_of_mut!(CRASH_PATH).cast::<u8>();
    // SAFETY: the length was checked against the buffer size above, and no handler reads the
    // buffer yet.
    unsafe {
        ptr::copy_nonoverlapping(bytes.as_ptr(), buffer, bytes.len());
        *buffer.add(bytes.len()) = 0;
    }
    let old = FALLBACK_FD.swap(file.into_raw_fd(), SeqCst);
    if old >= 0 {
        // SAFETY: the descriptor came from `into_raw_fd` above in an earlier call.
        unsafe { libc::close(old) };
    }
    Ok(())
}

/// What a thread entering the crash handler should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// First in: writes the record.
    Writer,
    /// Another thread crashed while the record is being written. It waits for the writer.
    Waiter,
    /// The writer itself faulted while writing (SA_NODEFER). Waiting would never end.
    Reentered,
}

/// Guarantees at most one crash record per process, and that no thread re-raises a fatal signal
/// before that record is on disk.
struct RecordGuard {
    num_times_called: AtomicU64,
    writer_tid: AtomicI64,
    written: AtomicBool,
}

impl RecordGuard {
    const fn new() -> Self {
        Self {
            num_times_called: AtomicU64::new(0),
            writer_tid: AtomicI64::new(-1),
            written: AtomicBool::new(false),
        }
    }

    fn enter(&self, tid: i64) -> Role {
        if self.num_times_called.fetch_add(1, SeqCst) == 0 {
            self.writer_tid.store(tid, SeqCst);
            Role::Writer
        } else if self.writer_tid.load(SeqCst) == tid {
            Role::Reentered
        } else {
            Role::Waiter
        }
    }

    fn finish(&self) {
        self.written.store(true, SeqCst);
    }

    /// Sleeps in 1ms steps until the writer finishes, for at most `max_wait_ms`.
    /// Returns whether the record was written.
    fn wait_for_writer(&self, max_wait_ms: u32) -> bool {
        let step = libc::timespec {
            tv_sec: 0,
            tv_nsec: 1_000_000,
        };
        for _ in 0..max_wait_ms {
            if self.written.load(SeqCst) {
                return true;
            }
            // SAFETY: `step` is a valid timespec, and the remainder is not requested.
            unsafe { libc::nanosleep(&step, ptr::null_mut()) };
        }
        self.written.load(SeqCst)
    }
}

static RECORD_GUARD: RecordGuard = RecordGuard::new();

pub(crate) extern "C" fn handle_posix_sigaction(
    signum: i32,
    sig_info: *mut siginfo_t,
    _ucontext: *mut c_void,
) {
    match RECORD_GUARD.enter(get_current_thread_id()) {
        Role::Writer => {
            // SAFETY: only the writer touches the crash buffers.
            unsafe { write_crash_record(signum, sig_info) };
            RECORD_GUARD.finish();
        }
        Role::Waiter => {
            RECORD_GUARD.wait_for_writer(MAX_WRITER_WAIT_MS);
        }
        Role::Reentered => {}
    }
    // SAFETY: No preconditions.
    unsafe { restore_and_reraise(signum) };
}

unsafe fn write_crash_record(signum: c_int, sig_info: *const siginfo_t) {
    let fallback = FALLBACK_FD.load(SeqCst);
    // SAFETY: the buffer is NUL terminated by `prepare_crash_file`.
    let fd = unsafe { open_crash_file(fallback) };
    if fd < 0 {
        return;
    }
    // SAFETY: `fd` is open for writing and the frame buffer is ours.
    unsafe { write_record_to(fd, signum, sig_info) };
    // SAFETY: `fd` is valid. The fallback stays open for the lifetime of the process.
    unsafe {
        libc::fsync(fd);
        if fd != fallback {
            libc::close(fd);
        }
    }
}

unsafe fn open_crash_file(fallback: c_int) -> c_int {
    let path = ptr::addr_of!(CRASH_PATH).cast::<c_char>();
    // SAFETY: `path` points to a NUL-terminated buffer.
    let fd = unsafe {
        libc::open(
            path,
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC,
            0o644 as libc::c_uint,
        )
    };
    if fd >= 0 || fallback < 0 {
        return fd;
    }
    // SAFETY: `fallback` was opened for writing in `prepare_crash_file`.
    unsafe {
        libc::lseek(fallback, 0, libc::SEEK_SET);
        libc::ftruncate(fallback, 0);
    }
    fallback
}

/// Writes the signal name, the fault address and one return address per line.
/// SAFETY:
///     `fd` must be open for writing. Must not run concurrently with itself.
unsafe fn write_record_to(fd: c_int, signum: c_int, sig_info: *const siginfo_t) {
    let mut hex = [0u8; HEX_BUFFER_SIZE];
    write_line(fd, SignalNames::from(signum).as_str().as_bytes());
    // SAFETY: `sig_info` comes from the kernel, or is null.
    let fault_address = unsafe { fault_address(signum, sig_info) };
    write_line(fd, format_hex(fault_address, &mut hex));

    // SAFETY: guaranteed by the caller.
    let depth = unsafe { collect_frames() };
    let frames = ptr::addr_of!(FRAMES).cast::<usize>();
    for i in 0..depth {
        // SAFETY: `collect_frames` never returns more than the buffer length.
        let ip = unsafe { *frames.add(i) };
        write_line(fd, format_hex(ip, &mut hex));
    }
}

/// SIGILL, SIGFPE, SIGSEGV, SIGBUS, and SIGTRAP fill in si_addr with the address of the fault.
/// Other signals carry none, recorded as `0x0`.
unsafe fn fault_address(signum: c_int, sig_info: *const siginfo_t) -> usize {
    if sig_info.is_null() {
        return 0;
    }
    match signum {
        libc::SIGILL | libc::SIGFPE | libc::SIGSEGV | libc::SIGBUS | libc::SIGTRAP => {
            // SAFETY: checked non-null above.
            unsafe { (*sig_info).si_addr() as usize }
        }
        _ => 0,
    }
}

/// Walks the current stack into the pre-allocated frame buffer. Returns the number of frames.
/// SIGNAL SAFETY:
///     Computing the `ip` of each frame does not allocate. Frames are never resolved here;
///     symbolization happens offline.
unsafe fn collect_frames() -> usize {
    let frames = ptr::addr_of_mut!(FRAMES).cast::<usize>();
    let mut depth = 0;
    // SAFETY: the unsynchronized walker is fine here since this is the only thread walking.
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            *frames.add(depth) = frame.ip() as usize;
            depth += 1;
            depth < MAX_BACKTRACE_FRAMES
        });
    }
    depth
}

fn write_line(fd: c_int, bytes: &[u8]) {
    write_all(fd, bytes);
    write_all(fd, b"\n");
}

fn write_all(fd: c_int, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a valid buffer of the given length.
        let written = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if written < 0 && Errno::last() == Errno::EINTR {
            continue;
        }
        if written <= 0 {
            return;
        }
        bytes = &bytes[written as usize..];
    }
}

/// Lowercase hexadecimal with a `0x` prefix and no leading zeroes, written right-aligned into
/// `buf`. Does not allocate and never goes through `core::fmt`.
pub(crate) fn format_hex(value: usize, buf: &mut [u8; HEX_BUFFER_SIZE]) -> &[u8] {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut start = buf.len();
    let mut remaining = value;
    loop {
        start -= 1;
        buf[start] = DIGITS[remaining & 0xf];
        remaining >>= 4;
        if remaining == 0 {
            break;
        }
    }
    start -= 2;
    buf[start] = b'0';
    buf[start + 1] = b'x';
    &buf[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash_info::{CrashKind, CrashRecord};
    use crate::store::format;
    use std::os::unix::io::AsRawFd;

    fn hex(value: usize) -> String {
        let mut buf = [0u8; HEX_BUFFER_SIZE];
        String::from_utf8_lossy(format_hex(value, &mut buf)).into_owned()
    }

    #[test]
    fn test_format_hex() {
        assert_eq!(hex(0), "0x0");
        assert_eq!(hex(0xa), "0xa");
        assert_eq!(hex(0xdead_beef), "0xdeadbeef");
        assert_eq!(hex(0x1000), "0x1000");
        assert_eq!(hex(usize::MAX), format!("{:#x}", usize::MAX));
    }

    #[test]
    fn test_record_guard_roles() {
        let guard = RecordGuard::new();
        assert_eq!(guard.enter(10), Role::Writer);
        assert_eq!(guard.enter(10), Role::Reentered);
        assert_eq!(guard.enter(11), Role::Waiter);
        assert!(!guard.wait_for_writer(0));
        guard.finish();
        assert!(guard.wait_for_writer(0));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_second_crashing_thread_waits_for_the_record() {
        let guard = std::sync::Arc::new(RecordGuard::new());
        assert_eq!(guard.enter(1), Role::Writer);

        let writer = {
            let guard = guard.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(50));
                guard.finish();
            })
        };
        assert_eq!(guard.enter(2), Role::Waiter);
        let begin = std::time::Instant::now();
        assert!(guard.wait_for_writer(5_000));
        assert!(begin.elapsed() < std::time::Duration::from_secs(5));
        writer.join().unwrap();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_wait_for_writer_is_bounded() {
        let guard = RecordGuard::new();
        assert_eq!(guard.enter(1), Role::Writer);
        assert_eq!(guard.enter(2), Role::Waiter);
        let begin = std::time::Instant::now();
        assert!(!guard.wait_for_writer(20));
        assert!(begin.elapsed() >= std::time::Duration::from_millis(20));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_record_layout_is_readable() -> anyhow::Result<()> {
        let file = tempfile::NamedTempFile::new()?;
        // SAFETY: the descriptor is open for writing and no other test walks the frame buffer.
        unsafe { write_record_to(file.as_file().as_raw_fd(), libc::SIGABRT, ptr::null()) };
        let contents = fs::read(file.path())?;

        let CrashRecord::Native(record) = format::decode(CrashKind::Native, &contents)? else {
            panic!("wrong kind");
        };
        assert_eq!(record.signal_name, "SIGABRT");
        assert_eq!(record.fault_address, "0x0");
        assert!(!record.backtrace.is_empty());
        assert!(record.backtrace.len() <= MAX_BACKTRACE_FRAMES);
        assert!(record.backtrace.iter().all(|ip| ip.starts_with("0x")));
        Ok(())
    }
}
