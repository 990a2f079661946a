// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Returns a numeric identifier for the current OS thread.
#[cfg(target_os = "linux")]
pub fn get_current_thread_id() -> i64 {
    // SAFETY: syscall(SYS_gettid) has no preconditions for current thread.
    unsafe { libc::syscall(libc::SYS_gettid) as i64 }
}

/// Returns a numeric identifier for the current OS thread.
#[cfg(target_os = "macos")]
pub fn get_current_thread_id() -> i64 {
    let mut tid: u64 = 0;
    // SAFETY: `pthread_threadid_np` has no preconditions for current thread
    // when pthread_t is 0 and output pointer is valid.
    let rc = unsafe { libc::pthread_threadid_np(0, &mut tid) };
    debug_assert_eq!(rc, 0, "pthread_threadid_np failed: {rc}");
    tid as i64
}

/// Returns a numeric identifier for the current OS thread.
/// Unknown on this platform, reported as `0`.
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn get_current_thread_id() -> i64 {
    0
}

/// The name of the current thread, as the runtime knows it.
pub fn get_current_thread_name() -> String {
    let current = std::thread::current();
    match current.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", current.id()),
    }
}

pub fn get_process_id() -> i32 {
    std::process::id() as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn test_thread_ids_differ_between_threads() {
        let here = get_current_thread_id();
        let there = std::thread::spawn(get_current_thread_id).join().unwrap();
        assert_ne!(here, there);
        assert!(here > 0);
    }

    #[test]
    fn test_named_thread() {
        let name = std::thread::Builder::new()
            .name("worker-7".to_string())
            .spawn(get_current_thread_name)
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(name, "worker-7");
    }
}
