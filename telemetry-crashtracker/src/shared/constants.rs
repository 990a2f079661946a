// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

pub const RUNTIME_CRASH_FILE: &str = "runtime_crash.txt";
pub const ASYNC_TASK_CRASH_FILE: &str = "async_task_crash.txt";
pub const NATIVE_CRASH_FILE: &str = "native_crash.txt";
pub const LIVENESS_WATERMARK_FILE: &str = "liveness_watermark.txt";

/// Maximum number of frames collected while inside a signal handler.
///
/// This limit prevents runaway frame walking in case of stack corruption.
pub const MAX_BACKTRACE_FRAMES: usize = 64;

/// How long a thread crashing while another one writes the native record waits before
/// re-raising its own signal.
pub const MAX_WRITER_WAIT_MS: u32 = 2_000;

/// Size of the pre-allocated, NUL-terminated buffer holding the native crash path.
pub const CRASH_PATH_BUFFER_SIZE: usize = 256;

/// Enough room for `0x` followed by the 16 hex digits of a 64-bit value.
pub const HEX_BUFFER_SIZE: usize = 24;

/// Value substituted for any string field missing from a stored record.
pub const UNKNOWN_VALUE: &str = "unknown";

pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_OTHER_THREADS: usize = 16;

/// How long the watchdog waits for a sampled thread to record its stack.
pub const STACK_SAMPLE_TIMEOUT: Duration = Duration::from_millis(100);
