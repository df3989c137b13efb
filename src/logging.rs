//! Kernel `log` backend: COM1 output plus an optional in-memory capture.
//!
//! Captured records are stored as `target|LEVEL|message` lines in a fixed
//! buffer, so logging never touches the heap and works under the memory
//! manager's lock.

use core::fmt::{self, Write as _};

use log::{LevelFilter, Log, Metadata, Record};

use crate::config::LogConfig;
use crate::drivers::serial;
use crate::sync::spinlock::SpinLock;

const CAPTURE_BUF_SIZE: usize = 16 * 1024;

struct CaptureState {
    enabled: bool,
    len: usize,
    overflow: bool,
    buf: [u8; CAPTURE_BUF_SIZE],
}

impl CaptureState {
    const fn new() -> Self {
        Self {
            enabled: false,
            len: 0,
            overflow: false,
            buf: [0; CAPTURE_BUF_SIZE],
        }
    }

    fn text(&self) -> &str {
        // Truncation may split a multi-byte character; keep the valid prefix.
        match core::str::from_utf8(&self.buf[..self.len]) {
            Ok(text) => text,
            Err(err) => {
                core::str::from_utf8(&self.buf[..err.valid_up_to()]).unwrap_or_default()
            }
        }
    }
}

impl fmt::Write for CaptureState {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        let remaining = self.buf.len().saturating_sub(self.len);
        let write_len = remaining.min(bytes.len());

        if write_len > 0 {
            let start = self.len;
            let end = start + write_len;
            self.buf[start..end].copy_from_slice(&bytes[..write_len]);
            self.len = end;
        }

        if write_len < bytes.len() {
            self.overflow = true;
        }
        Ok(())
    }
}

static CAPTURE: SpinLock<CaptureState> = SpinLock::new(CaptureState::new());

/// The `log::Log` implementation installed by [`init`].
pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        serial::write_fmt(format_args!(
            "[{:<5} {}] {}\n",
            record.level(),
            record.target(),
            record.args()
        ));

        let mut capture = CAPTURE.lock();
        if capture.enabled {
            let _ = writeln!(
                capture,
                "{}|{}|{}",
                record.target(),
                record.level(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Installs the logger and applies `config`.
///
/// Safe to call again; later calls only update the level and capture state.
pub fn init(config: &LogConfig) {
    if log::set_logger(&LOGGER).is_err() {
        log::debug!(target: "boot", "logger already installed");
    }
    log::set_max_level(config.level);
    set_capture_enabled(config.capture);
}

pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}

/// Enables or disables capture; either way the buffer is cleared.
pub fn set_capture_enabled(enabled: bool) {
    let mut capture = CAPTURE.lock();
    capture.enabled = enabled;
    capture.len = 0;
    capture.overflow = false;
}

/// Runs `f` over the captured text and whether it was truncated.
///
/// `f` must not log; the capture lock is held while it runs.
pub fn with_captured<R>(f: impl FnOnce(&str, bool) -> R) -> R {
    let capture = CAPTURE.lock();
    f(capture.text(), capture.overflow)
}

/// Number of captured lines logged under `target`.
pub fn captured_count(target: &str) -> usize {
    with_captured(|text, _| {
        text.lines()
            .filter(|line| line.split('|').next() == Some(target))
            .count()
    })
}
