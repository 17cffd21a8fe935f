//! Logging setup and stdio redirection
//!
//! The hook logs through `tracing`; the configured log driver decides
//! whether lines go to a file or to the terminal. Separately, the hook's
//! stdout and stderr are redirected into the CNI log file so anything the
//! downstream runtime prints lands there too.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::str::FromStr;

use nix::unistd::dup2;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::fmt;

use crate::error::HookError;

/// Initialize tracing according to the configured driver and level
///
/// `file://<path>` appends to the given file; `stdout://` (or `stdout`)
/// writes to the terminal. The returned guard must stay alive for the
/// process lifetime so buffered lines are flushed on exit.
pub fn setup(driver: &str, level: &str) -> Result<Option<WorkerGuard>, HookError> {
    let filter = LevelFilter::from_str(level).map_err(|e| {
        HookError::config_error(&format!("invalid log_level: {}", level))
            .with_details(&e.to_string())
    })?;

    if let Some(path) = driver.strip_prefix("file://") {
        let path = Path::new(path);
        let directory = path.parent().ok_or_else(|| {
            HookError::config_error(&format!("invalid log_driver path: {}", driver))
        })?;
        let file_name = path.file_name().ok_or_else(|| {
            HookError::config_error(&format!("invalid log_driver path: {}", driver))
        })?;

        let file_appender = rolling::never(directory, file_name);
        let (non_blocking, guard) = non_blocking(file_appender);
        fmt()
            .with_writer(non_blocking)
            .with_max_level(filter)
            .with_ansi(false)
            .init();

        return Ok(Some(guard));
    }

    if driver == "stdout" || driver == "stdout://" {
        fmt().with_max_level(filter).init();
        return Ok(None);
    }

    Err(HookError::config_error(&format!(
        "unsupported log_driver: {}",
        driver
    )))
}

/// Redirect the process stdout and stderr into the CNI log file
///
/// Must happen after the store is acquired and before any CNI invocation,
/// so plugin output and runtime output share the append-only log. The
/// returned file keeps the descriptor alive; fds 1 and 2 are duplicates.
pub fn redirect_stdio(cni_log: &str) -> Result<File, HookError> {
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(cni_log)
        .map_err(|e| {
            HookError::io_error(&format!("failed to open CNI log: {}", cni_log))
                .with_details(&e.to_string())
        })?;

    dup2(file.as_raw_fd(), 1).map_err(|e| {
        HookError::io_error("failed to redirect stdout to the CNI log")
            .with_details(&e.to_string())
    })?;
    dup2(file.as_raw_fd(), 2).map_err(|e| {
        HookError::io_error("failed to redirect stderr to the CNI log")
            .with_details(&e.to_string())
    })?;

    Ok(file)
}
