//! Tracing subscriber setup.
//!
//! Logs go to stderr and to `<home>/logs/vmorch.log`. The filter comes from
//! `RUST_LOG` and defaults to `info`.

use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use vmorch_shared::errors::{VmorchError, VmorchResult};

use crate::runtime::layout::FilesystemLayout;

pub const LOG_FILE_NAME: &str = "vmorch.log";

/// Keeps the file writer alive for the rest of the process.
static FILE_GUARD: OnceLock<Option<WorkerGuard>> = OnceLock::new();

/// Install the global subscriber for `layout`.
///
/// Only the first call has an effect. If another subscriber is already
/// installed (tests, embedding applications) it is left in place.
pub fn init_logging_for(layout: &FilesystemLayout) -> VmorchResult<()> {
    let logs_dir = layout.logs_dir();
    std::fs::create_dir_all(&logs_dir).map_err(|e| {
        VmorchError::Storage(format!(
            "Failed to create log directory {}: {}",
            logs_dir.display(),
            e
        ))
    })?;

    FILE_GUARD.get_or_init(|| {
        let file_appender = tracing_appender::rolling::never(&logs_dir, LOG_FILE_NAME);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let installed = tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
            .try_init()
            .is_ok();

        installed.then_some(guard)
    });

    Ok(())
}

/// Stderr-only subscriber, for front-ends that run before a home directory
/// is known.
pub fn init_stderr_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = FilesystemLayout::new(dir.path().to_path_buf());

        init_logging_for(&layout).unwrap();
        init_logging_for(&layout).unwrap();
        assert!(layout.logs_dir().is_dir());
    }
}
