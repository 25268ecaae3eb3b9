//! Tracing setup for hosts embedding the fleet engine.
//!
//! Logs go to stderr by default. With a log directory configured they go to
//! `fleet.log` there instead, rotated on every startup and flushed per line.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Log file name inside the log directory.
pub const LOG_FILE_NAME: &str = "fleet.log";

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "provider_fleet=info,warn";

/// Rotated files kept next to the live log.
const KEEP_ROTATED: u32 = 3;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to create log directory {path}: {reason}")]
    LogDir { path: String, reason: String },

    #[error("failed to open log file {path}: {reason}")]
    LogFile { path: String, reason: String },
}

/// How to set up tracing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryOptions {
    /// Write to `fleet.log` here; stderr when `None`.
    pub log_dir: Option<PathBuf>,
    /// Filter directives used when `RUST_LOG` is unset.
    pub default_filter: String,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            log_dir: None,
            default_filter: DEFAULT_FILTER.to_string(),
            json: false,
        }
    }
}

impl TelemetryOptions {
    /// Log to the platform data directory.
    pub fn in_data_dir() -> Self {
        Self {
            log_dir: Some(default_log_dir()),
            ..Self::default()
        }
    }
}

/// Platform-standard data directory for the engine.
///
/// Falls back to `~/.provider-fleet/` when no data directory can be resolved.
pub fn default_log_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("provider-fleet");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".provider-fleet")
}

/// Install the global tracing subscriber.
///
/// Returns `Ok(false)` when a subscriber was already installed, which is not
/// an error: embedding hosts often set up their own.
pub fn init_tracing(options: &TelemetryOptions) -> Result<bool, TelemetryError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&options.default_filter));

    let (writer, log_path) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| TelemetryError::LogDir {
                path: dir.display().to_string(),
                reason: e.to_string(),
            })?;
            let log_path = dir.join(LOG_FILE_NAME);
            rotate_log_file(&log_path, KEEP_ROTATED);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .map_err(|e| TelemetryError::LogFile {
                    path: log_path.display().to_string(),
                    reason: e.to_string(),
                })?;
            (BoxMakeWriter::new(FlushingWriter::new(file)), Some(log_path))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(log_path.is_none())
        .with_target(true)
        .with_thread_ids(false);
    let installed = if options.json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };

    if installed {
        let destination = log_path
            .as_ref()
            .map_or_else(|| "stderr".to_string(), |p| p.display().to_string());
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            log_file = %destination,
            pid = std::process::id(),
            "=== provider fleet starting ==="
        );
    }
    Ok(installed)
}

/// Rotate `fleet.log` → `fleet.log.1` → `.2` → … → `.{keep}`.
///
/// The oldest file beyond `keep` is deleted. Missing files are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// File writer that flushes after every write so lines survive a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<File>>,
}

impl FlushingWriter {
    fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut file = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = file.write(buf)?;
        file.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?
            .flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
