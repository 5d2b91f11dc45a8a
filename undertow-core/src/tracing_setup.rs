//! Log output for the daemon.
//!
//! The console shows Undertow's own crates at the chosen level and everything
//! else at `warn`. With a logs directory, `undertow.log` additionally receives
//! every event at trace level and is truncated on each start.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

pub const LOG_FILE_NAME: &str = "undertow.log";

const OWN_CRATES: [&str; 3] = ["undertow_core", "undertow_web", "undertow"];

/// Console directives: dependencies at `warn`, our crates at `level`.
pub fn console_directives(level: Level) -> String {
    let level = level.to_string().to_lowercase();
    std::iter::once("warn".to_string())
        .chain(OWN_CRATES.iter().map(|krate| format!("{krate}={level}")))
        .collect::<Vec<_>>()
        .join(",")
}

fn file_layer(dir: &Path) -> std::io::Result<(Box<dyn Layer<Registry> + Send + Sync>, PathBuf)> {
    fs::create_dir_all(dir)?;
    let path = dir.join(LOG_FILE_NAME);
    let writer = File::create(&path)?;
    let layer = fmt::layer()
        .with_ansi(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(writer)
        .with_filter(EnvFilter::new("trace"))
        .boxed();
    Ok((layer, path))
}

/// Installs the global subscriber. `RUST_LOG` replaces the console filter.
///
/// # Errors
///
/// - `std::io::Error` - The logs directory or log file could not be created
pub fn init_tracing(console_level: Level, logs_dir: Option<&Path>) -> std::io::Result<()> {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_directives(console_level)));

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> =
        vec![fmt::layer().with_filter(console_filter).boxed()];
    let log_path = match logs_dir {
        Some(dir) => {
            let (layer, path) = file_layer(dir)?;
            layers.push(layer);
            Some(path)
        }
        None => None,
    };

    tracing_subscriber::registry().with(layers).init();
    tracing::debug!(console = %console_level, file = ?log_path, "Logging ready");
    Ok(())
}

/// `--log-level` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl CliLogLevel {
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = self.as_tracing_level().to_string().to_lowercase();
        f.write_str(&level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_directives_scope_level_to_own_crates() {
        assert_eq!(
            console_directives(Level::DEBUG),
            "warn,undertow_core=debug,undertow_web=debug,undertow=debug"
        );
    }

    #[test]
    fn test_cli_level_display_matches_value_names() {
        assert_eq!(CliLogLevel::Trace.to_string(), "trace");
        assert_eq!(CliLogLevel::Warn.as_tracing_level(), Level::WARN);
    }

    #[test]
    fn test_file_layer_truncates_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        fs::create_dir_all(&logs).unwrap();
        fs::write(logs.join(LOG_FILE_NAME), b"stale").unwrap();

        let (_layer, path) = file_layer(&logs).unwrap();
        assert_eq!(path, logs.join(LOG_FILE_NAME));
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }
}
