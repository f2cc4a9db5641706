// Sidetrack - side-effect capture for speculative evaluation
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Logging setup for Sidetrack components
//!
//! Console output is always enabled; drivers that run long search campaigns can additionally
//! mirror every event into a daily-rotated file under the system temp directory. `RUST_LOG`
//! controls verbosity and defaults to `info`.

use eyre::{Result, WrapErr};
use once_cell::sync::OnceCell;
use std::{env, fs, path::PathBuf, sync::Once};
use tracing::Level;
use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::LocalTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Name of the directory (under the system temp dir) holding log files
pub const LOG_DIR_NAME: &str = "sidetrack-logs";

// Keeps the non-blocking file writer alive for the whole process
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Initialize logging for a Sidetrack component
///
/// # Arguments
/// * `component_name` - Name of the component, used for the log file name
/// * `enable_file_logging` - Also write logs to `<tmp>/sidetrack-logs/<component>/`
///
/// # Examples
/// ```rust,ignore
/// sidetrack_common::logging::init_logging("search-driver", true)?;
/// tracing::info!("driver started");
/// ```
pub fn init_logging(component_name: &str, enable_file_logging: bool) -> Result<()> {
    let env_filter = default_filter(Level::INFO)?;

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_line_number(true)
        .with_timer(LocalTime::rfc_3339())
        .with_ansi(true);

    if enable_file_logging {
        let log_dir = create_log_directory(component_name)?;
        let file_appender = rolling::daily(&log_dir, format!("{component_name}.log"));
        let (writer, guard) = non_blocking(file_appender);
        // A second initialization keeps the first guard; its writer is the live one
        let _ = FILE_GUARD.set(guard);

        let file_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_timer(LocalTime::rfc_3339())
            .with_ansi(false)
            .with_writer(writer);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer.with_filter(EnvFilter::from_default_env()))
            .try_init()
            .map_err(|e| eyre::eyre!("Failed to initialize tracing subscriber: {}", e))?;

        tracing::info!(
            component = component_name,
            log_dir = %log_dir.display(),
            "Logging initialized with console and file output"
        );
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init()
            .map_err(|e| eyre::eyre!("Failed to initialize tracing subscriber: {}", e))?;

        tracing::info!(component = component_name, "Logging initialized with console output only");
    }

    Ok(())
}

fn default_filter(level: Level) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.as_str()))
        .wrap_err("Failed to create environment filter")
}

fn create_log_directory(component_name: &str) -> Result<PathBuf> {
    let log_dir = env::temp_dir().join(LOG_DIR_NAME).join(component_name);
    fs::create_dir_all(&log_dir)
        .wrap_err_with(|| format!("Failed to create log directory {}", log_dir.display()))?;
    Ok(log_dir)
}

/// Initialize compact console-only logging
pub fn init_simple_logging(level: Level) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(default_filter(level)?)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|e| eyre::eyre!("Failed to initialize simple logging: {}", e))?;

    Ok(())
}

static TEST_LOGGING_INIT: Once = Once::new();

/// Idempotent logging setup for tests.
///
/// Safe to call from every test; only the first call installs a subscriber. Defaults to
/// `INFO` unless `RUST_LOG` says otherwise.
pub fn ensure_test_logging(default_level: Option<Level>) {
    TEST_LOGGING_INIT.call_once(|| {
        // Failure means another subscriber is already installed
        let _ = init_simple_logging(default_level.unwrap_or(Level::INFO));
    });
}
