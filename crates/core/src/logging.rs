//! Log filter selection and the rolling file sink used by the binary.
//!
//! Filters are chosen as `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`,
//! then [`DEFAULT_LOG_FILTER`]. Only an implicitly chosen filter gets the
//! noise directives; the file sink always keeps encoder stderr at debug.

use std::fs;
use std::path::{Path, PathBuf};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

use crate::encoder::ENCODER_STDERR_TARGET;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "encoder_stderr=error,hyper=warn";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const LOG_DIR_NAME: &str = "logs";
const LOG_FILE_PREFIX: &str = "textreel";
const LOG_FILE_SUFFIX: &str = "log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub noise_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub console: String,
    pub file: String,
}

#[derive(Debug)]
pub enum FileSink {
    Rolling(RollingFileAppender),
    /// Console-only logging; `reason` explains why the file sink is missing.
    ConsoleOnly {
        log_dir: Option<PathBuf>,
        reason: String,
    },
}

#[derive(Debug)]
pub struct LoggingPlan {
    pub filters: LogFilters,
    pub file_sink: FileSink,
}

enum FilterChoice {
    Explicit(String),
    Implicit(String),
}

pub fn plan_logging(options: &LoggingOptions) -> LoggingPlan {
    LoggingPlan {
        filters: log_filters(options),
        file_sink: open_file_sink(options.data_dir.as_deref(), options.retention_files),
    }
}

pub fn log_filters(options: &LoggingOptions) -> LogFilters {
    match choose_filter(options) {
        FilterChoice::Explicit(filter) => LogFilters {
            console: filter.clone(),
            file: filter,
        },
        FilterChoice::Implicit(filter) => LogFilters {
            console: prepend_directives(&options.noise_filter, &filter),
            file: prepend_directives(&file_noise_filter(&options.noise_filter), &filter),
        },
    }
}

pub fn select_log_filter(options: &LoggingOptions) -> String {
    log_filters(options).console
}

/// Opens a daily rolling appender under `<data_dir>/logs`. Never fails:
/// any problem downgrades to console-only logging.
pub fn open_file_sink(data_dir: Option<&Path>, retention_files: usize) -> FileSink {
    let Some(data_dir) = data_dir else {
        return FileSink::ConsoleOnly {
            log_dir: None,
            reason: "no data directory configured".to_string(),
        };
    };

    let log_dir = data_dir.join(LOG_DIR_NAME);
    if let Err(e) = fs::create_dir_all(&log_dir) {
        return FileSink::ConsoleOnly {
            log_dir: Some(log_dir),
            reason: format!("cannot create log directory: {e}"),
        };
    }

    let max_files = if retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        retention_files
    };

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(max_files)
        .build(&log_dir)
        .map(FileSink::Rolling)
        .unwrap_or_else(|e| FileSink::ConsoleOnly {
            log_dir: Some(log_dir),
            reason: format!("cannot open rolling log file: {e}"),
        })
}

fn choose_filter(options: &LoggingOptions) -> FilterChoice {
    if let Some(filter) = &options.cli_log_filter {
        return FilterChoice::Explicit(filter.clone());
    }
    match options.verbose {
        0 => FilterChoice::Implicit(
            options
                .rust_log_env
                .clone()
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
        ),
        1 => FilterChoice::Explicit("debug".to_string()),
        _ => FilterChoice::Explicit("trace".to_string()),
    }
}

fn prepend_directives(directives: &str, filter: &str) -> String {
    if directives.trim().is_empty() {
        filter.to_string()
    } else {
        format!("{directives},{filter}")
    }
}

/// Noise directives for the file sink: same as the console's except that
/// encoder stderr is always kept at debug.
fn file_noise_filter(noise_filter: &str) -> String {
    let encoder_directive = format!("{ENCODER_STDERR_TARGET}=debug");
    let mut directives: Vec<&str> = noise_filter
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .filter(|directive| {
            directive.split('=').next().map(str::trim) != Some(ENCODER_STDERR_TARGET)
        })
        .collect();
    directives.push(&encoder_directive);
    directives.join(",")
}
