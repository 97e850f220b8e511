use std::io::Write;

use log::LevelFilter;

use crate::error::{ConvertError, PipelineError};

/// Log verbosity selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }

    /// One step more verbose, saturating at debug.
    pub fn raised(self) -> Self {
        match self {
            LogLevel::Error => LogLevel::Warn,
            LogLevel::Warn => LogLevel::Info,
            LogLevel::Info | LogLevel::Debug => LogLevel::Debug,
        }
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
        }
    }
}

/// Initialize the logging system. `RUST_LOG` overrides `level` when set.
pub fn init_logging(level: LogLevel) {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(level.into())
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}",
                jiff::Zoned::now().strftime("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        });

    if builder.try_init().is_err() {
        eprintln!("Warning: Logging system already initialized");
    }
}

/// Result extension for convenient error logging
pub trait ResultExt<T, E> {
    fn log_error(self, context: Option<&str>) -> Self;
}

impl<T> ResultExt<T, ConvertError> for Result<T, ConvertError> {
    fn log_error(self, context: Option<&str>) -> Self {
        if let Err(ref error) = self {
            log_with_context(&error.to_string(), context);
        }
        self
    }
}

impl<T> ResultExt<T, PipelineError> for Result<T, PipelineError> {
    fn log_error(self, context: Option<&str>) -> Self {
        if let Err(ref error) = self {
            log_with_context(&error.to_string(), context);
        }
        self
    }
}

fn log_with_context(message: &str, context: Option<&str>) {
    match context {
        Some(ctx) => log::error!("{}: {}", ctx, message),
        None => log::error!("{}", message),
    }
}
