use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_FILE_PREFIX: &str = "cfn-ansible-config.log";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid log level {level}: {message}")]
    InvalidLevel { level: String, message: String },

    #[error("Unable to set up logging: {0}")]
    Init(String),
}

/// `RUST_LOG` wins over the requested level when it is set.
pub fn env_filter(level: &str) -> Result<EnvFilter, Error> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    return EnvFilter::try_new(level).map_err(|error| Error::InvalidLevel {
        level: level.to_string(),
        message: error.to_string(),
    });
}

/// Logs to stderr and to a daily rolling file under `log_dir`. Keep the
/// returned guard alive until exit so buffered lines reach the file.
pub fn init(level: &str, log_dir: &Path) -> Result<WorkerGuard, Error> {
    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(env_filter(level)?)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking))
        .try_init()
        .map_err(|error| Error::Init(error.to_string()))?;

    return Ok(guard);
}

#[cfg(test)]
mod tests {
    use super::{env_filter, Error};

    #[test]
    fn rejects_unknown_level() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }

        let result = env_filter("info,aws_config=notalevel");
        assert_eq!(true, result.is_err());
        match result.err().unwrap() {
            Error::InvalidLevel { .. } => {}
            _ => panic!("Expected `InvalidLevel` error"),
        }
    }

    #[test]
    fn accepts_directives() {
        assert_eq!(true, env_filter("debug,aws_config=warn").is_ok());
    }
}
