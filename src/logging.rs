use crate::config::{LogFormat, LogLevel, LoggingConfig};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::io::Write;

/// Initialize the `log` facade via env_logger. `RUST_LOG` overrides the
/// configured level.
pub fn init(config: &LoggingConfig) {
    let level = config.level.clone().unwrap_or_default().to_string();
    let format = config.format.clone().unwrap_or_default();

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));

    if matches!(format, LogFormat::Json) {
        builder.format(|buf, record| {
            let timestamp: DateTime<Utc> = Utc::now();
            let entry = json!({
                "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
                "level": record.level().to_string().to_lowercase(),
                "target": record.target(),
                "module": record.module_path().unwrap_or("unknown"),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{}", entry)
        });
    }

    builder.init();
}

pub fn parse_log_level(s: &str) -> Result<LogLevel, Box<dyn std::error::Error>> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        _ => Err(format!("Invalid log level: {}. Must be one of: trace, debug, info, warn, error", s).into()),
    }
}

pub fn parse_log_format(s: &str) -> Result<LogFormat, Box<dyn std::error::Error>> {
    match s.to_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        _ => Err(format!("Invalid log format: {}. Must be one of: text, json", s).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("debug"), Ok(LogLevel::Debug)));
        assert!(matches!(parse_log_level("WARN"), Ok(LogLevel::Warn)));
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_parse_log_format() {
        assert!(matches!(parse_log_format("json"), Ok(LogFormat::Json)));
        assert!(parse_log_format("xml").is_err());
    }
}
