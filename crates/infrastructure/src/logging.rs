use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{ConfigError, LogFormat, LogLevel};

/// Crates whose debug output drowns the agent's own.
const QUIET_TARGETS: &[&str] = &["hyper=warn", "h2=warn", "tower=warn"];

/// Build the event filter. `RUST_LOG` wins over the configured level.
pub fn build_filter(level: LogLevel) -> Result<EnvFilter, ConfigError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let mut directives = vec![level.as_str().to_string()];
    directives.extend(QUIET_TARGETS.iter().map(|d| (*d).to_string()));
    EnvFilter::try_new(directives.join(",")).map_err(|e| ConfigError::Validation {
        field: "agent.log_level".to_string(),
        message: e.to_string(),
    })
}

/// Initialize structured logging to stdout.
///
/// - `LogFormat::Json`: flattened JSON for log collectors.
/// - `LogFormat::Text`: human-readable colored output.
///
/// Must be called exactly once at startup.
pub fn init_logging(level: LogLevel, format: LogFormat) -> Result<(), ConfigError> {
    let registry = tracing_subscriber::registry().with(build_filter(level)?);

    match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_target(true)
                    .with_ansi(false),
            )
            .init(),
        LogFormat::Text => registry
            .with(fmt::layer().pretty().with_target(true).with_ansi(true))
            .init(),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_level_builds_a_filter() {
        for level in [
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ] {
            assert!(
                build_filter(level).is_ok(),
                "{} should be a valid filter",
                level.as_str()
            );
        }
    }

    #[test]
    fn quiet_targets_are_valid_directives() {
        for d in QUIET_TARGETS {
            assert!(EnvFilter::try_new(d).is_ok(), "{d}");
        }
    }
}
