//! Subscriber setup. Everything is written to stderr because stdout carries
//! outcome and delivery lines.

use serde::Deserialize;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const FALLBACK_LEVEL: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Case-insensitive; `None` for an unknown name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Some(LogFormat::Pretty),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Pick the filter: a valid `RUST_LOG` wins, then `level`, then "info".
/// The error is returned when `level` had to be replaced.
fn select_filter(rust_log: Option<&str>, level: &str) -> (EnvFilter, Option<ParseError>) {
    if let Some(Ok(filter)) = rust_log.map(EnvFilter::try_new) {
        return (filter, None);
    }
    match EnvFilter::try_new(level) {
        Ok(filter) => (filter, None),
        Err(e) => (EnvFilter::new(FALLBACK_LEVEL), Some(e)),
    }
}

/// Install the global subscriber. Must run once, before the runtime starts.
pub fn init_logging(level: &str, format: LogFormat) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let (filter, bad_level) = select_filter(rust_log.as_deref(), level);

    let pretty = (format == LogFormat::Pretty).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_line_number(true)
    });
    let json = (format == LogFormat::Json).then(|| {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_writer(std::io::stderr)
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(pretty)
        .with(json)
        .init();

    if let Some(e) = bad_level {
        tracing::warn!(level, error = %e, "invalid log level, using {}", FALLBACK_LEVEL);
    }
    tracing::debug!(?format, "logging ready");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_names() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse(" pretty "), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::parse("xml"), None);
        assert_eq!(LogFormat::default(), LogFormat::Pretty);
    }

    #[test]
    fn bad_level_falls_back() {
        let (_, err) = select_filter(None, "tally=loud");
        assert!(err.is_some());
        let (_, err) = select_filter(None, "tally_client=debug,warn");
        assert!(err.is_none());
        // A usable RUST_LOG hides a bad configured level.
        let (_, err) = select_filter(Some("debug"), "tally=loud");
        assert!(err.is_none());
        // An unusable RUST_LOG is ignored.
        let (_, err) = select_filter(Some("tally=loud"), "info");
        assert!(err.is_none());
    }
}
