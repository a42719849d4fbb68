//! Tracing subscriber initialization.
//!
//! `RUST_LOG` selects what is logged (default `info`), `EVENTSTORE_LOG_FORMAT`
//! selects how: `json` (default) for machine ingestion, `text` for terminals.

use tracing_subscriber::EnvFilter;

/// Output format of log lines.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

impl LogFormat {
    /// Parse a format name; unknown names fall back to JSON.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("text") | Some("pretty") => LogFormat::Text,
            _ => LogFormat::Json,
        }
    }

    pub fn from_env() -> Self {
        Self::parse(std::env::var("EVENTSTORE_LOG_FORMAT").ok().as_deref())
    }
}

/// Initialize tracing with the format taken from the environment.
pub fn init() {
    init_with(LogFormat::from_env());
}

/// Initialize tracing with an explicit format.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_with(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_writer(std::io::stderr);

    let _ = match format {
        LogFormat::Json => builder.json().with_target(false).try_init(),
        LogFormat::Text => builder.with_target(true).try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_format_names() {
        assert_eq!(LogFormat::parse(None), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("TEXT")), LogFormat::Text);
        assert_eq!(LogFormat::parse(Some(" pretty ")), LogFormat::Text);
        assert_eq!(LogFormat::parse(Some("xml")), LogFormat::Json);
    }

    #[test]
    fn init_twice_is_harmless() {
        init_with(LogFormat::Text);
        init_with(LogFormat::Json);
    }
}
