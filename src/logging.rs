use anyhow::anyhow;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::MakeWriter,
    util::SubscriberInitExt as _,
};

use crate::config::{LogFormat, LoggingConfig};

const DEFAULT_LOG_LEVEL: &str = "info";

/// Installs the global subscriber. Must run once, before any other startup step logs.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let log_level = resolve_log_level(config.level.as_deref())?;

    match config.format.unwrap_or(LogFormat::Json) {
        LogFormat::Json => json_subscriber(log_level, std::io::stdout)
            .try_init()
            .map_err(|err| anyhow!("initialize logging subscriber: {err}")),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_target(true)
            .pretty()
            .try_init()
            .map_err(|err| anyhow!("initialize logging subscriber: {err}")),
    }
}

/// The JSON line subscriber `init` installs, writing to `writer`.
pub fn json_subscriber<W>(
    log_level: LevelFilter,
    writer: W,
) -> impl tracing::Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(true)
        .json()
        .with_writer(writer)
        .finish()
}

/// Parses a level name, accepting the legacy names `warning`, `success` and `fatal`.
pub fn resolve_log_level(raw_level: Option<&str>) -> anyhow::Result<LevelFilter> {
    let raw_level = raw_level.unwrap_or(DEFAULT_LOG_LEVEL);
    let normalized = raw_level.trim().to_ascii_lowercase();
    let canonical = match normalized.as_str() {
        "warning" => "warn",
        "success" => "info",
        "fatal" => "error",
        other => other,
    };

    canonical.parse::<LevelFilter>().map_err(|_| {
        anyhow!(
            "invalid log level `{raw_level}`; expected one of trace, debug, info, warn, error, off"
        )
    })
}

#[cfg(test)]
mod tests {
    use super::resolve_log_level;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn log_level_defaults_to_info() {
        assert_eq!(
            resolve_log_level(None).expect("default level should resolve"),
            LevelFilter::INFO
        );
    }

    #[test]
    fn legacy_level_names_map_onto_tracing_levels() {
        assert_eq!(resolve_log_level(Some("Warning")).unwrap(), LevelFilter::WARN);
        assert_eq!(resolve_log_level(Some("success")).unwrap(), LevelFilter::INFO);
        assert_eq!(resolve_log_level(Some("FATAL")).unwrap(), LevelFilter::ERROR);
        assert_eq!(resolve_log_level(Some(" debug ")).unwrap(), LevelFilter::DEBUG);
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let err = resolve_log_level(Some("verbose")).unwrap_err();
        assert!(
            err.to_string().contains("invalid log level"),
            "unexpected error: {err}"
        );
    }
}
