//! Tracing subscriber setup.
//!
//! Logs go to stderr so command output on stdout stays machine-readable.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins when set and valid;
/// otherwise `level` (e.g. `"warn"`, `"vaultgraph=debug"`) is used.
///
/// # Errors
///
/// Returns an error if `level` is not a valid filter directive or a global
/// subscriber is already installed.
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| anyhow::anyhow!("invalid log level '{level}': {e}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to set subscriber: {e}"))
}

/// Check a plain level name such as `"info"`.
///
/// # Errors
///
/// Returns an error for empty or unrecognised levels.
pub fn parse_level(level: &str) -> anyhow::Result<LevelFilter> {
    if level.trim().is_empty() {
        anyhow::bail!("log level must not be empty");
    }
    level
        .parse::<LevelFilter>()
        .map_err(|_| anyhow::anyhow!("unrecognised log level: '{level}'"))
}

/// Check a filter such as `"warn"` or `"warn,vaultgraph=debug"`: every
/// comma-separated part is a level, optionally prefixed by `target=`.
///
/// # Errors
///
/// Returns an error naming the first part that is not a known level.
pub fn validate_filter(filter: &str) -> anyhow::Result<()> {
    if filter.trim().is_empty() {
        anyhow::bail!("log level must not be empty");
    }
    for part in filter.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let level = match part.rsplit_once('=') {
            Some((target, level)) if !target.trim().is_empty() => level,
            Some(_) => anyhow::bail!("missing target in log directive '{part}'"),
            None => part,
        };
        parse_level(level.trim())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_levels_parse() {
        for level in ["error", "warn", "info", "debug", "trace", "off"] {
            assert!(parse_level(level).is_ok(), "expected '{level}' to parse");
        }
    }

    #[test]
    fn unknown_levels_are_rejected() {
        assert!(parse_level("").is_err());
        assert!(parse_level("loud").is_err());
    }

    #[test]
    fn directives_need_known_levels() {
        assert!(validate_filter("warn").is_ok());
        assert!(validate_filter("warn, vaultgraph=debug").is_ok());
        assert!(validate_filter("loud").is_err());
        assert!(validate_filter("vaultgraph=chatty").is_err());
        assert!(validate_filter("=debug").is_err());
        assert!(validate_filter(" ").is_err());
    }

    #[test]
    fn second_init_reports_existing_subscriber() {
        let _ = init("warn");

        let second = init("warn");

        assert!(second.is_err());
    }
}
