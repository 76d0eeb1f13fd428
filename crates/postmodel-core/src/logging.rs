//! Logging integration for postmodel.
//!
//! Every event the crates emit about database work uses the [`DB_TARGET`]
//! target, and statement execution runs inside a [`query_span`] carrying the
//! database name. Applications that do not install their own subscriber can
//! call [`setup_logging`].

use tracing_subscriber::EnvFilter;

use crate::settings::Settings;

/// Target of every event about database work: SQL statements at `debug`,
/// pool lifecycle at `info`, discarded connections at `warn`.
pub const DB_TARGET: &str = "postmodel::db";

/// The filter directives `settings` asks for.
///
/// `log_level` is used as given when it parses as an `EnvFilter` directive
/// list and falls back to `info` otherwise. In debug mode statement logging
/// is switched on for [`DB_TARGET`] unless `log_level` already says something
/// about `postmodel`.
///
/// # Examples
///
/// ```
/// use postmodel_core::logging::log_filter;
/// use postmodel_core::Settings;
///
/// let settings = Settings { debug: false, log_level: "warn".into(), ..Settings::default() };
/// assert_eq!(log_filter(&settings), "warn");
/// ```
pub fn log_filter(settings: &Settings) -> String {
    let base = match EnvFilter::try_new(&settings.log_level) {
        Ok(_) if !settings.log_level.trim().is_empty() => settings.log_level.trim().to_string(),
        _ => "info".to_string(),
    };
    if settings.debug && !base.contains("postmodel") {
        format!("{base},{DB_TARGET}=debug")
    } else {
        base
    }
}

/// Installs a global subscriber configured from `settings`.
///
/// Debug mode prints compact lines with the span context, so each statement
/// shows the database it ran on. Otherwise events are written as JSON with
/// the fields of the current span flattened in. Returns `false` if a
/// subscriber was already installed.
pub fn setup_logging(settings: &Settings) -> bool {
    use tracing_subscriber::fmt;

    let filter = EnvFilter::new(log_filter(settings));
    let installed = if settings.debug {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .compact()
            .try_init()
    } else {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .try_init()
    };
    installed.is_ok()
}

/// Creates a span for statements executed against the named database.
///
/// # Examples
///
/// ```
/// use postmodel_core::logging::query_span;
///
/// let span = query_span("default");
/// let _guard = span.enter();
/// tracing::debug!("running statement");
/// ```
pub fn query_span(db_name: &str) -> tracing::Span {
    tracing::debug_span!(target: DB_TARGET, "postmodel.query", db = db_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(debug: bool, level: &str) -> Settings {
        Settings {
            debug,
            log_level: level.into(),
            ..Settings::default()
        }
    }

    #[test]
    fn test_debug_turns_on_statement_logging() {
        assert_eq!(log_filter(&settings(true, "info")), "info,postmodel::db=debug");
        assert_eq!(log_filter(&settings(false, "info")), "info");
    }

    #[test]
    fn test_explicit_postmodel_directive_is_kept() {
        let level = "warn,postmodel::db=trace";
        assert_eq!(log_filter(&settings(true, level)), level);
    }

    #[test]
    fn test_invalid_level_falls_back_to_info() {
        assert_eq!(log_filter(&settings(false, "not a directive ===")), "info");
        assert_eq!(log_filter(&settings(false, "  ")), "info");
    }

    #[test]
    fn test_second_install_reports_false() {
        let s = settings(false, "warn");
        setup_logging(&s);
        assert!(!setup_logging(&s));
    }
}
