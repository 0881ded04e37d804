use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_FILE: &str = "runtrace.logs.jsonl";

/// Logging options read from `RUNTRACE_*` variables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogSettings {
    pub enabled: bool,
    /// Filter candidates in priority order: `RUNTRACE_LOG_LEVEL`, then `RUST_LOG`.
    pub filters: Vec<String>,
    /// JSONL destination; `None` logs to the console.
    pub json_log_path: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            filters: Vec::new(),
            json_log_path: None,
        }
    }
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = ["RUNTRACE_OBSERVABILITY_ENABLED", "RUNTRACE_OBSERVABILITY"]
            .into_iter()
            .find_map(&lookup)
            .map(|raw| parse_bool_env(&raw).unwrap_or(true))
            .unwrap_or(true);
        let filters = ["RUNTRACE_LOG_LEVEL", "RUST_LOG"]
            .into_iter()
            .filter_map(&lookup)
            .collect();
        let json_log_path = lookup("RUNTRACE_JSON_LOG_PATH").map(PathBuf::from);
        Self {
            enabled,
            filters,
            json_log_path,
        }
    }

    /// First filter candidate that parses, else `info`.
    pub fn env_filter(&self) -> EnvFilter {
        self.filters
            .iter()
            .find_map(|raw| EnvFilter::try_new(raw).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

/// Splits a log path into the directory to create and the file name to write.
fn log_file_location(path: &Path) -> (PathBuf, String) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE)
        .to_string();
    (dir, file_name)
}

/// Initialize logging once per process from [`LogSettings::from_env`].
///
/// Environment variables:
/// - `RUNTRACE_OBSERVABILITY_ENABLED` / `RUNTRACE_OBSERVABILITY`: optional enable/disable flag (default enabled).
/// - `RUNTRACE_LOG_LEVEL`: optional level/filter override (`info`, `debug`, etc.).
/// - `RUNTRACE_JSON_LOG_PATH`: optional log file path. If set, logs are JSONL in that file.
///   If unset, logs go to stderr in a compact console format; stdout is left to event output.
/// - `RUST_LOG`: fallback filter.
pub fn init_observability() {
    INIT.get_or_init(|| install(LogSettings::from_env()));
}

fn install(settings: LogSettings) {
    if !settings.enabled {
        return;
    }
    let env_filter = settings.env_filter();
    match settings.json_log_path.as_deref() {
        Some(path) => {
            let (dir, file_name) = log_file_location(path);
            let _ = std::fs::create_dir_all(&dir);
            let json_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_target(false)
                .with_writer(tracing_appender::rolling::never(dir, file_name));
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(json_layer)
                .try_init();
        }
        None => {
            let console_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn bool_flags_accept_common_spellings() {
        assert_eq!(parse_bool_env(" Enabled "), Some(true));
        assert_eq!(parse_bool_env("off"), Some(false));
        assert_eq!(parse_bool_env("maybe"), None);
    }

    #[test]
    fn settings_default_to_enabled_console_logging() {
        assert_eq!(LogSettings::from_lookup(lookup(&[])), LogSettings::default());
    }

    #[test]
    fn first_enable_flag_wins_and_unknown_values_keep_logging_on() {
        let settings = LogSettings::from_lookup(lookup(&[
            ("RUNTRACE_OBSERVABILITY_ENABLED", "no"),
            ("RUNTRACE_OBSERVABILITY", "yes"),
        ]));
        assert!(!settings.enabled);
        let settings = LogSettings::from_lookup(lookup(&[("RUNTRACE_OBSERVABILITY", "sometimes")]));
        assert!(settings.enabled);
    }

    #[test]
    fn log_level_takes_priority_over_rust_log() {
        let settings = LogSettings::from_lookup(lookup(&[
            ("RUST_LOG", "warn"),
            ("RUNTRACE_LOG_LEVEL", "runtrace_core=debug"),
            ("RUNTRACE_JSON_LOG_PATH", "logs/trace.jsonl"),
        ]));
        assert_eq!(settings.filters, ["runtrace_core=debug", "warn"]);
        assert_eq!(
            settings.env_filter().to_string(),
            EnvFilter::new("runtrace_core=debug").to_string()
        );
        assert_eq!(settings.json_log_path, Some(PathBuf::from("logs/trace.jsonl")));
    }

    #[test]
    fn invalid_filters_fall_through_to_info() {
        let settings = LogSettings {
            filters: vec!["runtrace=loudest".into()],
            ..LogSettings::default()
        };
        assert_eq!(
            settings.env_filter().to_string(),
            EnvFilter::new("info").to_string()
        );
    }

    #[test]
    fn bare_file_name_logs_to_current_dir() {
        let (dir, file) = log_file_location(Path::new("trace.jsonl"));
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(file, "trace.jsonl");
    }

    #[test]
    fn nested_log_path_dir_can_be_created() {
        let root = tempfile::tempdir().expect("tempdir");
        let path = root.path().join("logs/nested/trace.jsonl");
        let (dir, file) = log_file_location(&path);
        std::fs::create_dir_all(&dir).expect("create");
        assert!(dir.is_dir());
        assert_eq!(dir, root.path().join("logs/nested"));
        assert_eq!(file, "trace.jsonl");
    }
}
