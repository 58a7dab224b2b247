//! Process-wide `tracing` setup for hosts embedding a run stream.
//!
//! Settings come from `SUITESTREAM_*` variables. Logs never go to stdout,
//! which belongs to whatever the host renders.

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_FILTER: &str = "info";
const DEFAULT_LOG_FILE: &str = "suitestream.logs.jsonl";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogOutput {
    /// Compact human-readable lines on stderr.
    Stderr,
    /// JSON lines appended to a file, spans included.
    JsonFile(PathBuf),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservabilitySettings {
    pub enabled: bool,
    /// `EnvFilter` directive, e.g. `suitestream_core=debug,info`.
    pub filter: String,
    pub output: LogOutput,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            filter: DEFAULT_FILTER.to_string(),
            output: LogOutput::Stderr,
        }
    }
}

impl ObservabilitySettings {
    /// Reads `SUITESTREAM_OBSERVABILITY_ENABLED`, `SUITESTREAM_LOG_LEVEL`
    /// (then `RUST_LOG`) and `SUITESTREAM_JSON_LOG_PATH`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = lookup("SUITESTREAM_OBSERVABILITY_ENABLED")
            .and_then(|value| parse_flag(&value))
            .unwrap_or(true);
        let filter = ["SUITESTREAM_LOG_LEVEL", "RUST_LOG"]
            .into_iter()
            .filter_map(|key| lookup(key))
            .map(|value| value.trim().to_string())
            .find(|value| !value.is_empty() && EnvFilter::try_new(value).is_ok())
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());
        let output = lookup("SUITESTREAM_JSON_LOG_PATH")
            .filter(|path| !path.trim().is_empty())
            .map_or(LogOutput::Stderr, |path| {
                LogOutput::JsonFile(PathBuf::from(path.trim()))
            });
        Self {
            enabled,
            filter,
            output,
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => None,
    }
}

/// Splits a log file path into the directory and file name the appender wants.
fn log_target(path: &Path) -> (PathBuf, String) {
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

/// Installs the subscriber described by the environment. Later calls are no-ops.
pub fn init_observability() {
    init_observability_with(ObservabilitySettings::from_env());
}

/// Installs a subscriber for explicit settings. Only the first call in a
/// process has any effect, whichever entry point it comes through.
pub fn init_observability_with(settings: ObservabilitySettings) {
    INIT.get_or_init(|| {
        if !settings.enabled {
            return;
        }
        let env_filter =
            EnvFilter::try_new(&settings.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        match settings.output {
            LogOutput::JsonFile(path) => {
                let (dir, file_name) = log_target(&path);
                let _ = std::fs::create_dir_all(&dir);
                let writer = tracing_appender::rolling::never(dir, file_name);
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_current_span(true)
                            .with_span_list(true)
                            .with_writer(writer),
                    )
                    .try_init();
            }
            LogOutput::Stderr => {
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .compact()
                            .with_target(false)
                            .with_writer(std::io::stderr),
                    )
                    .try_init();
            }
        }
    });
}
