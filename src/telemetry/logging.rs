//! Logging setup
//!
//! The configured level applies to the bridge's own targets; everything
//! else stays at `warn`. Individual modules can be raised or lowered
//! below the bridge level:
//!
//! ```toml
//! [logging]
//! level = "info"
//! format = "json"
//!
//! [logging.modules]
//! "dataplane::rebalance" = "debug"
//! ```
//!
//! RUST_LOG, when set and valid, replaces all of this.

use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::Level;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Target prefix of every event this crate emits
const CRATE_TARGET: &str = "bridgecore";

/// Level for targets outside this crate
const FOREIGN_LEVEL: Level = Level::WARN;

/// Output format of log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    /// One JSON object per event, fields flattened
    Json,
}

/// The `[logging]` table
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// error, warn, info, debug or trace
    pub level: String,
    pub format: LogFormat,
    /// Per-module levels, keyed by path below the crate root
    pub modules: BTreeMap<String, String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            modules: BTreeMap::new(),
        }
    }
}

/// Installs the global subscriber. A second call is a no-op.
pub fn init_logging(config: Option<&LogConfig>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));
    let format = config.map(|c| c.format).unwrap_or_default();

    let registry = tracing_subscriber::registry().with(filter);
    let _ = match format {
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_target(false))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().flatten_event(true))
            .try_init(),
    };
}

/// EnvFilter directives for `config`
fn filter_directives(config: Option<&LogConfig>) -> String {
    let level = config.map_or(Level::INFO, |c| parse_level(&c.level));
    let mut directives = vec![
        level_name(FOREIGN_LEVEL),
        format!("{}={}", CRATE_TARGET, level_name(level)),
    ];

    if let Some(cfg) = config {
        for (module, module_level) in &cfg.modules {
            let path = module
                .strip_prefix(CRATE_TARGET)
                .map(|rest| rest.trim_start_matches("::"))
                .unwrap_or(module);
            directives.push(format!(
                "{}::{}={}",
                CRATE_TARGET,
                path,
                level_name(parse_level(module_level))
            ));
        }
    }

    directives.join(",")
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

fn level_name(level: Level) -> String {
    level.as_str().to_ascii_lowercase()
}
