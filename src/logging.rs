//! Logging setup
//!
//! Builds an `env_logger` filter from [`LoggingConfig`]: a default level plus
//! per-module overrides. `RUST_LOG`, when set, wins over both.
//!
//! # Usage
//!
//! ```no_run
//! use shadowcommit::config::LoggingConfig;
//! use shadowcommit::logging;
//!
//! let mut config = LoggingConfig::default();
//! config.modules.insert("shadowcommit::buffer".into(), "trace".into());
//! logging::init(&config, false)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{bail, Result};
use log::LevelFilter;

use crate::config::LoggingConfig;

/// Parse a level name as written in the config file
pub fn parse_level(s: &str) -> Option<LevelFilter> {
    match s.to_ascii_lowercase().as_str() {
        "off" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        _ => None,
    }
}

/// Render the config as an `env_logger` filter string.
///
/// `debug` raises the default level to at least `debug`; module overrides
/// are kept as written.
pub fn filter_spec(config: &LoggingConfig, debug: bool) -> Result<String> {
    let Some(mut level) = parse_level(&config.level) else {
        bail!("Unknown log level: {}", config.level);
    };
    if debug && level < LevelFilter::Debug {
        level = LevelFilter::Debug;
    }

    let mut parts = vec![level.to_string().to_lowercase()];
    for (module, module_level) in &config.modules {
        let Some(parsed) = parse_level(module_level) else {
            bail!("Unknown log level for {}: {}", module, module_level);
        };
        parts.push(format!("{}={}", module, parsed.to_string().to_lowercase()));
    }
    Ok(parts.join(","))
}

/// Install the global logger. Fails if one is already installed.
pub fn init(config: &LoggingConfig, debug: bool) -> Result<()> {
    let spec = filter_spec(config, debug)?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(spec))
        .format_timestamp_millis()
        .try_init()?;
    Ok(())
}
