//! Diagnostic tracing.
//!
//! Output goes to stderr in compact format. The filter is taken from
//! `CAIRN_LOG`, then `RUST_LOG`, then the configured default.

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ENV_LOG;

/// Build a filter from an explicit directive, falling back to `default`
/// when the directive is absent or unparsable.
pub fn filter_from(directive: Option<&str>, default: &str) -> EnvFilter {
    directive
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(default))
}

/// Install the global subscriber. Fails if one is already installed.
///
/// `default` is normally [`crate::EngineConfig::log_filter`].
pub fn init(default: &str) -> Result<()> {
    let directive = std::env::var(ENV_LOG)
        .or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV))
        .ok();
    let filter = filter_from(directive.as_deref(), default);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init()
        .context("failed to install tracing subscriber")
}
