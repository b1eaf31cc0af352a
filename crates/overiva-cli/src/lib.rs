//! Shared start-up for the overiva command-line tools.

use std::path::Path;

use anyhow::Context;

use overiva_core::observe::{init_logging, LogLevel};
use overiva_core::ToolConfig;

/// Load the tool configuration (explicit path or search path) and start logging.
///
/// `verbose` raises the configured level to debug.
pub fn setup(config: Option<&Path>, verbose: bool) -> anyhow::Result<ToolConfig> {
    let tool = ToolConfig::load_or_search(config).with_context(|| match config {
        Some(p) => format!("loading configuration from {}", p.display()),
        None => "loading configuration".to_string(),
    })?;

    let logging = if verbose {
        tool.logging.clone().with_level(LogLevel::Debug)
    } else {
        tool.logging.clone()
    };
    init_logging(&logging);
    Ok(tool)
}
