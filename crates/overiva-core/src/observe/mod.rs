//! # Observability
//!
//! Structured logging for the separation library and the experiment tools.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ trials, sweep, demo   tracing::info!(...)     │
//! └──────────────────────┬───────────────────────┘
//!                        ▼
//!          registry ── EnvFilter ── fmt layer (json | pretty | compact)
//!                        ▼
//!                      stderr
//! ```

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat, LogLevel};
