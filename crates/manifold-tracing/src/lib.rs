//! Shared tracing configuration for the manifold workspace.
//!
//! Binaries, integration tests, and supporting tools all install their
//! `tracing` subscribers through this crate, so the builder logic lives in
//! one place and log output stays consistent across entry points.

use std::sync::Once;

pub use tracing::{debug, error, info, trace, warn};

use tracing_subscriber::fmt as tracing_fmt;
use tracing_subscriber::EnvFilter;

/// Output format of the installed subscriber
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingOutput {
    /// Human-readable multi-line output for local terminals
    Pretty,
    /// Compact single-line output
    Compact,
    /// JSON lines for log collection
    Json,
}

/// Configuration describing how the shared subscriber should behave
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Optional directives (e.g. `manifold_core=debug,info`). When absent
    /// the crate falls back to `RUST_LOG`, then to [`default_directive`].
    ///
    /// [`default_directive`]: TracingConfig::default_directive
    pub directives: Option<String>,
    /// Fallback directive used when neither `directives` nor `RUST_LOG`
    /// resolves to a valid filter.
    pub default_directive: String,
    /// Whether event targets (module paths) appear in output.
    pub include_targets: bool,
    /// ANSI colour. Disable for CI logs that strip colour codes.
    pub ansi: bool,
    /// Output format of the formatter layer.
    pub output: TracingOutput,
}

impl TracingConfig {
    /// Configuration tuned for local development
    pub fn for_local() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_owned(),
            include_targets: true,
            ansi: true,
            output: TracingOutput::Pretty,
        }
    }

    /// Configuration tuned for CI and log collection (JSON, no ANSI)
    pub fn for_ci() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_owned(),
            include_targets: true,
            ansi: false,
            output: TracingOutput::Json,
        }
    }

    fn filter(&self) -> EnvFilter {
        if let Some(directives) = &self.directives {
            if let Ok(filter) = EnvFilter::try_new(directives) {
                return filter;
            }
        }
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.default_directive))
    }

    /// Install the subscriber globally; errors if one is already installed
    pub fn try_init(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let builder = tracing_fmt()
            .with_env_filter(self.filter())
            .with_target(self.include_targets)
            .with_ansi(self.ansi);
        match self.output {
            TracingOutput::Pretty => builder.pretty().try_init(),
            TracingOutput::Compact => builder.compact().try_init(),
            TracingOutput::Json => builder.json().try_init(),
        }
    }

    /// Install the subscriber globally, panicking on failure
    pub fn init(&self) {
        self.try_init().expect("tracing subscriber already installed");
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::for_local()
    }
}

/// Idempotent installation for test binaries
///
/// Tests across a binary race to install the global subscriber; this guard
/// makes the first caller win and the rest no-ops.
pub fn init_for_tests() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let mut config = TracingConfig::for_local();
        config.output = TracingOutput::Compact;
        config.ansi = false;
        let _ = config.try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let local = TracingConfig::for_local();
        assert_eq!(local.output, TracingOutput::Pretty);
        assert!(local.ansi);

        let ci = TracingConfig::for_ci();
        assert_eq!(ci.output, TracingOutput::Json);
        assert!(!ci.ansi);
    }

    #[test]
    fn test_explicit_directives_win() {
        let mut config = TracingConfig::for_local();
        config.directives = Some("manifold_core=debug".to_owned());
        // filter construction must not panic on valid directives
        let _ = config.filter();
    }

    #[test]
    fn test_init_for_tests_is_idempotent() {
        init_for_tests();
        init_for_tests();
    }
}
