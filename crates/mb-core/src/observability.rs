//! Observability infrastructure for motherbrain.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors shared by every
//! orchestration flow.

use std::fmt;
use std::sync::Once;

use serde::{Deserialize, Serialize};
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt as fmt_layer, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `mb_flow=debug`)
///
/// # Example
///
/// ```rust
/// use mb_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        // A host application may already own the global subscriber.
        let _ = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer::layer().pretty())
                .try_init(),
        };
    });
}

/// Creates a span for orchestration operations.
///
/// Every background run (bootstrap, upgrade, provision, destroy) executes
/// inside one of these so its log lines carry the job and environment.
///
/// # Example
///
/// ```rust
/// use mb_core::observability::orchestration_span;
///
/// let span = orchestration_span("bootstrap", "01HZX", "production");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn orchestration_span(operation: &str, job_id: &str, environment: &str) -> Span {
    tracing::info_span!(
        "orchestration",
        op = operation,
        job_id = job_id,
        environment = environment,
    )
}

/// Creates a span for a single worker's remote action.
#[must_use]
pub fn worker_span(group_id: &str, host_count: usize) -> Span {
    tracing::info_span!("worker", group = group_id, hosts = host_count)
}

/// Wrapper that hides a value in `Debug` and `Display` output.
///
/// Used for credentials carried in configuration structs.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Redacted<T>(pub T);

impl<T> Redacted<T> {
    /// Returns a reference to the wrapped value.
    #[must_use]
    pub const fn expose(&self) -> &T {
        &self.0
    }
}

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_succeeds() {
        // Should not panic (uses Once internally)
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn test_orchestration_span_creates_span() {
        let span = orchestration_span("bootstrap", "job_123", "production");
        let _guard = span.enter();
        tracing::info!("orchestration message");
    }

    #[test]
    fn test_worker_span_creates_span() {
        let span = worker_span("app::web", 3);
        let _guard = span.enter();
        tracing::debug!("worker message");
    }

    #[test]
    fn redacted_hides_value() {
        let secret = Redacted("hunter2".to_string());
        assert_eq!(format!("{secret:?}"), "[REDACTED]");
        assert_eq!(secret.to_string(), "[REDACTED]");
        assert_eq!(secret.expose(), "hunter2");
    }
}
