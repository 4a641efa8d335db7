//! Tracing setup for Loom binaries, with optional OpenTelemetry export.
//!
//! Every binary calls [`init_tracing`] once at startup. Logs go to stderr
//! through an `EnvFilter` (default `info`, override with `RUST_LOG`).
//!
//! # OTel export
//!
//! Built with the `telemetry` feature, spans are also exported over OTLP when
//! the standard environment variables ask for it:
//!
//! ```bash
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4317 loom-server branches --db space.db
//! ```
//!
//! Set `OTEL_SDK_DISABLED=true` to turn export off even when an endpoint is set.

#[cfg(feature = "telemetry")]
mod otel;

#[cfg(feature = "telemetry")]
pub use otel::{LoomSampler, OtelGuard, otel_layer};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("OTLP exporter: {0}")]
    Exporter(String),
    #[error("runtime for OTLP export: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Whether the environment asks for OTel export.
///
/// True when `OTEL_SDK_DISABLED` is not `"true"` and either
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set or `OTEL_TRACES_EXPORTER` is set to
/// something other than `"none"`.
pub fn otel_enabled() -> bool {
    if std::env::var("OTEL_SDK_DISABLED")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
    {
        return false;
    }
    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        return true;
    }
    if let Ok(exporter) = std::env::var("OTEL_TRACES_EXPORTER") {
        return !exporter.eq_ignore_ascii_case("none");
    }
    false
}

/// Span names sampled at every occurrence: anything that changes the log.
const WRITE_SPANS: &[&str] = &[
    "loom.append",
    "loom.fork",
    "loom.merge",
    "loom.submit_event",
    "loom.designate_primary",
];

/// High-volume read spans.
const READ_SPANS: &[&str] = &["loom.state_of", "loom.history_bundle", "loom.compress"];

/// Sampling rate for a root span by name. `None` defers to the parent-based
/// default.
///
/// | spans                                        | rate |
/// |----------------------------------------------|------|
/// | `loom.append`, `loom.fork`, `loom.merge`, … | 100% |
/// | `loom.state_of`, `loom.history_bundle`, …   | 10%  |
/// | anything else                                | parent, else 10% |
pub fn sample_rate(span_name: &str) -> Option<f64> {
    if WRITE_SPANS.contains(&span_name) {
        Some(1.0)
    } else if READ_SPANS.contains(&span_name) {
        Some(0.1)
    } else {
        None
    }
}

/// Keeps OTel export alive. Hold it until the process exits.
#[derive(Default)]
pub struct TelemetryGuard {
    #[cfg(feature = "telemetry")]
    _otel: Option<OtelGuard>,
}

/// Install the global subscriber: stderr logs, plus OTel when enabled.
///
/// Calling it again is a no-op.
pub fn init_tracing(service_name: &str) -> TelemetryGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));

    #[cfg(feature = "telemetry")]
    if otel_enabled() {
        match otel_layer(service_name) {
            Ok((layer, guard)) => {
                let _ = registry.with(layer).try_init();
                return TelemetryGuard { _otel: Some(guard) };
            }
            Err(e) => eprintln!("{service_name}: OTel export disabled: {e}"),
        }
    }
    #[cfg(not(feature = "telemetry"))]
    let _ = service_name;

    let _ = registry.try_init();
    TelemetryGuard::default()
}
