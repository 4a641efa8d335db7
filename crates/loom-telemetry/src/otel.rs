//! OTLP exporter wiring and the Loom sampler.

use opentelemetry::trace::{
    Link, SamplingDecision, SamplingResult, SpanKind, TraceContextExt, TraceId, TraceState,
    TracerProvider as _,
};
use opentelemetry::{Context, KeyValue, global};
use opentelemetry_otlp::SpanExporter;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracer, SdkTracerProvider, ShouldSample, SpanLimits};
use tracing_opentelemetry::OpenTelemetryLayer;

use crate::{TelemetryError, sample_rate};

/// Rate for root spans with no named category.
const DEFAULT_RATE: f64 = 0.1;

/// Shuts the tracer provider down on drop, flushing pending spans.
pub struct OtelGuard {
    provider: SdkTracerProvider,
    // Drop order: the enter guard goes before the runtime it entered.
    _runtime_enter: Option<tokio::runtime::EnterGuard<'static>>,
    _runtime: Option<&'static tokio::runtime::Runtime>,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Err(e) = self.provider.shutdown() {
            eprintln!("OTel shutdown error: {e}");
        }
    }
}

/// Build the OTel layer for `tracing_subscriber::registry()` and its guard.
pub fn otel_layer<S>(service_name: &str) -> Result<(OpenTelemetryLayer<S, SdkTracer>, OtelGuard), TelemetryError>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    // The batch processor spawns onto tokio. The admin CLI has no runtime of
    // its own, so one is created and leaked for the life of the process.
    let (exporter, runtime, enter) = match tokio::runtime::Handle::try_current() {
        Ok(_) => {
            let exporter = SpanExporter::builder()
                .with_tonic()
                .build()
                .map_err(|e| TelemetryError::Exporter(e.to_string()))?;
            (exporter, None, None)
        }
        Err(_) => {
            let rt: &'static tokio::runtime::Runtime = Box::leak(Box::new(tokio::runtime::Runtime::new()?));
            let enter = rt.enter();
            let exporter = rt
                .block_on(async { SpanExporter::builder().with_tonic().build() })
                .map_err(|e| TelemetryError::Exporter(e.to_string()))?;
            (exporter, Some(rt), Some(enter))
        }
    };

    let resource = Resource::builder().with_service_name(service_name.to_string()).build();
    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(LoomSampler)
        .with_resource(resource)
        .with_span_limits(SpanLimits::default())
        .build();
    global::set_tracer_provider(provider.clone());

    let layer = tracing_opentelemetry::layer().with_tracer(provider.tracer("loom"));
    Ok((layer, OtelGuard { provider, _runtime_enter: enter, _runtime: runtime }))
}

/// Samples by span name; see [`sample_rate`](crate::sample_rate).
///
/// Children of a sampled span and spans already marked as errors are always
/// recorded.
#[derive(Debug, Clone)]
pub struct LoomSampler;

fn record(trace_state: TraceState) -> SamplingResult {
    SamplingResult { decision: SamplingDecision::RecordAndSample, attributes: Vec::new(), trace_state }
}

fn marks_error(kv: &KeyValue) -> bool {
    match (kv.key.as_str(), kv.value.as_str().as_ref()) {
        ("otel.status_code", "ERROR") | ("error", "true") => true,
        _ => false,
    }
}

impl ShouldSample for LoomSampler {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult {
        let parent = parent_context.map(|cx| cx.span().span_context().clone());
        if let Some(parent) = parent.filter(|p| p.is_sampled()) {
            return record(parent.trace_state().clone());
        }
        if attributes.iter().any(marks_error) {
            return record(TraceState::default());
        }

        let ratio = Sampler::TraceIdRatioBased(sample_rate(name).unwrap_or(DEFAULT_RATE));
        ratio.should_sample(parent_context, trace_id, name, span_kind, attributes, links)
    }
}
