//! # Observability Core
//!
//! The passive sink every other engine writes to: a labeled metric registry
//! with Prometheus exposition (C1) and a span tracer with W3C context
//! propagation (C2).

pub mod metrics;
pub mod tracer;

pub use metrics::{Labels, MetricError, MetricKind, MetricRegistry, MetricResult};
pub use tracer::{
    AlwaysSampler, CompositeSampler, NeverSampler, ProbabilitySampler, Sampler, Span, SpanContext,
    SpanError, SpanEvent, SpanId, SpanStatus, TraceId, Tracer, TracerConfig, TracerError,
    TracerResult,
};
