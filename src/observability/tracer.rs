//! Span tracer with W3C trace-context propagation (C2).
//!
//! Active spans live in a table keyed by span id; ending a span moves it
//! into a bounded FIFO ring of completed spans for later inspection or
//! export. Sampling is delegated to a [`Sampler`] so callers can swap head-
//! based, rate-limited, or always/never strategies without touching the
//! tracer itself.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const DEFAULT_COMPLETED_CAPACITY: usize = 10_000;

#[derive(Debug, Error)]
pub enum TracerError {
    #[error("invalid traceparent header: {0}")]
    InvalidTraceContext(String),
    #[error("span {0} is not active")]
    SpanNotActive(String),
}

pub type TracerResult<T> = Result<T, TracerError>;

/// 128-bit trace identifier, rendered as 32 lowercase hex chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId([u8; 16]);

impl TraceId {
    pub fn new() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    pub fn from_hex(hex: &str) -> TracerResult<Self> {
        if hex.len() != 32 {
            return Err(TracerError::InvalidTraceContext(
                "trace id must be 32 hex characters".to_string(),
            ));
        }
        let mut bytes = [0u8; 16];
        for i in 0..16 {
            bytes[i] = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| TracerError::InvalidTraceContext("invalid hex".to_string()))?;
        }
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// 64-bit span identifier, rendered as 16 lowercase hex chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanId([u8; 8]);

impl SpanId {
    pub fn new() -> Self {
        let uuid = Uuid::new_v4();
        let b = uuid.as_bytes();
        Self([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
    }

    pub fn from_hex(hex: &str) -> TracerResult<Self> {
        if hex.len() != 16 {
            return Err(TracerError::InvalidTraceContext(
                "span id must be 16 hex characters".to_string(),
            ));
        }
        let mut bytes = [0u8; 8];
        for i in 0..8 {
            bytes[i] = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| TracerError::InvalidTraceContext("invalid hex".to_string()))?;
        }
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl std::fmt::Display for SpanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Trace-level flags carried in the W3C `traceparent` header's flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceFlags {
    pub sampled: bool,
}

impl TraceFlags {
    fn to_byte(self) -> u8 {
        if self.sampled {
            0x01
        } else {
            0x00
        }
    }

    fn from_byte(byte: u8) -> Self {
        Self {
            sampled: (byte & 0x01) != 0,
        }
    }
}

/// Context identifying a span's position in its trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub flags: TraceFlags,
}

impl SpanContext {
    pub fn new_root(sampled: bool) -> Self {
        Self {
            trace_id: TraceId::new(),
            span_id: SpanId::new(),
            parent_span_id: None,
            flags: TraceFlags { sampled },
        }
    }

    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: SpanId::new(),
            parent_span_id: Some(self.span_id),
            flags: self.flags,
        }
    }

    /// Render as a W3C `traceparent` header value: `version-traceid-spanid-flags`.
    pub fn to_traceparent(&self) -> String {
        format!(
            "00-{}-{}-{:02x}",
            self.trace_id,
            self.span_id,
            self.flags.to_byte()
        )
    }

    /// Parse a W3C `traceparent` header value. The parsed context has no
    /// parent span id recorded; the caller treats the header's span id as
    /// the remote parent when it starts a child span.
    pub fn from_traceparent(header: &str) -> TracerResult<Self> {
        let parts: Vec<&str> = header.split('-').collect();
        if parts.len() != 4 {
            return Err(TracerError::InvalidTraceContext(
                "traceparent must have 4 dash-separated fields".to_string(),
            ));
        }
        let trace_id = TraceId::from_hex(parts[1])?;
        let span_id = SpanId::from_hex(parts[2])?;
        let flags_byte = u8::from_str_radix(parts[3], 16)
            .map_err(|_| TracerError::InvalidTraceContext("invalid flags byte".to_string()))?;

        Ok(Self {
            trace_id,
            span_id,
            parent_span_id: None,
            flags: TraceFlags::from_byte(flags_byte),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanStatus {
    Unset,
    Ok,
    Error,
}

/// A named occurrence recorded against a span without ending it, e.g. a
/// retry or a cache miss partway through the operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp: SystemTime,
    pub attributes: HashMap<String, String>,
}

/// Carried into `Tracer::end` to record a span's failure; `message` and
/// `stack` are copied into the span's attributes under `error.message`
/// and `error.stack`.
#[derive(Debug, Clone)]
pub struct SpanError {
    pub message: String,
    pub stack: Option<String>,
}

impl SpanError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// A unit of work. Mutated while active, immutable once pushed to the
/// completed ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub context: SpanContext,
    pub name: String,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
    pub attributes: HashMap<String, String>,
    pub events: Vec<SpanEvent>,
    pub status: SpanStatus,
}

impl Span {
    fn new_root(name: impl Into<String>, sampled: bool) -> Self {
        Self {
            context: SpanContext::new_root(sampled),
            name: name.into(),
            start_time: SystemTime::now(),
            end_time: None,
            attributes: HashMap::new(),
            events: Vec::new(),
            status: SpanStatus::Unset,
        }
    }

    fn new_child(parent: &SpanContext, name: impl Into<String>) -> Self {
        Self {
            context: parent.child(),
            name: name.into(),
            start_time: SystemTime::now(),
            end_time: None,
            attributes: HashMap::new(),
            events: Vec::new(),
            status: SpanStatus::Unset,
        }
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn add_event(&mut self, name: impl Into<String>, attributes: HashMap<String, String>) {
        self.events.push(SpanEvent {
            name: name.into(),
            timestamp: SystemTime::now(),
            attributes,
        });
    }

    pub fn duration(&self) -> Option<Duration> {
        self.end_time.and_then(|end| end.duration_since(self.start_time).ok())
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingDecision {
    Sample,
    Drop,
}

/// Decides whether a newly started root span should be sampled.
pub trait Sampler: Send + Sync {
    fn should_sample(&self, trace_id: &TraceId, span_name: &str) -> SamplingDecision;
}

/// Samples every trace. Suitable for development and low-volume services.
pub struct AlwaysSampler;

impl Sampler for AlwaysSampler {
    fn should_sample(&self, _trace_id: &TraceId, _span_name: &str) -> SamplingDecision {
        SamplingDecision::Sample
    }
}

/// Drops every trace.
pub struct NeverSampler;

impl Sampler for NeverSampler {
    fn should_sample(&self, _trace_id: &TraceId, _span_name: &str) -> SamplingDecision {
        SamplingDecision::Drop
    }
}

/// Samples a fixed fraction of root spans.
pub struct ProbabilitySampler {
    probability: f64,
}

impl ProbabilitySampler {
    pub fn new(probability: f64) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
        }
    }
}

impl Sampler for ProbabilitySampler {
    fn should_sample(&self, _trace_id: &TraceId, _span_name: &str) -> SamplingDecision {
        if rand::random::<f64>() < self.probability {
            SamplingDecision::Sample
        } else {
            SamplingDecision::Drop
        }
    }
}

/// Samples a span unconditionally if its name matches any `always_trace`
/// pattern, otherwise falls back to a fixed probability. Unlike
/// [`AlwaysSampler`]/[`NeverSampler`]/[`ProbabilitySampler`], which are
/// each one strategy on their own, this combines a forced-trace override
/// with a probabilistic baseline in a single decision.
pub struct CompositeSampler {
    always_trace: Vec<Regex>,
    sample_rate: f64,
}

impl CompositeSampler {
    pub fn new(always_trace: Vec<Regex>, sample_rate: f64) -> Self {
        Self {
            always_trace,
            sample_rate: sample_rate.clamp(0.0, 1.0),
        }
    }
}

impl Sampler for CompositeSampler {
    fn should_sample(&self, _trace_id: &TraceId, span_name: &str) -> SamplingDecision {
        if self.always_trace.iter().any(|pattern| pattern.is_match(span_name)) {
            return SamplingDecision::Sample;
        }
        if rand::random::<f64>() < self.sample_rate {
            SamplingDecision::Sample
        } else {
            SamplingDecision::Drop
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracerConfig {
    /// How many finished spans the completed ring retains before evicting
    /// the oldest.
    pub completed_capacity: usize,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            completed_capacity: DEFAULT_COMPLETED_CAPACITY,
        }
    }
}

impl TracerConfig {
    pub fn validate(&self) -> TracerResult<()> {
        if self.completed_capacity == 0 {
            return Err(TracerError::InvalidTraceContext(
                "completed_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

struct TracerState {
    active: HashMap<SpanId, Span>,
    completed: VecDeque<Span>,
}

/// Span lifecycle manager: starts root/child spans, holds them in an active
/// table keyed by span id, and retires ended spans into a bounded FIFO ring.
pub struct Tracer {
    config: TracerConfig,
    sampler: Arc<dyn Sampler>,
    state: Mutex<TracerState>,
}

impl Tracer {
    pub fn new(config: TracerConfig, sampler: Arc<dyn Sampler>) -> TracerResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            sampler,
            state: Mutex::new(TracerState {
                active: HashMap::new(),
                completed: VecDeque::new(),
            }),
        })
    }

    /// Start a root span, consulting the sampler for the sampling decision
    /// baked into its context flags.
    pub fn start_root(&self, name: impl Into<String>) -> SpanId {
        let name = name.into();
        let trace_id = TraceId::new();
        let sampled = matches!(
            self.sampler.should_sample(&trace_id, &name),
            SamplingDecision::Sample
        );

        let mut span = Span::new_root(name, sampled);
        span.context.trace_id = trace_id;
        let span_id = span.context.span_id;

        self.state.lock().active.insert(span_id, span);
        span_id
    }

    /// Start a span inheriting `parent`'s trace id and sampling flag.
    pub fn start_child(&self, parent: &SpanContext, name: impl Into<String>) -> SpanId {
        let span = Span::new_child(parent, name);
        let span_id = span.context.span_id;
        self.state.lock().active.insert(span_id, span);
        span_id
    }

    /// Start a span as the child of a remote context carried over the wire.
    pub fn start_from_traceparent(
        &self,
        header: &str,
        name: impl Into<String>,
    ) -> TracerResult<SpanId> {
        let remote = SpanContext::from_traceparent(header)?;
        Ok(self.start_child(&remote, name))
    }

    pub fn set_attribute(
        &self,
        span_id: SpanId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> TracerResult<()> {
        let mut state = self.state.lock();
        let span = state
            .active
            .get_mut(&span_id)
            .ok_or_else(|| TracerError::SpanNotActive(span_id.to_string()))?;
        span.set_attribute(key, value);
        Ok(())
    }

    /// Look up the context of an active span, e.g. to build a `traceparent`
    /// header for an outgoing call.
    pub fn context_of(&self, span_id: SpanId) -> Option<SpanContext> {
        self.state.lock().active.get(&span_id).map(|s| s.context.clone())
    }

    /// Record a named event against an active span without ending it.
    pub fn add_event(
        &self,
        span_id: SpanId,
        name: impl Into<String>,
        attributes: HashMap<String, String>,
    ) -> TracerResult<()> {
        let mut state = self.state.lock();
        let span = state
            .active
            .get_mut(&span_id)
            .ok_or_else(|| TracerError::SpanNotActive(span_id.to_string()))?;
        span.add_event(name, attributes);
        Ok(())
    }

    /// End a span, moving it from the active table into the completed ring.
    /// Evicts the oldest completed span once the ring is at capacity.
    /// `error`'s message and stack (if any) are copied into the span's
    /// attributes as `error.message`/`error.stack`.
    pub fn end(&self, span_id: SpanId, status: SpanStatus, error: Option<SpanError>) -> TracerResult<()> {
        let mut state = self.state.lock();
        let mut span = state
            .active
            .remove(&span_id)
            .ok_or_else(|| TracerError::SpanNotActive(span_id.to_string()))?;

        span.end_time = Some(SystemTime::now());
        span.status = status;
        if let Some(error) = error {
            span.set_attribute("error.message", error.message);
            if let Some(stack) = error.stack {
                span.set_attribute("error.stack", stack);
            }
        }

        if state.completed.len() >= self.config.completed_capacity {
            state.completed.pop_front();
        }
        state.completed.push_back(span);
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn completed_count(&self) -> usize {
        self.state.lock().completed.len()
    }

    /// Snapshot of completed spans, oldest first.
    pub fn completed_snapshot(&self) -> Vec<Span> {
        self.state.lock().completed.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracer(sampler: Arc<dyn Sampler>) -> Tracer {
        Tracer::new(TracerConfig::default(), sampler).unwrap()
    }

    #[test]
    fn traceparent_round_trips() {
        let ctx = SpanContext::new_root(true);
        let header = ctx.to_traceparent();
        let parsed = SpanContext::from_traceparent(&header).unwrap();
        assert_eq!(ctx.trace_id, parsed.trace_id);
        assert_eq!(ctx.span_id, parsed.span_id);
        assert_eq!(ctx.flags, parsed.flags);
    }

    #[test]
    fn malformed_traceparent_rejected() {
        assert!(SpanContext::from_traceparent("not-a-header").is_err());
    }

    #[test]
    fn child_span_shares_trace_id() {
        let t = tracer(Arc::new(AlwaysSampler));
        let root_id = t.start_root("root");
        let root_ctx = t.context_of(root_id).unwrap();
        let child_id = t.start_child(&root_ctx, "child");
        let child_ctx = t.context_of(child_id).unwrap();

        assert_eq!(root_ctx.trace_id, child_ctx.trace_id);
        assert_eq!(child_ctx.parent_span_id, Some(root_id));
    }

    #[test]
    fn ending_moves_span_to_completed_ring() {
        let t = tracer(Arc::new(AlwaysSampler));
        let id = t.start_root("op");
        assert_eq!(t.active_count(), 1);

        t.end(id, SpanStatus::Ok, None).unwrap();
        assert_eq!(t.active_count(), 0);
        assert_eq!(t.completed_count(), 1);
    }

    #[test]
    fn ending_unknown_span_errors() {
        let t = tracer(Arc::new(AlwaysSampler));
        let bogus = SpanId::new();
        assert!(t.end(bogus, SpanStatus::Ok, None).is_err());
    }

    #[test]
    fn completed_ring_evicts_oldest_past_capacity() {
        let t = Tracer::new(
            TracerConfig { completed_capacity: 2 },
            Arc::new(AlwaysSampler),
        )
        .unwrap();

        let first = t.start_root("first");
        t.end(first, SpanStatus::Ok, None).unwrap();
        let second = t.start_root("second");
        t.end(second, SpanStatus::Ok, None).unwrap();
        let third = t.start_root("third");
        t.end(third, SpanStatus::Ok, None).unwrap();

        let names: Vec<String> = t.completed_snapshot().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["second", "third"]);
    }

    #[test]
    fn never_sampler_marks_unsampled() {
        let t = tracer(Arc::new(NeverSampler));
        let id = t.start_root("op");
        let ctx = t.context_of(id).unwrap();
        assert!(!ctx.flags.sampled);
    }

    #[test]
    fn events_recorded_against_an_active_span_survive_into_the_completed_snapshot() {
        let t = tracer(Arc::new(AlwaysSampler));
        let id = t.start_root("op");
        t.add_event(id, "cache-miss", HashMap::from([("key".to_string(), "k1".to_string())]))
            .unwrap();
        t.end(id, SpanStatus::Ok, None).unwrap();

        let span = t.completed_snapshot().into_iter().next().unwrap();
        assert_eq!(span.events.len(), 1);
        assert_eq!(span.events[0].name, "cache-miss");
        assert_eq!(span.events[0].attributes.get("key"), Some(&"k1".to_string()));
    }

    #[test]
    fn adding_an_event_to_an_unknown_span_errors() {
        let t = tracer(Arc::new(AlwaysSampler));
        let bogus = SpanId::new();
        assert!(t.add_event(bogus, "noop", HashMap::new()).is_err());
    }

    #[test]
    fn ending_with_an_error_copies_message_and_stack_into_attributes() {
        let t = tracer(Arc::new(AlwaysSampler));
        let id = t.start_root("op");
        t.end(
            id,
            SpanStatus::Error,
            Some(SpanError::new("boom").with_stack("at foo\nat bar")),
        )
        .unwrap();

        let span = t.completed_snapshot().into_iter().next().unwrap();
        assert_eq!(span.status, SpanStatus::Error);
        assert_eq!(span.attributes.get("error.message"), Some(&"boom".to_string()));
        assert_eq!(
            span.attributes.get("error.stack"),
            Some(&"at foo\nat bar".to_string())
        );
    }

    #[test]
    fn composite_sampler_always_traces_matching_names_regardless_of_rate() {
        let sampler = CompositeSampler::new(vec![Regex::new("^checkout\\.").unwrap()], 0.0);
        let decision = sampler.should_sample(&TraceId::new(), "checkout.submit");
        assert_eq!(decision, SamplingDecision::Sample);
    }

    #[test]
    fn composite_sampler_falls_back_to_probability_for_non_matching_names() {
        let sampler = CompositeSampler::new(vec![Regex::new("^checkout\\.").unwrap()], 1.0);
        let decision = sampler.should_sample(&TraceId::new(), "background.sweep");
        assert_eq!(decision, SamplingDecision::Sample);

        let sampler = CompositeSampler::new(vec![Regex::new("^checkout\\.").unwrap()], 0.0);
        let decision = sampler.should_sample(&TraceId::new(), "background.sweep");
        assert_eq!(decision, SamplingDecision::Drop);
    }
}
