//! Shared data structures for geotrace.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
    pub city: String,
    pub country: String,
}

/// One node along the path, keyed by its position in the trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Hop {
    pub hop_number: u32,
    pub ip: String,
    pub hostname: String,
    pub latency_ms: u64,
    pub location: Option<Location>,
}

impl Hop {
    pub fn from_fact(fact: HopFact) -> Self {
        Self {
            hop_number: fact.hop_number,
            ip: fact.ip,
            hostname: fact.hostname,
            latency_ms: fact.latency_ms,
            location: None,
        }
    }
}

/// What a single line of traceroute output says about a hop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HopFact {
    pub hop_number: u32,
    pub ip: String,
    pub hostname: String,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

impl TraceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TraceStatus::Completed | TraceStatus::Failed)
    }
}

/// Outward event vocabulary of a trace session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum TraceEvent {
    #[serde(rename = "traceroute-started")]
    Started { target: String },
    #[serde(rename = "hop-discovered")]
    HopDiscovered(Hop),
    #[serde(rename = "hop-location-updated")]
    HopLocationUpdated(Hop),
    #[serde(rename = "trace-error-diagnostic")]
    Diagnostic { text: String },
    #[serde(rename = "traceroute-completed")]
    Completed {
        #[serde(rename = "hopCount")]
        hop_count: usize,
    },
    #[serde(rename = "traceroute-error")]
    Error { error: String },
}

impl TraceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TraceEvent::Started { .. } => "traceroute-started",
            TraceEvent::HopDiscovered(_) => "hop-discovered",
            TraceEvent::HopLocationUpdated(_) => "hop-location-updated",
            TraceEvent::Diagnostic { .. } => "trace-error-diagnostic",
            TraceEvent::Completed { .. } => "traceroute-completed",
            TraceEvent::Error { .. } => "traceroute-error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TraceEvent::Completed { .. } | TraceEvent::Error { .. })
    }
}

/// A session event stamped with its position in the session's stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub seq: u64,
    #[serde(flatten)]
    pub event: TraceEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceRequest {
    #[serde(default)]
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceResponse {
    pub hops: Vec<Hop>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: String,
}
