//! Metrics instrumentation for binder-dns.
//!
//! All metrics are prefixed with `binder.`

use hickory_proto::op::ResponseCode;
use metrics::{counter, gauge, histogram};
use std::time::Instant;

/// Record an answered DNS query.
pub fn record_query(record_type: &str, rcode: ResponseCode, duration: std::time::Duration) {
    counter!("binder.query.count", "type" => record_type.to_string(), "rcode" => rcode_label(rcode))
        .increment(1);
    histogram!("binder.query.duration.seconds", "type" => record_type.to_string())
        .record(duration.as_secs_f64());
}

fn rcode_label(rcode: ResponseCode) -> &'static str {
    match rcode {
        ResponseCode::NoError => "noerror",
        ResponseCode::FormErr => "formerr",
        ResponseCode::ServFail => "servfail",
        ResponseCode::NXDomain => "nxdomain",
        ResponseCode::NotImp => "notimp",
        ResponseCode::Refused => "refused",
        _ => "other",
    }
}

/// Record the number of answers returned for a query.
pub fn record_answers_returned(count: usize) {
    histogram!("binder.query.answers").record(count as f64);
}

/// Record a directory event applied to the tree.
pub fn record_tree_event(kind: &'static str) {
    counter!("binder.tree.event.count", "event" => kind).increment(1);
}

/// Record a payload that could not be parsed at all.
pub fn record_malformed_payload() {
    counter!("binder.tree.malformed_payload.count").increment(1);
}

/// Record a directory session transition.
pub fn record_session(transition: SessionTransition) {
    let transition_str = match transition {
        SessionTransition::Established => "established",
        SessionTransition::Lost => "lost",
        SessionTransition::ConnectFailed => "connect_failed",
    };

    counter!("binder.directory.session.count", "transition" => transition_str).increment(1);
}

/// Directory session transitions.
#[derive(Debug, Clone, Copy)]
pub enum SessionTransition {
    /// A session was established.
    Established,
    /// An established session was lost.
    Lost,
    /// A connection attempt failed.
    ConnectFailed,
}

/// Record tree state (call periodically or on change).
pub fn record_tree_state(nodes: usize, reverse_entries: usize, ready: bool) {
    gauge!("binder.tree.nodes").set(nodes as f64);
    gauge!("binder.tree.reverse_entries").set(reverse_entries as f64);
    gauge!("binder.tree.ready").set(if ready { 1.0 } else { 0.0 });
}

/// Record a recursion attempt.
pub fn record_recursion(path: RecursionPath, outcome: RecursionOutcome) {
    let path_str = match path {
        RecursionPath::Forward => "forward",
        RecursionPath::Reverse => "reverse",
    };
    let outcome_str = match outcome {
        RecursionOutcome::Answered => "answered",
        RecursionOutcome::Empty => "empty",
        RecursionOutcome::NoCandidates => "no_candidates",
        RecursionOutcome::Timeout => "timeout",
        RecursionOutcome::Error => "error",
    };

    counter!("binder.recursion.count", "path" => path_str, "outcome" => outcome_str).increment(1);
}

/// Which recursion path served a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecursionPath {
    /// Forward lookup scoped to one datacenter.
    Forward,
    /// PTR fan-out across every datacenter.
    Reverse,
}

/// Result of a recursion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecursionOutcome {
    /// An upstream returned records.
    Answered,
    /// Upstreams answered with nothing usable.
    Empty,
    /// No upstream was eligible.
    NoCandidates,
    /// The per-request deadline passed.
    Timeout,
    /// Transport or protocol failure.
    Error,
}

/// Record a resolver map refresh.
pub fn record_resolver_refresh(success: bool, datacenters: usize, resolvers: usize) {
    let result = if success { "success" } else { "error" };
    counter!("binder.recursion.refresh.count", "result" => result).increment(1);
    if success {
        gauge!("binder.recursion.datacenters").set(datacenters as f64);
        gauge!("binder.recursion.resolvers").set(resolvers as f64);
    }
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
