//! Engine counters, registered with the runtime metrics context.

use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
};

/// Label for per-cause drop counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DropCause {
    pub cause: String,
}

impl DropCause {
    pub fn new(cause: &'static str) -> Self {
        Self {
            cause: cause.into(),
        }
    }
}

/// Metrics for one session engine.
#[derive(Clone)]
pub struct Metrics {
    /// Control records sent (first transmissions).
    pub control_sent: Counter,
    /// Control records received and accepted by the reliable layer.
    pub control_received: Counter,
    /// Control record retransmissions.
    pub retransmits: Counter,
    /// Data packets encrypted and emitted.
    pub data_sent: Counter,
    /// Data packets decrypted and delivered.
    pub data_received: Counter,
    /// Inbound packets dropped, by cause.
    pub drops: Family<DropCause, Counter>,
    /// Completed key negotiations (initial and renegotiated).
    pub negotiations: Counter,
    /// Keepalive pings sent.
    pub pings_sent: Counter,
}

impl Metrics {
    /// Create and register a new set of metrics.
    pub fn init(context: &impl RuntimeMetrics) -> Self {
        let metrics = Self {
            control_sent: Counter::default(),
            control_received: Counter::default(),
            retransmits: Counter::default(),
            data_sent: Counter::default(),
            data_received: Counter::default(),
            drops: Family::default(),
            negotiations: Counter::default(),
            pings_sent: Counter::default(),
        };
        context.register(
            "control_sent",
            "Control records sent (first transmissions)",
            metrics.control_sent.clone(),
        );
        context.register(
            "control_received",
            "Control records received and accepted",
            metrics.control_received.clone(),
        );
        context.register(
            "retransmits",
            "Control record retransmissions",
            metrics.retransmits.clone(),
        );
        context.register(
            "data_sent",
            "Data packets encrypted and emitted",
            metrics.data_sent.clone(),
        );
        context.register(
            "data_received",
            "Data packets decrypted and delivered",
            metrics.data_received.clone(),
        );
        context.register("drops", "Inbound packets dropped by cause", metrics.drops.clone());
        context.register(
            "negotiations",
            "Completed key negotiations",
            metrics.negotiations.clone(),
        );
        context.register("pings_sent", "Keepalive pings sent", metrics.pings_sent.clone());
        metrics
    }
}
