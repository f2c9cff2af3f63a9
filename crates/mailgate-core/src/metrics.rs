//! Prometheus metrics for the decision engine

use mailgate_common::Decision;
use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Engine counters, registered in a registry owned by this value
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    decisions: IntCounterVec,
    check_duration: Histogram,
    checker_errors: IntCounterVec,
}

impl EngineMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let decisions = IntCounterVec::new(
            Opts::new("mailgate_decisions_total", "Decisions by outcome"),
            &["decision"],
        )?;
        let check_duration = Histogram::with_opts(
            HistogramOpts::new("mailgate_check_duration_seconds", "Time spent in one check")
                .buckets(vec![
                    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
        )?;
        let checker_errors = IntCounterVec::new(
            Opts::new(
                "mailgate_checker_errors_total",
                "Checks that degraded to a temporary or permanent error",
            ),
            &["checker"],
        )?;

        registry.register(Box::new(decisions.clone()))?;
        registry.register(Box::new(check_duration.clone()))?;
        registry.register(Box::new(checker_errors.clone()))?;

        Ok(Self {
            registry,
            decisions,
            check_duration,
            checker_errors,
        })
    }

    pub fn record_decision(&self, decision: Decision, elapsed: Duration) {
        self.decisions.with_label_values(&[decision.as_str()]).inc();
        self.check_duration.observe(elapsed.as_secs_f64());
    }

    pub fn record_checker_error(&self, checker: &str) {
        self.checker_errors.with_label_values(&[checker]).inc();
    }

    pub fn decisions(&self, decision: Decision) -> u64 {
        self.decisions.with_label_values(&[decision.as_str()]).get()
    }

    pub fn checker_errors(&self, checker: &str) -> u64 {
        self.checker_errors.with_label_values(&[checker]).get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition format
    pub fn export(&self) -> String {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}
