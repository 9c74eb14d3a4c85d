//! Prometheus metrics for the autoscaler controllers, recorded through the
//! `metrics` facade and served by `autoscaler_common::metrics`.

use metrics::{counter, histogram};
use std::time::Duration;

/// Per-controller metrics handle. One instance lives in each controller's
/// context and is cheap to clone (just a label).
#[derive(Clone)]
pub struct ControllerMetrics {
    controller: &'static str,
}

impl ControllerMetrics {
    pub fn new(controller: &'static str) -> Self {
        Self { controller }
    }

    pub fn record_reconcile(&self, name: &str, namespace: &str) {
        counter!(
            "autoscaler_reconciles_total",
            "controller" => self.controller,
            "name" => name.to_string(),
            "namespace" => namespace.to_string(),
        )
        .increment(1);
    }

    pub fn record_action(&self, name: &str, namespace: &str, action: &str) {
        counter!(
            "autoscaler_actions_total",
            "controller" => self.controller,
            "name" => name.to_string(),
            "namespace" => namespace.to_string(),
            "action" => action.to_string(),
        )
        .increment(1);
    }

    pub fn observe_read(&self, name: &str, namespace: &str, action: &str, elapsed: Duration) {
        histogram!(
            "autoscaler_reconcile_read_seconds",
            "controller" => self.controller,
            "name" => name.to_string(),
            "namespace" => namespace.to_string(),
            "action" => action.to_string(),
        )
        .record(elapsed.as_secs_f64());
    }

    pub fn observe_write(&self, name: &str, namespace: &str, action: &str, elapsed: Duration) {
        histogram!(
            "autoscaler_reconcile_write_seconds",
            "controller" => self.controller,
            "name" => name.to_string(),
            "namespace" => namespace.to_string(),
            "action" => action.to_string(),
        )
        .record(elapsed.as_secs_f64());
    }

    pub fn record_phase_transition(&self, node_group: &str, from: &str, to: &str) {
        counter!(
            "autoscaler_node_phase_transitions_total",
            "node_group" => node_group.to_string(),
            "from" => from.to_string(),
            "to" => to.to_string(),
        )
        .increment(1);
    }

    pub fn record_scale_decision(&self, node_group: &str, reason: &str) {
        counter!(
            "autoscaler_scale_decisions_total",
            "node_group" => node_group.to_string(),
            "reason" => reason.to_string(),
        )
        .increment(1);
    }

    pub fn record_iaas_call(&self, operation: &str, outcome: &str, elapsed: Duration) {
        counter!(
            "autoscaler_iaas_calls_total",
            "operation" => operation.to_string(),
            "outcome" => outcome.to_string(),
        )
        .increment(1);
        histogram!(
            "autoscaler_iaas_call_seconds",
            "operation" => operation.to_string(),
        )
        .record(elapsed.as_secs_f64());
    }
}
