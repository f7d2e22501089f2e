use std::sync::OnceLock;

use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use stratus_core::events::{OperationFinished, OrchestrationFinished, StepOutcome, StepProcessed};
use stratus_engine::EventBus;

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: step invocations by kind and outcome.
    pub const STEPS_PROCESSED_TOTAL: &str = "stratus_steps_processed_total";
    /// Counter: operations reaching a terminal state, by kind and state.
    pub const OPERATIONS_FINISHED_TOTAL: &str = "stratus_operations_finished_total";
    /// Counter: orchestrations reaching a terminal state, by kind and state.
    pub const ORCHESTRATIONS_FINISHED_TOTAL: &str = "stratus_orchestrations_finished_total";
}

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder.
///
/// Safe to call multiple times; subsequent calls return the existing handle.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install prometheus recorder");

            describe_counter!(
                names::STEPS_PROCESSED_TOTAL,
                "Step invocations by kind and outcome"
            );
            describe_counter!(
                names::OPERATIONS_FINISHED_TOTAL,
                "Operations reaching a terminal state"
            );
            describe_counter!(
                names::ORCHESTRATIONS_FINISHED_TOTAL,
                "Orchestrations reaching a terminal state"
            );

            tracing::info!("prometheus metrics recorder initialized");
            handle
        })
        .clone()
}

/// The global handle, if [`init_metrics`] ran.
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

/// Wire the counters to the engine's state-transition events.
pub fn register_event_subscribers(bus: &EventBus) {
    bus.subscribe::<StepProcessed, _>(|event| {
        let outcome = match event.outcome {
            StepOutcome::Completed => "completed",
            StepOutcome::Retried(_) => "retried",
            StepOutcome::Failed => "failed",
        };
        counter!(
            names::STEPS_PROCESSED_TOTAL,
            "kind" => event.kind.as_str(),
            "outcome" => outcome,
        )
        .increment(1);
    });

    bus.subscribe::<OperationFinished, _>(|event| {
        counter!(
            names::OPERATIONS_FINISHED_TOTAL,
            "kind" => event.kind.as_str(),
            "state" => event.state.to_string(),
        )
        .increment(1);
    });

    bus.subscribe::<OrchestrationFinished, _>(|event| {
        counter!(
            names::ORCHESTRATIONS_FINISHED_TOTAL,
            "kind" => event.kind.as_str(),
            "state" => event.state.to_string(),
        )
        .increment(1);
    });
}
