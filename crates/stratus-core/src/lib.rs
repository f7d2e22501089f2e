//! Domain model for the stratus service broker.
//!
//! This crate holds the records the broker persists and reasons about:
//! [`Operation`] (a single durable lifecycle action on one instance) and
//! [`Orchestration`] (a fleet-wide campaign producing many child operations),
//! plus the supporting types shared by the engine, the stores, and the HTTP
//! boundary.

pub mod events;
pub mod filter;
pub mod operation;
pub mod orchestration;
pub mod plan;
pub mod runtime;

pub use filter::{OperationFilter, OrchestrationFilter};
pub use operation::{
    CredentialsRef, Operation, OperationKind, OperationPayload, OperationState,
    ProvisioningParameters,
};
pub use orchestration::{
    ChildCounters, Orchestration, OrchestrationKind, OrchestrationParameters, OrchestrationState,
    ScheduleWindow, StrategySpec, TargetSelector,
};
pub use plan::PlanId;
pub use runtime::{ResolveError, RuntimeRef, RuntimeResolver};
