//! Durable step-pipeline engine and orchestration supervisor.
//!
//! The engine drives a single [`Operation`](stratus_core::Operation) through
//! a weight-ordered pipeline of idempotent [`Step`]s, persisting after every
//! step so a process restart resumes from the first incomplete step. Fleet
//! campaigns are expanded and tracked by the [`OrchestrationSupervisor`];
//! both it and the [`OperationManager`] run behind [`ProcessingQueue`] worker
//! pools.
//!
//! ```text
//! boundary ──insert──▶ store ──add(id)──▶ ProcessingQueue
//!                                              │ worker
//!                                              ▼
//!                                       OperationManager ──▶ Step pipeline
//!                                              │ persist per step
//!                                              ▼
//!                                            store
//! ```

pub mod bus;
pub mod error;
pub mod manager;
pub mod queue;
pub mod recovery;
pub mod registry;
pub mod step;
pub mod supervisor;

pub use bus::EventBus;
pub use error::EngineError;
pub use manager::{OperationManager, DEFAULT_OPERATION_TIMEOUT};
pub use queue::{Executor, ProcessingQueue};
pub use recovery::RecoveryLoader;
pub use registry::{StepDescriptor, StepRegistry};
pub use step::{EnableForPlan, SkipForPlan, Step, StepError, StepResult};
pub use supervisor::{ChildOperationFactory, OrchestrationSupervisor, DEFAULT_POLLING_INTERVAL};
