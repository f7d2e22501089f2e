//! The orchestration supervisor: expands campaigns into child operations and
//! tracks their aggregate progress.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use stratus_core::events::OrchestrationFinished;
use stratus_core::{
    ChildCounters, Operation, OperationFilter, OperationState, Orchestration, OrchestrationKind,
    OrchestrationState, RuntimeRef, RuntimeResolver,
};
use stratus_storage::{OperationStore, OrchestrationStore};

use crate::bus::EventBus;
use crate::error::EngineError;
use crate::queue::{Executor, ProcessingQueue};

/// How often an in-progress campaign is re-examined.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(60);

/// Builds the child operation for one resolved runtime.
pub trait ChildOperationFactory: Send + Sync + 'static {
    fn create(&self, orchestration: &Orchestration, runtime: &RuntimeRef) -> Operation;
}

impl<F> ChildOperationFactory for F
where
    F: Fn(&Orchestration, &RuntimeRef) -> Operation + Send + Sync + 'static,
{
    fn create(&self, orchestration: &Orchestration, runtime: &RuntimeRef) -> Operation {
        self(orchestration, runtime)
    }
}

/// Coordinates one kind of fleet-wide campaign.
///
/// The supervisor itself runs behind a [`ProcessingQueue`]; each `process`
/// call is a single tick that either advances the campaign or asks to be
/// polled again after [`DEFAULT_POLLING_INTERVAL`].
pub struct OrchestrationSupervisor {
    kind: OrchestrationKind,
    orchestrations: Arc<dyn OrchestrationStore>,
    operations: Arc<dyn OperationStore>,
    resolver: Arc<dyn RuntimeResolver>,
    factory: Arc<dyn ChildOperationFactory>,
    operation_queue: Arc<ProcessingQueue>,
    bus: EventBus,
    polling_interval: Duration,
}

impl OrchestrationSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: OrchestrationKind,
        orchestrations: Arc<dyn OrchestrationStore>,
        operations: Arc<dyn OperationStore>,
        resolver: Arc<dyn RuntimeResolver>,
        factory: Arc<dyn ChildOperationFactory>,
        operation_queue: Arc<ProcessingQueue>,
        bus: EventBus,
    ) -> Self {
        Self {
            kind,
            orchestrations,
            operations,
            resolver,
            factory,
            operation_queue,
            bus,
            polling_interval: DEFAULT_POLLING_INTERVAL,
        }
    }

    pub fn with_polling_interval(mut self, polling_interval: Duration) -> Self {
        self.polling_interval = polling_interval;
        self
    }

    #[instrument(skip(self), fields(kind = %self.kind))]
    pub async fn process(&self, orchestration_id: Uuid) -> Result<Option<Duration>, EngineError> {
        let orchestration = self.orchestrations.get(orchestration_id).await?;

        if orchestration.state.is_terminal() {
            debug!(state = %orchestration.state, "orchestration already settled");
            return Ok(None);
        }

        match orchestration.state {
            OrchestrationState::Pending => self.start(orchestration).await,
            OrchestrationState::Canceling => self.cancel_tick(orchestration).await,
            OrchestrationState::InProgress | OrchestrationState::Retrying => {
                self.progress_tick(orchestration).await
            }
            // Terminal states are handled above.
            _ => Ok(None),
        }
    }

    /// Resolve targets and create the child operations.
    async fn start(
        &self,
        mut orchestration: Orchestration,
    ) -> Result<Option<Duration>, EngineError> {
        let runtimes = match self
            .resolver
            .resolve(&orchestration.parameters.targets)
            .await
        {
            Ok(runtimes) => runtimes,
            Err(error) => {
                warn!(%error, "target resolution failed");
                orchestration.state = OrchestrationState::Failed;
                orchestration.description = format!("target resolution failed: {error}");
                orchestration.updated_at = Utc::now();
                self.persist_terminal(orchestration).await?;
                return Ok(None);
            }
        };

        // A crash between child creation and the state transition must not
        // duplicate children on replay; instances that already have a child
        // are skipped.
        let existing = self
            .operations
            .list_by_orchestration(orchestration.id, OperationFilter::default())
            .await?;
        let known: Vec<&str> = existing
            .operations
            .iter()
            .map(|op| op.instance_id.as_str())
            .collect();

        let mut created = existing.total;
        for runtime in &runtimes {
            if known.contains(&runtime.instance_id.as_str()) {
                continue;
            }
            let child = self.factory.create(&orchestration, runtime);
            self.operations.insert(child).await?;
            created += 1;
        }

        info!(
            targets = runtimes.len(),
            children = created,
            "orchestration started"
        );

        orchestration.counters = ChildCounters {
            pending: created,
            ..ChildCounters::default()
        };
        orchestration.state = OrchestrationState::InProgress;
        orchestration.description = format!("{created} child operations created");
        orchestration.updated_at = Utc::now();

        match self.orchestrations.update(orchestration).await {
            Ok(_) => Ok(Some(Duration::ZERO)),
            Err(e) if e.is_conflict() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Cancel children that have not started; wait out the rest.
    async fn cancel_tick(
        &self,
        mut orchestration: Orchestration,
    ) -> Result<Option<Duration>, EngineError> {
        let page = self
            .operations
            .list_by_orchestration(orchestration.id, OperationFilter::default())
            .await?;

        for child in &page.operations {
            if child.state != OperationState::Pending {
                continue;
            }
            let mut child = child.clone();
            child.state = OperationState::Canceled;
            child.description = "canceled by orchestration".to_string();
            let now = Utc::now();
            child.updated_at = now;
            child.finished_at = Some(now);
            match self.operations.update(child).await {
                Ok(_) => {}
                // A worker already holds this child; it settles on its own.
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e.into()),
            }
        }

        let page = self
            .operations
            .list_by_orchestration(orchestration.id, OperationFilter::default())
            .await?;
        orchestration.counters = tally(&page.operations);
        orchestration.updated_at = Utc::now();

        if orchestration.counters.in_progress == 0 {
            orchestration.state = OrchestrationState::Canceled;
            orchestration.description = "orchestration canceled".to_string();
            self.persist_terminal(orchestration).await?;
            return Ok(None);
        }

        info!(
            in_progress = orchestration.counters.in_progress,
            "waiting for in-flight children before canceling"
        );
        match self.orchestrations.update(orchestration).await {
            Ok(_) => Ok(Some(self.polling_interval)),
            Err(e) if e.is_conflict() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Refresh counters, admit the next wave, derive terminal state.
    async fn progress_tick(
        &self,
        mut orchestration: Orchestration,
    ) -> Result<Option<Duration>, EngineError> {
        let page = self
            .operations
            .list_by_orchestration(orchestration.id, OperationFilter::default())
            .await?;

        orchestration.counters = tally(&page.operations);
        orchestration.updated_at = Utc::now();

        if orchestration.counters.settled() {
            orchestration.state = if orchestration.counters.failed > 0 {
                OrchestrationState::Failed
            } else {
                OrchestrationState::Succeeded
            };
            orchestration.description = format!(
                "{} succeeded, {} failed, {} canceled",
                orchestration.counters.succeeded,
                orchestration.counters.failed,
                orchestration.counters.canceled
            );
            self.persist_terminal(orchestration).await?;
            return Ok(None);
        }

        self.admit(&orchestration, &page.operations);

        match self.orchestrations.update(orchestration).await {
            Ok(_) => Ok(Some(self.polling_interval)),
            Err(e) if e.is_conflict() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Release pending children up to the strategy's parallelism, honoring
    /// the schedule window. Children already queued count against the wave.
    fn admit(&self, orchestration: &Orchestration, children: &[Operation]) {
        let strategy = &orchestration.parameters.strategy;
        if let Some(schedule) = &strategy.schedule {
            if !schedule.is_open(Utc::now()) {
                debug!("outside schedule window; not admitting children");
                return;
            }
        }

        let parallelism = strategy.parallelism.max(1);
        let in_flight = children
            .iter()
            .filter(|child| {
                child.state == OperationState::InProgress
                    || (child.state == OperationState::Pending
                        && self.operation_queue.is_enqueued(child.id))
            })
            .count();
        let capacity = parallelism.saturating_sub(in_flight);
        if capacity == 0 {
            return;
        }

        let mut admitted = 0;
        for child in children {
            if admitted >= capacity {
                break;
            }
            if child.state == OperationState::Pending
                && !self.operation_queue.is_enqueued(child.id)
                && self.operation_queue.add(child.id)
            {
                admitted += 1;
            }
        }
        if admitted > 0 {
            info!(admitted, "admitted children");
        }
    }

    async fn persist_terminal(&self, orchestration: Orchestration) -> Result<(), EngineError> {
        let id = orchestration.id;
        let state = orchestration.state;
        match self.orchestrations.update(orchestration).await {
            Ok(_) => {
                info!(orchestration_id = %id, %state, "orchestration finished");
                self.bus.publish(OrchestrationFinished {
                    orchestration_id: id,
                    kind: self.kind,
                    state,
                });
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                debug!("lost terminal update to another worker");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn tally(children: &[Operation]) -> ChildCounters {
    let mut counters = ChildCounters::default();
    for child in children {
        match child.state {
            OperationState::Pending => counters.pending += 1,
            OperationState::InProgress => counters.in_progress += 1,
            OperationState::Succeeded => counters.succeeded += 1,
            OperationState::Failed => counters.failed += 1,
            OperationState::Canceled => counters.canceled += 1,
        }
    }
    counters
}

#[async_trait]
impl Executor for OrchestrationSupervisor {
    async fn execute(&self, id: Uuid) -> Result<Option<Duration>, EngineError> {
        self.process(id).await
    }
}
