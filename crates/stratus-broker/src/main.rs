// stratus broker entry point.
// Wiring order matters: configuration and telemetry first, then the status
// server so probes see the process early, then storage, queues, and the
// recovery loader, and only then the public HTTP surface.

mod api;
mod clients;
mod config;
mod health;
mod metrics;
mod pipelines;
mod steps;
mod telemetry;

use std::sync::Arc;

use anyhow::Context;
use tower_http::trace::TraceLayer;
use tracing::info;

use stratus_core::{
    Operation, OperationKind, Orchestration, OrchestrationKind, RuntimeRef, RuntimeResolver,
};
use stratus_engine::{
    ChildOperationFactory, EventBus, OperationManager, OrchestrationSupervisor, ProcessingQueue,
    RecoveryLoader, StepRegistry,
};
use stratus_storage::{InMemoryStore, OperationStore, OrchestrationStore, PostgresStore};

use crate::api::ApiState;
use crate::clients::{
    CatalogRuntimeResolver, HttpAccountProvider, HttpEvaluationClient, HttpProvisionerClient,
};
use crate::config::Config;
use crate::pipelines::PipelineDeps;

fn operation_queue(
    kind: OperationKind,
    name: &str,
    registry: StepRegistry,
    config: &Config,
    operations: Arc<dyn OperationStore>,
    bus: EventBus,
) -> Arc<ProcessingQueue> {
    let manager = Arc::new(
        OperationManager::new(kind, operations, bus, registry)
            .with_timeout(config.operation_timeout),
    );
    Arc::new(ProcessingQueue::new(
        name,
        manager,
        config.workers_per_queue,
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("loading configuration")?;
    telemetry::init_tracing(config.log_level.as_deref());
    let metrics_handle = metrics::init_metrics();

    info!(version = env!("CARGO_PKG_VERSION"), "starting stratus broker");

    // Health probes come up before anything that can take a while.
    let status_listener =
        tokio::net::TcpListener::bind((config.host.as_str(), config.status_port))
            .await
            .with_context(|| format!("binding status port {}", config.status_port))?;
    info!(port = config.status_port, "status server listening");
    tokio::spawn(async move {
        if let Err(error) = axum::serve(status_listener, health::router()).await {
            tracing::error!(%error, "status server terminated");
        }
    });

    let (operations, orchestrations): (Arc<dyn OperationStore>, Arc<dyn OrchestrationStore>) =
        if config.db_in_memory {
            info!("using in-memory storage");
            let store = Arc::new(InMemoryStore::new());
            (store.clone(), store)
        } else {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required unless APP_DB_IN_MEMORY=true")?;
            let store = Arc::new(
                PostgresStore::connect(url)
                    .await
                    .context("connecting to the database")?,
            );
            info!("connected to the database");
            (store.clone(), store)
        };

    let bus = EventBus::new();
    metrics::register_event_subscribers(&bus);

    let http = reqwest::Client::new();
    let deps = PipelineDeps {
        provisioner: Arc::new(HttpProvisionerClient::new(
            config.provisioner_url.clone(),
            http.clone(),
        )),
        evaluations: Arc::new(HttpEvaluationClient::new(
            config.evaluator_url.clone(),
            http.clone(),
        )),
        accounts: Arc::new(HttpAccountProvider::new(
            config.accounts_url.clone(),
            http.clone(),
        )),
    };

    // One manager and queue per operation kind, isolating provisioning from
    // deprovisioning and upgrade traffic.
    let provision_queue = operation_queue(
        OperationKind::Provision,
        "provisioning",
        pipelines::provisioning_registry(&config, &deps),
        &config,
        operations.clone(),
        bus.clone(),
    );
    let deprovision_queue = operation_queue(
        OperationKind::Deprovision,
        "deprovisioning",
        pipelines::deprovisioning_registry(&deps),
        &config,
        operations.clone(),
        bus.clone(),
    );
    let upgrade_runtime_ops_queue = operation_queue(
        OperationKind::UpgradeRuntime,
        "upgrade-runtime",
        pipelines::upgrade_runtime_registry(&deps),
        &config,
        operations.clone(),
        bus.clone(),
    );
    let upgrade_cluster_ops_queue = operation_queue(
        OperationKind::UpgradeCluster,
        "upgrade-cluster",
        pipelines::upgrade_cluster_registry(&deps),
        &config,
        operations.clone(),
        bus.clone(),
    );
    let update_queue = config.update_processing_enabled.then(|| {
        operation_queue(
            OperationKind::Update,
            "update",
            pipelines::update_registry(&deps),
            &config,
            operations.clone(),
            bus.clone(),
        )
    });

    let resolver: Arc<dyn RuntimeResolver> = Arc::new(CatalogRuntimeResolver::new(
        config.resolver_url.clone(),
        http,
    ));

    let default_version = config.runtime_version.clone();
    let runtime_factory: Arc<dyn ChildOperationFactory> = Arc::new(
        move |orchestration: &Orchestration, runtime: &RuntimeRef| -> Operation {
            let target_version = orchestration
                .parameters
                .target_version
                .clone()
                .unwrap_or_else(|| default_version.clone());
            Operation::new_upgrade_runtime(orchestration.id, runtime.clone(), target_version)
        },
    );
    let cluster_factory: Arc<dyn ChildOperationFactory> = Arc::new(
        |orchestration: &Orchestration, runtime: &RuntimeRef| -> Operation {
            Operation::new_upgrade_cluster(orchestration.id, runtime.clone())
        },
    );

    let upgrade_runtime_supervisor = Arc::new(
        OrchestrationSupervisor::new(
            OrchestrationKind::UpgradeRuntime,
            orchestrations.clone(),
            operations.clone(),
            resolver.clone(),
            runtime_factory,
            upgrade_runtime_ops_queue.clone(),
            bus.clone(),
        )
        .with_polling_interval(config.polling_interval),
    );
    let upgrade_runtime_queue = Arc::new(ProcessingQueue::new(
        "upgrade-runtime-orchestrations",
        upgrade_runtime_supervisor,
        config.orchestration_workers,
    ));

    let upgrade_cluster_supervisor = Arc::new(
        OrchestrationSupervisor::new(
            OrchestrationKind::UpgradeCluster,
            orchestrations.clone(),
            operations.clone(),
            resolver,
            cluster_factory,
            upgrade_cluster_ops_queue.clone(),
            bus.clone(),
        )
        .with_polling_interval(config.polling_interval),
    );
    let upgrade_cluster_queue = Arc::new(ProcessingQueue::new(
        "upgrade-cluster-orchestrations",
        upgrade_cluster_supervisor,
        config.orchestration_workers,
    ));

    if config.disable_process_operations_in_progress {
        info!("skipping in-progress operation processing at startup");
    } else {
        let loader = RecoveryLoader::new(operations.clone(), orchestrations.clone());
        loader
            .resume_operations(OperationKind::Provision, &provision_queue)
            .await
            .context("resuming provisioning operations")?;
        loader
            .resume_operations(OperationKind::Deprovision, &deprovision_queue)
            .await
            .context("resuming deprovisioning operations")?;
        loader
            .resume_operations(OperationKind::UpgradeRuntime, &upgrade_runtime_ops_queue)
            .await
            .context("resuming upgrade-runtime operations")?;
        loader
            .resume_operations(OperationKind::UpgradeCluster, &upgrade_cluster_ops_queue)
            .await
            .context("resuming upgrade-cluster operations")?;
        if let Some(queue) = &update_queue {
            loader
                .resume_operations(OperationKind::Update, queue)
                .await
                .context("resuming update operations")?;
        }
        loader
            .resume_orchestrations(OrchestrationKind::UpgradeRuntime, &upgrade_runtime_queue)
            .await
            .context("resuming upgrade-runtime orchestrations")?;
        loader
            .resume_orchestrations(OrchestrationKind::UpgradeCluster, &upgrade_cluster_queue)
            .await
            .context("resuming upgrade-cluster orchestrations")?;
    }

    let state = ApiState {
        operations,
        orchestrations,
        provision_queue: provision_queue.clone(),
        deprovision_queue: deprovision_queue.clone(),
        update_queue: update_queue.clone(),
        upgrade_runtime_queue: upgrade_runtime_queue.clone(),
        upgrade_cluster_queue: upgrade_cluster_queue.clone(),
        development_mode: config.development_mode,
        metrics: Some(metrics_handle),
    };
    let app = api::router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("binding broker port {}", config.port))?;
    info!(port = config.port, "broker listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("draining queues");
    for queue in [
        &provision_queue,
        &deprovision_queue,
        &upgrade_runtime_ops_queue,
        &upgrade_cluster_ops_queue,
        &upgrade_runtime_queue,
        &upgrade_cluster_queue,
    ] {
        queue.shutdown().await;
    }
    if let Some(queue) = &update_queue {
        queue.shutdown().await;
    }

    info!("stratus broker stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
