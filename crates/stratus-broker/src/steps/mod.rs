//! Step implementations wired into the pipelines.
//!
//! Every step checks the operation's payload before repeating an external
//! side effect and records what it did back into the payload, so a crashed
//! and replayed invocation converges instead of duplicating work.

pub mod deprovisioning;
pub mod init;
pub mod provisioning;
pub mod update;
pub mod upgrade;

use std::time::Duration;

use tracing::debug;

use stratus_core::Operation;
use stratus_engine::StepResult;

use crate::clients::{ClientError, ProvisionerClient, ProvisionerStatus};

/// How long a step waits before retrying an unavailable external service.
pub(crate) const RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// How often a step polls a long-running provisioner operation.
pub(crate) const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Map a client error to the step outcome it implies.
pub(crate) fn client_failure(
    operation: Operation,
    error: ClientError,
    retry_after: Duration,
) -> StepResult {
    if error.is_transient() {
        debug!(%error, "external service unavailable; retrying");
        StepResult::retry(operation, retry_after)
    } else {
        StepResult::failed(operation, error.to_string())
    }
}

/// Poll a provisioner-side operation until it settles.
pub(crate) async fn poll_provisioner(
    provisioner: &dyn ProvisionerClient,
    provisioner_operation_id: &str,
    operation: Operation,
    check_interval: Duration,
    what: &str,
) -> StepResult {
    match provisioner.operation_status(provisioner_operation_id).await {
        Ok(ProvisionerStatus::InProgress) => StepResult::retry(operation, check_interval),
        Ok(ProvisionerStatus::Succeeded) => StepResult::Completed(operation),
        Ok(ProvisionerStatus::Failed { message }) => {
            StepResult::failed(operation, format!("{what} failed: {message}"))
        }
        Err(error) => client_failure(operation, error, check_interval),
    }
}
