use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::orchestration::TargetSelector;
use crate::plan::PlanId;

/// A concrete managed runtime an operation targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeRef {
    pub runtime_id: String,
    pub instance_id: String,
    pub shoot_name: String,
    pub region: String,
    pub plan: PlanId,
}

/// Errors from target resolution.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("runtime resolver unavailable: {0}")]
    Unavailable(String),

    #[error("invalid target selector: {0}")]
    InvalidSelector(String),
}

/// Resolves a campaign's target selector to a concrete runtime list.
///
/// Implementations may block on external catalog calls. The returned list
/// must be sorted by `runtime_id` so repeated resolution of the same selector
/// is stable.
#[async_trait]
pub trait RuntimeResolver: Send + Sync + 'static {
    async fn resolve(&self, selector: &TargetSelector) -> Result<Vec<RuntimeRef>, ResolveError>;
}
