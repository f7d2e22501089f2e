use stratus_core::runtime::ResolveError;
use stratus_storage::StoreError;

/// Errors surfaced by the engine to queue workers.
///
/// A worker that receives one of these logs it and drops the operation id;
/// the id comes back via the recovery loader or a later enqueue.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Target resolution error
    #[error("resolver error: {0}")]
    Resolver(#[from] ResolveError),
}
