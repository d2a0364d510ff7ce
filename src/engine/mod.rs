mod conflict;
mod error;
mod mutations;
mod policy;
mod queries;
mod store;
#[cfg(test)]
mod tests;

pub use error::{EngineError, PolicyViolation, StoreError};
pub use policy::BookingPolicy;
pub use store::{ReservationStore, WalStore};

use std::path::PathBuf;
use std::sync::Arc;

/// The reservation engine. Holds no mutable state of its own: policy is
/// fixed at startup and every reservation lives in the store, so one engine
/// can serve any number of concurrent callers.
pub struct Engine {
    policy: BookingPolicy,
    store: Arc<dyn ReservationStore>,
}

impl Engine {
    pub fn new(policy: BookingPolicy, store: Arc<dyn ReservationStore>) -> Self {
        Self { policy, store }
    }

    /// Engine over a WAL-backed store at `wal_path`. Returns the store too so
    /// the caller can drive compaction.
    pub fn open(policy: BookingPolicy, wal_path: PathBuf) -> std::io::Result<(Self, Arc<WalStore>)> {
        let store = Arc::new(WalStore::open(wal_path)?);
        Ok((Self::new(policy, store.clone()), store))
    }

    pub fn policy(&self) -> &BookingPolicy {
        &self.policy
    }
}

/// Count and log a rejected request, then hand the error back.
fn rejected(op: &'static str, e: EngineError) -> EngineError {
    metrics::counter!(
        crate::observability::RESERVATIONS_REJECTED_TOTAL,
        "op" => op,
        "reason" => e.kind()
    )
    .increment(1);
    match &e {
        EngineError::StoreUnavailable(_) => tracing::error!("{op} failed: {e}"),
        _ => tracing::debug!("{op} rejected: {e}"),
    }
    e
}
