//! Persistence collaborator for audit mirroring
//!
//! The tracker is the in-memory source of truth; an injected `SnapshotStore`
//! may mirror terminal records for audit trails. Tracking never depends on
//! its availability: a failed or slow store surfaces as a warning to the
//! `update_state` caller, not an error.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::record::ExecutionRecord;

/// Bound on a single snapshot write
pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_millis(500);

/// Injected mirror for terminal execution records
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn store(&self, record: &ExecutionRecord) -> anyhow::Result<()>;
}

/// Snapshot store that discards everything
pub struct NullSnapshotStore;

#[async_trait]
impl SnapshotStore for NullSnapshotStore {
    async fn store(&self, _record: &ExecutionRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Mirror a terminal record, bounded and best-effort
///
/// Returns whether the snapshot was persisted; callers surface `false` as a
/// warning, never as a failure of the state transition itself.
pub(crate) async fn mirror(store: &dyn SnapshotStore, record: &ExecutionRecord) -> bool {
    match tokio::time::timeout(SNAPSHOT_TIMEOUT, store.store(record)).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            warn!(
                execution_id = %record.execution_id,
                error = %err,
                "Snapshot store failed, tracking continues in-memory"
            );
            false
        }
        Err(_) => {
            warn!(
                execution_id = %record.execution_id,
                timeout_ms = SNAPSHOT_TIMEOUT.as_millis() as u64,
                "Snapshot store too slow, tracking continues in-memory"
            );
            false
        }
    }
}
