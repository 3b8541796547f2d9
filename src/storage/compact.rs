//! Background compaction of the backend's history.
//!
//! Several stores (possibly in several processes) may share one backend, and
//! each runs a compactor. They coordinate through a well-known key: a cycle
//! only compacts if it wins a compare-and-swap on that key's version, so each
//! interval compacts at most once cluster-wide.
//!
//! Each successful cycle compacts to the revision observed in the previous
//! cycle, which leaves every client a full interval to finish paginated lists
//! and re-establish watches.

use crate::backend::{
    compare_version, first_range_response, header_revision, op_get, op_put, txn, BackendResult,
    KvBackend,
};
use crate::etcdserverpb::compare::CompareResult;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Key whose version counts completed compaction cycles.
pub const COMPACT_REV_KEY: &str = "compact_rev_key";

/// Progress carried from one compaction cycle to the next.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompactState {
    /// Version of [`COMPACT_REV_KEY`] this compactor last saw.
    pub time: i64,
    /// Backend revision observed at the last cycle.
    pub revision: i64,
}

/// Periodically compacts a shared backend.
pub struct Compactor {
    backend: Arc<dyn KvBackend>,
    interval: Duration,
}

impl Compactor {
    pub fn new(backend: Arc<dyn KvBackend>, interval: Duration) -> Self {
        Self { backend, interval }
    }

    /// Spawns the compaction loop. It stops when `cancel` fires.
    ///
    /// A zero interval disables compaction and returns `None`.
    pub fn run(self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if self.interval.is_zero() {
            info!("Compaction disabled");
            return None;
        }
        Some(tokio::spawn(async move {
            self.run_periodic(cancel).await;
        }))
    }

    async fn run_periodic(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);
        // The first tick fires immediately; compaction starts one interval in.
        ticker.tick().await;
        info!(interval = ?self.interval, "Starting periodic compactor");

        let mut state = CompactState::default();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.compact_once(state).await {
                Ok(next) => state = next,
                Err(e) => warn!(error = %e, "Compaction failed"),
            }
        }
        debug!("Compactor stopped");
    }

    /// Runs one coordinated compaction cycle.
    ///
    /// If another compactor already advanced [`COMPACT_REV_KEY`] past
    /// `state.time`, this cycle only catches up on the counter. Otherwise it
    /// claims the cycle and compacts to `state.revision`. Nothing is compacted
    /// on the very first cycle.
    pub async fn compact_once(&self, state: CompactState) -> BackendResult<CompactState> {
        let key = COMPACT_REV_KEY.as_bytes();
        let req = txn(
            vec![compare_version(key, CompareResult::Equal, state.time)],
            vec![op_put(key, state.revision.to_string().into_bytes(), 0)],
            vec![op_get(key)],
        );
        let resp = self.backend.txn(req).await?;
        let current_revision = header_revision(&resp.header);

        if !resp.succeeded {
            let time = first_range_response(&resp)
                .and_then(|r| r.kvs.first())
                .map_or(0, |kv| kv.version);
            debug!(time, "Compaction cycle claimed elsewhere");
            return Ok(CompactState {
                time,
                revision: current_revision,
            });
        }

        let next = CompactState {
            time: state.time + 1,
            revision: current_revision,
        };
        if state.revision == 0 {
            return Ok(next);
        }

        self.backend.compact(state.revision).await?;
        info!(revision = state.revision, "Compacted backend");
        Ok(next)
    }
}
