use std::sync::Arc;

use log::{debug, info};

use crate::query::QueryId;
use crate::registry::QueryRegistry;

/// Operator-facing kill. Never fails: unknown, finished and already-killed
/// queries simply report `false`.
#[derive(Clone)]
pub struct KillProcedure {
    registry: Arc<QueryRegistry>,
}

impl KillProcedure {
    pub fn new(registry: Arc<QueryRegistry>) -> Self {
        KillProcedure { registry }
    }

    /// Request cancellation of `query_id`. Returns `true` when this call
    /// was the one that cancelled it.
    pub fn kill(&self, query_id: &QueryId, reason: Option<&str>) -> bool {
        let reason = reason.map(str::trim).filter(|r| !r.is_empty());
        let killed = self.registry.request_cancellation(query_id, reason);
        if killed {
            info!(
                "Kill requested for query {}: {}",
                query_id,
                reason.unwrap_or("no message provided")
            );
        } else {
            debug!("Kill of query {} had no effect", query_id);
        }
        killed
    }
}
