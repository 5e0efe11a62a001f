//! Process-scoped registry of every query the coordinator knows about.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::config::CoordinatorConfig;
use crate::error::QueryError;
use crate::metrics::QueryMetrics;
use crate::query::{QueryId, QueryInfo, QueryStateMachine};
use crate::state::QueryState;

/// Owns all [`QueryStateMachine`]s. The map lock is only held for map
/// operations; per-query fields are guarded by each query's own lock.
pub struct QueryRegistry {
    queries: RwLock<HashMap<QueryId, Arc<QueryStateMachine>>>,
    max_queries: usize,
    max_query_history: usize,
    min_query_expire_age: Duration,
    metrics: Arc<QueryMetrics>,
}

impl QueryRegistry {
    pub fn new(config: &CoordinatorConfig) -> Self {
        Self::with_metrics(config, Arc::new(QueryMetrics::new()))
    }

    /// Registry that counts its evictions in `metrics`.
    pub fn with_metrics(config: &CoordinatorConfig, metrics: Arc<QueryMetrics>) -> Self {
        QueryRegistry {
            queries: RwLock::new(HashMap::new()),
            max_queries: config.max_queries,
            max_query_history: config.max_query_history,
            min_query_expire_age: config.min_query_expire_age(),
            metrics,
        }
    }

    pub fn register(&self, query: &str) -> Result<QueryId, QueryError> {
        self.register_query(query).map(|q| q.id().clone())
    }

    /// Create a QUEUED query and start tracking it.
    pub fn register_query(&self, query: &str) -> Result<Arc<QueryStateMachine>, QueryError> {
        if self.len() >= self.max_queries {
            self.prune_expired();
        }

        let mut queries = self.queries.write().unwrap_or_else(PoisonError::into_inner);
        if queries.len() >= self.max_queries {
            return Err(QueryError::CapacityExceeded {
                max_queries: self.max_queries,
            });
        }

        loop {
            let id = QueryId::generate();
            if let Entry::Vacant(slot) = queries.entry(id.clone()) {
                let machine = Arc::new(QueryStateMachine::new(id, query));
                slot.insert(Arc::clone(&machine));
                debug!("Query {} registered", machine.id());
                return Ok(machine);
            }
        }
    }

    pub fn get(&self, id: &QueryId) -> Option<Arc<QueryStateMachine>> {
        self.queries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn lookup(&self, id: &QueryId) -> Result<QueryInfo, QueryError> {
        self.get(id)
            .map(|q| q.info())
            .ok_or_else(|| QueryError::NotFound(id.clone()))
    }

    /// All tracked queries ordered by submission. Each entry is read as one
    /// coherent group; the map lock is released before any entry is read.
    pub fn snapshot(&self) -> Vec<QueryInfo> {
        let mut infos: Vec<QueryInfo> = self.tracked().iter().map(|q| q.info()).collect();
        infos.sort_by(|a, b| {
            a.submitted_at
                .cmp(&b.submitted_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        infos
    }

    pub fn transition(&self, id: &QueryId, next: QueryState) -> bool {
        self.get(id).map(|q| q.transition(next)).unwrap_or(false)
    }

    pub fn fail(&self, id: &QueryId, cause: QueryError) -> bool {
        self.get(id).map(|q| q.fail(cause)).unwrap_or(false)
    }

    /// `true` only if the query exists, is not terminal and had not been
    /// cancelled already.
    pub fn request_cancellation(&self, id: &QueryId, reason: Option<&str>) -> bool {
        self.get(id)
            .map(|q| q.request_cancellation(reason))
            .unwrap_or(false)
    }

    /// Non-terminal queries submitted more than `limit` ago.
    pub fn running_longer_than(&self, limit: Duration) -> Vec<QueryId> {
        let now = Instant::now();
        self.tracked()
            .iter()
            .filter(|q| !q.is_done() && now.saturating_duration_since(q.submitted_at()) > limit)
            .map(|q| q.id().clone())
            .collect()
    }

    /// Evict the oldest terminal queries while more than the history cap are
    /// kept, but only those that ended longer ago than the expiry age.
    /// Returns how many entries were removed.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut terminal: Vec<(Instant, QueryId)> = self
            .tracked()
            .iter()
            .filter_map(|q| {
                let info = q.info();
                info.ended_at.map(|ended| (ended, info.id))
            })
            .collect();
        terminal.sort();

        let mut expired: Vec<QueryId> = Vec::new();
        let mut remaining = terminal.len();
        for (ended, id) in terminal {
            if remaining <= self.max_query_history
                || now.saturating_duration_since(ended) <= self.min_query_expire_age
            {
                break;
            }
            expired.push(id);
            remaining -= 1;
        }

        if expired.is_empty() {
            return 0;
        }

        let mut queries = self.queries.write().unwrap_or_else(PoisonError::into_inner);
        for id in &expired {
            queries.remove(id);
        }
        info!(
            "Pruned {} finished quer{} from registry ({} tracked)",
            expired.len(),
            if expired.len() == 1 { "y" } else { "ies" },
            queries.len()
        );
        self.metrics.record_queries_pruned(expired.len());
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.queries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.max_queries
    }

    fn tracked(&self) -> Vec<Arc<QueryStateMachine>> {
        self.queries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}
