//! Drives each submitted query from QUEUED to a terminal state on its own
//! thread, and owns the registry, metrics and kill procedure shared with the
//! system tables.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};

use crate::analysis::{render_plan, Analyzer};
use crate::config::CoordinatorConfig;
use crate::engine::{DuckDbCatalogProvider, DuckDbEngine, QueryExecutor};
use crate::error::{CoordinatorError, MetadataError, QueryError};
use crate::kill::KillProcedure;
use crate::metadata::MetadataProvider;
use crate::metrics::QueryMetrics;
use crate::query::{QueryId, QueryStateMachine};
use crate::registry::QueryRegistry;
use crate::result::QueryOutput;
use crate::state::QueryState;
use crate::system_tables::SystemTablesContext;

type QueryOutcome = Result<QueryOutput, QueryError>;

pub struct Coordinator {
    registry: Arc<QueryRegistry>,
    metrics: Arc<QueryMetrics>,
    killer: KillProcedure,
    metadata: Arc<dyn MetadataProvider>,
    executor: Arc<dyn QueryExecutor>,
    engine: Option<Arc<DuckDbEngine>>,
    reaper: Mutex<Option<ReaperHandle>>,
}

struct ReaperHandle {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

impl Coordinator {
    /// Coordinator over caller-supplied collaborators, without system tables.
    pub fn new(
        config: CoordinatorConfig,
        metadata: Arc<dyn MetadataProvider>,
        executor: Arc<dyn QueryExecutor>,
    ) -> Result<Self, CoordinatorError> {
        Self::build(config, metadata, executor, None)
    }

    /// Coordinator over an embedded DuckDB database with `trex_queries()`,
    /// `trex_kill_query` and `trex_query_metrics()` installed.
    pub fn with_duckdb(
        config: CoordinatorConfig,
        metadata: Arc<dyn MetadataProvider>,
    ) -> Result<Self, CoordinatorError> {
        config.validate()?;
        let engine = Arc::new(DuckDbEngine::open(&config.database_path)?);
        let executor: Arc<dyn QueryExecutor> = engine.clone();
        Self::build(config, metadata, executor, Some(engine))
    }

    /// Like [`Coordinator::with_duckdb`], resolving metadata from the
    /// database's own catalog.
    pub fn with_duckdb_catalog(config: CoordinatorConfig) -> Result<Self, CoordinatorError> {
        config.validate()?;
        let engine = Arc::new(DuckDbEngine::open(&config.database_path)?);
        let metadata: Arc<dyn MetadataProvider> = Arc::new(DuckDbCatalogProvider::new(&engine)?);
        let executor: Arc<dyn QueryExecutor> = engine.clone();
        Self::build(config, metadata, executor, Some(engine))
    }

    fn build(
        config: CoordinatorConfig,
        metadata: Arc<dyn MetadataProvider>,
        executor: Arc<dyn QueryExecutor>,
        engine: Option<Arc<DuckDbEngine>>,
    ) -> Result<Self, CoordinatorError> {
        config.validate()?;

        let metrics = Arc::new(QueryMetrics::new());
        let registry = Arc::new(QueryRegistry::with_metrics(&config, Arc::clone(&metrics)));
        let killer = KillProcedure::new(Arc::clone(&registry));

        if let Some(engine) = &engine {
            engine.install_system_tables(SystemTablesContext {
                registry: Arc::clone(&registry),
                metrics: Arc::clone(&metrics),
                killer: killer.clone(),
            })?;
        }

        let reaper = spawn_reaper(&config, &registry, &killer)?;
        info!(
            "Query coordinator started (max_queries={}, max_query_history={})",
            config.max_queries, config.max_query_history
        );

        Ok(Coordinator {
            registry,
            metrics,
            killer,
            metadata,
            executor,
            engine,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    /// Register `sql` and start analysing it in the background. Only a full
    /// registry is reported here; every later failure ends up on the handle.
    pub fn submit(&self, sql: &str) -> Result<QueryHandle, QueryError> {
        let query = match self.registry.register_query(sql) {
            Ok(query) => query,
            Err(e) => {
                self.metrics.record_query_rejected();
                warn!("Query rejected: {}", e);
                return Err(e);
            }
        };
        self.metrics.record_query_submitted();

        let (tx, rx) = crossbeam_channel::bounded(1);
        let task = QueryTask {
            query: Arc::clone(&query),
            analyzer: Analyzer::new(),
            metadata: Arc::clone(&self.metadata),
            executor: Arc::clone(&self.executor),
            metrics: Arc::clone(&self.metrics),
        };

        let spawned = thread::Builder::new()
            .name(format!("trex-query-{}", query.id()))
            .spawn(move || task.run(tx));
        if let Err(e) = spawned {
            error!("Failed to spawn worker for query {}: {}", query.id(), e);
            if query.fail(QueryError::Internal(format!("Failed to spawn query thread: {e}"))) {
                self.metrics
                    .record_query_failed(query.submitted_at().elapsed(), false);
            }
        }

        Ok(QueryHandle { query, result: rx })
    }

    pub fn kill(&self, query_id: &QueryId, reason: Option<&str>) -> bool {
        self.killer.kill(query_id, reason)
    }

    pub fn registry(&self) -> &Arc<QueryRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<QueryMetrics> {
        &self.metrics
    }

    pub fn engine(&self) -> Option<&Arc<DuckDbEngine>> {
        self.engine.as_ref()
    }

    /// Stop the reaper and cancel every query that is still in flight.
    pub fn shutdown(&self) {
        let reaper = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(reaper) = reaper else {
            return;
        };

        drop(reaper.stop);
        if reaper.thread.join().is_err() {
            warn!("Query reaper thread panicked");
        }

        for info in self.registry.snapshot() {
            if !info.state.is_done() {
                self.killer.kill(&info.id, Some("Coordinator shutting down"));
            }
        }
        info!("Query coordinator stopped");
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_reaper(
    config: &CoordinatorConfig,
    registry: &Arc<QueryRegistry>,
    killer: &KillProcedure,
) -> Result<ReaperHandle, CoordinatorError> {
    let (stop, stopped) = crossbeam_channel::bounded::<()>(0);
    let interval = config.reaper_interval();
    let max_run_time = config.query_max_run_time();
    let registry = Arc::clone(registry);
    let killer = killer.clone();

    let thread = thread::Builder::new()
        .name("trex-query-reaper".to_string())
        .spawn(move || {
            debug!("Query reaper started (interval={:?})", interval);
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }

                if let Some(limit) = max_run_time {
                    let reason = format!(
                        "Query exceeded maximum run time of {}s",
                        limit.as_secs()
                    );
                    for id in registry.running_longer_than(limit) {
                        if killer.kill(&id, Some(&reason)) {
                            warn!("Query {} killed by reaper: {}", id, reason);
                        }
                    }
                }

                registry.prune_expired();
            }
            debug!("Query reaper stopped");
        })?;

    Ok(ReaperHandle { stop, thread })
}

/// Everything one worker thread needs.
struct QueryTask {
    query: Arc<QueryStateMachine>,
    analyzer: Analyzer,
    metadata: Arc<dyn MetadataProvider>,
    executor: Arc<dyn QueryExecutor>,
    metrics: Arc<QueryMetrics>,
}

impl QueryTask {
    fn run(self, tx: Sender<QueryOutcome>) {
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.execute())) {
            Ok(outcome) => outcome,
            Err(payload) => Err(QueryError::Internal(format!(
                "Query worker panicked: {}",
                panic_message(payload.as_ref())
            ))),
        };
        // Terminal state first, so a woken waiter never sees a live query.
        let outcome = self.complete(outcome);
        let _ = tx.send(outcome);
    }

    fn execute(&self) -> QueryOutcome {
        let sql = self.query.query();
        let token = self.query.cancellation_token();

        self.check_cancelled()?;
        self.query.transition(QueryState::WaitingForResources);

        let analyzed = self.analyzer.analyze(sql)?;
        let mut resolved = Vec::with_capacity(analyzed.tables.len());
        for table in analyzed.tables {
            self.check_cancelled()?;
            debug!("Query {} resolving metadata for {}", self.query.id(), table);
            let columns = self
                .metadata
                .resolve(&table, token)
                .map_err(|e| self.metadata_error(e))?;
            self.check_cancelled()?;
            resolved.push((table, columns));
        }

        if analyzed.explain_only {
            return Ok(QueryOutput::text("Query Plan", render_plan(sql, &resolved)));
        }

        self.check_cancelled()?;
        self.query.transition(QueryState::Running);
        let output = self.executor.execute(sql, token).map_err(|e| {
            if token.is_cancelled() {
                self.cancelled()
            } else {
                e
            }
        })?;
        self.check_cancelled()?;
        Ok(output)
    }

    /// Apply the terminal state and return the outcome the query actually
    /// ended with.
    fn complete(&self, outcome: QueryOutcome) -> QueryOutcome {
        let id = self.query.id();
        let elapsed = self.query.submitted_at().elapsed();
        let applied = match &outcome {
            Ok(_) => self.query.transition(QueryState::Finished),
            Err(cause) => self.query.fail(cause.clone()),
        };
        // A kill that wins against the last transition turns success into failure.
        let outcome = match (outcome, self.query.failure()) {
            (Ok(_), Some(cause)) => Err(cause),
            (outcome, _) => outcome,
        };
        if !applied {
            return outcome;
        }

        match &outcome {
            Ok(output) => {
                self.metrics.record_query_finished(elapsed);
                info!(
                    "Query {} finished in {:?} ({} rows)",
                    id,
                    elapsed,
                    output.row_count()
                );
            }
            Err(cause) => {
                self.metrics.record_query_failed(elapsed, cause.is_cancelled());
                if cause.is_cancelled() {
                    info!("Query {} cancelled: {}", id, cause);
                } else {
                    warn!("Query {} failed: {}", id, cause);
                }
            }
        }
        outcome
    }

    fn check_cancelled(&self) -> Result<(), QueryError> {
        if self.query.is_cancellation_requested() {
            return Err(self.cancelled());
        }
        Ok(())
    }

    fn cancelled(&self) -> QueryError {
        QueryError::cancelled(self.query.cancellation_token().reason().as_deref())
    }

    fn metadata_error(&self, e: MetadataError) -> QueryError {
        if e == MetadataError::Cancelled || self.query.is_cancellation_requested() {
            self.cancelled()
        } else {
            QueryError::AnalysisFailure(e.to_string())
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Caller's view of a submitted query.
#[derive(Debug)]
pub struct QueryHandle {
    query: Arc<QueryStateMachine>,
    result: Receiver<QueryOutcome>,
}

impl QueryHandle {
    pub fn id(&self) -> &QueryId {
        self.query.id()
    }

    pub fn state(&self) -> QueryState {
        self.query.state()
    }

    pub fn is_done(&self) -> bool {
        self.query.is_done()
    }

    /// Block until the query is terminal and return its outcome.
    pub fn wait(self) -> QueryOutcome {
        match self.result.recv() {
            Ok(outcome) => outcome,
            Err(_) => Err(self.lost_outcome()),
        }
    }

    /// `None` if the query is still running after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<QueryOutcome> {
        match self.result.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(self.lost_outcome())),
        }
    }

    /// Wait for a terminal state without consuming the outcome.
    pub fn wait_done(&self, timeout: Duration) -> bool {
        self.query.wait_done(timeout)
    }

    fn lost_outcome(&self) -> QueryError {
        self.query.failure().unwrap_or_else(|| {
            QueryError::Internal("query worker exited without a result".to_string())
        })
    }
}
