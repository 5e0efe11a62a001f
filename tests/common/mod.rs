// Shared helpers for coordinator integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use trex_coordinator::{
    CancellationToken, ColumnMetadata, Coordinator, CoordinatorConfig, MetadataError,
    MetadataProvider, PendingMetadata, QueryOutput, TableReference,
};

pub const TIMEOUT: Duration = Duration::from_secs(10);

static MARKER: AtomicUsize = AtomicUsize::new(0);

pub fn setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Unique alias so concurrent tests can find their own rows in `trex_queries()`.
pub fn unique_marker() -> String {
    format!(
        "test_query_id_{}_{}",
        std::process::id(),
        MARKER.fetch_add(1, Ordering::Relaxed)
    )
}

pub type Columns = Vec<ColumnMetadata>;

/// Metadata provider whose tables are either answered at once or parked on
/// a [`PendingMetadata`] the test completes (or watches get cancelled).
#[derive(Default)]
pub struct MockMetadata {
    pending: Mutex<HashMap<String, PendingMetadata<Columns>>>,
}

impl MockMetadata {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make lookups of `table` block until the returned value is set.
    pub fn block_table(&self, table: &str) -> PendingMetadata<Columns> {
        let pending = PendingMetadata::new();
        self.pending
            .lock()
            .unwrap()
            .insert(table.to_lowercase(), pending.clone());
        pending
    }
}

impl MetadataProvider for MockMetadata {
    fn resolve(
        &self,
        table: &TableReference,
        cancel: &CancellationToken,
    ) -> Result<Columns, MetadataError> {
        let pending = self
            .pending
            .lock()
            .unwrap()
            .get(&table.table.to_lowercase())
            .cloned();
        match pending {
            Some(pending) => pending.get(cancel),
            None => Ok(vec![ColumnMetadata::new("id", "BIGINT")]),
        }
    }
}

pub fn coordinator(metadata: Arc<MockMetadata>) -> Coordinator {
    setup();
    Coordinator::with_duckdb(CoordinatorConfig::default(), metadata).unwrap()
}

/// Run a statement through the coordinator and wait for its rows.
pub fn run(coordinator: &Coordinator, sql: &str) -> QueryOutput {
    coordinator
        .submit(sql)
        .unwrap()
        .wait_timeout(TIMEOUT)
        .expect("query did not finish in time")
        .unwrap_or_else(|e| panic!("query failed: {e}\nSQL: {sql}"))
}

/// Rows of `trex_queries()` for queries containing `marker`, excluding the
/// reading statement itself.
pub fn query_rows(coordinator: &Coordinator, marker: &str, columns: &str) -> QueryOutput {
    run(
        coordinator,
        &format!(
            "SELECT {columns} FROM trex_queries() \
             WHERE query LIKE '%{marker}%' AND query NOT LIKE '%trex_queries%'"
        ),
    )
}

pub fn query_state(coordinator: &Coordinator, marker: &str) -> Option<String> {
    query_rows(coordinator, marker, "state")
        .column_strings("state")
        .into_iter()
        .next()
        .flatten()
}

/// Poll `trex_queries()` until the query containing `marker` is in `state`.
pub fn assert_query_eventually(coordinator: &Coordinator, marker: &str, state: &str) {
    let start = Instant::now();
    loop {
        let current = query_state(coordinator, marker);
        if current.as_deref() == Some(state) {
            return;
        }
        assert!(
            start.elapsed() < TIMEOUT,
            "query {marker} never reached {state}, last seen {current:?}"
        );
        thread::sleep(Duration::from_millis(20));
    }
}
