//! DuckDB table functions over the query registry:
//! `trex_queries()`, `trex_kill_query(id, reason)` and `trex_query_metrics()`.
//! `trex_kill_query` is a table macro over `trex_kill_query_by_id` that maps
//! NULL arguments to empty strings.

use std::error::Error;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use duckdb::core::{DataChunkHandle, FlatVector, Inserter, LogicalTypeHandle, LogicalTypeId};
use duckdb::vtab::{BindInfo, InitInfo, TableFunctionInfo, VTab};
use duckdb::Connection;

use crate::kill::KillProcedure;
use crate::metrics::{MetricEntry, QueryMetrics};
use crate::query::{epoch_millis, QueryId, QueryInfo};
use crate::registry::QueryRegistry;

const VECTOR_SIZE: usize = 2048;
const KILL_FUNCTION: &str = "trex_kill_query_by_id";

/// Handed to every table function as extra info at registration.
#[derive(Clone)]
pub struct SystemTablesContext {
    pub registry: Arc<QueryRegistry>,
    pub metrics: Arc<QueryMetrics>,
    pub killer: KillProcedure,
}

pub fn install(conn: &Connection, ctx: SystemTablesContext) -> duckdb::Result<()> {
    conn.register_table_function_with_extra_info::<QueriesTable, _>("trex_queries", &ctx)?;
    conn.register_table_function_with_extra_info::<KillQueryProcedure, _>(KILL_FUNCTION, &ctx)?;
    conn.register_table_function_with_extra_info::<QueryMetricsTable, _>(
        "trex_query_metrics",
        &ctx,
    )?;
    // NULL arguments reach the table function as empty strings, which the
    // kill procedure reads as "no reason".
    conn.execute_batch(&format!(
        "CREATE OR REPLACE MACRO trex_kill_query(query_id, reason) AS TABLE \
         SELECT killed FROM {KILL_FUNCTION}(\
         coalesce(CAST(query_id AS VARCHAR), ''), coalesce(CAST(reason AS VARCHAR), ''))"
    ))?;
    Ok(())
}

fn context(bind: &BindInfo) -> Result<SystemTablesContext, Box<dyn Error>> {
    let ctx = bind.get_extra_info::<SystemTablesContext>();
    unsafe { ctx.as_ref() }
        .cloned()
        .ok_or_else(|| "system table context is not registered".into())
}

fn bind_data<T>(init: &InitInfo) -> Result<&T, Box<dyn Error>> {
    let data = init.get_bind_data::<T>();
    unsafe { data.as_ref() }.ok_or_else(|| "Bind data is null".into())
}

/// One `trex_queries()` row.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRow {
    pub query_id: String,
    pub state: String,
    pub query: String,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub cancellation_requested: bool,
    pub queued_time_ms: i64,
    pub analysis_time_ms: Option<i64>,
    pub elapsed_time_ms: i64,
    pub created_ms: i64,
    pub end_ms: Option<i64>,
}

impl QueryRow {
    pub fn from_info(info: &QueryInfo) -> Self {
        QueryRow {
            query_id: info.id.to_string(),
            state: info.state.as_str().to_string(),
            query: info.query.clone(),
            error_type: info.error_type().map(str::to_string),
            error_message: info.failure.as_ref().map(|f| f.to_string()),
            cancellation_requested: info.cancellation_requested,
            queued_time_ms: info.queued_time.as_millis() as i64,
            analysis_time_ms: info.analysis_time.map(|d| d.as_millis() as i64),
            elapsed_time_ms: info.elapsed.as_millis() as i64,
            created_ms: epoch_millis(info.created),
            end_ms: info.end.map(epoch_millis),
        }
    }
}

fn fill_varchar<R>(vector: &mut FlatVector, rows: &[R], get: impl Fn(&R) -> Option<&str>) {
    for (i, row) in rows.iter().enumerate() {
        match get(row) {
            Some(v) => vector.insert(i, v),
            None => vector.set_null(i),
        }
    }
}

/// Two-pass fill: values via `as_mut_slice`, then nulls.
fn fill_typed<R, T: Copy + 'static>(
    vector: &mut FlatVector,
    rows: &[R],
    get: impl Fn(&R) -> Option<T>,
) {
    let mut null_indices = Vec::new();
    {
        let slice = vector.as_mut_slice::<T>();
        for (i, row) in rows.iter().enumerate() {
            match get(row) {
                Some(v) => slice[i] = v,
                None => null_indices.push(i),
            }
        }
    }
    for idx in null_indices {
        vector.set_null(idx);
    }
}

pub struct QueriesTable;

#[repr(C)]
pub struct QueriesBindData {
    registry: Arc<QueryRegistry>,
}

#[repr(C)]
pub struct QueriesInitData {
    rows: Vec<QueryRow>,
    offset: AtomicUsize,
}

impl VTab for QueriesTable {
    type InitData = QueriesInitData;
    type BindData = QueriesBindData;

    fn bind(bind: &BindInfo) -> Result<Self::BindData, Box<dyn Error>> {
        let varchar = || LogicalTypeHandle::from(LogicalTypeId::Varchar);
        let bigint = || LogicalTypeHandle::from(LogicalTypeId::Bigint);
        bind.add_result_column("query_id", varchar());
        bind.add_result_column("state", varchar());
        bind.add_result_column("query", varchar());
        bind.add_result_column("error_type", varchar());
        bind.add_result_column("error_message", varchar());
        bind.add_result_column(
            "cancellation_requested",
            LogicalTypeHandle::from(LogicalTypeId::Boolean),
        );
        bind.add_result_column("queued_time_ms", bigint());
        bind.add_result_column("analysis_time_ms", bigint());
        bind.add_result_column("elapsed_time_ms", bigint());
        bind.add_result_column("created_ms", bigint());
        bind.add_result_column("end_ms", bigint());

        Ok(QueriesBindData {
            registry: context(bind)?.registry,
        })
    }

    fn init(init: &InitInfo) -> Result<Self::InitData, Box<dyn Error>> {
        let bind_data = bind_data::<QueriesBindData>(init)?;
        let rows = bind_data
            .registry
            .snapshot()
            .iter()
            .map(QueryRow::from_info)
            .collect();
        Ok(QueriesInitData {
            rows,
            offset: AtomicUsize::new(0),
        })
    }

    fn func(
        func: &TableFunctionInfo<Self>,
        output: &mut DataChunkHandle,
    ) -> Result<(), Box<dyn Error>> {
        let init_data = func.get_init_data();
        let offset = init_data.offset.load(Ordering::Relaxed);
        if offset >= init_data.rows.len() {
            output.set_len(0);
            return Ok(());
        }

        let chunk_size = VECTOR_SIZE.min(init_data.rows.len() - offset);
        let rows = &init_data.rows[offset..offset + chunk_size];

        fill_varchar(&mut output.flat_vector(0), rows, |r| Some(r.query_id.as_str()));
        fill_varchar(&mut output.flat_vector(1), rows, |r| Some(r.state.as_str()));
        fill_varchar(&mut output.flat_vector(2), rows, |r| Some(r.query.as_str()));
        fill_varchar(&mut output.flat_vector(3), rows, |r| r.error_type.as_deref());
        fill_varchar(&mut output.flat_vector(4), rows, |r| r.error_message.as_deref());
        fill_typed(&mut output.flat_vector(5), rows, |r| Some(r.cancellation_requested));
        fill_typed(&mut output.flat_vector(6), rows, |r| Some(r.queued_time_ms));
        fill_typed(&mut output.flat_vector(7), rows, |r| r.analysis_time_ms);
        fill_typed(&mut output.flat_vector(8), rows, |r| Some(r.elapsed_time_ms));
        fill_typed(&mut output.flat_vector(9), rows, |r| Some(r.created_ms));
        fill_typed(&mut output.flat_vector(10), rows, |r| r.end_ms);

        output.set_len(chunk_size);
        init_data.offset.store(offset + chunk_size, Ordering::Relaxed);
        Ok(())
    }

    fn parameters() -> Option<Vec<LogicalTypeHandle>> {
        None
    }
}

pub struct KillQueryProcedure;

#[repr(C)]
pub struct KillQueryBindData {
    killer: KillProcedure,
    query_id: String,
    reason: String,
}

#[repr(C)]
pub struct KillQueryInitData {
    killed: bool,
    done: AtomicBool,
}

impl VTab for KillQueryProcedure {
    type InitData = KillQueryInitData;
    type BindData = KillQueryBindData;

    fn bind(bind: &BindInfo) -> Result<Self::BindData, Box<dyn Error>> {
        bind.add_result_column("killed", LogicalTypeHandle::from(LogicalTypeId::Boolean));
        let query_id = bind.get_parameter(0).to_string();
        let reason = bind.get_parameter(1).to_string();
        Ok(KillQueryBindData {
            killer: context(bind)?.killer,
            query_id,
            reason,
        })
    }

    fn init(init: &InitInfo) -> Result<Self::InitData, Box<dyn Error>> {
        let bind_data = bind_data::<KillQueryBindData>(init)?;
        let killed = bind_data.killer.kill(
            &QueryId::from(bind_data.query_id.as_str()),
            Some(bind_data.reason.as_str()),
        );
        Ok(KillQueryInitData {
            killed,
            done: AtomicBool::new(false),
        })
    }

    fn func(
        func: &TableFunctionInfo<Self>,
        output: &mut DataChunkHandle,
    ) -> Result<(), Box<dyn Error>> {
        let init_data = func.get_init_data();
        if init_data.done.swap(true, Ordering::Relaxed) {
            output.set_len(0);
            return Ok(());
        }

        let mut killed_vector = output.flat_vector(0);
        killed_vector.as_mut_slice::<bool>()[0] = init_data.killed;
        output.set_len(1);
        Ok(())
    }

    fn parameters() -> Option<Vec<LogicalTypeHandle>> {
        Some(vec![
            LogicalTypeHandle::from(LogicalTypeId::Varchar),
            LogicalTypeHandle::from(LogicalTypeId::Varchar),
        ])
    }
}

pub struct QueryMetricsTable;

#[repr(C)]
pub struct QueryMetricsBindData {
    metrics: Arc<QueryMetrics>,
}

#[repr(C)]
pub struct QueryMetricsInitData {
    entries: Vec<MetricEntry>,
    done: AtomicBool,
}

impl VTab for QueryMetricsTable {
    type InitData = QueryMetricsInitData;
    type BindData = QueryMetricsBindData;

    fn bind(bind: &BindInfo) -> Result<Self::BindData, Box<dyn Error>> {
        bind.add_result_column("metric_name", LogicalTypeHandle::from(LogicalTypeId::Varchar));
        bind.add_result_column("metric_type", LogicalTypeHandle::from(LogicalTypeId::Varchar));
        bind.add_result_column("value", LogicalTypeHandle::from(LogicalTypeId::Varchar));
        Ok(QueryMetricsBindData {
            metrics: context(bind)?.metrics,
        })
    }

    fn init(init: &InitInfo) -> Result<Self::InitData, Box<dyn Error>> {
        let bind_data = bind_data::<QueryMetricsBindData>(init)?;
        Ok(QueryMetricsInitData {
            entries: bind_data.metrics.get_all_metrics(),
            done: AtomicBool::new(false),
        })
    }

    fn func(
        func: &TableFunctionInfo<Self>,
        output: &mut DataChunkHandle,
    ) -> Result<(), Box<dyn Error>> {
        let init_data = func.get_init_data();
        if init_data.done.swap(true, Ordering::Relaxed) {
            output.set_len(0);
            return Ok(());
        }

        let entries = &init_data.entries;
        fill_varchar(&mut output.flat_vector(0), entries, |e| Some(e.name.as_str()));
        fill_varchar(&mut output.flat_vector(1), entries, |e| Some(e.metric_type.as_str()));
        fill_varchar(&mut output.flat_vector(2), entries, |e| Some(e.value.as_str()));
        output.set_len(entries.len());
        Ok(())
    }

    fn parameters() -> Option<Vec<LogicalTypeHandle>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::error::QueryError;
    use crate::state::QueryState;
    use pretty_assertions::assert_eq;

    fn context() -> SystemTablesContext {
        let registry = Arc::new(QueryRegistry::new(&CoordinatorConfig::default()));
        SystemTablesContext {
            killer: KillProcedure::new(Arc::clone(&registry)),
            metrics: Arc::new(QueryMetrics::new()),
            registry,
        }
    }

    fn installed() -> (Connection, SystemTablesContext) {
        let conn = Connection::open_in_memory().unwrap();
        let ctx = context();
        install(&conn, ctx.clone()).unwrap();
        (conn, ctx)
    }

    #[test]
    fn row_projection_of_queued_query() {
        let ctx = context();
        let id = ctx.registry.register("SELECT 1").unwrap();
        let row = QueryRow::from_info(&ctx.registry.lookup(&id).unwrap());
        assert_eq!(row.query_id, id.to_string());
        assert_eq!(row.state, "QUEUED");
        assert_eq!(row.query, "SELECT 1");
        assert_eq!(row.error_type, None);
        assert_eq!(row.analysis_time_ms, None);
        assert_eq!(row.end_ms, None);
        assert!(!row.cancellation_requested);
        assert!(row.created_ms > 0);
    }

    #[test]
    fn row_projection_of_killed_query() {
        let ctx = context();
        let id = ctx.registry.register("SELECT 1").unwrap();
        ctx.registry.transition(&id, QueryState::WaitingForResources);
        ctx.registry.request_cancellation(&id, Some("because"));
        ctx.registry.fail(&id, QueryError::cancelled(Some("because")));

        let row = QueryRow::from_info(&ctx.registry.lookup(&id).unwrap());
        assert_eq!(row.state, "FAILED");
        assert_eq!(row.error_type.as_deref(), Some("CANCELLED"));
        assert_eq!(
            row.error_message.as_deref(),
            Some("Query killed. Message: because")
        );
        assert!(row.cancellation_requested);
        assert!(row.analysis_time_ms.is_some());
        assert!(row.end_ms.is_some());
    }

    #[test]
    fn queries_table_lists_registry() {
        let (conn, ctx) = installed();
        let id = ctx.registry.register("SELECT 'marker'").unwrap();

        let (state, cancelled): (String, bool) = conn
            .query_row(
                "SELECT state, cancellation_requested FROM trex_queries() WHERE query_id = ?",
                [id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(state, "QUEUED");
        assert!(!cancelled);

        let null_end: bool = conn
            .query_row(
                "SELECT end_ms IS NULL FROM trex_queries() WHERE query_id = ?",
                [id.as_str()],
                |row| row.get(0),
            )
            .unwrap();
        assert!(null_end);
    }

    #[test]
    fn queries_table_spans_multiple_chunks() {
        let (conn, ctx) = installed();
        for i in 0..(VECTOR_SIZE + 10) {
            ctx.registry.register(&format!("SELECT {i}")).unwrap();
        }
        let count: i64 = conn
            .query_row("SELECT count(*) FROM trex_queries()", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, (VECTOR_SIZE + 10) as i64);
    }

    #[test]
    fn kill_procedure_reports_outcome() {
        let (conn, ctx) = installed();
        let id = ctx.registry.register("SELECT 1").unwrap();

        let sql = format!("CALL trex_kill_query('{}', 'because')", id);
        let killed: bool = conn.query_row(&sql, [], |row| row.get(0)).unwrap();
        assert!(killed);
        assert!(ctx.registry.lookup(&id).unwrap().cancellation_requested);

        let again: bool = conn.query_row(&sql, [], |row| row.get(0)).unwrap();
        assert!(!again);

        let unknown: bool = conn
            .query_row("CALL trex_kill_query('nope', '')", [], |row| row.get(0))
            .unwrap();
        assert!(!unknown);

        let null_id: bool = conn
            .query_row("CALL trex_kill_query(NULL, NULL)", [], |row| row.get(0))
            .unwrap();
        assert!(!null_id);
    }

    #[test]
    fn kill_procedure_null_reason_means_no_message() {
        let (conn, ctx) = installed();
        let id = ctx.registry.register("SELECT 1").unwrap();

        let killed: bool = conn
            .query_row(
                &format!("CALL trex_kill_query('{id}', NULL)"),
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(killed);

        let query = ctx.registry.get(&id).unwrap();
        assert_eq!(query.cancellation_token().reason(), None);
        query.fail(QueryError::cancelled(query.cancellation_token().reason().as_deref()));
        let row = QueryRow::from_info(&query.info());
        assert_eq!(
            row.error_message.as_deref(),
            Some("Query killed. No message provided.")
        );
    }

    #[test]
    fn metrics_table_lists_entries() {
        let (conn, ctx) = installed();
        ctx.metrics.record_query_submitted();
        let value: String = conn
            .query_row(
                "SELECT value FROM trex_query_metrics() WHERE metric_name = 'queries_submitted'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(value, "1");
    }
}
