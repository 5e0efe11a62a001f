use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{select, RecvTimeoutError};
use duckdb::Connection;
use log::debug;

use crate::cancellation::CancellationToken;
use crate::error::{CoordinatorError, MetadataError, QueryError};
use crate::metadata::{ColumnMetadata, MetadataProvider, TableReference};
use crate::result::QueryOutput;
use crate::system_tables::{self, SystemTablesContext};

const INTERRUPT_RETRY: Duration = Duration::from_millis(10);

/// Runs an analyzed statement to completion.
pub trait QueryExecutor: Send + Sync {
    fn execute(&self, sql: &str, cancel: &CancellationToken) -> Result<QueryOutput, QueryError>;
}

/// Embedded DuckDB database. Every statement runs on its own cloned
/// connection so long scans never hold the shared lock.
pub struct DuckDbEngine {
    conn: Mutex<Connection>,
}

impl DuckDbEngine {
    pub fn open(path: &str) -> Result<Self, CoordinatorError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        debug!("Opened DuckDB database at {}", path);
        Ok(DuckDbEngine {
            conn: Mutex::new(conn),
        })
    }

    /// Register `trex_queries`, `trex_kill_query` and `trex_query_metrics`.
    pub fn install_system_tables(&self, ctx: SystemTablesContext) -> Result<(), CoordinatorError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        system_tables::install(&conn, ctx)?;
        Ok(())
    }

    pub fn connection(&self) -> Result<Connection, QueryError> {
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_clone()
            .map_err(|e| QueryError::Internal(format!("Failed to clone connection: {e}")))
    }

    pub fn execute_batch(&self, sql: &str) -> Result<(), QueryError> {
        self.connection()?
            .execute_batch(sql)
            .map_err(|e| QueryError::ExecutionFailure(e.to_string()))
    }

    /// Run directly, bypassing the coordinator.
    pub fn query(&self, sql: &str) -> Result<QueryOutput, QueryError> {
        QueryOutput::from_query(&self.connection()?, sql)
    }
}

impl QueryExecutor for DuckDbEngine {
    fn execute(&self, sql: &str, cancel: &CancellationToken) -> Result<QueryOutput, QueryError> {
        if cancel.is_cancelled() {
            return Err(QueryError::cancelled(cancel.reason().as_deref()));
        }
        let conn = self.connection()?;
        let interrupt = conn.interrupt_handle();
        let signal = cancel.signal();
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);

        let result = thread::scope(|s| {
            thread::Builder::new()
                .name("trex-query-interrupt".to_string())
                .spawn_scoped(s, move || {
                    select! {
                        recv(signal) -> _ => {
                            // An interrupt that lands before DuckDB starts the
                            // statement is reset by it, so keep firing until done.
                            loop {
                                interrupt.interrupt();
                                match done_rx.recv_timeout(INTERRUPT_RETRY) {
                                    Err(RecvTimeoutError::Timeout) => continue,
                                    _ => break,
                                }
                            }
                        }
                        recv(done_rx) -> _ => {}
                    }
                })
                .map_err(|e| QueryError::Internal(format!("Failed to spawn interrupt watcher: {e}")))?;

            let result = QueryOutput::from_query(&conn, sql);
            drop(done_tx);
            result
        });

        match result {
            Err(_) if cancel.is_cancelled() => {
                debug!("Statement interrupted by cancellation");
                Err(QueryError::cancelled(cancel.reason().as_deref()))
            }
            other => other,
        }
    }
}

/// Resolves table columns from the engine's own `information_schema`.
pub struct DuckDbCatalogProvider {
    conn: Mutex<Connection>,
}

impl DuckDbCatalogProvider {
    pub fn new(engine: &DuckDbEngine) -> Result<Self, CoordinatorError> {
        let conn = engine
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_clone()?;
        Ok(DuckDbCatalogProvider {
            conn: Mutex::new(conn),
        })
    }
}

impl MetadataProvider for DuckDbCatalogProvider {
    fn resolve(
        &self,
        table: &TableReference,
        cancel: &CancellationToken,
    ) -> Result<Vec<ColumnMetadata>, MetadataError> {
        if cancel.is_cancelled() {
            return Err(MetadataError::Cancelled);
        }

        let mut sql = String::from(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE lower(table_name) = lower(?)",
        );
        let mut args = vec![table.table.clone()];
        if let Some(schema) = &table.schema {
            sql.push_str(" AND lower(table_schema) = lower(?)");
            args.push(schema.clone());
        }
        if let Some(catalog) = &table.catalog {
            sql.push_str(" AND lower(table_catalog) = lower(?)");
            args.push(catalog.clone());
        }
        sql.push_str(" ORDER BY ordinal_position");

        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| MetadataError::Failed(e.to_string()))?;
        let columns = stmt
            .query_map(duckdb::params_from_iter(args.iter()), |row| {
                Ok(ColumnMetadata {
                    name: row.get(0)?,
                    data_type: row.get(1)?,
                })
            })
            .map_err(|e| MetadataError::Failed(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| MetadataError::Failed(e.to_string()))?;

        if columns.is_empty() {
            return Err(MetadataError::TableNotFound(table.to_string()));
        }
        Ok(columns)
    }
}
