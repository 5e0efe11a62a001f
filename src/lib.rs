//! Query lifecycle registry and cancellation for an embedded DuckDB query
//! coordinator.
//!
//! Every submitted statement is tracked from QUEUED to FINISHED/FAILED, the
//! live registry is readable as `trex_queries()`, and any query, including
//! one blocked in a metadata call, can be stopped with
//! `CALL trex_kill_query(id, reason)`.

pub mod analysis;
pub mod cancellation;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod kill;
pub mod metadata;
pub mod metrics;
pub mod query;
pub mod registry;
pub mod result;
pub mod state;
pub mod system_tables;

pub use cancellation::CancellationToken;
pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, QueryHandle};
pub use engine::{DuckDbCatalogProvider, DuckDbEngine, QueryExecutor};
pub use error::{CoordinatorError, MetadataError, QueryError};
pub use kill::KillProcedure;
pub use metadata::{
    ColumnMetadata, MetadataProvider, PendingMetadata, StaticMetadataProvider, TableReference,
};
pub use metrics::QueryMetrics;
pub use query::{QueryId, QueryInfo};
pub use registry::QueryRegistry;
pub use result::QueryOutput;
pub use state::QueryState;
