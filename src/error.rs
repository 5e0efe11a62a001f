use thiserror::Error;

use crate::query::QueryId;

/// Outcome errors of a tracked query. Every variant except `NotFound` and
/// `CapacityExceeded` is also recorded as the cause of a FAILED query.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Query {0} not found")]
    NotFound(QueryId),

    #[error("Query registry is full ({max_queries} queries tracked)")]
    CapacityExceeded { max_queries: usize },

    #[error("{message}")]
    Cancelled { message: String },

    #[error("Analysis failed: {0}")]
    AnalysisFailure(String),

    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueryError {
    pub fn cancelled(reason: Option<&str>) -> Self {
        let message = match reason {
            Some(r) if !r.trim().is_empty() => format!("Query killed. Message: {}", r),
            _ => "Query killed. No message provided.".to_string(),
        };
        QueryError::Cancelled { message }
    }

    /// Code shown in the `error_type` column of `trex_queries()`.
    pub fn error_type(&self) -> &'static str {
        match self {
            QueryError::NotFound(_) => "NOT_FOUND",
            QueryError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            QueryError::Cancelled { .. } => "CANCELLED",
            QueryError::AnalysisFailure(_) => "ANALYSIS_FAILURE",
            QueryError::ExecutionFailure(_) => "EXECUTION_FAILURE",
            QueryError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled { .. })
    }
}

/// Errors raised by a [`crate::metadata::MetadataProvider`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("Metadata resolution was cancelled")]
    Cancelled,

    #[error("Table '{0}' does not exist")]
    TableNotFound(String),

    #[error("Metadata resolution failed: {0}")]
    Failed(String),
}

/// Construction-time failures of a coordinator.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("DuckDB error: {0}")]
    Engine(#[from] duckdb::Error),

    #[error("Failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}
