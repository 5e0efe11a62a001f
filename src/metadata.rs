//! Boundary to pluggable metadata sources consulted during analysis.
//!
//! A provider may block for as long as its backing system needs, but it must
//! return [`MetadataError::Cancelled`] promptly once the token it was handed
//! fires. [`PendingMetadata`] is the building block for that: a settable value
//! whose `get` waits on both the value and the token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{Receiver, Sender};

use crate::cancellation::CancellationToken;
use crate::error::MetadataError;

/// A table referenced by a statement, as written (`catalog.schema.table`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableReference {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub table: String,
}

impl TableReference {
    pub fn new(table: &str) -> Self {
        TableReference {
            catalog: None,
            schema: None,
            table: table.to_string(),
        }
    }

    /// Build from dotted name parts; the last part is the table.
    pub fn from_parts(parts: &[String]) -> Option<Self> {
        match parts {
            [table] => Some(TableReference {
                catalog: None,
                schema: None,
                table: table.clone(),
            }),
            [schema, table] => Some(TableReference {
                catalog: None,
                schema: Some(schema.clone()),
                table: table.clone(),
            }),
            [catalog, schema, table] => Some(TableReference {
                catalog: Some(catalog.clone()),
                schema: Some(schema.clone()),
                table: table.clone(),
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for TableReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(catalog) = &self.catalog {
            write!(f, "{}.", catalog)?;
        }
        if let Some(schema) = &self.schema {
            write!(f, "{}.", schema)?;
        }
        f.write_str(&self.table)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub name: String,
    pub data_type: String,
}

impl ColumnMetadata {
    pub fn new(name: &str, data_type: &str) -> Self {
        ColumnMetadata {
            name: name.to_string(),
            data_type: data_type.to_string(),
        }
    }
}

pub trait MetadataProvider: Send + Sync {
    /// Resolve the columns of `table`. May block; must honour `cancel`.
    fn resolve(
        &self,
        table: &TableReference,
        cancel: &CancellationToken,
    ) -> Result<Vec<ColumnMetadata>, MetadataError>;
}

impl<F> MetadataProvider for F
where
    F: Fn(&TableReference, &CancellationToken) -> Result<Vec<ColumnMetadata>, MetadataError>
        + Send
        + Sync,
{
    fn resolve(
        &self,
        table: &TableReference,
        cancel: &CancellationToken,
    ) -> Result<Vec<ColumnMetadata>, MetadataError> {
        self(table, cancel)
    }
}

/// In-memory table definitions, keyed by unqualified table name.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadataProvider {
    tables: HashMap<String, Vec<ColumnMetadata>>,
}

impl StaticMetadataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: &str, columns: Vec<ColumnMetadata>) -> Self {
        self.tables.insert(table.to_lowercase(), columns);
        self
    }
}

impl MetadataProvider for StaticMetadataProvider {
    fn resolve(
        &self,
        table: &TableReference,
        cancel: &CancellationToken,
    ) -> Result<Vec<ColumnMetadata>, MetadataError> {
        if cancel.is_cancelled() {
            return Err(MetadataError::Cancelled);
        }
        self.tables
            .get(&table.table.to_lowercase())
            .cloned()
            .ok_or_else(|| MetadataError::TableNotFound(table.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingState {
    Pending,
    Completed,
    Cancelled,
}

/// A value that is set once by one party and awaited by others, where the
/// waiting side can be interrupted by a [`CancellationToken`]. An interrupted
/// wait cancels the value itself, so a later `set` is refused.
#[derive(Debug, Clone)]
pub struct PendingMetadata<T> {
    inner: Arc<PendingInner<T>>,
}

#[derive(Debug)]
struct PendingInner<T> {
    state: Mutex<(PendingState, Option<T>)>,
    ready_tx: Mutex<Option<Sender<()>>>,
    ready_rx: Receiver<()>,
}

impl<T: Clone> PendingMetadata<T> {
    pub fn new() -> Self {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(0);
        PendingMetadata {
            inner: Arc::new(PendingInner {
                state: Mutex::new((PendingState::Pending, None)),
                ready_tx: Mutex::new(Some(ready_tx)),
                ready_rx,
            }),
        }
    }

    /// Complete with `value`. Returns `false` if already completed or cancelled.
    pub fn set(&self, value: T) -> bool {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.0 != PendingState::Pending {
                return false;
            }
            *state = (PendingState::Completed, Some(value));
        }
        self.release_waiters();
        true
    }

    /// Cancel without a value. Returns `false` if already completed or cancelled.
    pub fn cancel(&self) -> bool {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.0 != PendingState::Pending {
                return false;
            }
            state.0 = PendingState::Cancelled;
        }
        self.release_waiters();
        true
    }

    pub fn is_done(&self) -> bool {
        self.current_state() != PendingState::Pending
    }

    pub fn is_cancelled(&self) -> bool {
        self.current_state() == PendingState::Cancelled
    }

    /// Block until the value is set, this pending value is cancelled, or
    /// `cancel` fires. In the last case the pending value is cancelled too.
    pub fn get(&self, cancel: &CancellationToken) -> Result<T, MetadataError> {
        if let Some(result) = self.try_get() {
            return result;
        }
        match cancel.wait_for(&self.inner.ready_rx) {
            Ok(_) => self.try_get().unwrap_or(Err(MetadataError::Cancelled)),
            Err(_) => {
                self.cancel();
                // A value set concurrently with the interrupt still wins.
                self.try_get().unwrap_or(Err(MetadataError::Cancelled))
            }
        }
    }

    fn try_get(&self) -> Option<Result<T, MetadataError>> {
        let state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.0 {
            PendingState::Pending => None,
            PendingState::Completed => state.1.clone().map(Ok),
            PendingState::Cancelled => Some(Err(MetadataError::Cancelled)),
        }
    }

    fn current_state(&self) -> PendingState {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner).0
    }

    fn release_waiters(&self) {
        self.inner
            .ready_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl<T: Clone> Default for PendingMetadata<T> {
    fn default() -> Self {
        Self::new()
    }
}
