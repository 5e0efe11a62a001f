//! Per-query state machine and its read-only snapshot.

use std::sync::{Condvar, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::debug;

use crate::cancellation::CancellationToken;
use crate::error::QueryError;
use crate::state::QueryState;

/// Opaque query identifier, unique for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(String);

impl QueryId {
    pub fn generate() -> Self {
        QueryId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for QueryId {
    fn from(s: &str) -> Self {
        QueryId(s.to_string())
    }
}

impl From<String> for QueryId {
    fn from(s: String) -> Self {
        QueryId(s)
    }
}

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fields that change together; always read and written under one lock.
#[derive(Debug, Clone)]
struct QueryStatus {
    state: QueryState,
    failure: Option<QueryError>,
    analysis_started: Option<Instant>,
    execution_started: Option<Instant>,
    ended: Option<Instant>,
    end_time: Option<SystemTime>,
}

#[derive(Debug)]
pub struct QueryStateMachine {
    id: QueryId,
    query: String,
    created: SystemTime,
    submitted_at: Instant,
    status: RwLock<QueryStatus>,
    cancellation: CancellationToken,
    done: Mutex<bool>,
    done_signal: Condvar,
}

impl QueryStateMachine {
    pub fn new(id: QueryId, query: &str) -> Self {
        QueryStateMachine {
            id,
            query: query.to_string(),
            created: SystemTime::now(),
            submitted_at: Instant::now(),
            status: RwLock::new(QueryStatus {
                state: QueryState::Queued,
                failure: None,
                analysis_started: None,
                execution_started: None,
                ended: None,
                end_time: None,
            }),
            cancellation: CancellationToken::new(),
            done: Mutex::new(false),
            done_signal: Condvar::new(),
        }
    }

    pub fn id(&self) -> &QueryId {
        &self.id
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    pub fn state(&self) -> QueryState {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    pub fn failure(&self) -> Option<QueryError> {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .failure
            .clone()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Move forward to `next`. Returns `false` (and changes nothing) when the
    /// edge is not part of the lifecycle, including any move out of a
    /// terminal state.
    pub fn transition(&self, next: QueryState) -> bool {
        self.apply(next, None)
    }

    /// Move to FAILED, recording `cause`.
    pub fn fail(&self, cause: QueryError) -> bool {
        self.apply(QueryState::Failed, Some(cause))
    }

    fn apply(&self, next: QueryState, cause: Option<QueryError>) -> bool {
        let now = Instant::now();
        {
            let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
            if !status.state.can_transition_to(next) {
                return false;
            }
            // A query that was asked to stop never reports success.
            let (next, cause) = match next {
                QueryState::Finished if self.cancellation.is_cancelled() => (
                    QueryState::Failed,
                    Some(QueryError::cancelled(self.cancellation.reason().as_deref())),
                ),
                _ => (next, cause),
            };
            debug!("Query {} {} -> {}", self.id, status.state, next);
            status.state = next;
            match next {
                QueryState::WaitingForResources => status.analysis_started = Some(now),
                QueryState::Running => status.execution_started = Some(now),
                QueryState::Finished | QueryState::Failed => {
                    status.failure = cause;
                    status.ended = Some(now);
                    status.end_time = Some(SystemTime::now());
                }
                QueryState::Queued => {}
            }
        }
        if next.is_done() {
            let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
            *done = true;
            self.done_signal.notify_all();
        }
        true
    }

    /// Fire the cancellation token. `true` only when this call flipped the
    /// flag of a query that was not yet terminal.
    pub fn request_cancellation(&self, reason: Option<&str>) -> bool {
        // Held across the check and the flag so no terminal transition slips in between.
        let status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        if status.state.is_done() {
            return false;
        }
        self.cancellation.cancel(reason)
    }

    /// Wait until the query reaches a terminal state.
    pub fn wait_done(&self, timeout: Duration) -> bool {
        let done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        let (done, _) = self
            .done_signal
            .wait_timeout_while(done, timeout, |done| !*done)
            .unwrap_or_else(PoisonError::into_inner);
        *done
    }

    /// Coherent copy of all fields.
    pub fn info(&self) -> QueryInfo {
        let status = self
            .status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let now = Instant::now();
        let finished_at = status.ended.unwrap_or(now);
        let queued_until = status.analysis_started.unwrap_or(finished_at);
        let analysis_time = status.analysis_started.map(|started| {
            status
                .execution_started
                .or(status.ended)
                .unwrap_or(now)
                .saturating_duration_since(started)
        });

        QueryInfo {
            id: self.id.clone(),
            query: self.query.clone(),
            state: status.state,
            failure: status.failure,
            cancellation_requested: self.cancellation.is_cancelled(),
            created: self.created,
            end: status.end_time,
            queued_time: queued_until.saturating_duration_since(self.submitted_at),
            analysis_time,
            elapsed: finished_at.saturating_duration_since(self.submitted_at),
            submitted_at: self.submitted_at,
            ended_at: status.ended,
        }
    }
}

/// Point-in-time view of one query.
#[derive(Debug, Clone)]
pub struct QueryInfo {
    pub id: QueryId,
    pub query: String,
    pub state: QueryState,
    pub failure: Option<QueryError>,
    pub cancellation_requested: bool,
    pub created: SystemTime,
    pub end: Option<SystemTime>,
    pub queued_time: Duration,
    pub analysis_time: Option<Duration>,
    pub elapsed: Duration,
    pub submitted_at: Instant,
    pub ended_at: Option<Instant>,
}

impl QueryInfo {
    pub fn error_type(&self) -> Option<&'static str> {
        self.failure.as_ref().map(QueryError::error_type)
    }
}

pub(crate) fn epoch_millis(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
