/// Lifecycle states of a tracked query.
///
/// `Finished` and `Failed` are terminal. A killed query ends in `Failed` with a
/// cancellation cause rather than in a state of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryState {
    Queued,
    /// Analysis phase: resolving metadata or waiting for resources.
    WaitingForResources,
    Running,
    Finished,
    Failed,
}

impl QueryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryState::Queued => "QUEUED",
            QueryState::WaitingForResources => "WAITING_FOR_RESOURCES",
            QueryState::Running => "RUNNING",
            QueryState::Finished => "FINISHED",
            QueryState::Failed => "FAILED",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, QueryState::Finished | QueryState::Failed)
    }

    pub fn can_transition_to(&self, next: QueryState) -> bool {
        use QueryState::*;
        matches!(
            (self, next),
            (Queued, WaitingForResources)
                | (Queued, Failed)
                | (WaitingForResources, Running)
                | (WaitingForResources, Finished)
                | (WaitingForResources, Failed)
                | (Running, Finished)
                | (Running, Failed)
        )
    }
}

impl std::fmt::Display for QueryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
