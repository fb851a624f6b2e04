/// Behavioral switches for a [`Client`](crate::Client).
///
/// All off by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientOptions {
    /// Make [`run_tasks`](crate::Client::run_tasks) return
    /// [`Error::IoWait`](crate::Error::IoWait) instead of blocking when no
    /// task can advance without waiting for I/O.
    pub non_blocking: bool,

    /// Deliver `WORK_DATA`/`WORK_WARNING` chunks to the callbacks only,
    /// without accumulating them in the task's result buffer. For jobs with
    /// large streamed results.
    pub unbuffered_result: bool,

    /// Reclaim tasks automatically once they reach a terminal state and
    /// their final callback has run. Handles to reclaimed tasks become
    /// stale.
    pub free_tasks: bool,
}
