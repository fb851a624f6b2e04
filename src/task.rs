//! Per-submission state: the task state machine and its callback surface.

use crate::error::Error;
use crate::proto::{Command, Packet, UniqueId};

/// Stable, copyable handle to a task owned by a [`Client`](crate::Client).
///
/// Handles carry a generation counter so that a handle to a freed task is
/// detected rather than silently addressing whatever reused its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// Where a task is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TaskState {
    /// Accepted by the client, not yet assigned to a connection.
    New,
    /// Queued (or in flight) on a connection's send queue.
    Submit,
    /// Request fully written; awaiting `JOB_CREATED`.
    WaitJobCreated,
    /// Background submission acknowledged. Terminal: no further responses
    /// are expected for this task.
    Created,
    /// Foreground job acknowledged and running; `WORK_*` traffic may arrive.
    Working,
    /// Finished successfully. Terminal.
    Complete,
    /// Failed, either by `WORK_FAIL`, a server `ERROR`, or connection loss.
    /// Terminal.
    Failed,
    /// Finished with a worker exception (only when the `exceptions` option
    /// was negotiated). Terminal.
    Exception,
}

impl TaskState {
    /// Whether the task accepts no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Created | TaskState::Complete | TaskState::Failed | TaskState::Exception
        )
    }
}

/// Event sink for one task, invoked synchronously on the thread driving
/// [`Client::run_tasks`](crate::Client::run_tasks).
///
/// All methods default to doing nothing, so implementors override only the
/// events they care about. Returning an error stops further event dispatch
/// to that task (other tasks continue to be serviced) and records the error
/// on the task.
#[allow(unused_variables)]
pub trait TaskEvents {
    /// `JOB_CREATED` arrived; [`Task::job_handle`] is now set.
    fn on_created(&mut self, task: &Task) -> Result<(), Error> {
        Ok(())
    }

    /// `WORK_STATUS` or `STATUS_RES` updated the task's progress counters.
    fn on_status(&mut self, task: &Task) -> Result<(), Error> {
        Ok(())
    }

    /// A `WORK_DATA` chunk arrived. In unbuffered mode this is the only
    /// chance to observe the chunk.
    fn on_data(&mut self, task: &Task, chunk: &[u8]) -> Result<(), Error> {
        Ok(())
    }

    /// A `WORK_WARNING` chunk arrived.
    fn on_warning(&mut self, task: &Task, chunk: &[u8]) -> Result<(), Error> {
        Ok(())
    }

    /// The task reached [`TaskState::Complete`] (or [`TaskState::Created`]
    /// for background submissions).
    fn on_complete(&mut self, task: &Task) -> Result<(), Error> {
        Ok(())
    }

    /// The task reached [`TaskState::Failed`].
    fn on_fail(&mut self, task: &Task) -> Result<(), Error> {
        Ok(())
    }

    /// `WORK_EXCEPTION` arrived with exception routing negotiated.
    fn on_exception(&mut self, task: &Task, message: &[u8]) -> Result<(), Error> {
        Ok(())
    }
}

/// The no-op sink, for fire-and-forget submissions.
impl TaskEvents for () {}

type Handler = Box<dyn FnMut(&Task) -> Result<(), Error>>;
type ChunkHandler = Box<dyn FnMut(&Task, &[u8]) -> Result<(), Error>>;

/// A capability record of optional per-event closures.
///
/// The closure-based alternative to hand-implementing [`TaskEvents`]:
///
/// ```no_run
/// # use gearman_client::{Callbacks, Client};
/// # let mut client = Client::new();
/// # client.add_server("tcp://localhost:4730").unwrap();
/// let done = Callbacks::new()
///     .on_complete(|t| {
///         println!("{:?} => {} bytes", t.job_handle(), t.result().len());
///         Ok(())
///     })
///     .on_fail(|t| {
///         eprintln!("{:?} failed", t.job_handle());
///         Ok(())
///     });
/// client.add_task("resize", None, Some(&b"img-4711"[..]), done).unwrap();
/// ```
#[derive(Default)]
pub struct Callbacks {
    created: Option<Handler>,
    status: Option<Handler>,
    data: Option<ChunkHandler>,
    warning: Option<ChunkHandler>,
    complete: Option<Handler>,
    fail: Option<Handler>,
    exception: Option<ChunkHandler>,
}

impl Callbacks {
    /// An empty record: every event is ignored.
    pub fn new() -> Callbacks {
        Callbacks::default()
    }

    /// Handle `JOB_CREATED`.
    pub fn on_created(mut self, f: impl FnMut(&Task) -> Result<(), Error> + 'static) -> Self {
        self.created = Some(Box::new(f));
        self
    }

    /// Handle progress updates.
    pub fn on_status(mut self, f: impl FnMut(&Task) -> Result<(), Error> + 'static) -> Self {
        self.status = Some(Box::new(f));
        self
    }

    /// Handle intermediate data chunks.
    pub fn on_data(
        mut self,
        f: impl FnMut(&Task, &[u8]) -> Result<(), Error> + 'static,
    ) -> Self {
        self.data = Some(Box::new(f));
        self
    }

    /// Handle warning chunks.
    pub fn on_warning(
        mut self,
        f: impl FnMut(&Task, &[u8]) -> Result<(), Error> + 'static,
    ) -> Self {
        self.warning = Some(Box::new(f));
        self
    }

    /// Handle successful completion.
    pub fn on_complete(mut self, f: impl FnMut(&Task) -> Result<(), Error> + 'static) -> Self {
        self.complete = Some(Box::new(f));
        self
    }

    /// Handle failure.
    pub fn on_fail(mut self, f: impl FnMut(&Task) -> Result<(), Error> + 'static) -> Self {
        self.fail = Some(Box::new(f));
        self
    }

    /// Handle worker exceptions.
    pub fn on_exception(
        mut self,
        f: impl FnMut(&Task, &[u8]) -> Result<(), Error> + 'static,
    ) -> Self {
        self.exception = Some(Box::new(f));
        self
    }
}

impl TaskEvents for Callbacks {
    fn on_created(&mut self, task: &Task) -> Result<(), Error> {
        match self.created.as_mut() {
            Some(f) => f(task),
            None => Ok(()),
        }
    }

    fn on_status(&mut self, task: &Task) -> Result<(), Error> {
        match self.status.as_mut() {
            Some(f) => f(task),
            None => Ok(()),
        }
    }

    fn on_data(&mut self, task: &Task, chunk: &[u8]) -> Result<(), Error> {
        match self.data.as_mut() {
            Some(f) => f(task, chunk),
            None => Ok(()),
        }
    }

    fn on_warning(&mut self, task: &Task, chunk: &[u8]) -> Result<(), Error> {
        match self.warning.as_mut() {
            Some(f) => f(task, chunk),
            None => Ok(()),
        }
    }

    fn on_complete(&mut self, task: &Task) -> Result<(), Error> {
        match self.complete.as_mut() {
            Some(f) => f(task),
            None => Ok(()),
        }
    }

    fn on_fail(&mut self, task: &Task) -> Result<(), Error> {
        match self.fail.as_mut() {
            Some(f) => f(task),
            None => Ok(()),
        }
    }

    fn on_exception(&mut self, task: &Task, message: &[u8]) -> Result<(), Error> {
        match self.exception.as_mut() {
            Some(f) => f(task, message),
            None => Ok(()),
        }
    }
}

/// Which event a packet produced, to be relayed to the task's
/// [`TaskEvents`] sink by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fired {
    None,
    Created,
    CreatedTerminal,
    Status,
    StatusTerminal,
    Data,
    Warning,
    Complete,
    Fail,
    Exception,
}

/// One submission: wire identity, buffers, state and callback sink.
///
/// Owned by the [`Client`](crate::Client); user code addresses it through a
/// [`TaskHandle`] and observes it via `&Task` inside callbacks or
/// [`Client::task`](crate::Client::task).
pub struct Task {
    pub(crate) unique: UniqueId,
    /// Function name as placed on the wire, namespace prefix included.
    pub(crate) function: Vec<u8>,
    pub(crate) namespace_len: usize,
    /// The caller's workload, copied at submission time so the bytes stay
    /// stable while the request is in flight.
    pub(crate) workload: Vec<u8>,
    pub(crate) command: Command,
    pub(crate) state: TaskState,
    /// Encoded request frame; kept while `send_in_use` so a requeue after
    /// connection loss can resend the identical bytes.
    pub(crate) request: Vec<u8>,
    pub(crate) send_in_use: bool,
    pub(crate) job_handle: Vec<u8>,
    pub(crate) result: Vec<u8>,
    /// Most recent `WORK_DATA`/`WORK_WARNING` chunk.
    pub(crate) data: Vec<u8>,
    pub(crate) exception: Vec<u8>,
    pub(crate) numerator: u32,
    pub(crate) denominator: u32,
    pub(crate) known: bool,
    pub(crate) running: bool,
    pub(crate) conn: Option<usize>,
    pub(crate) events: Option<Box<dyn TaskEvents>>,
    pub(crate) events_failed: bool,
    /// Set once the engine has accounted for this task's terminal
    /// transition, so counters move exactly once.
    pub(crate) finalized: bool,
    pub(crate) error: Option<Error>,
}

impl Task {
    pub(crate) fn new(
        unique: UniqueId,
        function: Vec<u8>,
        namespace_len: usize,
        workload: Vec<u8>,
        command: Command,
        request: Vec<u8>,
        events: Box<dyn TaskEvents>,
    ) -> Task {
        Task {
            unique,
            function,
            namespace_len,
            workload,
            command,
            state: TaskState::New,
            request,
            send_in_use: true,
            job_handle: Vec::new(),
            result: Vec::new(),
            data: Vec::new(),
            exception: Vec::new(),
            numerator: 0,
            denominator: 0,
            known: false,
            running: false,
            conn: None,
            events: Some(events),
            events_failed: false,
            finalized: false,
            error: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// The submit (or status/option/echo) command this task was built from.
    pub fn command(&self) -> Command {
        self.command
    }

    /// The deduplication token sent with the submission.
    pub fn unique(&self) -> &UniqueId {
        &self.unique
    }

    /// Function name as the caller supplied it, namespace stripped.
    pub fn function(&self) -> &[u8] {
        &self.function[self.namespace_len..]
    }

    /// The submitted workload. Released together with the request buffer
    /// once the server has acknowledged the submission.
    pub fn workload(&self) -> &[u8] {
        &self.workload
    }

    /// Server-assigned job handle; empty until `JOB_CREATED` arrives,
    /// immutable afterwards.
    pub fn job_handle(&self) -> &[u8] {
        &self.job_handle
    }

    /// Accumulated result bytes (data chunks plus the completion payload).
    /// Stays empty in unbuffered mode.
    pub fn result(&self) -> &[u8] {
        &self.result
    }

    /// The most recently delivered data or warning chunk.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Exception message, when the task terminated with one.
    pub fn exception(&self) -> &[u8] {
        &self.exception
    }

    /// Numerator of the last progress report.
    pub fn numerator(&self) -> u32 {
        self.numerator
    }

    /// Denominator of the last progress report.
    pub fn denominator(&self) -> u32 {
        self.denominator
    }

    /// Whether the server knew the job, per the last `STATUS_RES`.
    pub fn known(&self) -> bool {
        self.known
    }

    /// Whether the job was running, per the last `STATUS_RES`.
    pub fn running(&self) -> bool {
        self.running
    }

    /// The error that terminated this task, if it failed.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Whether the request buffer is still queued or in flight.
    pub fn send_in_use(&self) -> bool {
        self.send_in_use
    }

    fn release_request(&mut self) {
        self.send_in_use = false;
        self.request = Vec::new();
        self.workload = Vec::new();
    }

    /// Fail the task out-of-band (connection loss, server `ERROR`).
    pub(crate) fn fail_with(&mut self, error: Error) -> Fired {
        if self.state.is_terminal() {
            return Fired::None;
        }
        self.release_request();
        self.state = TaskState::Failed;
        self.error = Some(error);
        Fired::Fail
    }

    /// Advance the state machine with one inbound packet.
    ///
    /// Pure with respect to I/O: mutates this task only and reports which
    /// event the engine should relay to the callback sink.
    pub(crate) fn apply(
        &mut self,
        packet: &Packet,
        exceptions_enabled: bool,
        unbuffered: bool,
    ) -> Result<Fired, Error> {
        if self.state.is_terminal() {
            // Once terminal, nothing mutates the task any more.
            return Ok(Fired::None);
        }

        match packet.command {
            Command::JobCreated => {
                self.job_handle = packet.arg(0).to_vec();
                self.release_request();
                if self.command.is_background() {
                    self.state = TaskState::Created;
                    Ok(Fired::CreatedTerminal)
                } else {
                    self.state = TaskState::Working;
                    Ok(Fired::Created)
                }
            }
            Command::WorkStatus => {
                self.numerator = ascii_u32(packet.arg(1));
                self.denominator = ascii_u32(packet.arg(2));
                Ok(Fired::Status)
            }
            Command::WorkData => {
                self.store_chunk(packet.arg(1), unbuffered);
                Ok(Fired::Data)
            }
            Command::WorkWarning => {
                self.store_chunk(packet.arg(1), unbuffered);
                Ok(Fired::Warning)
            }
            Command::WorkException => {
                if exceptions_enabled {
                    self.exception = packet.arg(1).to_vec();
                    self.release_request();
                    self.state = TaskState::Exception;
                    Ok(Fired::Exception)
                } else {
                    // Without the negotiated option this is just another
                    // data chunk and the task keeps running.
                    self.store_chunk(packet.arg(1), unbuffered);
                    Ok(Fired::Data)
                }
            }
            Command::WorkComplete => {
                if unbuffered {
                    self.data = packet.arg(1).to_vec();
                } else {
                    self.result.extend_from_slice(packet.arg(1));
                }
                self.release_request();
                self.state = TaskState::Complete;
                Ok(Fired::Complete)
            }
            Command::WorkFail => {
                self.release_request();
                self.state = TaskState::Failed;
                Ok(Fired::Fail)
            }
            Command::StatusRes => {
                self.known = packet.arg(1) == b"1";
                self.running = packet.arg(2) == b"1";
                self.numerator = ascii_u32(packet.arg(3));
                self.denominator = ascii_u32(packet.arg(4));
                self.release_request();
                self.state = TaskState::Complete;
                Ok(Fired::StatusTerminal)
            }
            Command::OptionRes | Command::EchoRes => {
                self.result = packet.arg(0).to_vec();
                self.release_request();
                self.state = TaskState::Complete;
                Ok(Fired::Complete)
            }
            Command::Error => {
                self.release_request();
                self.state = TaskState::Failed;
                self.error = Some(Error::Server {
                    code: String::from_utf8_lossy(packet.arg(0)).into_owned(),
                    text: String::from_utf8_lossy(packet.arg(1)).into_owned(),
                });
                Ok(Fired::Fail)
            }
            other => Err(crate::error::Protocol::Unexpected { command: other }.into()),
        }
    }

    fn store_chunk(&mut self, chunk: &[u8], unbuffered: bool) {
        self.data = chunk.to_vec();
        if !unbuffered {
            self.result.extend_from_slice(chunk);
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("command", &self.command)
            .field("state", &self.state)
            .field("function", &String::from_utf8_lossy(&self.function))
            .field("job_handle", &String::from_utf8_lossy(&self.job_handle))
            .finish_non_exhaustive()
    }
}

/// `atoi`-style parse: leading decimal digits, 0 on garbage.
fn ascii_u32(bytes: &[u8]) -> u32 {
    let mut value: u32 = 0;
    for &b in bytes {
        if !b.is_ascii_digit() {
            break;
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as u32);
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Packet;

    fn task(command: Command) -> Task {
        Task::new(
            UniqueId::random(),
            b"rev".to_vec(),
            0,
            b"hello".to_vec(),
            command,
            vec![1, 2, 3],
            Box::new(()),
        )
    }

    fn created(handle: &[u8]) -> Packet {
        Packet::response(Command::JobCreated, vec![handle.to_vec()]).unwrap()
    }

    #[test]
    fn foreground_lifecycle() {
        let mut t = task(Command::SubmitJob);
        assert!(t.send_in_use());

        assert_eq!(t.apply(&created(b"H:x:1"), false, false).unwrap(), Fired::Created);
        assert_eq!(t.state(), TaskState::Working);
        assert_eq!(t.job_handle(), b"H:x:1");
        assert!(!t.send_in_use());

        let data = Packet::response(
            Command::WorkData,
            vec![b"H:x:1".to_vec(), b"chunk".to_vec()],
        )
        .unwrap();
        assert_eq!(t.apply(&data, false, false).unwrap(), Fired::Data);
        assert_eq!(t.result(), b"chunk");

        let complete = Packet::response(
            Command::WorkComplete,
            vec![b"H:x:1".to_vec(), b"-end".to_vec()],
        )
        .unwrap();
        assert_eq!(t.apply(&complete, false, false).unwrap(), Fired::Complete);
        assert_eq!(t.state(), TaskState::Complete);
        assert_eq!(t.result(), b"chunk-end");
    }

    #[test]
    fn background_terminates_at_created() {
        let mut t = task(Command::SubmitJobBg);
        assert_eq!(
            t.apply(&created(b"H:x:2"), false, false).unwrap(),
            Fired::CreatedTerminal
        );
        assert_eq!(t.state(), TaskState::Created);
        assert!(t.state().is_terminal());
        assert!(!t.send_in_use());
    }

    #[test]
    fn terminal_states_accept_no_mutation() {
        let mut t = task(Command::SubmitJob);
        t.apply(&created(b"H:x:3"), false, false).unwrap();
        let fail = Packet::response(Command::WorkFail, vec![b"H:x:3".to_vec()]).unwrap();
        t.apply(&fail, false, false).unwrap();
        assert_eq!(t.state(), TaskState::Failed);

        let complete = Packet::response(
            Command::WorkComplete,
            vec![b"H:x:3".to_vec(), b"late".to_vec()],
        )
        .unwrap();
        assert_eq!(t.apply(&complete, false, false).unwrap(), Fired::None);
        assert_eq!(t.state(), TaskState::Failed);
        assert!(t.result().is_empty());
    }

    #[test]
    fn status_updates_counters() {
        let mut t = task(Command::SubmitJob);
        t.apply(&created(b"H:x:4"), false, false).unwrap();
        let status = Packet::response(
            Command::WorkStatus,
            vec![b"H:x:4".to_vec(), b"5".to_vec(), b"10".to_vec()],
        )
        .unwrap();
        assert_eq!(t.apply(&status, false, false).unwrap(), Fired::Status);
        assert_eq!((t.numerator(), t.denominator()), (5, 10));
        assert_eq!(t.state(), TaskState::Working);
    }

    #[test]
    fn exception_routing_depends_on_negotiation() {
        let exception = Packet::response(
            Command::WorkException,
            vec![b"H:x:5".to_vec(), b"boom".to_vec()],
        )
        .unwrap();

        let mut negotiated = task(Command::SubmitJob);
        negotiated.apply(&created(b"H:x:5"), true, false).unwrap();
        assert_eq!(negotiated.apply(&exception, true, false).unwrap(), Fired::Exception);
        assert_eq!(negotiated.state(), TaskState::Exception);
        assert_eq!(negotiated.exception(), b"boom");

        let mut plain = task(Command::SubmitJob);
        plain.apply(&created(b"H:x:5"), false, false).unwrap();
        assert_eq!(plain.apply(&exception, false, false).unwrap(), Fired::Data);
        assert_eq!(plain.state(), TaskState::Working);
        assert_eq!(plain.result(), b"boom");
    }

    #[test]
    fn unbuffered_chunks_are_not_accumulated() {
        let mut t = task(Command::SubmitJob);
        t.apply(&created(b"H:x:6"), false, true).unwrap();
        let data = Packet::response(
            Command::WorkData,
            vec![b"H:x:6".to_vec(), b"chunk".to_vec()],
        )
        .unwrap();
        t.apply(&data, false, true).unwrap();
        assert_eq!(t.data(), b"chunk");
        assert!(t.result().is_empty());
    }

    #[test]
    fn status_res_terminates_status_tasks() {
        let mut t = task(Command::GetStatus);
        let res = Packet::response(
            Command::StatusRes,
            vec![
                b"H:x:7".to_vec(),
                b"1".to_vec(),
                b"1".to_vec(),
                b"3".to_vec(),
                b"4".to_vec(),
            ],
        )
        .unwrap();
        assert_eq!(t.apply(&res, false, false).unwrap(), Fired::StatusTerminal);
        assert!(t.known());
        assert!(t.running());
        assert_eq!((t.numerator(), t.denominator()), (3, 4));
        assert_eq!(t.state(), TaskState::Complete);
    }

    #[test]
    fn ascii_u32_matches_atoi() {
        assert_eq!(ascii_u32(b"42"), 42);
        assert_eq!(ascii_u32(b"42x"), 42);
        assert_eq!(ascii_u32(b""), 0);
        assert_eq!(ascii_u32(b"x42"), 0);
        assert_eq!(ascii_u32(b"99999999999999999999"), u32::MAX);
    }
}
