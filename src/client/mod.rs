//! The task-multiplexing engine: owns connections and tasks, drives every
//! task to a terminal state over shared non-blocking connections.

mod options;
mod poll;
mod utils;

pub use options::ClientOptions;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::conn::{Connection, Connector, Delivery, PumpOutcome, TcpConnector};
use crate::error::Error;
use crate::proto::{self, Command, Packet, Priority, Schedule, UniqueId};
use crate::task::{Fired, Task, TaskEvents, TaskHandle, TaskState};

/// Engine phase, mostly of diagnostic interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    /// Not inside `run_tasks`.
    Idle,
    /// Assigning new tasks to connections.
    New,
    /// Waiting for readiness to flush or receive.
    Submit,
    /// Pumping connections and dispatching packets.
    Packet,
}

struct Slot {
    generation: u32,
    task: Option<Task>,
}

/// A Gearman client: submits tasks to one or more job servers and drives
/// them through callbacks to completion.
///
/// # Connecting
///
/// Register servers with [`add_server`](Client::add_server) using
/// `tcp://host[:port]` addresses (port defaults to 4730), or use
/// [`Client::from_env`] to honor the `GEARMAN_PROVIDER` / `GEARMAN_URL`
/// environment variables. Connections are brought up lazily on first
/// submission and reconnected with exponential backoff after failures.
///
/// # Submitting and running
///
/// Every `add_task*` flavor queues a task and returns a [`TaskHandle`]
/// immediately; nothing touches the network until
/// [`run_tasks`](Client::run_tasks) is called. `run_tasks` multiplexes all
/// pending tasks over the registered connections and invokes each task's
/// [`TaskEvents`] callbacks synchronously on the calling thread, returning
/// once every task is terminal (or, in non-blocking mode, with
/// [`Error::IoWait`] as soon as nothing can advance without waiting).
///
/// ```no_run
/// use gearman_client::{Callbacks, Client};
///
/// # fn main() -> Result<(), gearman_client::Error> {
/// let mut client = Client::new();
/// client.add_server("tcp://localhost:4730")?;
/// client.add_task(
///     "reverse",
///     None,
///     Some(&b"hello"[..]),
///     Callbacks::new().on_complete(|t| {
///         println!("{}", String::from_utf8_lossy(t.result()));
///         Ok(())
///     }),
/// )?;
/// client.run_tasks()?;
/// # Ok(())
/// # }
/// ```
///
/// A `Client` stays on one thread; run one per thread. Multiple clients
/// share nothing and may run concurrently.
pub struct Client<C: Connector = TcpConnector> {
    connector: C,
    conns: Vec<Connection<C::Stream>>,
    /// Round-robin cursor: the connection after the last-chosen one is
    /// preferred for the next assignment.
    next_conn: usize,
    slots: Vec<Slot>,
    free: Vec<usize>,
    new_tasks: u32,
    running_tasks: u32,
    task_count: u32,
    state: EngineState,
    namespace: Option<Vec<u8>>,
    options: ClientOptions,
    exceptions_negotiated: bool,
    timeout: Option<Duration>,
    /// Client-wide callback set, observing every task after its own sink.
    default_events: Option<Rc<RefCell<Box<dyn TaskEvents>>>>,
    /// Set once a fatal error has been observed; submissions then fail
    /// fast until the client is dropped.
    last_fatal: Option<String>,
}

impl Client<TcpConnector> {
    /// A client over plain TCP with no servers registered yet.
    pub fn new() -> Client<TcpConnector> {
        Client::with_connector(TcpConnector)
    }

    /// A client configured from the environment: the server address from
    /// `GEARMAN_PROVIDER`/`GEARMAN_URL` (default `tcp://localhost:4730`)
    /// and the namespace from `GEARMAN_NAMESPACE` when set.
    pub fn from_env() -> Result<Client<TcpConnector>, Error> {
        let mut client = Client::new();
        client.add_server(&utils::get_env_url())?;
        if let Some(ns) = utils::env_namespace() {
            client.set_namespace(ns);
        }
        Ok(client)
    }
}

impl Default for Client<TcpConnector> {
    fn default() -> Self {
        Client::new()
    }
}

impl<C: Connector> Client<C> {
    /// A client that opens its streams through `connector` instead of
    /// plain TCP.
    pub fn with_connector(connector: C) -> Client<C> {
        Client {
            connector,
            conns: Vec::new(),
            next_conn: 0,
            slots: Vec::new(),
            free: Vec::new(),
            new_tasks: 0,
            running_tasks: 0,
            task_count: 0,
            state: EngineState::Idle,
            namespace: None,
            options: ClientOptions::default(),
            exceptions_negotiated: false,
            timeout: None,
            default_events: None,
            last_fatal: None,
        }
    }

    /// Register a job server. Tasks are spread over registered servers
    /// round-robin.
    pub fn add_server(&mut self, url: &str) -> Result<(), Error> {
        let (host, port) = utils::parse_server(url)?;
        debug!(host = %host, port, "registered server");
        self.conns.push(Connection::new(host, port));
        Ok(())
    }

    /// Register several job servers at once.
    pub fn add_servers<'a, I>(&mut self, urls: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for url in urls {
            self.add_server(url)?;
        }
        Ok(())
    }

    /// Prefix every function and reducer name sent to the server with
    /// `namespace`. Job handles and unique ids are not affected, and
    /// callbacks observe the un-prefixed names.
    pub fn set_namespace(&mut self, namespace: impl Into<Vec<u8>>) {
        let ns = namespace.into();
        self.namespace = if ns.is_empty() { None } else { Some(ns) };
    }

    /// The configured namespace, if any.
    pub fn namespace(&self) -> Option<&[u8]> {
        self.namespace.as_deref()
    }

    /// Bound every [`wait`](Client::wait) (and the blocking portions of
    /// [`run_tasks`](Client::run_tasks)) by `timeout`. `None`, the
    /// default, waits indefinitely.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Current behavioral options.
    pub fn options(&self) -> ClientOptions {
        self.options
    }

    /// Replace the behavioral options wholesale.
    pub fn set_options(&mut self, options: ClientOptions) {
        self.options = options;
    }

    /// Toggle non-blocking mode; see [`ClientOptions::non_blocking`].
    pub fn set_non_blocking(&mut self, non_blocking: bool) {
        self.options.non_blocking = non_blocking;
    }

    /// Install a client-wide callback set. It observes every task's events
    /// after the task's own sink has run; tasks submitted with `()` get
    /// exactly this set. An error returned here stops dispatch to the
    /// affected task like a per-task callback error does.
    pub fn set_callbacks(&mut self, events: impl TaskEvents + 'static) {
        self.default_events = Some(Rc::new(RefCell::new(Box::new(events))));
    }

    /// Whether the `exceptions` server option has been negotiated, which
    /// routes `WORK_EXCEPTION` to the exception callback and makes it
    /// terminal.
    pub fn exceptions_negotiated(&self) -> bool {
        self.exceptions_negotiated
    }

    /// Tasks accepted but not yet handed to a connection.
    pub fn new_tasks(&self) -> u32 {
        self.new_tasks
    }

    /// Tasks not yet in a terminal state.
    pub fn running_tasks(&self) -> u32 {
        self.running_tasks
    }

    /// Tasks currently allocated, terminal ones included until freed.
    pub fn task_count(&self) -> u32 {
        self.task_count
    }

    /// Rendering of the fatal error that degraded this client, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_fatal.as_deref()
    }

    /// Look up a task by handle. `None` for stale handles (freed or
    /// reclaimed tasks).
    pub fn task(&self, handle: TaskHandle) -> Option<&Task> {
        self.slot_index(handle).and_then(|i| self.slots[i].task.as_ref())
    }

    /// Release a task and invalidate its handle. Freeing a task that is
    /// still running abandons it: packets that later arrive for it are
    /// dropped.
    pub fn free_task(&mut self, handle: TaskHandle) -> Result<(), Error> {
        let Some(i) = self.slot_index(handle) else {
            return Err(Error::invalid("stale task handle"));
        };
        if let Some(task) = self.slots[i].task.as_ref() {
            if !task.state().is_terminal() {
                self.running_tasks = self.running_tasks.saturating_sub(1);
                if task.state() == TaskState::New {
                    self.new_tasks = self.new_tasks.saturating_sub(1);
                }
            }
        }
        self.free_slot(handle);
        Ok(())
    }

    // ------------------------------------------------------------------
    // submission surface
    // ------------------------------------------------------------------

    /// Submit a foreground job at normal priority.
    ///
    /// `unique` deduplicates concurrent submissions server-side; pass
    /// `None` to have a random UUID generated. `workload` is `None` for
    /// no payload; an empty non-`None` workload is rejected as invalid.
    pub fn add_task(
        &mut self,
        function: impl AsRef<[u8]>,
        unique: Option<&[u8]>,
        workload: Option<&[u8]>,
        events: impl TaskEvents + 'static,
    ) -> Result<TaskHandle, Error> {
        self.add_submit_priority(Priority::Normal, false, function.as_ref(), unique, workload, events)
    }

    /// Submit a foreground job served before normal-priority work.
    pub fn add_task_high(
        &mut self,
        function: impl AsRef<[u8]>,
        unique: Option<&[u8]>,
        workload: Option<&[u8]>,
        events: impl TaskEvents + 'static,
    ) -> Result<TaskHandle, Error> {
        self.add_submit_priority(Priority::High, false, function.as_ref(), unique, workload, events)
    }

    /// Submit a foreground job served after normal-priority work.
    pub fn add_task_low(
        &mut self,
        function: impl AsRef<[u8]>,
        unique: Option<&[u8]>,
        workload: Option<&[u8]>,
        events: impl TaskEvents + 'static,
    ) -> Result<TaskHandle, Error> {
        self.add_submit_priority(Priority::Low, false, function.as_ref(), unique, workload, events)
    }

    /// Submit a background job: the task terminates at
    /// [`TaskState::Created`] once the server acknowledges it, and no
    /// work traffic is delivered.
    pub fn add_task_background(
        &mut self,
        function: impl AsRef<[u8]>,
        unique: Option<&[u8]>,
        workload: Option<&[u8]>,
        events: impl TaskEvents + 'static,
    ) -> Result<TaskHandle, Error> {
        self.add_submit_priority(Priority::Normal, true, function.as_ref(), unique, workload, events)
    }

    /// Submit a high-priority background job.
    pub fn add_task_high_background(
        &mut self,
        function: impl AsRef<[u8]>,
        unique: Option<&[u8]>,
        workload: Option<&[u8]>,
        events: impl TaskEvents + 'static,
    ) -> Result<TaskHandle, Error> {
        self.add_submit_priority(Priority::High, true, function.as_ref(), unique, workload, events)
    }

    /// Submit a low-priority background job.
    pub fn add_task_low_background(
        &mut self,
        function: impl AsRef<[u8]>,
        unique: Option<&[u8]>,
        workload: Option<&[u8]>,
        events: impl TaskEvents + 'static,
    ) -> Result<TaskHandle, Error> {
        self.add_submit_priority(Priority::Low, true, function.as_ref(), unique, workload, events)
    }

    /// Submit a background job to run at `when`, an absolute UNIX time in
    /// seconds. The value is transmitted as-is; the server decides how to
    /// treat times in the past.
    pub fn add_task_epoch(
        &mut self,
        function: impl AsRef<[u8]>,
        unique: Option<&[u8]>,
        workload: Option<&[u8]>,
        when: u64,
        events: impl TaskEvents + 'static,
    ) -> Result<TaskHandle, Error> {
        self.add_submit(
            Command::SubmitJobEpoch,
            function.as_ref(),
            unique,
            workload,
            None,
            Some(when),
            None,
            Box::new(events),
        )
    }

    /// Submit a background job to run on a cron-style [`Schedule`].
    pub fn add_task_sched(
        &mut self,
        function: impl AsRef<[u8]>,
        unique: Option<&[u8]>,
        workload: Option<&[u8]>,
        schedule: Schedule,
        events: impl TaskEvents + 'static,
    ) -> Result<TaskHandle, Error> {
        self.add_submit(
            Command::SubmitJobSched,
            function.as_ref(),
            unique,
            workload,
            None,
            None,
            Some(schedule),
            Box::new(events),
        )
    }

    /// Submit a foreground job whose partial results the server aggregates
    /// through `reducer`. Both names are namespace-prefixed; the workload
    /// must be non-empty.
    pub fn add_reducer_task(
        &mut self,
        function: impl AsRef<[u8]>,
        reducer: impl AsRef<[u8]>,
        unique: Option<&[u8]>,
        workload: Option<&[u8]>,
        events: impl TaskEvents + 'static,
    ) -> Result<TaskHandle, Error> {
        self.add_reduce(Command::SubmitReduceJob, function.as_ref(), reducer.as_ref(), unique, workload, Box::new(events))
    }

    /// Background variant of [`add_reducer_task`](Client::add_reducer_task).
    pub fn add_reducer_task_background(
        &mut self,
        function: impl AsRef<[u8]>,
        reducer: impl AsRef<[u8]>,
        unique: Option<&[u8]>,
        workload: Option<&[u8]>,
        events: impl TaskEvents + 'static,
    ) -> Result<TaskHandle, Error> {
        self.add_reduce(Command::SubmitReduceJobBg, function.as_ref(), reducer.as_ref(), unique, workload, Box::new(events))
    }

    /// Ask a server about a background job. The task completes once
    /// `STATUS_RES` arrives, with the answer in the task's `known`,
    /// `running`, `numerator` and `denominator` accessors (the status
    /// callback fires as well).
    pub fn add_task_status(
        &mut self,
        job_handle: impl AsRef<[u8]>,
        events: impl TaskEvents + 'static,
    ) -> Result<TaskHandle, Error> {
        let handle = job_handle.as_ref();
        if handle.is_empty() {
            return Err(Error::invalid("job handle must not be empty"));
        }
        self.check_degraded()?;
        let th = self.add_auxiliary(Command::GetStatus, handle.to_vec(), None, Box::new(events))?;
        if let Some(task) = self.task_mut_checked(th) {
            task.job_handle = handle.to_vec();
        }
        Ok(th)
    }

    /// Round-trip `payload` through the server's echo facility. Blocks
    /// until the reply arrives; also drives any other pending tasks.
    pub fn echo(&mut self, payload: &[u8]) -> Result<(), Error> {
        use std::cell::Cell;

        self.check_degraded()?;
        let matched = Rc::new(Cell::new(false));
        let seen = Rc::clone(&matched);
        let expect = payload.to_vec();
        let events = crate::task::Callbacks::new().on_complete(move |t: &Task| {
            seen.set(t.result() == expect);
            Ok(())
        });
        let th =
            self.add_auxiliary(Command::EchoReq, payload.to_vec(), None, Box::new(events))?;
        let run = self.run_engine(Some(th), true);
        let task_error = self.task_mut_checked(th).and_then(|t| t.error.take());
        if self.slot_index(th).is_some() {
            self.free_task(th)?;
        }
        run?;
        if let Some(e) = task_error {
            return Err(e);
        }
        if matched.get() {
            Ok(())
        } else {
            Err(crate::error::Protocol::Unexpected { command: Command::EchoRes }.into())
        }
    }

    /// Negotiate a connection option with every registered server, e.g.
    /// `"exceptions"` to opt into exception routing. Blocks until each
    /// server acknowledges; also drives any other pending tasks.
    pub fn set_server_option(&mut self, option: &str) -> Result<(), Error> {
        if option.is_empty() {
            return Err(Error::invalid("option name must not be empty"));
        }
        self.check_degraded()?;
        if self.conns.is_empty() {
            return Err(Error::CouldNotConnect);
        }
        let mut handles = Vec::with_capacity(self.conns.len());
        for i in 0..self.conns.len() {
            handles.push(self.add_auxiliary(
                Command::OptionReq,
                option.as_bytes().to_vec(),
                Some(i),
                Box::new(()),
            )?);
        }
        for th in handles {
            let run = self.run_engine(Some(th), true);
            let task_error = self.task_mut_checked(th).and_then(|t| t.error.take());
            if self.slot_index(th).is_some() {
                self.free_task(th)?;
            }
            run?;
            if let Some(e) = task_error {
                return Err(e);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // the engine
    // ------------------------------------------------------------------

    /// Drive every pending task until it is terminal.
    ///
    /// Callbacks fire synchronously on this thread, in the order their
    /// packets are parsed. In blocking mode (the default) this returns
    /// `Ok(())` once all tasks are terminal; with
    /// [`ClientOptions::non_blocking`] set it returns [`Error::IoWait`]
    /// as soon as no task can advance without waiting. Calling this with
    /// no pending tasks is a no-op.
    pub fn run_tasks(&mut self) -> Result<(), Error> {
        self.run_engine(None, false)
    }

    /// Block until any connection becomes ready, bounded by the configured
    /// timeout. The non-blocking counterpart to letting
    /// [`run_tasks`](Client::run_tasks) wait internally.
    pub fn wait(&mut self) -> Result<(), Error> {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        self.wait_internal(deadline)
    }

    fn run_engine(&mut self, until: Option<TaskHandle>, force_blocking: bool) -> Result<(), Error> {
        let blocking = force_blocking || !self.options.non_blocking;
        let deadline = self.timeout.map(|t| Instant::now() + t);

        let result = loop {
            self.state = EngineState::New;
            if let Err(e) = self.drain_new() {
                break Err(e);
            }
            if self.finished(until) {
                break Ok(());
            }

            self.state = EngineState::Packet;
            let progressed = match self.pump_ready() {
                Ok(p) => p,
                Err(e) => break Err(e),
            };
            if self.finished(until) {
                break Ok(());
            }
            if progressed {
                continue;
            }

            if !blocking {
                break Err(Error::IoWait);
            }
            self.state = EngineState::Submit;
            if let Err(e) = self.wait_internal(deadline) {
                break Err(e);
            }
        };
        self.state = EngineState::Idle;
        result
    }

    fn finished(&self, until: Option<TaskHandle>) -> bool {
        match until {
            Some(th) => self.task(th).map_or(true, |t| t.state().is_terminal()),
            None => self.running_tasks == 0,
        }
    }

    /// Hand every task still in `New` to a connection, round-robin.
    fn drain_new(&mut self) -> Result<(), Error> {
        loop {
            let next = self.slots.iter().enumerate().find_map(|(i, s)| {
                s.task
                    .as_ref()
                    .filter(|t| t.state() == TaskState::New)
                    .map(|_| TaskHandle { index: i as u32, generation: s.generation })
            });
            let Some(th) = next else { return Ok(()) };

            let pinned = self.task(th).and_then(|t| t.conn);
            let conn_idx = match pinned {
                Some(i) => {
                    if !self.conns[i].usable(Instant::now()) {
                        // Wait out the backoff; the engine's wait wakes us.
                        return Ok(());
                    }
                    match self.conns[i].ensure_connected(&self.connector) {
                        Ok(()) => Some(i),
                        Err(_) => {
                            self.fail_task(th, Error::CouldNotConnect);
                            continue;
                        }
                    }
                }
                None => self.pick_conn()?,
            };
            let Some(ci) = conn_idx else {
                // Every connection is backing off; retry after the wait.
                return Ok(());
            };

            let Some((bytes, command)) =
                self.task(th).map(|t| (t.request.clone(), t.command))
            else {
                continue;
            };
            self.conns[ci].enqueue(bytes, Some(th), command);
            if let Some(task) = self.task_mut_checked(th) {
                task.state = TaskState::Submit;
                task.conn = Some(ci);
            }
            self.new_tasks = self.new_tasks.saturating_sub(1);
            trace!(conn = ci, ?command, "assigned task");
        }
    }

    /// Choose the next usable connection after the round-robin cursor,
    /// connecting on demand. `Ok(None)` means every connection is backing
    /// off and the caller should wait; `CouldNotConnect` means every
    /// candidate was tried and refused.
    fn pick_conn(&mut self) -> Result<Option<usize>, Error> {
        if self.conns.is_empty() {
            return Err(Error::CouldNotConnect);
        }
        let now = Instant::now();
        let n = self.conns.len();
        let mut candidates = 0;
        let mut refused = 0;
        for k in 0..n {
            let i = (self.next_conn + k) % n;
            if !self.conns[i].usable(now) {
                continue;
            }
            candidates += 1;
            match self.conns[i].ensure_connected(&self.connector) {
                Ok(()) => {
                    self.next_conn = (i + 1) % n;
                    return Ok(Some(i));
                }
                Err(_) => refused += 1,
            }
        }
        if candidates > 0 && refused == candidates {
            Err(Error::CouldNotConnect)
        } else {
            Ok(None)
        }
    }

    /// Level-triggered check: pump whatever is ready right now.
    fn pump_ready(&mut self) -> Result<bool, Error> {
        let (interests, index_map) = self.interests();
        if interests.is_empty() {
            return Ok(false);
        }
        let ready = poll::wait(&interests, Some(Duration::ZERO))?;
        let mut progressed = false;
        for (k, readiness) in ready.iter().enumerate() {
            if !readiness.readable && !readiness.writable {
                continue;
            }
            let i = index_map[k];
            let exceptions = self.exceptions_negotiated;
            match self.conns[i].pump(readiness.readable, readiness.writable, exceptions) {
                Ok(outcome) => {
                    if outcome.io || !outcome.sent.is_empty() || !outcome.deliveries.is_empty() {
                        progressed = true;
                    }
                    self.apply_outcome(i, outcome)?;
                }
                Err(e) => {
                    progressed = true;
                    self.handle_conn_failure(i, e);
                }
            }
        }
        Ok(progressed)
    }

    fn apply_outcome(&mut self, conn_idx: usize, outcome: PumpOutcome) -> Result<(), Error> {
        for th in outcome.sent {
            self.mark_sent(th);
        }
        for delivery in outcome.deliveries {
            match delivery {
                Delivery::Task { task, packet } => self.deliver(conn_idx, task, packet),
                Delivery::ClientError { code, text } => {
                    let err = Error::Server {
                        code: String::from_utf8_lossy(&code).into_owned(),
                        text: String::from_utf8_lossy(&text).into_owned(),
                    };
                    warn!(error = %err, "server error not attributable to a task");
                    self.last_fatal = Some(err.to_string());
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Apply one packet to its task and fire the matching callback.
    fn deliver(&mut self, conn_idx: usize, th: TaskHandle, packet: Packet) {
        let exceptions = self.exceptions_negotiated;
        let unbuffered = self.options.unbuffered_result;
        let option_ack = (packet.command == Command::OptionRes)
            .then(|| packet.arg(0).to_vec());

        let Some(task) = self.task_mut_checked(th) else {
            trace!(command = ?packet.command, "dropping packet for reclaimed task");
            return;
        };
        let fired = match task.apply(&packet, exceptions, unbuffered) {
            Ok(fired) => fired,
            Err(e) => {
                // Misrouted or state-inconsistent response: reset the
                // connection it came from.
                warn!(error = %e, "resetting connection after protocol violation");
                self.handle_conn_failure(conn_idx, e);
                return;
            }
        };
        if let Some(option) = option_ack {
            if option == b"exceptions" {
                debug!("exception routing negotiated");
                self.exceptions_negotiated = true;
            }
        }
        self.fire_events(th, fired);
        self.finalize_if_terminal(th);
    }

    /// Invoke the callbacks matching `fired` (per-task sink first, then
    /// the client-wide set), honoring the per-task dispatch-stop after a
    /// callback error.
    fn fire_events(&mut self, th: TaskHandle, fired: Fired) {
        if fired == Fired::None {
            return;
        }
        let shared = self.default_events.clone();
        let Some(task) = self.task_mut_checked(th) else { return };
        if task.events_failed {
            return;
        }
        let mut events = task.events.take();
        let t: &Task = task;
        let mut result = Ok(());
        if let Some(ev) = events.as_mut() {
            result = dispatch_event(&mut **ev, t, fired);
        }
        if result.is_ok() {
            if let Some(shared) = shared.as_ref() {
                let mut guard = shared.borrow_mut();
                result = dispatch_event(&mut **guard, t, fired);
            }
        }
        task.events = events;
        if let Err(e) = result {
            debug!(error = %e, "callback returned an error; stopping dispatch to task");
            task.events_failed = true;
            let rendered = e.to_string();
            if task.error.is_none() {
                task.error = Some(e);
            }
            // Graceful shutdown: refuse new submissions, let the rest of
            // the in-flight tasks complete.
            self.last_fatal = Some(rendered);
        }
    }

    fn mark_sent(&mut self, th: TaskHandle) {
        if let Some(task) = self.task_mut_checked(th) {
            if task.state() == TaskState::Submit && task.command().is_submit() {
                task.state = TaskState::WaitJobCreated;
            }
        }
    }

    fn finalize_if_terminal(&mut self, th: TaskHandle) {
        let Some(task) = self.task_mut_checked(th) else { return };
        if !task.state().is_terminal() || task.finalized {
            return;
        }
        task.finalized = true;
        self.running_tasks = self.running_tasks.saturating_sub(1);
        if self.options.free_tasks {
            self.free_slot(th);
        }
    }

    /// Fail a task out-of-band and run its failure callback.
    fn fail_task(&mut self, th: TaskHandle, error: Error) {
        let fired = match self.task_mut_checked(th) {
            Some(task) => task.fail_with(error),
            None => return,
        };
        self.fire_events(th, fired);
        self.finalize_if_terminal(th);
    }

    /// Tear down a failed connection: sent tasks are lost, unsent ones go
    /// back to the submission queue for another connection.
    fn handle_conn_failure(&mut self, conn_idx: usize, error: Error) {
        let server = self.conns[conn_idx].server();
        warn!(server = %server, error = %error, "connection failure");
        let report = self.conns[conn_idx].fail();

        for th in report.lost {
            self.fail_task(th, Error::LostConnection { server: server.clone() });
        }
        for out in report.unsent {
            let Some(th) = out.task else { continue };
            let Some(task) = self.task_mut_checked(th) else { continue };
            if task.state().is_terminal() {
                continue;
            }
            task.state = TaskState::New;
            if task.command().is_submit() {
                task.conn = None;
            }
            self.new_tasks += 1;
            debug!(server = %server, "requeued unsent task");
        }
    }

    fn wait_internal(&mut self, deadline: Option<Instant>) -> Result<(), Error> {
        let now = Instant::now();
        let retry_wake = self.conns.iter().filter_map(|c| c.retry_at()).min();

        let mut timeout = deadline.map(|d| d.saturating_duration_since(now));
        if let Some(at) = retry_wake {
            let until = at.saturating_duration_since(now);
            timeout = Some(timeout.map_or(until, |t| t.min(until)));
        }

        let (interests, _) = self.interests();
        if interests.is_empty() && timeout.is_none() {
            // Nothing to wait on and no timer that could change that.
            return Err(Error::Timeout);
        }

        let ready = poll::wait(&interests, timeout)?;
        if ready.iter().any(|r| r.readable || r.writable) {
            return Ok(());
        }
        if retry_wake.map_or(false, |at| at <= Instant::now()) {
            // Woke to retry a backed-off connection: that is progress.
            return Ok(());
        }
        Err(Error::Timeout)
    }

    fn interests(&self) -> (Vec<poll::Interest>, Vec<usize>) {
        let mut interests = Vec::new();
        let mut index_map = Vec::new();
        for (i, conn) in self.conns.iter().enumerate() {
            let (read, write) = (conn.wants_read(), conn.wants_write());
            if !read && !write {
                continue;
            }
            if let Some(fd) = conn.raw_fd() {
                interests.push(poll::Interest { fd, read, write });
                index_map.push(i);
            }
        }
        (interests, index_map)
    }

    // ------------------------------------------------------------------
    // task arena
    // ------------------------------------------------------------------

    fn slot_index(&self, handle: TaskHandle) -> Option<usize> {
        let i = handle.index as usize;
        let slot = self.slots.get(i)?;
        (slot.generation == handle.generation && slot.task.is_some()).then_some(i)
    }

    fn task_mut_checked(&mut self, handle: TaskHandle) -> Option<&mut Task> {
        let i = self.slot_index(handle)?;
        self.slots[i].task.as_mut()
    }

    fn free_slot(&mut self, handle: TaskHandle) {
        if let Some(i) = self.slot_index(handle) {
            self.slots[i].task = None;
            self.slots[i].generation = self.slots[i].generation.wrapping_add(1);
            self.free.push(i);
            self.task_count = self.task_count.saturating_sub(1);
        }
    }

    fn insert_task(&mut self, task: Task) -> TaskHandle {
        self.new_tasks += 1;
        self.running_tasks += 1;
        self.task_count += 1;
        match self.free.pop() {
            Some(i) => {
                self.slots[i].task = Some(task);
                TaskHandle { index: i as u32, generation: self.slots[i].generation }
            }
            None => {
                self.slots.push(Slot { generation: 0, task: Some(task) });
                TaskHandle { index: (self.slots.len() - 1) as u32, generation: 0 }
            }
        }
    }

    // ------------------------------------------------------------------
    // packet building
    // ------------------------------------------------------------------

    fn check_degraded(&self) -> Result<(), Error> {
        match &self.last_fatal {
            Some(cause) => Err(Error::Degraded { cause: cause.clone() }),
            None => Ok(()),
        }
    }

    fn add_submit_priority(
        &mut self,
        priority: Priority,
        background: bool,
        function: &[u8],
        unique: Option<&[u8]>,
        workload: Option<&[u8]>,
        events: impl TaskEvents + 'static,
    ) -> Result<TaskHandle, Error> {
        self.add_submit(
            priority.submit_command(background),
            function,
            unique,
            workload,
            None,
            None,
            None,
            Box::new(events),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn add_submit(
        &mut self,
        command: Command,
        function: &[u8],
        unique: Option<&[u8]>,
        workload: Option<&[u8]>,
        reducer: Option<&[u8]>,
        when: Option<u64>,
        schedule: Option<Schedule>,
        events: Box<dyn TaskEvents>,
    ) -> Result<TaskHandle, Error> {
        self.check_degraded()?;
        if function.is_empty() {
            return Err(Error::invalid("function name must not be empty"));
        }
        let workload = check_workload(workload)?;
        let unique = UniqueId::resolve(unique)?;

        let ns = self.namespace.as_deref();
        let wire_function = proto::namespaced(ns, function);
        let namespace_len = wire_function.len() - function.len();

        let mut args: Vec<Vec<u8>> =
            vec![wire_function.clone(), unique.as_bytes().to_vec()];
        match command {
            Command::SubmitJobEpoch => {
                let when = when.unwrap_or(0);
                args.push(when.to_string().into_bytes());
                args.push(workload.clone());
            }
            Command::SubmitJobSched => {
                let schedule = schedule.unwrap_or_default();
                args.extend(schedule.wire_args()?);
                args.push(workload.clone());
            }
            Command::SubmitReduceJob | Command::SubmitReduceJobBg => {
                let reducer = reducer.unwrap_or_default();
                args.push(proto::namespaced(ns, reducer));
                // Aggregate placeholder: a lone NUL on the wire.
                args.push(Vec::new());
                args.push(workload.clone());
            }
            _ => args.push(workload.clone()),
        }

        let request = Packet::request(command, args)?.encode()?;
        let task =
            Task::new(unique, wire_function, namespace_len, workload, command, request, events);
        Ok(self.insert_task(task))
    }

    fn add_reduce(
        &mut self,
        command: Command,
        function: &[u8],
        reducer: &[u8],
        unique: Option<&[u8]>,
        workload: Option<&[u8]>,
        events: Box<dyn TaskEvents>,
    ) -> Result<TaskHandle, Error> {
        if reducer.is_empty() {
            return Err(Error::invalid("reducer name must not be empty"));
        }
        match workload {
            Some(w) if !w.is_empty() => {}
            _ => return Err(Error::invalid("reduce submission requires a workload")),
        }
        self.add_submit(command, function, unique, workload, Some(reducer), None, None, events)
    }

    /// A request/response task outside the submit family: `GET_STATUS`,
    /// `OPTION_REQ` or `ECHO_REQ`. `pinned` binds it to one connection.
    fn add_auxiliary(
        &mut self,
        command: Command,
        arg: Vec<u8>,
        pinned: Option<usize>,
        events: Box<dyn TaskEvents>,
    ) -> Result<TaskHandle, Error> {
        let request = Packet::request(command, vec![arg.clone()])?.encode()?;
        let mut task =
            Task::new(UniqueId::random(), Vec::new(), 0, arg, command, request, events);
        task.conn = pinned;
        Ok(self.insert_task(task))
    }
}

impl<C: Connector> std::fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("servers", &self.conns.len())
            .field("state", &self.state)
            .field("new_tasks", &self.new_tasks)
            .field("running_tasks", &self.running_tasks)
            .field("task_count", &self.task_count)
            .finish_non_exhaustive()
    }
}

/// The (length, backing) consistency check on workloads: an empty-but-backed
/// workload is caller confusion and rejected up front.
fn check_workload(workload: Option<&[u8]>) -> Result<Vec<u8>, Error> {
    match workload {
        Some(w) if w.is_empty() => Err(Error::invalid("invalid workload")),
        Some(w) => Ok(w.to_vec()),
        None => Ok(Vec::new()),
    }
}

/// Route one fired event to the matching [`TaskEvents`] method.
fn dispatch_event(ev: &mut dyn TaskEvents, t: &Task, fired: Fired) -> Result<(), Error> {
    match fired {
        Fired::Created | Fired::CreatedTerminal => ev.on_created(t),
        Fired::Status | Fired::StatusTerminal => ev.on_status(t),
        Fired::Data => ev.on_data(t, t.data()),
        Fired::Warning => ev.on_warning(t, t.data()),
        Fired::Complete => ev.on_complete(t),
        Fired::Fail => ev.on_fail(t),
        Fired::Exception => ev.on_exception(t, t.exception()),
        Fired::None => Ok(()),
    }
}
