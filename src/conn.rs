//! A single server connection: non-blocking stream, packet queues and the
//! per-connection state machine.

use std::collections::{HashMap, VecDeque};
use std::io::{self, IoSlice, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::{Error, Protocol};
use crate::proto::{self, Command, Decoded, Packet};
use crate::task::TaskHandle;

/// How much to read per readiness signal. One bounded chunk per pump keeps
/// a chatty connection from starving its siblings.
const READ_CHUNK: usize = 8 * 1024;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// A source of non-blocking byte streams to a Gearman server.
///
/// The engine never opens sockets itself; it asks its connector, which lets
/// tests substitute a different transport. Streams must be non-blocking and
/// expose a file descriptor for the readiness poll.
pub trait Connector {
    /// The stream type produced by this connector.
    type Stream: Read + Write + AsRawFd;

    /// Establish a new stream to `host:port`.
    fn connect(&self, host: &str, port: u16) -> io::Result<Self::Stream>;
}

/// The default connector: plain TCP with `TCP_NODELAY`, switched to
/// non-blocking before it is handed to the engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_nonblocking(true)?;
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "hostname resolved to no addresses")
        }))
    }
}

/// Connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    /// No socket; will connect on demand.
    Idle,
    /// Bring-up in progress.
    Connecting,
    /// Established; frames flow.
    Connected,
    /// Transport failed; reconnect after the backoff expires.
    Failed,
}

/// An encoded frame waiting in the send queue, tagged with the task it
/// belongs to so failure handling can find its owner.
pub(crate) struct Outbound {
    pub(crate) bytes: Vec<u8>,
    pub(crate) task: Option<TaskHandle>,
    pub(crate) command: Command,
}

/// A request that was fully written and is owed exactly one in-order
/// response.
struct InFlight {
    task: TaskHandle,
    command: Command,
}

/// Where an inbound packet ended up.
#[derive(Debug)]
pub(crate) enum Delivery {
    /// Addressed to a task; the engine applies it and fires callbacks.
    Task {
        task: TaskHandle,
        packet: Packet,
    },
    /// A server `ERROR` that no in-flight request accounts for.
    ClientError {
        code: Vec<u8>,
        text: Vec<u8>,
    },
}

/// Result of one `pump` call.
#[derive(Default, Debug)]
pub(crate) struct PumpOutcome {
    /// Tasks whose request frame finished writing during this pump.
    pub(crate) sent: Vec<TaskHandle>,
    /// Inbound packets, already correlated.
    pub(crate) deliveries: Vec<Delivery>,
    /// Whether any bytes moved, even without a completed frame; partial
    /// transfers still count as forward progress.
    pub(crate) io: bool,
}

/// Tasks affected by a connection failure, split by whether their request
/// bytes already left the queue.
pub(crate) struct FailureReport {
    /// In flight or partially written: these must be failed, the server may
    /// have seen them.
    pub(crate) lost: Vec<TaskHandle>,
    /// Never written: safe to resubmit on another connection.
    pub(crate) unsent: Vec<Outbound>,
}

pub(crate) struct Connection<S> {
    host: String,
    port: u16,
    stream: Option<S>,
    state: ConnState,
    sendq: VecDeque<Outbound>,
    /// Bytes of the queue head already written.
    write_pos: usize,
    recvbuf: Vec<u8>,
    /// Request/response pairs awaiting their in-order answer.
    in_flight: VecDeque<InFlight>,
    /// Foreground jobs by server handle, for `WORK_*` dispatch.
    assigned: HashMap<Vec<u8>, TaskHandle>,
    backoff: Duration,
    retry_at: Option<Instant>,
}

impl<S: Read + Write + AsRawFd> Connection<S> {
    pub(crate) fn new(host: String, port: u16) -> Connection<S> {
        Connection {
            host,
            port,
            stream: None,
            state: ConnState::Idle,
            sendq: VecDeque::new(),
            write_pos: 0,
            recvbuf: Vec::new(),
            in_flight: VecDeque::new(),
            assigned: HashMap::new(),
            backoff: BACKOFF_INITIAL,
            retry_at: None,
        }
    }

    /// `host:port`, for error reporting.
    pub(crate) fn server(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub(crate) fn state(&self) -> ConnState {
        self.state
    }

    /// Whether this connection can be chosen for new work right now.
    pub(crate) fn usable(&self, now: Instant) -> bool {
        match self.state {
            ConnState::Idle | ConnState::Connecting | ConnState::Connected => true,
            ConnState::Failed => self.retry_at.map_or(true, |at| at <= now),
        }
    }

    /// When a failed connection becomes eligible again.
    pub(crate) fn retry_at(&self) -> Option<Instant> {
        match self.state {
            ConnState::Failed => self.retry_at,
            _ => None,
        }
    }

    /// Establish the transport if there is none yet.
    pub(crate) fn ensure_connected<C>(&mut self, connector: &C) -> Result<(), Error>
    where
        C: Connector<Stream = S>,
    {
        match self.state {
            ConnState::Connected => return Ok(()),
            ConnState::Idle | ConnState::Connecting => {}
            ConnState::Failed => {
                let now = Instant::now();
                if !self.usable(now) {
                    return Err(Error::CouldNotConnect);
                }
            }
        }

        self.state = ConnState::Connecting;
        trace!(server = %self.server(), "connecting");
        match connector.connect(&self.host, self.port) {
            Ok(stream) => {
                debug!(server = %self.server(), "connected");
                self.stream = Some(stream);
                self.state = ConnState::Connected;
                self.backoff = BACKOFF_INITIAL;
                self.retry_at = None;
                Ok(())
            }
            Err(e) => {
                warn!(server = %self.server(), error = %e, "connect failed");
                self.mark_failed();
                Err(Error::Io(e))
            }
        }
    }

    /// Append a frame to the outbound FIFO.
    pub(crate) fn enqueue(&mut self, bytes: Vec<u8>, task: Option<TaskHandle>, command: Command) {
        trace!(server = %self.server(), ?command, len = bytes.len(), "enqueue");
        self.sendq.push_back(Outbound { bytes, task, command });
    }

    pub(crate) fn wants_write(&self) -> bool {
        self.state == ConnState::Connected && !self.sendq.is_empty()
    }

    pub(crate) fn wants_read(&self) -> bool {
        self.state == ConnState::Connected
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    /// Whether any request is still queued, in flight, or running as a
    /// foreground job.
    #[cfg(test)]
    pub(crate) fn has_outstanding(&self) -> bool {
        !self.in_flight.is_empty() || !self.assigned.is_empty() || !self.sendq.is_empty()
    }

    /// Advance the connection by one bounded unit of work per ready
    /// direction. An `Err` means the transport or the peer's framing is
    /// broken; the caller must invoke [`fail`](Connection::fail).
    pub(crate) fn pump(
        &mut self,
        readable: bool,
        writable: bool,
        exceptions_enabled: bool,
    ) -> Result<PumpOutcome, Error> {
        let mut outcome = PumpOutcome::default();
        if writable && self.wants_write() {
            self.flush(&mut outcome)?;
        }
        if readable && self.wants_read() {
            self.fill(&mut outcome, exceptions_enabled)?;
        }
        Ok(outcome)
    }

    /// Drain the send queue with a single gather write; partial writes
    /// advance the cursor without copying.
    fn flush(&mut self, outcome: &mut PumpOutcome) -> Result<(), Error> {
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Ok(()),
        };

        let mut slices = Vec::with_capacity(self.sendq.len());
        for (i, out) in self.sendq.iter().enumerate() {
            let bytes = if i == 0 { &out.bytes[self.write_pos..] } else { &out.bytes[..] };
            slices.push(IoSlice::new(bytes));
        }

        let mut n = match stream.write_vectored(&slices) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(Error::Io(e)),
        };
        trace!(server = %self.server(), wrote = n, "flushed");
        outcome.io |= n > 0;

        while n > 0 {
            let head_remaining = match self.sendq.front() {
                Some(head) => head.bytes.len() - self.write_pos,
                None => break,
            };
            if n < head_remaining {
                self.write_pos += n;
                break;
            }
            n -= head_remaining;
            self.write_pos = 0;
            if let Some(out) = self.sendq.pop_front() {
                if let Some(task) = out.task {
                    outcome.sent.push(task);
                    if out.command.expects_ordered_response() {
                        self.in_flight.push_back(InFlight { task, command: out.command });
                    }
                }
            }
        }
        Ok(())
    }

    /// Read one bounded chunk and decode every complete frame it yields.
    fn fill(&mut self, outcome: &mut PumpOutcome, exceptions_enabled: bool) -> Result<(), Error> {
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Ok(()),
        };

        let mut chunk = [0u8; READ_CHUNK];
        let n = match stream.read(&mut chunk) {
            Ok(0) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "server closed the connection",
                )));
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(Error::Io(e)),
        };
        self.recvbuf.extend_from_slice(&chunk[..n]);
        trace!(server = %self.server(), read = n, buffered = self.recvbuf.len(), "filled");
        outcome.io |= n > 0;

        let mut consumed_total = 0;
        while consumed_total < self.recvbuf.len() {
            match proto::decode(&self.recvbuf[consumed_total..])? {
                Decoded::NeedMore(_) => break,
                Decoded::Frame { packet, consumed } => {
                    consumed_total += consumed;
                    if let Some(delivery) = self.correlate(packet, exceptions_enabled)? {
                        outcome.deliveries.push(delivery);
                    }
                }
            }
        }
        self.recvbuf.drain(..consumed_total);
        Ok(())
    }

    /// Match an inbound packet to its task.
    ///
    /// `WORK_*` packets are addressed by job handle. Everything else is the
    /// in-order answer to the oldest in-flight request; the protocol
    /// guarantees response order matches request order on one connection,
    /// which is also what makes positional `JOB_CREATED` assignment sound.
    fn correlate(
        &mut self,
        packet: Packet,
        exceptions_enabled: bool,
    ) -> Result<Option<Delivery>, Error> {
        match packet.command {
            Command::JobCreated | Command::StatusRes | Command::OptionRes | Command::EchoRes => {
                let head = self.in_flight.pop_front().ok_or(Protocol::Unexpected {
                    command: packet.command,
                })?;
                let matches = match packet.command {
                    Command::JobCreated => head.command.is_submit(),
                    Command::StatusRes => head.command == Command::GetStatus,
                    Command::OptionRes => head.command == Command::OptionReq,
                    Command::EchoRes => head.command == Command::EchoReq,
                    _ => false,
                };
                if !matches {
                    return Err(Protocol::Unexpected { command: packet.command }.into());
                }
                if packet.command == Command::JobCreated && !head.command.is_background() {
                    self.assigned.insert(packet.arg(0).to_vec(), head.task);
                }
                Ok(Some(Delivery::Task { task: head.task, packet }))
            }
            Command::WorkStatus | Command::WorkData | Command::WorkWarning => {
                match self.assigned.get(packet.arg(0)) {
                    Some(&task) => Ok(Some(Delivery::Task { task, packet })),
                    None => {
                        warn!(
                            server = %self.server(),
                            handle = %String::from_utf8_lossy(packet.arg(0)),
                            command = ?packet.command,
                            "dropping packet for unknown job handle"
                        );
                        Ok(None)
                    }
                }
            }
            Command::WorkComplete | Command::WorkFail => {
                match self.assigned.remove(packet.arg(0)) {
                    Some(task) => Ok(Some(Delivery::Task { task, packet })),
                    None => {
                        warn!(
                            server = %self.server(),
                            handle = %String::from_utf8_lossy(packet.arg(0)),
                            command = ?packet.command,
                            "dropping terminal packet for unknown job handle"
                        );
                        Ok(None)
                    }
                }
            }
            Command::WorkException => {
                // Terminal only when the option was negotiated; otherwise
                // the job keeps running and stays assigned.
                let found = if exceptions_enabled {
                    self.assigned.remove(packet.arg(0))
                } else {
                    self.assigned.get(packet.arg(0)).copied()
                };
                match found {
                    Some(task) => Ok(Some(Delivery::Task { task, packet })),
                    None => {
                        warn!(
                            server = %self.server(),
                            handle = %String::from_utf8_lossy(packet.arg(0)),
                            "dropping exception for unknown job handle"
                        );
                        Ok(None)
                    }
                }
            }
            Command::Error => {
                let code = packet.arg(0).to_vec();
                let text = packet.arg(1).to_vec();
                match self.in_flight.pop_front() {
                    Some(head) => Ok(Some(Delivery::Task { task: head.task, packet })),
                    None => Ok(Some(Delivery::ClientError { code, text })),
                }
            }
            // The client never sends admin commands, so line-oriented
            // output (or any request-direction frame) is a peer bug.
            other => Err(Protocol::Unexpected { command: other }.into()),
        }
    }

    /// Tear down after a transport error, reporting which tasks were lost
    /// and which frames can be retried elsewhere.
    pub(crate) fn fail(&mut self) -> FailureReport {
        debug!(server = %self.server(), backoff = ?self.backoff, "connection failed");
        self.stream = None;
        self.recvbuf.clear();

        let mut lost: Vec<TaskHandle> =
            self.in_flight.drain(..).map(|p| p.task).collect();
        lost.extend(self.assigned.drain().map(|(_, task)| task));

        let mut unsent: Vec<Outbound> = Vec::with_capacity(self.sendq.len());
        let mut first = true;
        for out in self.sendq.drain(..) {
            // A partially written frame may still have reached the server
            // whole; resubmitting it could run the job twice.
            if first && self.write_pos > 0 {
                if let Some(task) = out.task {
                    lost.push(task);
                }
            } else {
                unsent.push(out);
            }
            first = false;
        }
        self.write_pos = 0;
        self.mark_failed();

        FailureReport { lost, unsent }
    }

    fn mark_failed(&mut self) {
        self.state = ConnState::Failed;
        self.stream = None;
        self.retry_at = Some(Instant::now() + self.backoff);
        self.backoff = (self.backoff * 2).min(BACKOFF_MAX);
    }
}
