use thiserror::Error;

use crate::proto::Command;

/// The set of observable errors when interacting with a Gearman server.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Caller misuse detected before anything was sent.
    ///
    /// No state was mutated; the offending call can simply be corrected and
    /// retried.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong with the call.
        message: String,
    },

    /// The engine is in non-blocking mode and cannot advance any task
    /// without waiting for I/O.
    ///
    /// Re-enter [`Client::run_tasks`](crate::Client::run_tasks) once a
    /// connection becomes ready (or after calling
    /// [`Client::wait`](crate::Client::wait)).
    #[error("no task can advance without waiting for I/O")]
    IoWait,

    /// The transport failed while requests were in flight.
    ///
    /// Tasks whose request had already been sent are failed with this error;
    /// tasks still queued for write are returned to the submission queue and
    /// will be retried against another connection.
    #[error("lost connection to {server}")]
    LostConnection {
        /// `host:port` of the connection that failed.
        server: String,
    },

    /// Every registered server was tried and none could be reached.
    ///
    /// Reported at most once per [`Client::run_tasks`](crate::Client::run_tasks)
    /// call.
    #[error("could not connect to any server")]
    CouldNotConnect,

    /// The server sent an `ERROR` packet.
    #[error("server error [{code}]: {text}")]
    Server {
        /// Machine-readable error code string.
        code: String,
        /// Human-readable error text.
        text: String,
    },

    /// A malformed frame, or a response that makes no sense for the
    /// connection's state. The connection it arrived on is reset.
    #[error("protocol: {0}")]
    Protocol(#[from] Protocol),

    /// [`Client::wait`](crate::Client::wait) returned without any connection
    /// becoming ready within the configured bound.
    #[error("timed out waiting for connection readiness")]
    Timeout,

    /// The client shut down after a fatal error; submissions now fail fast
    /// until the client is dropped.
    #[error("client degraded after fatal error: {cause}")]
    Degraded {
        /// Rendering of the error that degraded the client.
        cause: String,
    },

    /// Underlying I/O layer errors other than connection loss, e.g. a failed
    /// readiness poll.
    #[error("underlying i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument { message: message.into() }
    }
}

/// Ways in which a frame can be malformed or unexpected.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Protocol {
    /// A packet was constructed or received with the wrong number of
    /// arguments for its command.
    #[error("{command:?} takes {expected} argument(s), got {given}")]
    BadArgumentCount {
        /// The command in question.
        command: Command,
        /// Arguments the command is defined to carry.
        expected: usize,
        /// Arguments actually present.
        given: usize,
    },

    /// The encoded payload would not fit in the frame header's u32 length
    /// field.
    #[error("payload of {len} bytes exceeds the wire format limit")]
    PayloadTooLarge {
        /// Total payload length that was attempted.
        len: u64,
    },

    /// The peer sent a command code this client does not know.
    #[error("unknown command code {code}")]
    UnknownCommand {
        /// The offending wire code.
        code: u32,
    },

    /// The frame did not start with `\0REQ` or `\0RES`.
    #[error("bad frame magic {bytes:?}")]
    BadMagic {
        /// The four bytes found where magic was expected.
        bytes: [u8; 4],
    },

    /// A response arrived that no in-flight request accounts for.
    #[error("unexpected {command:?} for connection state")]
    Unexpected {
        /// The command that could not be correlated.
        command: Command,
    },
}
