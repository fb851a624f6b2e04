use crate::error::{Error, Protocol};

use super::Command;

/// Frame header length: 4-byte magic, 4-byte command, 4-byte payload size.
pub const HEADER_LEN: usize = 12;

const MAGIC_REQUEST: [u8; 4] = *b"\0REQ";
const MAGIC_RESPONSE: [u8; 4] = *b"\0RES";

/// Direction marker in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    /// `\0REQ`: client to server.
    Request,
    /// `\0RES`: server to client.
    Response,
}

impl Magic {
    fn bytes(self) -> [u8; 4] {
        match self {
            Magic::Request => MAGIC_REQUEST,
            Magic::Response => MAGIC_RESPONSE,
        }
    }
}

/// One Gearman frame: magic, command and its argument byte strings.
///
/// Arguments are held as plain byte strings; the NUL separators of the wire
/// encoding are injected by [`encode`](Packet::encode) and stripped by
/// [`decode`], never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Frame direction.
    pub magic: Magic,
    /// Command kind; fixes the argument count.
    pub command: Command,
    /// Argument byte strings in command order.
    pub args: Vec<Vec<u8>>,
}

impl Packet {
    /// Build a request frame, validating the argument count for `command`.
    pub fn request(command: Command, args: Vec<Vec<u8>>) -> Result<Packet, Error> {
        Self::validated(Magic::Request, command, args)
    }

    /// Build a response frame, validating the argument count for `command`.
    pub fn response(command: Command, args: Vec<Vec<u8>>) -> Result<Packet, Error> {
        Self::validated(Magic::Response, command, args)
    }

    fn validated(magic: Magic, command: Command, args: Vec<Vec<u8>>) -> Result<Packet, Error> {
        if args.len() != command.arg_count() {
            return Err(Protocol::BadArgumentCount {
                command,
                expected: command.arg_count(),
                given: args.len(),
            }
            .into());
        }
        Ok(Packet { magic, command, args })
    }

    /// Payload length: argument bytes plus one NUL separator between each
    /// pair of consecutive arguments.
    fn payload_len(&self) -> u64 {
        let data: u64 = self.args.iter().map(|a| a.len() as u64).sum();
        data + self.args.len().saturating_sub(1) as u64
    }

    /// Encode the frame into wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let payload_len = self.payload_len();
        if payload_len > u32::MAX as u64 {
            return Err(Protocol::PayloadTooLarge { len: payload_len }.into());
        }

        let mut buf = Vec::with_capacity(HEADER_LEN + payload_len as usize);
        buf.extend_from_slice(&self.magic.bytes());
        buf.extend_from_slice(&self.command.wire().to_be_bytes());
        buf.extend_from_slice(&(payload_len as u32).to_be_bytes());
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                buf.push(0);
            }
            buf.extend_from_slice(arg);
        }
        Ok(buf)
    }

    /// First argument, for the common handle-first responses.
    pub(crate) fn arg(&self, i: usize) -> &[u8] {
        &self.args[i]
    }
}

/// Outcome of one [`decode`] attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame was parsed; `consumed` bytes may be dropped from the
    /// front of the caller's buffer.
    Frame {
        /// The parsed frame.
        packet: Packet,
        /// Bytes of input the frame occupied.
        consumed: usize,
    },
    /// The buffer holds no complete frame yet; at least this many further
    /// bytes are required before retrying.
    NeedMore(usize),
}

/// Streaming decode of the next frame from `buf`.
///
/// Binary frames need a 12-byte header before the payload length is known;
/// line-oriented text output (no leading NUL, used by the server for admin
/// command replies) is decoded up to the terminating `\n` as a
/// [`Command::Text`] packet.
pub fn decode(buf: &[u8]) -> Result<Decoded, Error> {
    if buf.is_empty() {
        return Ok(Decoded::NeedMore(HEADER_LEN));
    }

    if buf[0] != 0 {
        // Text mode: one line per response.
        return match buf.iter().position(|&b| b == b'\n') {
            Some(nl) => {
                let mut line = &buf[..nl];
                if line.last() == Some(&b'\r') {
                    line = &line[..line.len() - 1];
                }
                Ok(Decoded::Frame {
                    packet: Packet {
                        magic: Magic::Response,
                        command: Command::Text,
                        args: vec![line.to_vec()],
                    },
                    consumed: nl + 1,
                })
            }
            None => Ok(Decoded::NeedMore(1)),
        };
    }

    if buf.len() < HEADER_LEN {
        return Ok(Decoded::NeedMore(HEADER_LEN - buf.len()));
    }

    let magic = match [buf[0], buf[1], buf[2], buf[3]] {
        MAGIC_REQUEST => Magic::Request,
        MAGIC_RESPONSE => Magic::Response,
        bytes => return Err(Protocol::BadMagic { bytes }.into()),
    };

    let code = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let command =
        Command::from_wire(code).ok_or(Protocol::UnknownCommand { code })?;

    let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
    if buf.len() < HEADER_LEN + payload_len {
        return Ok(Decoded::NeedMore(HEADER_LEN + payload_len - buf.len()));
    }

    let payload = &buf[HEADER_LEN..HEADER_LEN + payload_len];
    let args = split_args(command, payload)?;

    Ok(Decoded::Frame {
        packet: Packet { magic, command, args },
        consumed: HEADER_LEN + payload_len,
    })
}

/// Split a payload into the fixed argument count of `command`.
///
/// The first `n - 1` arguments end at NUL separators; the final argument is
/// the remainder of the payload verbatim, so binary workloads may themselves
/// contain NULs.
fn split_args(command: Command, payload: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
    let expected = command.arg_count();
    if expected == 0 {
        return if payload.is_empty() {
            Ok(Vec::new())
        } else {
            Err(Protocol::BadArgumentCount { command, expected, given: 1 }.into())
        };
    }

    let mut args = Vec::with_capacity(expected);
    let mut rest = payload;
    for _ in 0..expected - 1 {
        match rest.iter().position(|&b| b == 0) {
            Some(nul) => {
                args.push(rest[..nul].to_vec());
                rest = &rest[nul + 1..];
            }
            None => {
                return Err(Protocol::BadArgumentCount {
                    command,
                    expected,
                    given: args.len() + 1,
                }
                .into());
            }
        }
    }
    args.push(rest.to_vec());
    Ok(args)
}
