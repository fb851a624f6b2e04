//! Thin wrapper over `poll(2)`, the readiness primitive of the engine.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Readiness of one connection's descriptor after a poll.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Readiness {
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

/// What one connection wants to be woken for.
pub(crate) struct Interest {
    pub(crate) fd: RawFd,
    pub(crate) read: bool,
    pub(crate) write: bool,
}

/// Poll the given interests, returning the readiness of each entry in
/// order. `timeout` of `None` blocks indefinitely; an empty interest list
/// degenerates to a plain sleep, used to wait out reconnect backoff.
pub(crate) fn wait(
    interests: &[Interest],
    timeout: Option<Duration>,
) -> io::Result<Vec<Readiness>> {
    let mut fds: Vec<libc::pollfd> = interests
        .iter()
        .map(|i| {
            let mut events = 0 as libc::c_short;
            if i.read {
                events |= libc::POLLIN;
            }
            if i.write {
                events |= libc::POLLOUT;
            }
            libc::pollfd { fd: i.fd, events, revents: 0 }
        })
        .collect();

    let timeout_ms: libc::c_int = match timeout {
        None => -1,
        Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
    };

    loop {
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }

    Ok(fds
        .iter()
        .map(|fd| Readiness {
            // Errors and hangups surface through the read path, where the
            // subsequent read(2) reports what actually happened.
            readable: fd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0,
            writable: fd.revents & (libc::POLLOUT | libc::POLLERR) != 0,
        })
        .collect())
}
