//! Timeout-bounded TCP connection establishment.
//!
//! Without a timeout the platform's blocking `connect` is used as is. With
//! one, the socket is switched to non-blocking mode, the connect is issued,
//! and completion is detected by waiting for read or write readiness and
//! then reading the socket's pending error (SO_ERROR).
//!
//! The socket is either handed back connected and in blocking mode, or
//! closed before the error is returned.

use crate::runtime::{
    wait_until, Deadline, Interest, PollReadiness, Readiness, WaitOutcome, WatchSet,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::AsRawFd;
use std::time::Duration;
use tracing::{debug, trace};

/// Phase of a single connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Socket created, connect not yet issued.
    Initiating,
    /// Non-blocking connect issued, outcome not yet known.
    PendingCompletion,
    /// Connected; socket is back in blocking mode.
    Established,
    /// Rejected or otherwise failed.
    Failed,
    /// Deadline passed before completion.
    TimedOut,
}

/// Connection establishment errors.
#[derive(Debug)]
pub enum ConnectError {
    /// The socket could not be created or its blocking mode changed.
    Setup { cause: io::Error },
    /// The OS rejected the connection or reported a pending error.
    Refused { cause: io::Error },
    /// The deadline elapsed before the connection completed.
    Timeout,
    /// The readiness wait failed for a reason other than interruption.
    WaitFailed { cause: io::Error },
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::Setup { cause } => write!(f, "socket setup failed: {}", cause),
            ConnectError::Refused { cause } => write!(f, "connection refused: {}", cause),
            ConnectError::Timeout => write!(f, "connection timed out"),
            ConnectError::WaitFailed { cause } => {
                write!(f, "waiting for connection failed: {}", cause)
            }
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectError::Setup { cause }
            | ConnectError::Refused { cause }
            | ConnectError::WaitFailed { cause } => Some(cause),
            ConnectError::Timeout => None,
        }
    }
}

/// Connect to `endpoint` using the `poll(2)` backend.
///
/// `timeout = None` blocks with the platform's native connect semantics.
pub fn connect(
    endpoint: SocketAddr,
    timeout: Option<Duration>,
) -> Result<TcpStream, ConnectError> {
    TimedConnector::new(PollReadiness::new()).connect(endpoint, timeout)
}

/// Establishes TCP connections with an optional wall-clock bound.
pub struct TimedConnector<R> {
    readiness: R,
}

impl<R: Readiness> TimedConnector<R> {
    pub fn new(readiness: R) -> Self {
        Self { readiness }
    }

    /// Connect to `endpoint`, giving up after `timeout` if one is set.
    ///
    /// On success the returned stream is in blocking mode. On failure the
    /// socket has already been closed.
    pub fn connect(
        &mut self,
        endpoint: SocketAddr,
        timeout: Option<Duration>,
    ) -> Result<TcpStream, ConnectError> {
        let deadline = timeout.map(Deadline::after);

        let socket = Socket::new(Domain::for_address(endpoint), Type::STREAM, Some(Protocol::TCP))
            .map_err(|cause| ConnectError::Setup { cause })?;

        debug!(
            endpoint = %endpoint,
            fd = socket.as_raw_fd(),
            timeout_ms = timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            "Connecting"
        );

        let mut attempt = ConnectionAttempt::new(socket, endpoint);
        let result = match deadline {
            None => attempt.run_blocking(),
            Some(deadline) => attempt.run_bounded(&mut self.readiness, deadline),
        };

        match result {
            Ok(()) => Ok(attempt.into_stream()),
            Err(e) => {
                debug!(endpoint = %endpoint, error = %e, "Connect failed, closing socket");
                Err(e)
            }
        }
    }

    /// Give back the readiness backend.
    pub fn into_inner(self) -> R {
        self.readiness
    }
}

/// State of one connect operation. Owns the socket until it is either
/// turned into a stream or dropped (closing it).
struct ConnectionAttempt {
    socket: Socket,
    endpoint: SocketAddr,
    phase: Phase,
    /// Set the first time the socket leaves blocking mode.
    went_nonblocking: bool,
}

impl ConnectionAttempt {
    fn new(socket: Socket, endpoint: SocketAddr) -> Self {
        Self {
            socket,
            endpoint,
            phase: Phase::Initiating,
            went_nonblocking: false,
        }
    }

    fn transition(&mut self, next: Phase) {
        trace!(endpoint = %self.endpoint, from = ?self.phase, to = ?next, "Connect phase");
        self.phase = next;
    }

    fn fail(&mut self, err: ConnectError) -> ConnectError {
        let next = match err {
            ConnectError::Timeout => Phase::TimedOut,
            _ => Phase::Failed,
        };
        self.transition(next);
        err
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), ConnectError> {
        self.socket
            .set_nonblocking(nonblocking)
            .map_err(|cause| self.fail(ConnectError::Setup { cause }))?;
        self.went_nonblocking |= nonblocking;
        trace!(endpoint = %self.endpoint, nonblocking, "Socket mode changed");
        Ok(())
    }

    fn run_blocking(&mut self) -> Result<(), ConnectError> {
        match self.socket.connect(&self.endpoint.into()) {
            Ok(()) => {
                self.transition(Phase::Established);
                Ok(())
            }
            Err(cause) => Err(self.fail(ConnectError::Refused { cause })),
        }
    }

    fn run_bounded<R: Readiness + ?Sized>(
        &mut self,
        readiness: &mut R,
        deadline: Deadline,
    ) -> Result<(), ConnectError> {
        self.set_nonblocking(true)?;

        match self.socket.connect(&self.endpoint.into()) {
            Ok(()) => return self.establish(),
            Err(e) if is_in_progress(&e) => self.transition(Phase::PendingCompletion),
            Err(cause) => return Err(self.fail(ConnectError::Refused { cause })),
        }

        let fd = self.socket.as_raw_fd();
        let set = WatchSet::new().watch(fd, Interest::READABLE | Interest::WRITABLE);

        loop {
            match wait_until(readiness, &set, deadline) {
                WaitOutcome::Ready(ready) if ready.is_ready(fd) => return self.check_pending(),
                WaitOutcome::Ready(_) | WaitOutcome::Interrupted => continue,
                WaitOutcome::TimedOut => return Err(self.fail(ConnectError::Timeout)),
                WaitOutcome::Failed(cause) => {
                    return Err(self.fail(ConnectError::WaitFailed { cause }))
                }
            }
        }
    }

    /// The asynchronous connect reports its result through the socket's
    /// pending error, not through errno.
    fn check_pending(&mut self) -> Result<(), ConnectError> {
        match self.socket.take_error() {
            Ok(None) => self.establish(),
            Ok(Some(cause)) | Err(cause) => Err(self.fail(ConnectError::Refused { cause })),
        }
    }

    fn establish(&mut self) -> Result<(), ConnectError> {
        self.set_nonblocking(false)?;
        self.transition(Phase::Established);
        Ok(())
    }

    fn into_stream(self) -> TcpStream {
        self.socket.into()
    }
}

/// Whether a non-blocking connect error means "still in progress".
/// Some platforms report an interrupted connect that keeps going as EINTR.
fn is_in_progress(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EINPROGRESS) | Some(libc::EINTR)
    ) || err.kind() == io::ErrorKind::WouldBlock
}
