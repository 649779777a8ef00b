//! Readiness-multiplexed duplex relay.
//!
//! One cooperative loop watches the connected socket and a local record
//! source. Socket data goes to a display sink as soon as it arrives; each
//! local record is written to the socket in full. The loop ends on end of
//! stream from either side, an external stop request, or a fatal error.
//!
//! The relay borrows the socket and never closes it.

use crate::runtime::{Interest, Readiness, ReadySet, WaitOutcome, WatchSet};
use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Default liveness tick between stop-flag checks.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Default socket read chunk size.
pub const DEFAULT_BUFFER_SIZE: usize = 512;

/// Which side of the relay an error occurred on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The connected socket.
    Remote,
    /// The local input source or the display sink.
    Local,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Remote => f.write_str("remote"),
            Side::Local => f.write_str("local"),
        }
    }
}

/// How a relay session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The socket reported end of stream.
    RemoteClosed,
    /// The local input reported end of input.
    LocalClosed,
    /// The external stop flag was raised.
    Stopped,
}

/// Fatal relay errors. The session is over; the socket is still open.
#[derive(Debug)]
pub enum RelayError {
    ReadFailed { side: Side, cause: io::Error },
    WriteFailed { side: Side, cause: io::Error },
    WaitFailed { cause: io::Error },
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::ReadFailed { side, cause } => {
                write!(f, "read from {} side failed: {}", side, cause)
            }
            RelayError::WriteFailed { side, cause } => {
                write!(f, "write to {} side failed: {}", side, cause)
            }
            RelayError::WaitFailed { cause } => write!(f, "readiness wait failed: {}", cause),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RelayError::ReadFailed { cause, .. }
            | RelayError::WriteFailed { cause, .. }
            | RelayError::WaitFailed { cause } => Some(cause),
        }
    }
}

/// A local source of records that can take part in a readiness wait.
pub trait LocalInput: AsRawFd {
    /// Replace `record` with the next record. Returns 0 at end of input.
    ///
    /// Called once per readiness event and must not block past it. When
    /// the bytes read so far do not complete a record, `WouldBlock` is
    /// returned and the fragment is kept for the next call.
    fn read_record(&mut self, record: &mut Vec<u8>) -> io::Result<usize>;

    /// Whether complete records are already buffered in user space. Such
    /// records will not show up as descriptor readiness.
    fn has_buffered(&self) -> bool {
        false
    }
}

/// Newline-delimited records over any readable descriptor.
///
/// A record ends at `\n` (kept) or at end of input. Each call reads from
/// the descriptor at most once; an unterminated line is carried over until
/// its newline or end of input arrives.
pub struct LineSource<R> {
    reader: BufReader<R>,
    partial: Vec<u8>,
}

impl<R: Read + AsRawFd> LineSource<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            partial: Vec::new(),
        }
    }

    pub fn with_capacity(capacity: usize, inner: R) -> Self {
        Self {
            reader: BufReader::with_capacity(capacity, inner),
            partial: Vec::new(),
        }
    }
}

impl<R: Read + AsRawFd> AsRawFd for LineSource<R> {
    fn as_raw_fd(&self) -> RawFd {
        self.reader.get_ref().as_raw_fd()
    }
}

impl<R: Read + AsRawFd> LocalInput for LineSource<R> {
    fn read_record(&mut self, record: &mut Vec<u8>) -> io::Result<usize> {
        record.clear();
        let available = self.reader.fill_buf()?;
        if available.is_empty() {
            // End of input completes whatever was carried over.
            record.append(&mut self.partial);
            return Ok(record.len());
        }

        match available.iter().position(|&b| b == b'\n') {
            Some(end) => {
                record.append(&mut self.partial);
                record.extend_from_slice(&available[..=end]);
                self.reader.consume(end + 1);
                Ok(record.len())
            }
            None => {
                let n = available.len();
                self.partial.extend_from_slice(available);
                self.reader.consume(n);
                trace!(carried = self.partial.len(), "Partial local record");
                Err(io::Error::new(io::ErrorKind::WouldBlock, "record incomplete"))
            }
        }
    }

    fn has_buffered(&self) -> bool {
        self.reader.buffer().contains(&b'\n')
    }
}

/// Write all of `buf`, retrying short and interrupted writes.
pub fn write_fully<W: Write + ?Sized>(writer: &mut W, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write accepted no bytes",
                ));
            }
            Ok(n) => {
                if n < buf.len() {
                    trace!(written = n, remaining = buf.len() - n, "Short write");
                }
                buf = &buf[n..];
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Relay tuning.
#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    /// Upper bound on a single wait; the stop flag is checked this often.
    pub tick: Duration,
    /// Maximum bytes read from the socket per iteration.
    pub buffer_size: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Shuttles data between a connected socket and local input.
pub struct DuplexRelay<R> {
    readiness: R,
    options: RelayOptions,
    stop: Option<Arc<AtomicBool>>,
}

impl<R: Readiness> DuplexRelay<R> {
    pub fn new(readiness: R) -> Self {
        Self::with_options(readiness, RelayOptions::default())
    }

    pub fn with_options(readiness: R, options: RelayOptions) -> Self {
        Self {
            readiness,
            options,
            stop: None,
        }
    }

    /// Observe `flag` once per iteration; the relay ends when it is set.
    pub fn stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some(flag);
        self
    }

    fn stop_requested(&self) -> bool {
        self.stop
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// Run one session until either side ends or an error occurs.
    ///
    /// Socket data is written to `sink`; local records are written to
    /// `socket`. The socket is left open in every case.
    pub fn run<S, L, W>(
        &mut self,
        socket: &mut S,
        local: &mut L,
        sink: &mut W,
    ) -> Result<RelayEnd, RelayError>
    where
        S: Read + Write + AsRawFd,
        L: LocalInput,
        W: Write,
    {
        let remote_fd = socket.as_raw_fd();
        let local_fd = local.as_raw_fd();
        let mut session = RelaySession::new(self.options.buffer_size);

        debug!(
            remote_fd,
            local_fd,
            tick_ms = u64::try_from(self.options.tick.as_millis()).unwrap_or(u64::MAX),
            buffer_size = self.options.buffer_size,
            "Relay started"
        );

        let result = loop {
            if self.stop_requested() {
                break Ok(RelayEnd::Stopped);
            }

            let set = WatchSet::new()
                .watch(remote_fd, Interest::READABLE)
                .watch(local_fd, Interest::READABLE);

            // Buffered local records are ready now; only peek at the socket.
            let pending_local = local.has_buffered();
            let timeout = if pending_local {
                Duration::ZERO
            } else {
                self.options.tick
            };

            let ready = match self.readiness.wait(&set, Some(timeout)) {
                WaitOutcome::Ready(ready) => ready,
                WaitOutcome::TimedOut if pending_local => ReadySet::new(),
                WaitOutcome::TimedOut | WaitOutcome::Interrupted => continue,
                WaitOutcome::Failed(cause) => break Err(RelayError::WaitFailed { cause }),
            };

            if ready.is_readable(remote_fd) {
                match session.pump_remote(socket, sink) {
                    Ok(None) => {}
                    Ok(Some(end)) => break Ok(end),
                    Err(e) => break Err(e),
                }
            }

            if pending_local || ready.is_readable(local_fd) {
                match session.pump_local(local, socket) {
                    Ok(None) => {}
                    Ok(Some(end)) => break Ok(end),
                    Err(e) => break Err(e),
                }
            }
        };

        match &result {
            Ok(end) => info!(
                end = ?end,
                sent = session.sent,
                received = session.received,
                "Relay finished"
            ),
            Err(e) => debug!(
                error = %e,
                sent = session.sent,
                received = session.received,
                "Relay failed"
            ),
        }

        result
    }
}

/// Per-run transfer state.
struct RelaySession {
    chunk: Vec<u8>,
    record: Vec<u8>,
    sent: u64,
    received: u64,
}

impl RelaySession {
    fn new(buffer_size: usize) -> Self {
        Self {
            chunk: vec![0u8; buffer_size.max(1)],
            record: Vec::with_capacity(buffer_size),
            sent: 0,
            received: 0,
        }
    }

    /// Forward one chunk of socket data to the sink.
    fn pump_remote<S, W>(
        &mut self,
        socket: &mut S,
        sink: &mut W,
    ) -> Result<Option<RelayEnd>, RelayError>
    where
        S: Read,
        W: Write,
    {
        match socket.read(&mut self.chunk) {
            Ok(0) => {
                debug!("Remote end of stream");
                Ok(Some(RelayEnd::RemoteClosed))
            }
            Ok(n) => {
                sink.write_all(&self.chunk[..n])
                    .and_then(|()| sink.flush())
                    .map_err(|cause| RelayError::WriteFailed {
                        side: Side::Local,
                        cause,
                    })?;
                self.received += n as u64;
                trace!(bytes = n, "Received from remote");
                Ok(None)
            }
            Err(ref e) if is_transient(e) => Ok(None),
            Err(cause) => Err(RelayError::ReadFailed {
                side: Side::Remote,
                cause,
            }),
        }
    }

    /// Forward one local record to the socket.
    fn pump_local<L, S>(
        &mut self,
        local: &mut L,
        socket: &mut S,
    ) -> Result<Option<RelayEnd>, RelayError>
    where
        L: LocalInput,
        S: Write,
    {
        match local.read_record(&mut self.record) {
            Ok(0) => {
                debug!("Local end of input");
                Ok(Some(RelayEnd::LocalClosed))
            }
            Ok(n) => {
                write_fully(socket, &self.record).map_err(|cause| RelayError::WriteFailed {
                    side: Side::Remote,
                    cause,
                })?;
                self.sent += n as u64;
                trace!(bytes = n, "Sent record to remote");
                Ok(None)
            }
            Err(ref e) if is_transient(e) => Ok(None),
            Err(cause) => Err(RelayError::ReadFailed {
                side: Side::Local,
                cause,
            }),
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
