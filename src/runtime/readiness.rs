//! Readiness multiplexing primitives shared by the connector and the relay.
//!
//! A wait is described by a [`WatchSet`] built fresh for every call and
//! answered with a [`WaitOutcome`]. Backends implement [`Readiness`].

use std::io;
use std::ops::BitOr;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Readiness classes a descriptor is watched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const READABLE: Interest = Interest(0b01);
    pub const WRITABLE: Interest = Interest(0b10);

    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// Descriptors to watch during a single wait.
#[derive(Debug, Clone, Default)]
pub struct WatchSet {
    entries: Vec<(RawFd, Interest)>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor. Watching the same descriptor twice merges interests.
    pub fn watch(mut self, fd: RawFd, interest: Interest) -> Self {
        match self.entries.iter_mut().find(|(f, _)| *f == fd) {
            Some((_, existing)) => *existing = *existing | interest,
            None => self.entries.push((fd, interest)),
        }
        self
    }

    pub fn entries(&self) -> &[(RawFd, Interest)] {
        &self.entries
    }
}

/// Descriptors reported ready by a wait.
///
/// Hang-up and error conditions are reported as both readable and writable,
/// so the caller's next read or pending-error query surfaces the cause.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadySet {
    readable: Vec<RawFd>,
    writable: Vec<RawFd>,
}

impl ReadySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_readable(&mut self, fd: RawFd) {
        if !self.readable.contains(&fd) {
            self.readable.push(fd);
        }
    }

    pub fn mark_writable(&mut self, fd: RawFd) {
        if !self.writable.contains(&fd) {
            self.writable.push(fd);
        }
    }

    pub fn is_readable(&self, fd: RawFd) -> bool {
        self.readable.contains(&fd)
    }

    pub fn is_writable(&self, fd: RawFd) -> bool {
        self.writable.contains(&fd)
    }

    /// Ready in either direction.
    pub fn is_ready(&self, fd: RawFd) -> bool {
        self.is_readable(fd) || self.is_writable(fd)
    }
}

/// Result of one readiness wait.
#[derive(Debug)]
pub enum WaitOutcome {
    /// At least one descriptor is ready.
    Ready(ReadySet),
    /// The timeout elapsed with nothing ready.
    TimedOut,
    /// A signal interrupted the wait before anything became ready.
    Interrupted,
    /// The primitive itself failed.
    Failed(io::Error),
}

/// A readiness-multiplexing primitive.
pub trait Readiness {
    /// Block until a descriptor in `set` is ready or `timeout` elapses.
    /// `None` waits indefinitely.
    fn wait(&mut self, set: &WatchSet, timeout: Option<Duration>) -> WaitOutcome;
}

impl<R: Readiness + ?Sized> Readiness for Box<R> {
    fn wait(&mut self, set: &WatchSet, timeout: Option<Duration>) -> WaitOutcome {
        (**self).wait(set, timeout)
    }
}

impl<R: Readiness + ?Sized> Readiness for &mut R {
    fn wait(&mut self, set: &WatchSet, timeout: Option<Duration>) -> WaitOutcome {
        (**self).wait(set, timeout)
    }
}

/// Convert a timeout to whole milliseconds, rounding up so that a
/// nonzero budget never becomes a zero-length poll.
pub(crate) fn timeout_millis(timeout: Duration) -> u128 {
    let nanos = timeout.as_nanos();
    nanos.div_ceil(1_000_000)
}

/// Map an OS error from a wait call to an outcome.
pub(crate) fn outcome_from_error(err: io::Error) -> WaitOutcome {
    if err.kind() == io::ErrorKind::Interrupted {
        WaitOutcome::Interrupted
    } else {
        WaitOutcome::Failed(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_flags() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.is_readable());
        assert!(both.is_writable());
        assert!(!Interest::READABLE.is_writable());
        assert!(!Interest::WRITABLE.is_readable());
    }

    #[test]
    fn test_watch_set_merges_duplicates() {
        let set = WatchSet::new()
            .watch(3, Interest::READABLE)
            .watch(4, Interest::READABLE)
            .watch(3, Interest::WRITABLE);

        assert_eq!(set.entries().len(), 2);
        let (fd, interest) = set.entries()[0];
        assert_eq!(fd, 3);
        assert!(interest.is_readable() && interest.is_writable());
    }

    #[test]
    fn test_ready_set() {
        let mut ready = ReadySet::new();
        assert!(!ready.is_ready(5));

        ready.mark_readable(5);
        ready.mark_readable(5);
        ready.mark_writable(7);

        assert!(ready.is_readable(5));
        assert!(!ready.is_writable(5));
        assert!(ready.is_ready(7));
        assert!(!ready.is_ready(9));
    }

    #[test]
    fn test_timeout_millis_rounds_up() {
        assert_eq!(timeout_millis(Duration::ZERO), 0);
        assert_eq!(timeout_millis(Duration::from_micros(1)), 1);
        assert_eq!(timeout_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(timeout_millis(Duration::from_micros(1500)), 2);
    }

    #[test]
    fn test_outcome_from_error() {
        let interrupted = io::Error::from(io::ErrorKind::Interrupted);
        assert!(matches!(
            outcome_from_error(interrupted),
            WaitOutcome::Interrupted
        ));

        let other = io::Error::from_raw_os_error(libc::EBADF);
        assert!(matches!(outcome_from_error(other), WaitOutcome::Failed(_)));
    }
}
