//! mio readiness backend.
//!
//! Uses epoll on Linux and kqueue on macOS. mio registrations are
//! edge-triggered, so every wait registers the watch set afresh (which
//! reports current readiness) and removes it again before returning.
//! Regular files cannot be registered with epoll; use the poll backend for
//! redirected file input.

use super::readiness::{
    outcome_from_error, Interest, Readiness, ReadySet, WaitOutcome, WatchSet,
};
use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;
use tracing::debug;

/// Readiness backend built on `mio::Poll`.
pub struct MioReadiness {
    poll: Poll,
    events: Events,
}

impl MioReadiness {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(16),
        })
    }

    fn register(&self, set: &WatchSet) -> io::Result<()> {
        for (idx, &(fd, interest)) in set.entries().iter().enumerate() {
            let result = self
                .poll
                .registry()
                .register(&mut SourceFd(&fd), Token(idx), to_mio(interest));
            if let Err(e) = result {
                self.deregister(&set.entries()[..idx]);
                return Err(e);
            }
        }
        Ok(())
    }

    fn deregister(&self, entries: &[(RawFd, Interest)]) {
        for &(fd, _) in entries {
            if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                debug!(fd, error = %e, "Deregister failed");
            }
        }
    }
}

impl Readiness for MioReadiness {
    fn wait(&mut self, set: &WatchSet, timeout: Option<Duration>) -> WaitOutcome {
        if let Err(e) = self.register(set) {
            return WaitOutcome::Failed(e);
        }

        let result = self.poll.poll(&mut self.events, timeout);
        self.deregister(set.entries());

        if let Err(e) = result {
            return outcome_from_error(e);
        }
        if self.events.is_empty() {
            return WaitOutcome::TimedOut;
        }

        let mut ready = ReadySet::new();
        for event in self.events.iter() {
            let Some(&(fd, _)) = set.entries().get(event.token().0) else {
                continue;
            };
            if event.is_readable() || event.is_read_closed() || event.is_error() {
                ready.mark_readable(fd);
            }
            if event.is_writable() || event.is_write_closed() || event.is_error() {
                ready.mark_writable(fd);
            }
        }

        WaitOutcome::Ready(ready)
    }
}

fn to_mio(interest: Interest) -> mio::Interest {
    match (interest.is_readable(), interest.is_writable()) {
        (true, true) => mio::Interest::READABLE | mio::Interest::WRITABLE,
        (false, true) => mio::Interest::WRITABLE,
        _ => mio::Interest::READABLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_times_out_when_idle() {
        let (a, _b) = UnixStream::pair().unwrap();
        let set = WatchSet::new().watch(a.as_raw_fd(), Interest::READABLE);
        let mut readiness = MioReadiness::new().unwrap();

        let outcome = readiness.wait(&set, Some(Duration::from_millis(20)));

        assert!(matches!(outcome, WaitOutcome::TimedOut));
    }

    #[test]
    fn test_level_semantics_across_waits() {
        let (a, mut b) = UnixStream::pair().unwrap();
        b.write_all(b"data").unwrap();
        let set = WatchSet::new().watch(a.as_raw_fd(), Interest::READABLE);
        let mut readiness = MioReadiness::new().unwrap();

        // Nothing is read in between, so both waits must see the data.
        for _ in 0..2 {
            match readiness.wait(&set, Some(Duration::from_secs(1))) {
                WaitOutcome::Ready(ready) => assert!(ready.is_readable(a.as_raw_fd())),
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[test]
    fn test_reports_writable() {
        let (a, _b) = UnixStream::pair().unwrap();
        let set =
            WatchSet::new().watch(a.as_raw_fd(), Interest::READABLE | Interest::WRITABLE);
        let mut readiness = MioReadiness::new().unwrap();

        match readiness.wait(&set, Some(Duration::from_secs(1))) {
            WaitOutcome::Ready(ready) => assert!(ready.is_writable(a.as_raw_fd())),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_interest_mapping() {
        assert_eq!(to_mio(Interest::READABLE), mio::Interest::READABLE);
        assert_eq!(to_mio(Interest::WRITABLE), mio::Interest::WRITABLE);
        assert_eq!(
            to_mio(Interest::READABLE | Interest::WRITABLE),
            mio::Interest::READABLE | mio::Interest::WRITABLE
        );
    }
}
