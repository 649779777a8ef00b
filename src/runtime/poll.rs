//! `poll(2)` readiness backend.
//!
//! Builds a fresh `pollfd` array from the watch set on every call, so no
//! descriptor state survives between waits. Works with terminals, pipes,
//! sockets, and regular files alike.

use super::readiness::{
    outcome_from_error, timeout_millis, Readiness, ReadySet, WaitOutcome, WatchSet,
};
use std::io;
use std::time::Duration;

/// Readiness backend built on `libc::poll`.
#[derive(Debug, Default)]
pub struct PollReadiness;

impl PollReadiness {
    pub fn new() -> Self {
        Self
    }
}

impl Readiness for PollReadiness {
    fn wait(&mut self, set: &WatchSet, timeout: Option<Duration>) -> WaitOutcome {
        let mut fds: Vec<libc::pollfd> = set
            .entries()
            .iter()
            .map(|&(fd, interest)| {
                let mut events: libc::c_short = 0;
                if interest.is_readable() {
                    events |= libc::POLLIN;
                }
                if interest.is_writable() {
                    events |= libc::POLLOUT;
                }
                libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                }
            })
            .collect();

        let timeout_ms = match timeout {
            Some(t) => timeout_millis(t).min(libc::c_int::MAX as u128) as libc::c_int,
            None => -1,
        };

        // SAFETY: `fds` is a live, exclusively borrowed slice for the whole
        // call and its length is passed alongside the pointer.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };

        if rc < 0 {
            return outcome_from_error(io::Error::last_os_error());
        }
        if rc == 0 {
            return WaitOutcome::TimedOut;
        }

        let mut ready = ReadySet::new();
        for pfd in &fds {
            if pfd.revents & libc::POLLNVAL != 0 {
                return WaitOutcome::Failed(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid descriptor {} in watch set", pfd.fd),
                ));
            }
            let broken = pfd.revents & (libc::POLLHUP | libc::POLLERR) != 0;
            if broken || pfd.revents & libc::POLLIN != 0 {
                ready.mark_readable(pfd.fd);
            }
            if broken || pfd.revents & libc::POLLOUT != 0 {
                ready.mark_writable(pfd.fd);
            }
        }

        WaitOutcome::Ready(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::readiness::Interest;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_times_out_when_idle() {
        let (a, _b) = UnixStream::pair().unwrap();
        let set = WatchSet::new().watch(a.as_raw_fd(), Interest::READABLE);

        let outcome = PollReadiness::new().wait(&set, Some(Duration::from_millis(20)));

        assert!(matches!(outcome, WaitOutcome::TimedOut));
    }

    #[test]
    fn test_reports_readable() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let (idle, _peer) = UnixStream::pair().unwrap();
        b.write_all(b"ping\n").unwrap();

        let set = WatchSet::new()
            .watch(a.as_raw_fd(), Interest::READABLE)
            .watch(idle.as_raw_fd(), Interest::READABLE);

        match PollReadiness::new().wait(&set, Some(Duration::from_secs(1))) {
            WaitOutcome::Ready(ready) => {
                assert!(ready.is_readable(a.as_raw_fd()));
                assert!(!ready.is_readable(idle.as_raw_fd()));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_reports_writable() {
        let (a, _b) = UnixStream::pair().unwrap();
        let set =
            WatchSet::new().watch(a.as_raw_fd(), Interest::READABLE | Interest::WRITABLE);

        match PollReadiness::new().wait(&set, Some(Duration::ZERO)) {
            WaitOutcome::Ready(ready) => {
                assert!(ready.is_writable(a.as_raw_fd()));
                assert!(!ready.is_readable(a.as_raw_fd()));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_hangup_counts_as_readable() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        let set = WatchSet::new().watch(a.as_raw_fd(), Interest::READABLE);

        match PollReadiness::new().wait(&set, Some(Duration::from_secs(1))) {
            WaitOutcome::Ready(ready) => assert!(ready.is_readable(a.as_raw_fd())),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
