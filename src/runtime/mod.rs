//! Readiness multiplexing runtime.
//!
//! Two interchangeable backends:
//! - `poll`: `poll(2)` via libc (default)
//! - `mio`: epoll on Linux, kqueue on macOS
//!
//! Both share common abstractions:
//! - `WatchSet`: Descriptors and interests for a single wait
//! - `WaitOutcome`: Tagged result of a wait
//! - `Deadline`: Absolute time budget for retried waits

mod deadline;
mod mio;
mod poll;
mod readiness;

pub use self::mio::MioReadiness;
pub use deadline::{wait_until, Deadline};
pub use poll::PollReadiness;
pub use readiness::{Interest, Readiness, ReadySet, WaitOutcome, WatchSet};

use serde::Deserialize;
use std::fmt;
use std::io;

/// Selectable readiness backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// `poll(2)`; works for any descriptor type
    #[default]
    Poll,
    /// mio (epoll/kqueue); sockets, pipes, and terminals only
    Mio,
}

impl Backend {
    /// Construct the backend.
    pub fn build(self) -> io::Result<Box<dyn Readiness>> {
        match self {
            Backend::Poll => Ok(Box::new(PollReadiness::new())),
            Backend::Mio => Ok(Box::new(MioReadiness::new()?)),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Poll => f.write_str("poll"),
            Backend::Mio => f.write_str("mio"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    #[test]
    fn test_every_backend_builds_and_waits() {
        let (a, _b) = UnixStream::pair().unwrap();
        let set = WatchSet::new().watch(a.as_raw_fd(), Interest::WRITABLE);

        for backend in [Backend::Poll, Backend::Mio] {
            let mut readiness = backend.build().unwrap();
            match readiness.wait(&set, Some(Duration::from_secs(1))) {
                WaitOutcome::Ready(ready) => assert!(ready.is_writable(a.as_raw_fd())),
                other => panic!("{backend}: unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_backend_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            backend: Backend,
        }

        let w: Wrapper = toml::from_str("backend = \"mio\"").unwrap();
        assert_eq!(w.backend, Backend::Mio);
        assert_eq!(Backend::default(), Backend::Poll);
    }
}
