//! timed-relay: bounded-timeout TCP connect plus a duplex line relay
//!
//! Two composed pieces:
//! - `connector`: establishes a TCP connection with an optional deadline
//!   using a non-blocking connect and a readiness wait
//! - `relay`: multiplexes a connected socket and a local record source in
//!   one cooperative loop until either side ends
//!
//! Both wait through the `runtime` readiness backends (`poll(2)` or mio).

pub mod config;
pub mod connector;
pub mod relay;
pub mod runtime;

pub use connector::{connect, ConnectError, TimedConnector};
pub use relay::{DuplexRelay, LineSource, LocalInput, RelayEnd, RelayError, RelayOptions, Side};
