//! timed-relay: interactive TCP client
//!
//! Resolves `HOST PORT`, connects with an optional timeout, then relays
//! stdin lines to the server and server bytes to stdout until either side
//! closes.
//!
//! Exit codes follow sysexits: 69 when the server is unavailable, 74 on a
//! relay I/O failure, 78 on a configuration error.

use std::fs::File;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::AsFd;
use std::process::ExitCode;
use timed_relay::config::{Config, Family};
use timed_relay::{DuplexRelay, LineSource, RelayOptions, TimedConnector};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EX_UNAVAILABLE: u8 = 69;
const EX_IOERR: u8 = 74;
const EX_CONFIG: u8 = 78;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("timed-relay: {e}");
            return ExitCode::from(EX_CONFIG);
        }
    };

    // Initialize logging; stdout carries relayed data
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        timeout_secs = config.timeout.map(|t| t.as_secs()),
        family = ?config.family,
        backend = %config.backend,
        "Starting timed-relay"
    );

    let endpoint = match resolve(&config.host, config.port, config.family) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!(host = %config.host, error = %e, "Address resolution failed");
            return ExitCode::from(EX_UNAVAILABLE);
        }
    };
    info!(addr = %endpoint.ip(), port = endpoint.port(), "Resolved endpoint");

    let readiness = match config.backend.build() {
        Ok(readiness) => readiness,
        Err(e) => {
            error!(backend = %config.backend, error = %e, "Failed to create readiness backend");
            return ExitCode::from(EX_UNAVAILABLE);
        }
    };

    let mut connector = TimedConnector::new(readiness);
    let mut stream = match connector.connect(endpoint, config.timeout) {
        Ok(stream) => stream,
        Err(e) => {
            error!(endpoint = %endpoint, error = %e, "Connect failed");
            return ExitCode::from(EX_UNAVAILABLE);
        }
    };
    info!(endpoint = %endpoint, "Connected");

    let options = RelayOptions {
        tick: config.tick,
        buffer_size: config.buffer_size,
    };
    let mut relay = DuplexRelay::with_options(connector.into_inner(), options);
    let result = relay_stdio(&mut relay, &mut stream);

    // The relay never closes the socket; its owner does.
    drop(stream);
    info!(endpoint = %endpoint, "Socket closed");

    match result {
        Ok(end) => {
            info!(end = ?end, "Session ended");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Session failed");
            ExitCode::from(EX_IOERR)
        }
    }
}

/// Relay between `stream` and this process's stdin/stdout.
fn relay_stdio(
    relay: &mut DuplexRelay<Box<dyn timed_relay::runtime::Readiness>>,
    stream: &mut TcpStream,
) -> Result<timed_relay::RelayEnd, Box<dyn std::error::Error>> {
    // Read stdin through a private descriptor so no std-side buffer hides
    // lines from the readiness wait.
    let stdin = File::from(io::stdin().as_fd().try_clone_to_owned()?);
    let mut local = LineSource::new(stdin);
    let mut stdout = io::stdout().lock();

    Ok(relay.run(stream, &mut local, &mut stdout)?)
}

/// Resolve `host:port` and pick the first address of the wanted family.
fn resolve(host: &str, port: u16, family: Family) -> io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .find(|addr| family.admits(addr))
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no {:?} address for {}", family, host),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_literal() {
        let addr = resolve("127.0.0.1", 7000, Family::Any).unwrap();
        assert_eq!(addr, "127.0.0.1:7000".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_resolve_family_mismatch() {
        let err = resolve("127.0.0.1", 7000, Family::Ipv6).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
