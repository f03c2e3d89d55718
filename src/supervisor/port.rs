use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::{Instant, sleep};
use tracing::{debug, trace};

/// Outcome of waiting for the collector port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Free,
    /// Still bound when the wait budget ran out
    StillBound,
    /// Not checked because a live deployment owns the port
    Skipped,
}

/// Is something listening on `addr`?
///
/// Probes by binding the address ourselves. Errors other than
/// `AddrInUse` (for example an address of another host) count as free.
pub async fn port_in_use(addr: SocketAddr) -> bool {
    match TcpListener::bind(addr).await {
        Ok(_) => false,
        Err(e) if e.kind() == ErrorKind::AddrInUse => true,
        Err(e) => {
            debug!("cannot probe {addr}: {e}");
            false
        }
    }
}

/// Poll `addr` every `poll` until it is free or `timeout` has passed.
pub async fn wait_for_port_free(addr: SocketAddr, timeout: Duration, poll: Duration) -> PortState {
    let deadline = Instant::now() + timeout;

    loop {
        if !port_in_use(addr).await {
            return PortState::Free;
        }

        if Instant::now() >= deadline {
            return PortState::StillBound;
        }

        trace!("{addr} still bound, waiting");
        sleep(poll).await;
    }
}
