//! Server assembly: listener setup with port cycling, worker-pool startup,
//! and the periodic throughput report loop.

pub mod digest_task;
pub mod event_loop;
pub mod report;

use crate::pool::ThreadPool;
use crate::sync::PendingSet;
use self::event_loop::SelectorTask;
use self::report::{take_report, SharedCounters, REPORT_WINDOW_SECS};
use chrono::Local;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const LISTEN_BACKLOG: i32 = 1024;

/// Lowest port the bind walk wraps back to after exhausting the range.
const PORT_RANGE_BOTTOM: u16 = 1024;

/// A bound but not yet running server.
///
/// Binding is separate from running so callers can learn the actual port
/// first; after cycling (or with a requested port of 0) it may differ from
/// the one asked for.
pub struct Server {
    listener: std::net::TcpListener,
    port: u16,
    pool_size: usize,
}

impl Server {
    /// Bind the listening socket, walking upward from the requested port
    /// when it is unavailable.
    pub fn bind(requested_port: u16, pool_size: usize) -> io::Result<Self> {
        let (listener, port) = bind_listener(requested_port)?;
        Ok(Self {
            listener,
            port,
            pool_size,
        })
    }

    /// The port actually bound.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Start the pool, hand it the event-loop task, and settle into the
    /// report loop. Runs until process termination.
    pub fn run(self) -> io::Result<()> {
        if self.pool_size < 2 {
            warn!(
                pool_size = self.pool_size,
                "No general workers beyond the event loop; hash tasks will starve"
            );
        }

        let pool = ThreadPool::new(self.pool_size);
        let counters: SharedCounters = Arc::new(Mutex::new(Vec::new()));
        let pending_writes = Arc::new(PendingSet::new());

        let selector = SelectorTask::new(
            self.listener,
            pool.clone(),
            pending_writes,
            Arc::clone(&counters),
        )?;

        pool.start()?;
        if !pool.submit(vec![Box::new(selector)]) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "thread pool cannot reserve a thread for the event loop",
            ));
        }

        info!(port = self.port, pool_size = self.pool_size, "Server running");

        loop {
            thread::sleep(Duration::from_secs(REPORT_WINDOW_SECS));
            let report = take_report(&counters);
            println!("[{}] {report}", Local::now().format("%H:%M:%S"));
        }
    }
}

/// Bind a non-blocking listener, walking upward from the requested port and
/// wrapping from the top of the range back to 1024. Returning to the
/// starting port without a successful bind is a setup failure.
fn bind_listener(requested_port: u16) -> io::Result<(std::net::TcpListener, u16)> {
    let mut port = requested_port;
    loop {
        match try_bind(port) {
            Ok(listener) => {
                // With a requested port of 0 the OS picks one for us
                let bound = listener.local_addr()?.port();
                if bound != requested_port && requested_port != 0 {
                    info!(requested = requested_port, bound, "Requested port taken, rebound");
                }
                return Ok((listener, bound));
            }
            Err(e) => {
                debug!(port, error = %e, "Bind failed");
                port = if port == u16::MAX {
                    PORT_RANGE_BOTTOM
                } else {
                    port + 1
                };
                if port == requested_port {
                    return Err(io::Error::new(
                        io::ErrorKind::AddrInUse,
                        "no available port in the entire range",
                    ));
                }
            }
        }
    }
}

fn try_bind(port: u16) -> io::Result<std::net::TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral_port() {
        let server = Server::bind(0, 4).unwrap();
        assert_ne!(server.port(), 0);
    }

    #[test]
    fn test_bind_walks_past_taken_port() {
        let first = Server::bind(0, 4).unwrap();
        let taken = first.port();

        // SO_REUSEADDR does not allow two live listeners on one port, so the
        // second bind must land somewhere else
        let second = Server::bind(taken, 4).unwrap();
        assert_ne!(second.port(), taken);
    }
}
