//! The connection event loop.
//!
//! Readiness-based model: one blocking poll tells us which sockets are
//! ready, then we perform non-blocking read/write syscalls. Each connection
//! is half-duplex: it is registered for read-readiness while a request is
//! being assembled, and for write-readiness while acknowledgment tokens are
//! being flushed, never both at once.
//!
//! The loop itself runs as a pool task that permanently reserves one worker
//! thread. Hashing never happens here: completed payloads are handed to the
//! pool as opportunistic [`DigestTask`]s, and finished tokens come back
//! through the shared pending-write set, announced by a poll waker.

use crate::message::{AckToken, Payload, PAYLOAD_SIZE, TOKEN_SIZE};
use crate::pool::{Task, ThreadPool};
use crate::server::digest_task::DigestTask;
use crate::server::report::{ConnCounter, SharedCounters};
use crate::sync::PendingSet;
use bytes::{Bytes, BytesMut};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);
const EVENTS_CAPACITY: usize = 1024;
const MAX_CONNECTIONS: usize = 10_000;

/// Half-duplex phase of one connection.
#[derive(Debug)]
enum Phase {
    /// Interested in read-readiness; `filled` bytes of the 8192-byte request
    /// assembled so far.
    AwaitingRequest { filled: usize },
    /// Interested in write-readiness; `buf` holds serialized tokens and
    /// `written` of its bytes have been flushed.
    AwaitingAckFlush { buf: BytesMut, written: usize },
}

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    phase: Phase,
    read_buf: Box<[u8; PAYLOAD_SIZE]>,
}

/// The event-loop task: owns the listener, the poll instance, and every
/// connection. Reserves one pool thread for the lifetime of the process.
pub struct SelectorTask {
    poll: Poll,
    listener: TcpListener,
    connections: Slab<Connection>,
    pool: ThreadPool,
    pending_writes: Arc<PendingSet<AckToken>>,
    /// Wakes the poll when a digest task delivers tokens. Polling is
    /// edge-triggered, so an already-writable socket is never re-reported;
    /// without this wake-up a token that lands after the writable event has
    /// fired would strand its connection.
    waker: Arc<Waker>,
    counters: SharedCounters,
}

impl SelectorTask {
    /// Wrap an already-bound non-blocking listener and register it for
    /// accept-readiness.
    pub fn new(
        listener: std::net::TcpListener,
        pool: ThreadPool,
        pending_writes: Arc<PendingSet<AckToken>>,
        counters: SharedCounters,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            listener,
            connections: Slab::with_capacity(1024),
            pool,
            pending_writes,
            waker,
            counters,
        })
    }

    fn run_loop(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        loop {
            // EINTR is routine; abandon this wait and re-enter it
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    debug!("Poll wait interrupted");
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    WAKER_TOKEN => self.flush_ready_tokens(),
                    Token(conn_id) => {
                        if let Err(e) = self.handle_connection_event(conn_id, event) {
                            debug!(conn_id, error = %e, "Connection error");
                            self.close_connection(conn_id);
                        }
                    }
                }
            }
        }
    }

    /// Drain the accept queue. Failures here are transient: they are logged
    /// and the loop keeps serving existing connections.
    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.connections.len() >= MAX_CONNECTIONS {
                        warn!(peer = %peer, "Connection limit reached, rejecting");
                        continue;
                    }

                    let conn_id = self.connections.insert(Connection {
                        stream,
                        peer,
                        phase: Phase::AwaitingRequest { filled: 0 },
                        read_buf: Box::new([0u8; PAYLOAD_SIZE]),
                    });

                    // Re-borrow after insert
                    let conn = &mut self.connections[conn_id];
                    if let Err(e) = self.poll.registry().register(
                        &mut conn.stream,
                        Token(conn_id),
                        Interest::READABLE,
                    ) {
                        error!(peer = %peer, error = %e, "Failed to register connection");
                        self.connections.remove(conn_id);
                        continue;
                    }

                    // Counter allocated under the same lock the report
                    // thread uses for consume-and-reset
                    self.counters.lock().unwrap().push(ConnCounter::new(peer));

                    debug!(conn_id, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn handle_connection_event(
        &mut self,
        conn_id: usize,
        event: &mio::event::Event,
    ) -> io::Result<()> {
        if !self.connections.contains(conn_id) {
            return Ok(());
        }

        if event.is_readable() {
            self.handle_readable(conn_id)?;
        }

        // Re-check: the readable path may have closed the connection
        if !self.connections.contains(conn_id) {
            return Ok(());
        }

        if event.is_writable() {
            self.handle_writable(conn_id)?;
        }

        Ok(())
    }

    /// Assemble the fixed-size request across readable events. Only a fully
    /// assembled payload is acted on: the hash task is submitted and the
    /// connection flips to write-only interest.
    fn handle_readable(&mut self, conn_id: usize) -> io::Result<()> {
        let conn = self
            .connections
            .get_mut(conn_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

        let mut filled = match conn.phase {
            Phase::AwaitingRequest { filled } => filled,
            _ => return Ok(()), // Not awaiting a request
        };

        loop {
            match conn.stream.read(&mut conn.read_buf[filled..]) {
                Ok(0) => {
                    // EOF
                    return Err(io::Error::new(io::ErrorKind::ConnectionReset, "EOF"));
                }
                Ok(n) => {
                    filled += n;
                    if filled == PAYLOAD_SIZE {
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Partial request; resume on the next readable event
                    conn.phase = Phase::AwaitingRequest { filled };
                    return Ok(());
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let peer = conn.peer;
        let payload = Payload::new(Bytes::copy_from_slice(&conn.read_buf[..]), peer);

        conn.phase = Phase::AwaitingAckFlush {
            buf: BytesMut::new(),
            written: 0,
        };
        self.poll
            .registry()
            .reregister(&mut conn.stream, Token(conn_id), Interest::WRITABLE)?;

        let task = DigestTask::new(
            vec![payload],
            Arc::clone(&self.pending_writes),
            Arc::clone(&self.waker),
        );
        // Opportunistic tasks cannot oversubscribe, but a rejection must
        // never take the loop down
        if !self.pool.submit(vec![Box::new(task)]) {
            warn!(peer = %peer, "Hash task submission rejected");
        }

        Ok(())
    }

    /// A digest task signalled that new tokens landed in the pending set.
    ///
    /// The writable event for a connection usually fires before its digest
    /// is computed, and an edge-triggered poll will not report the socket
    /// again, so the wake-up retries the flush for every connection still
    /// waiting on tokens.
    fn flush_ready_tokens(&mut self) {
        let waiting: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, conn)| matches!(conn.phase, Phase::AwaitingAckFlush { .. }))
            .map(|(conn_id, _)| conn_id)
            .collect();

        for conn_id in waiting {
            if let Err(e) = self.handle_writable(conn_id) {
                debug!(conn_id, error = %e, "Connection error");
                self.close_connection(conn_id);
            }
        }
    }

    /// Flush acknowledgment tokens. All tokens currently pending for this
    /// connection are extracted in one atomic step, then written out across
    /// as many writable events as it takes. The throughput counter advances
    /// once per fully flushed 40-byte token, and the connection returns to
    /// read-only interest only once the batch is drained.
    fn handle_writable(&mut self, conn_id: usize) -> io::Result<()> {
        let conn = self
            .connections
            .get_mut(conn_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;
        let peer = conn.peer;

        let (buf, written) = match &mut conn.phase {
            Phase::AwaitingAckFlush { buf, written } => (buf, written),
            _ => return Ok(()), // Not flushing
        };

        let tokens = self
            .pending_writes
            .extract_all_matching(|t| t.return_address() == Some(peer));
        for token in &tokens {
            buf.extend_from_slice(token.hash().as_bytes());
        }

        if buf.is_empty() {
            // Digest not computed yet. Stay in the flush phase; the digest
            // task's wake-up lands us back here once the token exists.
            // Flipping to read interest now would strand the token forever,
            // since the client sends nothing more until it is acknowledged.
            return Ok(());
        }

        let mut tokens_flushed = 0u64;
        while *written < buf.len() {
            match conn.stream.write(&buf[*written..]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    let before = *written / TOKEN_SIZE;
                    *written += n;
                    tokens_flushed += (*written / TOKEN_SIZE - before) as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        let complete = *written == buf.len();

        if tokens_flushed > 0 {
            let mut counters = self.counters.lock().unwrap();
            match counters.iter_mut().find(|c| c.address() == peer) {
                Some(counter) => {
                    for _ in 0..tokens_flushed {
                        counter.increment();
                    }
                }
                None => debug!(peer = %peer, "No counter for connection"),
            }
        }

        if complete {
            conn.phase = Phase::AwaitingRequest { filled: 0 };
            self.poll
                .registry()
                .reregister(&mut conn.stream, Token(conn_id), Interest::READABLE)?;
        }

        Ok(())
    }

    /// Tear down one connection: deregister, drop its counter, and discard
    /// tokens that can no longer be delivered.
    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut conn) = self.connections.try_remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            self.counters
                .lock()
                .unwrap()
                .retain(|c| c.address() != conn.peer);
            let orphaned = self
                .pending_writes
                .extract_all_matching(|t| t.return_address() == Some(conn.peer));
            if !orphaned.is_empty() {
                debug!(peer = %conn.peer, count = orphaned.len(), "Dropped undeliverable tokens");
            }
            debug!(conn_id, peer = %conn.peer, "Connection closed");
        }
    }
}

impl Task for SelectorTask {
    /// The event loop occupies its worker for the pool's entire lifetime.
    fn threads_needed(&self) -> usize {
        1
    }

    fn run(self: Box<Self>) {
        let mut task = *self;
        if let Err(e) = task.run_loop() {
            error!(error = %e, "Event loop terminated");
        }
    }
}
