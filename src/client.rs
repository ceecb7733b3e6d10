//! Synchronous request/response driver for the benchmark server.
//!
//! Sends one 8 KB payload at a time, blocks for the 40-byte acknowledgment,
//! verifies it against the digest of a payload actually sent, and paces
//! itself to the configured message rate. One request is in flight per
//! connection at any time; that half of the wire contract is the client's
//! to uphold.

use crate::message::{digest_hex, random_payload, TOKEN_SIZE};
use chrono::Local;
use std::collections::HashSet;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Default)]
struct Counters {
    sent: u64,
    received: u64,
}

/// The benchmark client: one blocking TCP connection plus delivery counters.
pub struct Client {
    stream: TcpStream,
    pause: Duration,
    counters: Arc<Mutex<Counters>>,
}

impl Client {
    /// Connect to the server. `rate` is the target number of messages per
    /// second; the send loop sleeps `1000 / rate` milliseconds per round.
    pub fn connect(host: &str, port: u16, rate: u32) -> io::Result<Self> {
        let stream = TcpStream::connect((host, port))?;
        let pause = Duration::from_millis(1000 / u64::from(rate.max(1)));
        Ok(Self {
            stream,
            pause,
            counters: Arc::new(Mutex::new(Counters::default())),
        })
    }

    /// A handle the reporter thread can consume counts through.
    pub fn report_handle(&self) -> ReportHandle {
        ReportHandle {
            counters: Arc::clone(&self.counters),
        }
    }

    /// Drive paced request/response rounds until the connection fails.
    ///
    /// Every payload's digest goes into an outstanding set before the send;
    /// each received token must check one of them off, so token loss,
    /// duplication, or corruption is detected rather than just counted.
    pub fn run(mut self) -> io::Result<()> {
        let mut outstanding: HashSet<String> = HashSet::new();
        let mut token = [0u8; TOKEN_SIZE];

        loop {
            let payload = random_payload();
            outstanding.insert(digest_hex(&payload));

            self.counters.lock().unwrap().sent += 1;
            self.stream.write_all(&payload)?;

            self.stream.read_exact(&mut token)?;
            self.counters.lock().unwrap().received += 1;

            match std::str::from_utf8(&token) {
                Ok(hash) if outstanding.remove(hash) => {
                    debug!(hash, "Acknowledgment verified");
                }
                Ok(hash) => warn!(hash, "Received token for a payload never sent"),
                Err(_) => warn!("Received non-UTF-8 acknowledgment"),
            }

            thread::sleep(self.pause);
        }
    }
}

/// Consume-and-reset view of a client's delivery counters, shared with the
/// reporter thread.
#[derive(Clone)]
pub struct ReportHandle {
    counters: Arc<Mutex<Counters>>,
}

impl ReportHandle {
    /// Snapshot the counts and reset them to zero.
    pub fn take_report(&self) -> ClientReport {
        let mut counters = self.counters.lock().unwrap();
        let report = ClientReport::new(counters.sent, counters.received);
        counters.sent = 0;
        counters.received = 0;
        report
    }
}

/// Sent/received counts for one reporting window, stamped at creation.
pub struct ClientReport {
    sent: u64,
    received: u64,
    time: String,
}

impl ClientReport {
    fn new(sent: u64, received: u64) -> Self {
        Self {
            sent,
            received,
            time: Local::now().format("%H:%M:%S").to_string(),
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn received(&self) -> u64 {
        self.received
    }
}

impl fmt::Display for ClientReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] Total Sent Count: {}, Total Received Count: {}",
            self.time, self.sent, self.received
        )
    }
}
