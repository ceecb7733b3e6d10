//! The pool task that turns payloads into acknowledgment tokens.

use crate::message::{AckToken, Payload};
use crate::pool::Task;
use crate::sync::PendingSet;
use mio::Waker;
use std::sync::Arc;
use tracing::warn;

/// Hashes a batch of payloads and forwards the tokens to the event loop's
/// pending-write set.
///
/// Opportunistic: reserves no pool threads and runs whenever a worker is
/// free. The whole batch is handed over in one `add_all`, so the event loop
/// either sees all of these tokens or none of them yet. After the hand-off
/// the task wakes the poll: the destination socket's writable event has
/// usually fired (and been consumed) before the digest exists, so the loop
/// must be told to retry the flush.
pub struct DigestTask {
    payloads: Vec<Payload>,
    pending_writes: Arc<PendingSet<AckToken>>,
    waker: Arc<Waker>,
}

impl DigestTask {
    pub fn new(
        payloads: Vec<Payload>,
        pending_writes: Arc<PendingSet<AckToken>>,
        waker: Arc<Waker>,
    ) -> Self {
        Self {
            payloads,
            pending_writes,
            waker,
        }
    }
}

impl Task for DigestTask {
    fn run(self: Box<Self>) {
        let mut tokens = Vec::with_capacity(self.payloads.len());
        for payload in &self.payloads {
            let mut token = payload.digest();
            if !token.set_return_address(payload.source()) {
                // Unreachable for freshly minted tokens; never rebind
                warn!(source = %payload.source(), "Token already bound, dropping");
                continue;
            }
            tokens.push(token);
        }
        self.pending_writes.add_all(tokens);

        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake event loop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{digest_hex, random_payload};
    use bytes::Bytes;
    use mio::{Events, Poll, Token};
    use std::net::SocketAddr;
    use std::time::Duration;

    const TEST_WAKER: Token = Token(9);

    fn poll_and_waker() -> (Poll, Arc<Waker>) {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), TEST_WAKER).unwrap());
        (poll, waker)
    }

    #[test]
    fn test_digest_task_feeds_pending_set() {
        let addr_a: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        let addr_b: SocketAddr = "127.0.0.1:7002".parse().unwrap();

        let body_a = random_payload();
        let body_b = random_payload();
        let expected_a = digest_hex(&body_a);
        let expected_b = digest_hex(&body_b);

        let (_poll, waker) = poll_and_waker();
        let pending = Arc::new(PendingSet::new());
        let task = DigestTask::new(
            vec![
                Payload::new(Bytes::from(body_a), addr_a),
                Payload::new(Bytes::from(body_b), addr_b),
            ],
            Arc::clone(&pending),
            waker,
        );

        Box::new(task).run();

        let for_a = pending.extract_all_matching(|t: &AckToken| t.return_address() == Some(addr_a));
        assert_eq!(for_a.len(), 1);
        assert_eq!(for_a[0].hash(), expected_a);

        let for_b = pending.extract_all_matching(|t: &AckToken| t.return_address() == Some(addr_b));
        assert_eq!(for_b.len(), 1);
        assert_eq!(for_b[0].hash(), expected_b);

        assert!(pending.is_empty());
    }

    #[test]
    fn test_digest_task_wakes_poll_after_handoff() {
        let addr: SocketAddr = "127.0.0.1:7003".parse().unwrap();
        let (mut poll, waker) = poll_and_waker();
        let pending = Arc::new(PendingSet::new());

        let task = DigestTask::new(
            vec![Payload::new(Bytes::from(random_payload()), addr)],
            Arc::clone(&pending),
            Arc::clone(&waker),
        );
        Box::new(task).run();

        // The token must be visible before the wake-up is observed
        let mut events = Events::with_capacity(4);
        poll.poll(&mut events, Some(Duration::from_secs(5))).unwrap();
        assert!(events.iter().any(|e| e.token() == TEST_WAKER));
        assert_eq!(pending.len(), 1);
    }
}
