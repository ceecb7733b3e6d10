//! Wire message types for the benchmark protocol.
//!
//! A request is an opaque 8 KB payload; the acknowledgment is the 40-character
//! lowercase hex SHA-1 digest of that payload. The digest is a delivery
//! verification token, not a security feature.

use bytes::Bytes;
use rand::RngCore;
use sha1::{Digest, Sha1};
use std::net::SocketAddr;

/// Size of every request payload in bytes.
pub const PAYLOAD_SIZE: usize = 8192;

/// Size of every acknowledgment token in bytes (SHA-1 as lowercase hex).
pub const TOKEN_SIZE: usize = 40;

/// Compute the lowercase hex SHA-1 digest of a byte slice.
pub fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Generate a random `PAYLOAD_SIZE`-byte request body.
pub fn random_payload() -> Vec<u8> {
    let mut bytes = vec![0u8; PAYLOAD_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// A fully assembled request payload together with the address of the
/// connection it arrived on. The source is set at construction and never
/// changes afterwards.
#[derive(Debug, Clone)]
pub struct Payload {
    bytes: Bytes,
    source: SocketAddr,
}

impl Payload {
    /// Wrap received bytes with their originating connection address.
    ///
    /// Callers are expected to pass exactly `PAYLOAD_SIZE` bytes; the event
    /// loop only constructs payloads from completed reads.
    pub fn new(bytes: Bytes, source: SocketAddr) -> Self {
        debug_assert_eq!(bytes.len(), PAYLOAD_SIZE);
        Self { bytes, source }
    }

    /// Address of the connection that sent this payload.
    pub fn source(&self) -> SocketAddr {
        self.source
    }

    /// Raw payload bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Compute this payload's acknowledgment token. The return address is
    /// left unset; the hash task stamps it before hand-off.
    pub fn digest(&self) -> AckToken {
        AckToken::new(digest_hex(&self.bytes))
    }
}

/// An acknowledgment token: the hex digest of one payload plus the address
/// it must be written back to.
///
/// The return address is one-time-settable. Once a token is bound to a
/// destination it can never be redirected.
#[derive(Debug, Clone)]
pub struct AckToken {
    hash: String,
    return_address: Option<SocketAddr>,
}

impl AckToken {
    pub fn new(hash: String) -> Self {
        Self {
            hash,
            return_address: None,
        }
    }

    /// Bind the token to its destination. The first call wins; later calls
    /// fail and leave the existing binding untouched.
    pub fn set_return_address(&mut self, address: SocketAddr) -> bool {
        if self.return_address.is_none() {
            self.return_address = Some(address);
            true
        } else {
            false
        }
    }

    /// The 40-character lowercase hex digest.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Destination address, if bound.
    pub fn return_address(&self) -> Option<SocketAddr> {
        self.return_address
    }
}
