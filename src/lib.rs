//! scalebench: a scalability benchmark harness.
//!
//! A server accepts many concurrent connections on a single
//! readiness-driven event loop, offloads SHA-1 hashing of each 8 KB request
//! to a bounded worker pool, and echoes the 40-character hex digest back as
//! a delivery-verification token. A client drives synchronous
//! request/response traffic against it while tracking delivery counts.
//!
//! Layering, leaf first:
//! - [`message`]: wire message types and the hash unit
//! - [`sync`]: the blocking unique queue and the pending-write multiset
//! - [`pool`]: the worker-pool scheduler with admission control
//! - [`server`]: the connection event loop and throughput accounting
//! - [`client`]: the synchronous traffic driver

pub mod client;
pub mod config;
pub mod message;
pub mod pool;
pub mod server;
pub mod sync;
