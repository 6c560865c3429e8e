//! Integration test crate for the fabric workspace.
//!
//! This crate has no library code of its own — it only contains integration
//! tests that exercise the concrete end-to-end scenarios spanning naming,
//! security, transport, and the agent across real (loopback) QUIC
//! connections, rather than a single crate's in-process unit tests.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p fabric-integration-tests -- --ignored
//! ```
