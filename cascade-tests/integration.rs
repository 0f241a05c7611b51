//! Integration tests for Cascade
//!
//! These tests drive the full stack over real sockets on localhost:
//! discovery datagrams, master coordination, slave execution and the
//! client protocol, verifying the behavior no single crate can test
//! alone.

#[path = "integration/common.rs"]
mod common;

#[path = "integration/campaign_distribution.rs"]
mod campaign_distribution;

#[path = "integration/discovery_liveness.rs"]
mod discovery_liveness;

#[path = "integration/failure_recovery.rs"]
mod failure_recovery;

#[path = "integration/cancellation.rs"]
mod cancellation;
