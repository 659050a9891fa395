//! Integration test crate for NearMeet.
//!
//! There is no library code here. The tests under `tests/` run real
//! servers and clients over loopback TCP and exercise flows that span the
//! transport, chat and crypto crates.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p nearmeet-integration-tests
//! ```
