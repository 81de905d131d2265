//! Property-based tests for dBFT consensus invariants.
//!
//! These drive whole simulated validator networks with randomized message
//! orderings and fault sets, and check the properties every run must keep:
//! agreement on a single block, progress with at most F faulty validators,
//! monotonic views and a well-formed primary rotation.

pub mod consensus_invariants;
