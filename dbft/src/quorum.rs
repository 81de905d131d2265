//! Fault tolerance and quorum sizes for a validator set of `n` members.

/// Maximum number of faulty validators tolerated: `(n - 1) / 3`.
pub fn max_faulty(n: usize) -> usize {
    n.saturating_sub(1) / 3
}

/// Number of matching messages needed to advance a phase: `n - f`.
pub fn quorum(n: usize) -> usize {
    n - max_faulty(n)
}
