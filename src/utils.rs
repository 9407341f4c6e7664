use std::time::{Duration, Instant};

/// Fallback used when the available parallelism cannot be queried.
pub const DEFAULT_POOL_CAPACITY: usize = 4;

pub fn get_default_capacity() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(DEFAULT_POOL_CAPACITY)
}

/// Time left until `deadline`, or `None` once it has passed.
pub(crate) fn remaining(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|d| !d.is_zero())
}
