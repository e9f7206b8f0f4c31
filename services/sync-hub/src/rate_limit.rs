//! Admission & Auth Glue (C9), rate-limit half: a per-connection token
//! bucket over inbound `mutation` frames (spec §6: 50/s sustained, burst
//! 200).
//!
//! The teacher has no rate limiter of its own; this is enriched from
//! `get-convex-convex-backend`'s `database::index_worker`, which drives a
//! `governor::RateLimiter` off a `Quota::per_second(..).allow_burst(..)`
//! the same way.

use std::num::NonZeroU32;

use governor::{
    clock::DefaultClock,
    state::{direct::NotKeyed, InMemoryState},
    Quota, RateLimiter as GovernorRateLimiter,
};

pub struct MutationRateLimiter {
    inner: GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl MutationRateLimiter {
    pub fn new(per_second: u32, burst: u32) -> Self {
        let per_second = NonZeroU32::new(per_second.max(1)).unwrap();
        let burst = NonZeroU32::new(burst.max(1)).unwrap();
        let quota = Quota::per_second(per_second).allow_burst(burst);
        Self {
            inner: GovernorRateLimiter::direct(quota),
        }
    }

    /// `true` if this mutation frame may proceed; `false` means the caller
    /// should reply `rate_limited` and, per spec §6, close the connection.
    pub fn check(&self) -> bool {
        self.inner.check().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_allowance_is_consumed_then_exhausted() {
        let limiter = MutationRateLimiter::new(1, 3);
        assert!(limiter.check());
        assert!(limiter.check());
        assert!(limiter.check());
        assert!(!limiter.check());
    }
}
