//! Limiter trait for abstracting over the token bucket and rule-based limiters.

use crate::error::{RateLimitExceeded, Violation};

/// Outcome of a permit request.
#[derive(Debug, Clone, PartialEq)]
pub struct Permits {
    /// Permits the caller asked for
    pub requested: u32,
    /// Permits available at the time of the request, whether granted or not
    pub available: u32,
    /// Permits actually granted
    pub granted: u32,
    /// The tightest constraint, set whenever fewer than `requested` were available
    pub limited_by: Option<Violation>,
}

impl Permits {
    /// A grant that was not constrained by anything.
    pub fn unlimited(requested: u32) -> Self {
        Self {
            requested,
            available: u32::MAX,
            granted: requested,
            limited_by: None,
        }
    }

    /// Whether everything that was asked for was granted.
    pub fn is_complete(&self) -> bool {
        self.granted == self.requested
    }
}

/// Trait for rate limiter implementations.
///
/// `O` is the operation being admitted: a key for the token bucket, or an
/// arbitrary operation type for the rule-based limiters.
pub trait OpRateLimiter<O: ?Sized>: Send + Sync {
    /// Permits currently available for `op`, without consuming any.
    fn available(&self, op: &O) -> u32;

    /// Request `permits` for `op`. Never blocks. With `partial`, grants as
    /// many as are available; otherwise all or nothing.
    fn acquire(&self, op: &O, permits: u32, partial: bool) -> Permits;

    /// Return permits granted to `op` that went unused.
    fn give_back(&self, op: &O, permits: u32);

    /// Acquire exactly `permits` or fail with the violated constraint.
    fn require(&self, op: &O, permits: u32) -> Result<Permits, RateLimitExceeded> {
        let grant = self.acquire(op, permits, false);
        match grant.limited_by {
            Some(violation) if grant.granted < permits => Err(RateLimitExceeded::new(
                permits,
                grant.available,
                violation,
            )),
            _ => Ok(grant),
        }
    }
}

/// A "limiter" that grants everything. Useful in tests and when limiting is
/// switched off.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateUnlimiter;

impl<O: ?Sized> OpRateLimiter<O> for RateUnlimiter {
    fn available(&self, _op: &O) -> u32 {
        u32::MAX
    }

    fn acquire(&self, _op: &O, permits: u32, _partial: bool) -> Permits {
        Permits::unlimited(permits)
    }

    fn give_back(&self, _op: &O, _permits: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimiter_grants_everything() {
        let limiter = RateUnlimiter;
        assert_eq!(OpRateLimiter::<str>::available(&limiter, "any"), u32::MAX);

        let grant = limiter.require("any", 1_000_000).unwrap();
        assert!(grant.is_complete());
        assert_eq!(grant.granted, 1_000_000);
    }

    #[test]
    fn test_unlimiter_works_with_any_op_type() {
        let limiter = RateUnlimiter;
        let grant = limiter.acquire(&(1u8, "op"), 3, true);
        assert_eq!(grant, Permits::unlimited(3));
    }
}
