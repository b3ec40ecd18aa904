//! Lease-based admission control.
//!
//! When leasing is enabled, a requester may only start new interactions
//! while it holds permits from the most recent LEASE frame and that lease
//! has not expired. Each grant replaces the previous one outright; permits
//! never accumulate across grants.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::{LeaseGrant, WeftError};

/// Requester side: tracks permits granted by the peer.
///
/// Permits are spent at the moment a request frame is about to be sent, not
/// when the operator is created, so an expired lease rejects a long-queued
/// request the same as a never-granted one.
#[derive(Debug)]
pub struct RequesterLeaseTracker {
    inner: Mutex<LeaseWindow>,
}

#[derive(Debug)]
struct LeaseWindow {
    permits: u32,
    expires: Option<Instant>,
}

impl RequesterLeaseTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LeaseWindow {
                permits: 0,
                expires: None,
            }),
        }
    }

    /// Install a fresh grant, replacing whatever was left of the old one.
    pub fn grant(&self, grant: LeaseGrant) {
        let mut window = self.inner.lock();
        window.permits = grant.permits;
        window.expires = Some(Instant::now() + grant.ttl);
    }

    /// Spend one permit, failing if none remain or the lease expired.
    pub fn use_permit(&self) -> Result<(), WeftError> {
        let mut window = self.inner.lock();
        match window.expires {
            Some(expires) if Instant::now() < expires && window.permits > 0 => {
                window.permits -= 1;
                Ok(())
            }
            _ => Err(WeftError::MissingLease),
        }
    }

    /// 1.0 while an unexpired lease with permits remaining is held, 0.0
    /// otherwise. Callers can use this to shed load before hitting
    /// [`WeftError::MissingLease`].
    pub fn availability(&self) -> f64 {
        let window = self.inner.lock();
        match window.expires {
            Some(expires) if Instant::now() < expires && window.permits > 0 => 1.0,
            _ => 0.0,
        }
    }

    pub fn permits(&self) -> u32 {
        let window = self.inner.lock();
        match window.expires {
            Some(expires) if Instant::now() < expires => window.permits,
            _ => 0,
        }
    }
}

impl Default for RequesterLeaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Responder side: enforces the grants this side issued to its peer.
///
/// The responder mirrors each grant it sends and checks inbound requests
/// against it, so a peer that ignores the lease is rejected locally.
#[derive(Debug, Default)]
pub struct ResponderLeaseTracker {
    inner: Mutex<Option<LeaseWindow>>,
}

impl ResponderLeaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a grant issued to the peer. Returns the frame content to send.
    pub fn issue(&self, permits: u32, ttl: Duration) -> LeaseGrant {
        let mut inner = self.inner.lock();
        *inner = Some(LeaseWindow {
            permits,
            expires: Some(Instant::now() + ttl),
        });
        LeaseGrant { permits, ttl }
    }

    /// Charge one inbound request against the outstanding grant.
    pub fn admit(&self) -> Result<(), WeftError> {
        let mut inner = self.inner.lock();
        match inner.as_mut() {
            Some(window)
                if window.permits > 0
                    && window.expires.is_some_and(|e| Instant::now() < e) =>
            {
                window.permits -= 1;
                Ok(())
            }
            _ => Err(WeftError::MissingLease),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_lease_means_no_permits() {
        let tracker = RequesterLeaseTracker::new();
        assert_eq!(tracker.use_permit().unwrap_err(), WeftError::MissingLease);
        assert_eq!(tracker.availability(), 0.0);
    }

    #[test]
    fn test_permits_exhaust() {
        let tracker = RequesterLeaseTracker::new();
        tracker.grant(LeaseGrant {
            permits: 2,
            ttl: Duration::from_millis(5000),
        });
        assert_eq!(tracker.availability(), 1.0);
        tracker.use_permit().unwrap();
        // Still available until the last permit is gone.
        assert_eq!(tracker.availability(), 1.0);
        tracker.use_permit().unwrap();
        assert_eq!(tracker.use_permit().unwrap_err(), WeftError::MissingLease);
        assert_eq!(tracker.availability(), 0.0);
    }

    #[test]
    fn test_expired_lease_rejects() {
        let tracker = RequesterLeaseTracker::new();
        tracker.grant(LeaseGrant {
            permits: 5,
            ttl: Duration::ZERO,
        });
        assert_eq!(tracker.use_permit().unwrap_err(), WeftError::MissingLease);
    }

    #[test]
    fn test_new_grant_replaces_old() {
        let tracker = RequesterLeaseTracker::new();
        tracker.grant(LeaseGrant {
            permits: 5,
            ttl: Duration::from_millis(5000),
        });
        tracker.use_permit().unwrap();
        tracker.grant(LeaseGrant {
            permits: 1,
            ttl: Duration::from_millis(5000),
        });
        // Permits do not accumulate: only the new grant counts.
        assert_eq!(tracker.permits(), 1);
        tracker.use_permit().unwrap();
        assert_eq!(tracker.use_permit().unwrap_err(), WeftError::MissingLease);
    }

    #[test]
    fn test_responder_mirror() {
        let tracker = ResponderLeaseTracker::new();
        assert_eq!(tracker.admit().unwrap_err(), WeftError::MissingLease);
        let grant = tracker.issue(2, Duration::from_millis(5000));
        assert_eq!(grant.permits, 2);
        tracker.admit().unwrap();
        tracker.admit().unwrap();
        assert_eq!(tracker.admit().unwrap_err(), WeftError::MissingLease);
    }
}
