//! Payloads: the values carried by frames.
//!
//! A payload owns a data buffer and an optional metadata buffer. Ownership
//! is single-consumer: handing a payload to the send path or to a handler
//! consumes it, and a consumed/released payload fails any further use with
//! [`WeftError::ReleasedPayload`] instead of double-releasing.
//!
//! Payloads can be attached to a [`PayloadLedger`], which counts payloads
//! that have been created but not yet consumed or dropped. Tests use the
//! ledger to assert leak freedom; release is guaranteed to decrement the
//! count exactly once per payload.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::WeftError;

/// A data buffer plus optional metadata, consumed exactly once.
#[derive(Debug, Default)]
pub struct Payload {
    inner: Option<PayloadInner>,
}

#[derive(Debug)]
struct PayloadInner {
    data: Bytes,
    metadata: Option<Bytes>,
    _tracked: Option<LedgerEntry>,
}

impl Payload {
    pub fn new(data: Bytes) -> Self {
        Self {
            inner: Some(PayloadInner {
                data,
                metadata: None,
                _tracked: None,
            }),
        }
    }

    pub fn with_metadata(data: Bytes, metadata: Bytes) -> Self {
        Self {
            inner: Some(PayloadInner {
                data,
                metadata: Some(metadata),
                _tracked: None,
            }),
        }
    }

    /// Build a payload from buffer parts (reassembly path).
    pub fn from_parts(data: Bytes, metadata: Option<Bytes>) -> Self {
        Self {
            inner: Some(PayloadInner {
                data,
                metadata,
                _tracked: None,
            }),
        }
    }

    /// An empty payload, used for bare COMPLETE-style signals.
    pub fn empty() -> Self {
        Self::new(Bytes::new())
    }

    /// True until the payload is consumed or released.
    pub fn is_valid(&self) -> bool {
        self.inner.is_some()
    }

    pub fn data(&self) -> Result<&Bytes, WeftError> {
        self.inner
            .as_ref()
            .map(|i| &i.data)
            .ok_or(WeftError::ReleasedPayload)
    }

    pub fn metadata(&self) -> Result<Option<&Bytes>, WeftError> {
        self.inner
            .as_ref()
            .map(|i| i.metadata.as_ref())
            .ok_or(WeftError::ReleasedPayload)
    }

    /// Total payload bytes (data + metadata), zero once released.
    pub fn len(&self) -> usize {
        match &self.inner {
            Some(i) => i.data.len() + i.metadata.as_ref().map_or(0, Bytes::len),
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if the payload carries a metadata buffer.
    pub fn has_metadata(&self) -> bool {
        matches!(&self.inner, Some(i) if i.metadata.is_some())
    }

    /// Consume the payload, yielding its buffers.
    ///
    /// Fails on an already-consumed payload without touching any counter a
    /// second time.
    pub fn into_parts(mut self) -> Result<(Bytes, Option<Bytes>), WeftError> {
        let inner = self.inner.take().ok_or(WeftError::ReleasedPayload)?;
        Ok((inner.data, inner.metadata))
    }

    /// Explicitly release the payload without consuming its buffers.
    ///
    /// Idempotent: releasing twice is a no-op, not a double-release.
    pub fn release(&mut self) {
        self.inner = None;
    }
}

/// Counts outstanding (created but not yet released) payloads.
///
/// Attach payloads with [`PayloadLedger::track`]; each tracked payload
/// decrements the count exactly once, on consumption, explicit release, or
/// drop, whichever comes first.
#[derive(Debug, Clone, Default)]
pub struct PayloadLedger {
    outstanding: Arc<AtomicUsize>,
}

/// Handle embedded in a tracked payload; its drop is the single release
/// point.
#[derive(Debug)]
struct LedgerEntry(Arc<AtomicUsize>);

impl Drop for LedgerEntry {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl PayloadLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a payload to this ledger, incrementing the outstanding count.
    ///
    /// A released payload is returned untouched: there is nothing left to
    /// track.
    pub fn track(&self, mut payload: Payload) -> Payload {
        if let Some(inner) = payload.inner.as_mut() {
            self.outstanding.fetch_add(1, Ordering::AcqRel);
            inner._tracked = Some(LedgerEntry(self.outstanding.clone()));
        }
        payload
    }

    /// Number of tracked payloads not yet released.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_parts_consumes() {
        let p = Payload::with_metadata(Bytes::from_static(b"data"), Bytes::from_static(b"meta"));
        assert!(p.is_valid());
        assert_eq!(p.len(), 8);
        let (data, metadata) = p.into_parts().unwrap();
        assert_eq!(data, Bytes::from_static(b"data"));
        assert_eq!(metadata.unwrap(), Bytes::from_static(b"meta"));
    }

    #[test]
    fn test_released_payload_is_rejected() {
        let mut p = Payload::new(Bytes::from_static(b"x"));
        p.release();
        assert!(!p.is_valid());
        assert_eq!(p.data().unwrap_err(), WeftError::ReleasedPayload);
        assert_eq!(p.into_parts().unwrap_err(), WeftError::ReleasedPayload);
    }

    #[test]
    fn test_double_release_is_noop() {
        let mut p = Payload::new(Bytes::from_static(b"x"));
        p.release();
        p.release();
        assert!(!p.is_valid());
    }

    #[test]
    fn test_ledger_counts_exactly_once() {
        let ledger = PayloadLedger::new();
        let p = ledger.track(Payload::new(Bytes::from_static(b"x")));
        assert_eq!(ledger.outstanding(), 1);

        // Consuming releases exactly once.
        let _ = p.into_parts().unwrap();
        assert_eq!(ledger.outstanding(), 0);

        // Dropping releases exactly once.
        let p2 = ledger.track(Payload::new(Bytes::from_static(b"y")));
        assert_eq!(ledger.outstanding(), 1);
        drop(p2);
        assert_eq!(ledger.outstanding(), 0);

        // Explicit release then drop releases once, not twice.
        let mut p3 = ledger.track(Payload::new(Bytes::from_static(b"z")));
        p3.release();
        assert_eq!(ledger.outstanding(), 0);
        drop(p3);
        assert_eq!(ledger.outstanding(), 0);
    }

    #[test]
    fn test_tracking_released_payload_is_noop() {
        let ledger = PayloadLedger::new();
        let mut p = Payload::new(Bytes::from_static(b"x"));
        p.release();
        let _p = ledger.track(p);
        assert_eq!(ledger.outstanding(), 0);
    }
}
