//! Per-stream lifecycle state, packed into one atomic word.
//!
//! Every operator owns a [`StreamState`]: the low 32 bits hold the pending
//! demand counter (saturating at [`REQUEST_MAX`], the unbounded sentinel),
//! the high bits hold lifecycle flags. All transitions go through CAS
//! loops; there is no lock anywhere on this path, so demand, cancellation,
//! and inbound delivery can race freely without losing or duplicating a
//! transition.
//!
//! TERMINATED is absorbing: once set, every mutation is a no-op and the
//! caller is told so, which is what lets operators turn late signals into
//! payload releases instead of double-delivery.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::WeftError;

/// Demand sentinel: treat the stream as unbounded.
pub const REQUEST_MAX: u32 = u32::MAX;

const DEMAND_MASK: u64 = 0xFFFF_FFFF;
const SUBSCRIBED: u64 = 1 << 32;
const FIRST_FRAME_SENT: u64 = 1 << 33;
const REASSEMBLING: u64 = 1 << 34;
const INBOUND_TERMINATED: u64 = 1 << 35;
const OUTBOUND_TERMINATED: u64 = 1 << 36;
const TERMINATED: u64 = 1 << 37;

/// Flag-name table for diagnostics.
static FLAG_NAMES: &[(u64, &str)] = &[
    (SUBSCRIBED, "SUBSCRIBED"),
    (FIRST_FRAME_SENT, "FIRST_FRAME_SENT"),
    (REASSEMBLING, "REASSEMBLING"),
    (INBOUND_TERMINATED, "INBOUND_TERMINATED"),
    (OUTBOUND_TERMINATED, "OUTBOUND_TERMINATED"),
    (TERMINATED, "TERMINATED"),
];

/// Outcome of a `request(n)` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// This caller claimed the first frame; send the initial request frame
    /// carrying the given demand.
    SendInitial(u32),
    /// The stream is active; send a REQUEST_N frame for this increment.
    SendRequestN(u32),
    /// Demand was recorded but frame emission belongs to someone else
    /// (a driver that has not claimed the first frame yet).
    Buffered,
    /// The stream is already terminated; the demand is dropped.
    Terminated,
}

/// Outcome of terminating one direction of a channel stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfCloseOutcome {
    /// This direction closed; the other is still open.
    HalfClosed,
    /// Both directions are now closed and this caller won the final
    /// transition (it must unregister the stream).
    BothClosed,
    /// The stream was already fully terminated.
    AlreadyTerminated,
}

/// Pre-termination snapshot handed to the winner of the terminal CAS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    pub subscribed: bool,
    pub first_frame_sent: bool,
    pub reassembling: bool,
}

pub struct StreamState(AtomicU64);

impl Default for StreamState {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamState {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    fn load(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    fn cas(&self, current: u64, new: u64) -> Result<u64, u64> {
        self.0
            .compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        self.load() & TERMINATED != 0
    }

    pub fn is_subscribed(&self) -> bool {
        self.load() & SUBSCRIBED != 0
    }

    pub fn first_frame_sent(&self) -> bool {
        self.load() & FIRST_FRAME_SENT != 0
    }

    pub fn is_reassembling(&self) -> bool {
        self.load() & REASSEMBLING != 0
    }

    /// Current pending demand.
    pub fn requested(&self) -> u32 {
        (self.load() & DEMAND_MASK) as u32
    }

    /// Accept the one allowed subscriber.
    pub fn try_subscribe(&self) -> Result<(), WeftError> {
        let mut s = self.load();
        loop {
            if s & TERMINATED != 0 {
                return Err(WeftError::Cancelled);
            }
            if s & SUBSCRIBED != 0 {
                return Err(WeftError::SingleSubscriberOnly);
            }
            match self.cas(s, s | SUBSCRIBED) {
                Ok(_) => return Ok(()),
                Err(actual) => s = actual,
            }
        }
    }

    /// Record demand and decide what, if anything, to emit.
    ///
    /// The claim of FIRST_FRAME_SENT is atomic with the demand update, so
    /// under racing `request` calls exactly one caller gets `SendInitial`
    /// and every later increment maps to exactly one `SendRequestN`.
    pub fn request(&self, n: u32) -> RequestOutcome {
        if n == 0 {
            return RequestOutcome::Buffered;
        }
        let mut s = self.load();
        loop {
            if s & TERMINATED != 0 {
                return RequestOutcome::Terminated;
            }
            let demand = saturating_demand(s, n);
            if s & FIRST_FRAME_SENT == 0 {
                let new = (s & !DEMAND_MASK) | demand as u64 | FIRST_FRAME_SENT;
                match self.cas(s, new) {
                    Ok(_) => return RequestOutcome::SendInitial(demand),
                    Err(actual) => s = actual,
                }
            } else {
                let new = (s & !DEMAND_MASK) | demand as u64;
                match self.cas(s, new) {
                    Ok(_) => return RequestOutcome::SendRequestN(n),
                    Err(actual) => s = actual,
                }
            }
        }
    }

    /// Record demand without claiming frame emission (channel requester:
    /// the driver task claims the first frame once the outbound source
    /// yields).
    pub fn add_demand(&self, n: u32) -> RequestOutcome {
        if n == 0 {
            return RequestOutcome::Buffered;
        }
        let mut s = self.load();
        loop {
            if s & TERMINATED != 0 {
                return RequestOutcome::Terminated;
            }
            let demand = saturating_demand(s, n);
            let new = (s & !DEMAND_MASK) | demand as u64;
            match self.cas(s, new) {
                Ok(_) => {
                    return if s & FIRST_FRAME_SENT != 0 {
                        RequestOutcome::SendRequestN(n)
                    } else {
                        RequestOutcome::Buffered
                    };
                }
                Err(actual) => s = actual,
            }
        }
    }

    /// Claim the first frame, returning the demand accumulated so far.
    ///
    /// Returns `None` if the stream terminated or the frame was already
    /// claimed. After a successful claim, later demand maps to REQUEST_N.
    pub fn claim_first_frame(&self) -> Option<u32> {
        let mut s = self.load();
        loop {
            if s & (TERMINATED | FIRST_FRAME_SENT) != 0 {
                return None;
            }
            match self.cas(s, s | FIRST_FRAME_SENT) {
                Ok(_) => return Some((s & DEMAND_MASK) as u32),
                Err(actual) => s = actual,
            }
        }
    }

    /// Mark the first frame sent without reading demand (single-response
    /// interactions, where subscription is the one unit of demand).
    pub fn mark_first_frame_sent(&self) {
        let mut s = self.load();
        loop {
            if s & (TERMINATED | FIRST_FRAME_SENT) != 0 {
                return;
            }
            match self.cas(s, s | FIRST_FRAME_SENT) {
                Ok(_) => return,
                Err(actual) => s = actual,
            }
        }
    }

    /// Consume one unit of inbound demand for a delivered payload.
    ///
    /// Fails with [`WeftError::Overflow`] when the peer sent more than was
    /// requested, and with [`WeftError::Cancelled`] after termination.
    pub fn consume_demand(&self) -> Result<(), WeftError> {
        let mut s = self.load();
        loop {
            if s & TERMINATED != 0 {
                return Err(WeftError::Cancelled);
            }
            let demand = (s & DEMAND_MASK) as u32;
            if demand == REQUEST_MAX {
                return Ok(());
            }
            if demand == 0 {
                return Err(WeftError::Overflow);
            }
            let new = (s & !DEMAND_MASK) | (demand - 1) as u64;
            match self.cas(s, new) {
                Ok(_) => return Ok(()),
                Err(actual) => s = actual,
            }
        }
    }

    pub fn set_reassembling(&self, on: bool) {
        let mut s = self.load();
        loop {
            if s & TERMINATED != 0 {
                return;
            }
            let new = if on { s | REASSEMBLING } else { s & !REASSEMBLING };
            if new == s {
                return;
            }
            match self.cas(s, new) {
                Ok(_) => return,
                Err(actual) => s = actual,
            }
        }
    }

    /// Terminate the whole stream. Returns the pre-termination snapshot to
    /// the single winner; every other caller gets `None`.
    pub fn try_terminate(&self) -> Option<StateSnapshot> {
        let mut s = self.load();
        loop {
            if s & TERMINATED != 0 {
                return None;
            }
            let new = s | TERMINATED | INBOUND_TERMINATED | OUTBOUND_TERMINATED;
            match self.cas(s, new) {
                Ok(_) => {
                    return Some(StateSnapshot {
                        subscribed: s & SUBSCRIBED != 0,
                        first_frame_sent: s & FIRST_FRAME_SENT != 0,
                        reassembling: s & REASSEMBLING != 0,
                    });
                }
                Err(actual) => s = actual,
            }
        }
    }

    /// Close the inbound direction; full termination happens only when the
    /// outbound direction is closed too.
    pub fn terminate_inbound(&self) -> HalfCloseOutcome {
        self.terminate_direction(INBOUND_TERMINATED, OUTBOUND_TERMINATED)
    }

    /// Close the outbound direction; see [`StreamState::terminate_inbound`].
    pub fn terminate_outbound(&self) -> HalfCloseOutcome {
        self.terminate_direction(OUTBOUND_TERMINATED, INBOUND_TERMINATED)
    }

    fn terminate_direction(&self, this: u64, other: u64) -> HalfCloseOutcome {
        let mut s = self.load();
        loop {
            if s & TERMINATED != 0 {
                return HalfCloseOutcome::AlreadyTerminated;
            }
            if s & this != 0 {
                // Direction already closed; nothing left to transition.
                return HalfCloseOutcome::AlreadyTerminated;
            }
            let both = s & other != 0;
            let new = if both { s | this | TERMINATED } else { s | this };
            match self.cas(s, new) {
                Ok(_) => {
                    return if both {
                        HalfCloseOutcome::BothClosed
                    } else {
                        HalfCloseOutcome::HalfClosed
                    };
                }
                Err(actual) => s = actual,
            }
        }
    }

    pub fn inbound_terminated(&self) -> bool {
        self.load() & INBOUND_TERMINATED != 0
    }

    pub fn outbound_terminated(&self) -> bool {
        self.load() & OUTBOUND_TERMINATED != 0
    }
}

fn saturating_demand(state: u64, n: u32) -> u32 {
    let demand = (state & DEMAND_MASK) as u32;
    demand.saturating_add(n)
}

impl std::fmt::Debug for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.load();
        let mut names = Vec::new();
        for (bit, name) in FLAG_NAMES {
            if s & bit != 0 {
                names.push(*name);
            }
        }
        if names.is_empty() {
            names.push("UNSUBSCRIBED");
        }
        write!(f, "StreamState({}, demand={})", names.join("|"), s & DEMAND_MASK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_single_subscriber() {
        let state = StreamState::new();
        assert!(state.try_subscribe().is_ok());
        assert_eq!(
            state.try_subscribe().unwrap_err(),
            WeftError::SingleSubscriberOnly
        );
    }

    #[test]
    fn test_request_claims_initial_then_request_n() {
        let state = StreamState::new();
        assert_eq!(state.request(5), RequestOutcome::SendInitial(5));
        assert_eq!(state.request(3), RequestOutcome::SendRequestN(3));
        assert_eq!(state.requested(), 8);
    }

    #[test]
    fn test_demand_saturates_at_sentinel() {
        let state = StreamState::new();
        assert_eq!(
            state.request(REQUEST_MAX),
            RequestOutcome::SendInitial(REQUEST_MAX)
        );
        assert_eq!(
            state.request(10),
            RequestOutcome::SendRequestN(10)
        );
        assert_eq!(state.requested(), REQUEST_MAX);
        // Unbounded demand never overflows.
        for _ in 0..3 {
            state.consume_demand().unwrap();
        }
        assert_eq!(state.requested(), REQUEST_MAX);
    }

    #[test]
    fn test_consume_demand_overflow() {
        let state = StreamState::new();
        assert_eq!(state.request(2), RequestOutcome::SendInitial(2));
        state.consume_demand().unwrap();
        state.consume_demand().unwrap();
        assert_eq!(state.consume_demand().unwrap_err(), WeftError::Overflow);
    }

    #[test]
    fn test_terminated_is_absorbing() {
        let state = StreamState::new();
        state.try_subscribe().unwrap();
        let snapshot = state.try_terminate().unwrap();
        assert!(snapshot.subscribed);
        assert!(!snapshot.first_frame_sent);

        assert!(state.try_terminate().is_none());
        assert_eq!(state.request(4), RequestOutcome::Terminated);
        assert_eq!(state.consume_demand().unwrap_err(), WeftError::Cancelled);
        assert!(state.try_subscribe().is_err());
        state.set_reassembling(true);
        assert!(!state.is_reassembling());
    }

    #[test]
    fn test_half_close_both_directions() {
        let state = StreamState::new();
        assert_eq!(state.terminate_inbound(), HalfCloseOutcome::HalfClosed);
        assert!(!state.is_terminated());
        assert_eq!(state.terminate_inbound(), HalfCloseOutcome::AlreadyTerminated);
        assert_eq!(state.terminate_outbound(), HalfCloseOutcome::BothClosed);
        assert!(state.is_terminated());
        assert_eq!(state.terminate_outbound(), HalfCloseOutcome::AlreadyTerminated);
    }

    #[test]
    fn test_claim_first_frame_reads_buffered_demand() {
        let state = StreamState::new();
        assert_eq!(state.add_demand(7), RequestOutcome::Buffered);
        assert_eq!(state.add_demand(2), RequestOutcome::Buffered);
        assert_eq!(state.claim_first_frame(), Some(9));
        assert_eq!(state.claim_first_frame(), None);
        assert_eq!(state.add_demand(1), RequestOutcome::SendRequestN(1));
    }

    #[test]
    fn test_racing_terminate_has_one_winner() {
        for _ in 0..64 {
            let state = Arc::new(StreamState::new());
            let mut handles = Vec::new();
            for _ in 0..4 {
                let state = state.clone();
                handles.push(std::thread::spawn(move || {
                    state.try_terminate().is_some() as usize
                }));
            }
            let winners: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
            assert_eq!(winners, 1);
        }
    }

    #[test]
    fn test_racing_requests_claim_exactly_one_initial() {
        for _ in 0..64 {
            let state = Arc::new(StreamState::new());
            let mut handles = Vec::new();
            for _ in 0..4 {
                let state = state.clone();
                handles.push(std::thread::spawn(move || {
                    matches!(state.request(1), RequestOutcome::SendInitial(_)) as usize
                }));
            }
            let initials: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
            assert_eq!(initials, 1);
            assert_eq!(state.requested(), 4);
        }
    }

    #[test]
    fn test_debug_uses_flag_names() {
        let state = StreamState::new();
        assert!(format!("{state:?}").contains("UNSUBSCRIBED"));
        state.try_subscribe().unwrap();
        assert!(format!("{state:?}").contains("SUBSCRIBED"));
        state.try_terminate().unwrap();
        assert!(format!("{state:?}").contains("TERMINATED"));
    }
}
