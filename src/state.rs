//! Handle state machine and cross-thread publication protocol.
//!
//! Every I/O handle carries a [`StateCell`]: the state tag, the handle
//! generation, and the completion results, all as atomics. The cell owns the
//! ordering rules that make results visible across backends without locks:
//!
//! ```text
//! Completer stores results, then Release-stores state  →  observer Acquire-loads
//! state, then reads results.
//! Reclaimer Release-stores generation+1, then Idle     →  observer Acquire-loads
//! state, then generation; a stale generation means "recycled".
//! ```
//!
//! The state load always happens *before* the generation load. If the
//! generation still matches the reference, the observed state cannot belong
//! to a later incarnation of the handle.
//!
//! Legal transitions (no back-edges):
//!
//! ```text
//! Idle → HandedOut → Defined → Prepared → InFlight → Reaped
//!     → CompletedShared | CompletedLocal → Idle (reclaim, generation bump)
//! HandedOut → Idle (release without define)
//! ```

#[cfg(not(loom))]
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, Ordering};

/// Lifecycle state of an I/O handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum HandleState {
    /// On the owning backend's free list.
    Idle = 0,
    /// Held by the owner, being built. At most one per backend.
    HandedOut = 1,
    /// Operation and payload set; prepare hooks may run.
    Defined = 2,
    /// Fully defined, staged for submission.
    Prepared = 3,
    /// Submitted to the I/O method.
    InFlight = 4,
    /// Raw result known; completion callback chain running.
    Reaped = 5,
    /// Terminal; results visible to any backend.
    CompletedShared = 6,
    /// Terminal; the owner itself drove completion.
    CompletedLocal = 7,
}

impl HandleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::CompletedShared | Self::CompletedLocal)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::HandedOut => "handed_out",
            Self::Defined => "defined",
            Self::Prepared => "prepared",
            Self::InFlight => "in_flight",
            Self::Reaped => "reaped",
            Self::CompletedShared => "completed_shared",
            Self::CompletedLocal => "completed_local",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::HandedOut,
            2 => Self::Defined,
            3 => Self::Prepared,
            4 => Self::InFlight,
            5 => Self::Reaped,
            6 => Self::CompletedShared,
            7 => Self::CompletedLocal,
            other => unreachable!("corrupt handle state {other}"),
        }
    }
}

/// Result of observing a handle through an (index, generation) reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observed {
    /// The generation advanced past the reference: the referenced I/O has
    /// completed and its slot was reclaimed.
    Recycled,
    /// The referenced incarnation is still live, in the given state.
    Live(HandleState),
}

/// Atomic state, generation and result storage for one handle.
///
/// # Invariants
///
/// - `generation` starts at 1 and strictly increases by one per reclaim; a
///   reference generation of 0 is never handed out.
/// - `raw_result` is stored before the state becomes `Reaped`; the distilled
///   pair is stored before the state becomes `CompletedShared`/`Local`. Both
///   are published by the Release store of the state.
/// - Exactly one reaper wins [`StateCell::begin_reap`] per in-flight I/O.
pub struct StateCell {
    state: AtomicU8,
    generation: AtomicU64,
    raw_result: AtomicI32,
    /// Packed (status, callback id, error data); see `result::IoResult`.
    distilled: AtomicU64,
    distilled_result: AtomicI32,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(HandleState::Idle as u8),
            generation: AtomicU64::new(1),
            raw_result: AtomicI32::new(0),
            distilled: AtomicU64::new(0),
            distilled_result: AtomicI32::new(0),
        }
    }

    /// Current state. Acquire, so terminal observations also publish results.
    pub fn state(&self) -> HandleState {
        HandleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Observes the handle through a reference generation.
    ///
    /// The state is loaded before the generation: if the generation still
    /// matches, the state belongs to the referenced incarnation.
    pub fn observe(&self, ref_generation: u64) -> Observed {
        debug_assert_ne!(ref_generation, 0);
        let state = HandleState::from_u8(self.state.load(Ordering::Acquire));
        if self.generation.load(Ordering::Acquire) != ref_generation {
            Observed::Recycled
        } else {
            Observed::Live(state)
        }
    }

    /// Owner-side transition. Debug-asserts the expected source state.
    pub fn transition(&self, from: HandleState, to: HandleState) {
        debug_assert!(to != HandleState::Idle, "reclaim must go through reclaim_publish");
        let prev = self.state.swap(to as u8, Ordering::Release);
        debug_assert_eq!(
            prev, from as u8,
            "illegal transition to {} (expected from {})",
            to.name(),
            from.name()
        );
    }

    /// Stores the raw method result. Must precede [`StateCell::begin_reap`].
    pub fn set_raw_result(&self, result: i32) {
        self.raw_result.store(result, Ordering::Relaxed);
    }

    pub fn raw_result(&self) -> i32 {
        self.raw_result.load(Ordering::Relaxed)
    }

    /// Claims the right to run the completion chain: `InFlight` → `Reaped`.
    ///
    /// Returns false if another reaper won the race (POSIX AIO allows any
    /// waiter to notice completion first).
    pub fn begin_reap(&self) -> bool {
        self.state
            .compare_exchange(
                HandleState::InFlight as u8,
                HandleState::Reaped as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Publishes the distilled result and the terminal state.
    pub fn publish_completion(&self, distilled: u64, distilled_result: i32, local: bool) {
        self.distilled.store(distilled, Ordering::Relaxed);
        self.distilled_result
            .store(distilled_result, Ordering::Relaxed);
        let terminal = if local {
            HandleState::CompletedLocal
        } else {
            HandleState::CompletedShared
        };
        let prev = self.state.swap(terminal as u8, Ordering::Release);
        debug_assert_eq!(prev, HandleState::Reaped as u8);
    }

    /// Distilled pair. Only meaningful after a terminal state was observed
    /// with Acquire ordering.
    pub fn distilled(&self) -> (u64, i32) {
        (
            self.distilled.load(Ordering::Relaxed),
            self.distilled_result.load(Ordering::Relaxed),
        )
    }

    /// Reclaim: bump the generation, then publish `Idle`.
    ///
    /// The generation store is ordered before the state store, so an observer
    /// that sees `Idle` and then loads the generation always finds it
    /// advanced past any reference to the finished incarnation.
    pub fn reclaim_publish(&self) {
        self.generation.fetch_add(1, Ordering::Release);
        self.state
            .store(HandleState::Idle as u8, Ordering::Release);
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn fresh_cell_is_idle_generation_one() {
        let cell = StateCell::new();
        assert_eq!(cell.state(), HandleState::Idle);
        assert_eq!(cell.generation(), 1);
        assert_eq!(cell.observe(1), Observed::Live(HandleState::Idle));
    }

    #[test]
    fn stale_generation_reads_recycled() {
        let cell = StateCell::new();
        cell.transition(HandleState::Idle, HandleState::HandedOut);
        cell.reclaim_publish();
        assert_eq!(cell.observe(1), Observed::Recycled);
        assert_eq!(cell.observe(2), Observed::Live(HandleState::Idle));
    }

    #[test]
    fn reap_race_has_one_winner() {
        let cell = StateCell::new();
        cell.transition(HandleState::Idle, HandleState::HandedOut);
        cell.transition(HandleState::HandedOut, HandleState::Defined);
        cell.transition(HandleState::Defined, HandleState::Prepared);
        cell.transition(HandleState::Prepared, HandleState::InFlight);
        assert!(cell.begin_reap());
        assert!(!cell.begin_reap());
        assert_eq!(cell.state(), HandleState::Reaped);
    }

    #[test]
    fn completion_publishes_distilled_pair() {
        let cell = StateCell::new();
        cell.transition(HandleState::Idle, HandleState::HandedOut);
        cell.transition(HandleState::HandedOut, HandleState::Defined);
        cell.transition(HandleState::Defined, HandleState::Prepared);
        cell.transition(HandleState::Prepared, HandleState::InFlight);
        cell.set_raw_result(-5);
        assert!(cell.begin_reap());
        cell.publish_completion(0xfeed, -5, false);
        assert_eq!(cell.state(), HandleState::CompletedShared);
        assert_eq!(cell.distilled(), (0xfeed, -5));
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;
    use loom::thread;

    /// A waiter spinning on `observe` must either see the referenced
    /// incarnation reach a terminal state with the distilled result visible,
    /// or see `Recycled` — never a terminal state with stale results.
    #[test]
    fn completion_is_published_before_terminal_state() {
        loom::model(|| {
            let cell = Arc::new(StateCell::new());
            cell.transition(HandleState::Idle, HandleState::HandedOut);
            cell.transition(HandleState::HandedOut, HandleState::Defined);
            cell.transition(HandleState::Defined, HandleState::Prepared);
            cell.transition(HandleState::Prepared, HandleState::InFlight);

            let completer = {
                let cell = Arc::clone(&cell);
                thread::spawn(move || {
                    cell.set_raw_result(42);
                    assert!(cell.begin_reap());
                    cell.publish_completion(7, 42, false);
                })
            };

            loop {
                match cell.observe(1) {
                    Observed::Recycled => unreachable!("nobody reclaims in this model"),
                    Observed::Live(state) if state.is_terminal() => {
                        assert_eq!(cell.distilled(), (7, 42));
                        break;
                    }
                    Observed::Live(_) => thread::yield_now(),
                }
            }

            completer.join().unwrap();
        });
    }

    /// After a reclaim, an observer holding the old reference generation must
    /// report `Recycled`; it must never see `Idle` attributed to the old
    /// incarnation.
    #[test]
    fn reclaim_never_leaks_idle_to_old_reference() {
        loom::model(|| {
            let cell = Arc::new(StateCell::new());
            cell.transition(HandleState::Idle, HandleState::HandedOut);
            cell.transition(HandleState::HandedOut, HandleState::Defined);
            cell.transition(HandleState::Defined, HandleState::Prepared);
            cell.transition(HandleState::Prepared, HandleState::InFlight);
            cell.set_raw_result(0);
            assert!(cell.begin_reap());
            cell.publish_completion(0, 0, false);

            let reclaimer = {
                let cell = Arc::clone(&cell);
                thread::spawn(move || cell.reclaim_publish())
            };

            match cell.observe(1) {
                Observed::Recycled => {}
                Observed::Live(state) => assert_eq!(state, HandleState::CompletedShared),
            }

            reclaimer.join().unwrap();
        });
    }
}
