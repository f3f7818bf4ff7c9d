//! Resource-owner binding: ties handle and bounce-buffer lifetimes to a
//! transactional scope, so aborts reclaim whatever the scope left behind.
//!
//! Registration stores (index, generation) references rather than back
//! pointers; at unwind, anything whose generation advanced has already
//! completed its lifecycle and is skipped silently. That is what makes the
//! walker safe to run at any time relative to cross-backend completion.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::Backend;
use crate::handle::IoRef;
use crate::state::{HandleState, Observed};

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// A transactional scope that I/O handles and bounce buffers are charged to.
///
/// Thread-bound, like the backend it works against.
pub struct ResourceOwner {
    name: &'static str,
    id: u64,
    ios: RefCell<Vec<IoRef>>,
}

impl ResourceOwner {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
            ios: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn scope_id(&self) -> u64 {
        self.id
    }

    pub(crate) fn remember_io(&self, ioref: IoRef) {
        self.ios.borrow_mut().push(ioref);
    }

    /// Unwinds the scope. `on_error` says whether the scope is aborting;
    /// leftovers found during a normal unwind are leaks and draw a warning.
    ///
    /// Handles still being built are reclaimed; staged handles are force
    /// submitted and left to complete; in-flight handles complete naturally
    /// (their stale references are skipped by generation). Result sinks of
    /// live handles are dropped, since the issuer's frame is going away.
    pub fn release_all(&self, backend: &mut Backend, on_error: bool) {
        let ios: Vec<IoRef> = self.ios.borrow_mut().drain(..).collect();
        for ioref in ios {
            let index = ioref.index();
            let observed = backend
                .control()
                .handle(index)
                .state
                .observe(ioref.generation());
            let state = match observed {
                Observed::Recycled => continue,
                Observed::Live(state) => state,
            };
            match state {
                HandleState::Idle => {
                    unreachable!("idle handle with live generation in scope unwind")
                }
                HandleState::HandedOut => {
                    if !on_error {
                        tracing::warn!(scope = self.name, io = index, "leaked I/O handle");
                    }
                    backend.resowner_reclaim(index);
                    continue;
                }
                HandleState::CompletedLocal => {
                    backend.resowner_reclaim(index);
                    continue;
                }
                HandleState::Defined | HandleState::Prepared => {
                    backend.submit_staged();
                }
                HandleState::InFlight
                | HandleState::Reaped
                | HandleState::CompletedShared => {}
            }
            backend.clear_report(index);
        }

        if let Some(bb_index) = backend.handed_out_bounce_for_scope(self.id) {
            if !on_error {
                tracing::warn!(scope = self.name, bounce = bb_index, "leaked bounce buffer");
            }
            backend.drop_handed_out_bounce(bb_index);
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
