//! Synchronous fallback method: every operation runs inline.
//!
//! `needs_synchronous_execution` answers true unconditionally, so handles
//! never reach the staging array; the define path executes them on the spot
//! and completion is always local. `submit` still executes anything handed
//! to it, for the force-submit paths.

use crate::config::IoMethodKind;
use crate::engine::{Backend, EngineControl};
use crate::method::IoMethod;
use crate::ops;

pub(crate) struct SyncMethod;

impl IoMethod for SyncMethod {
    fn kind(&self) -> IoMethodKind {
        IoMethodKind::Sync
    }

    fn submit(&self, backend: &mut Backend, staged: &[u32]) -> usize {
        let ctl = backend.control().clone();
        for &index in staged {
            ctl.prepare_submit(index);
        }
        for &index in staged {
            ops::perform_synchronously(&ctl, backend, index);
        }
        staged.len()
    }

    fn needs_synchronous_execution(&self, _ctl: &EngineControl, _index: u32) -> bool {
        true
    }
}
