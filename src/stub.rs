//! The ref-counted stub that stands between async pipelines and their unit.
//!
//! Because VM initialization is deferred to the non-real-time thread, the
//! server can destroy a unit while a pipeline is still preparing its VM.
//! Pipelines therefore never hold a unit handle directly: they hold a clone of
//! the unit's `Arc<UnitStub>` and check the owner slot when they reach their
//! real-time publication stage. A destroyed unit clears the slot in its
//! teardown, so an orphaned pipeline reroutes its freshly built VM straight to
//! destruction instead of publishing it.
//!
//! The `Arc` strong count is the stub's reference count: the clone a pipeline
//! captures at submission is the acquire, dropping the payload during the
//! pipeline's real-time cleanup stage is the release, and the stub is freed
//! when the last reference goes away.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::unit::UnitId;

/// Owner slot sentinel for "the unit is gone".
const ORPHANED: usize = usize::MAX;

/// See the module docs. Never relocated once allocated; freely cloneable
/// across thread boundaries through its `Arc`.
#[derive(Debug)]
pub struct UnitStub {
    /// The owning unit's slot, or [`ORPHANED`]. Only ever written on the
    /// real-time thread (unit construction and destruction both run there),
    /// and only read during a pipeline's real-time stages, so all accesses are
    /// serialized by the command runner and relaxed ordering suffices.
    owner: AtomicUsize,
}

impl UnitStub {
    pub(crate) fn new(owner: UnitId) -> Arc<Self> {
        Arc::new(Self {
            owner: AtomicUsize::new(owner.index()),
        })
    }

    /// The unit this stub belongs to, if it is still alive.
    pub(crate) fn owner(&self) -> Option<UnitId> {
        match self.owner.load(Ordering::Relaxed) {
            ORPHANED => None,
            index => Some(UnitId::from_index(index)),
        }
    }

    /// Called exactly once, from the unit's teardown on the real-time thread.
    pub(crate) fn orphan(&self) {
        self.owner.store(ORPHANED, Ordering::Relaxed);
    }

    /// Whether the owning unit has been destroyed.
    pub fn is_orphaned(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == ORPHANED
    }
}
