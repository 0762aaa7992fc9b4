//! The process-wide thread-local "current loop" slot.
//!
//! Every [`crate::EventLoop`] registers itself here at construction and
//! deregisters on drop, enforcing one loop per thread: constructing a second
//! `EventLoop` on a thread that already has one is a programmer error and
//! aborts the process (see [`crate::error::abort`]). Components that are
//! only ever touched from their owning loop's thread (`Channel`,
//! `TimerQueue`, ...) reach the loop's mutable internals through this slot
//! rather than storing a direct reference to it, which would require
//! `EventLoop` itself to be shareable across an `Rc` cycle.

use std::cell::Cell;
use std::ptr;

use crate::error;
use crate::event_loop::EventLoop;

thread_local! {
    static CURRENT: Cell<*mut EventLoop> = Cell::new(ptr::null_mut());
}

/// Registers `loop_` as this thread's current loop. Aborts if one is
/// already registered.
pub(crate) fn set_current(loop_: *mut EventLoop) {
    CURRENT.with(|cell| {
        if !cell.get().is_null() {
            error::abort("another EventLoop already exists on this thread");
        }
        cell.set(loop_);
    });
}

pub(crate) fn clear_current() {
    CURRENT.with(|cell| cell.set(ptr::null_mut()));
}

pub(crate) fn is_set() -> bool {
    CURRENT.with(|cell| !cell.get().is_null())
}

/// Runs `f` with mutable access to this thread's current loop. Aborts if
/// called from a thread with no registered loop — every caller of this
/// function is expected to have already checked thread affinity, so
/// reaching here with nothing registered means an invariant was violated
/// upstream.
pub(crate) fn with_current<R>(f: impl FnOnce(&mut EventLoop) -> R) -> R {
    let ptr = CURRENT.with(|cell| cell.get());
    if ptr.is_null() {
        error::abort("no EventLoop registered on this thread");
    }
    // SAFETY: `ptr` was registered by a live `EventLoop` on this very
    // thread and is cleared on that loop's drop, so it is either null (the
    // abort above) or points at a still-live `EventLoop` owned by this
    // thread. Thread affinity keeps this from aliasing across threads.
    let loop_ref = unsafe { &mut *ptr };
    f(loop_ref)
}
