//! Hazard-pointer based safe memory reclamation.
//!
//! A thread that wants to dereference a shared pointer publishes it in one of
//! its hazard slots and re-validates that the pointer is still reachable.
//! Threads that unlink nodes retire them into a thread-local list; a
//! reclamation pass frees every retired pointer that is absent from all
//! published slots.
//!
//! Liveness caveat: a stalled thread that keeps a hazard published delays
//! reclamation of that one node indefinitely. This can grow the retired lists
//! but never causes a use-after-free.

mod domain;
mod hazard;
mod retire;
mod thread;

pub use domain::Domain;
pub use hazard::HazardPointer;
pub use thread::Thread;

use core::sync::atomic::{fence, Ordering};

/// The domain used by participants that don't carry their own.
pub static DEFAULT_DOMAIN: Domain = Domain::new();

/// Barrier between publishing a hazard and re-reading its source.
///
/// Pairs with the fence a reclaimer issues before scanning the slots: either
/// the scan observes the hazard, or the publisher's re-read observes the
/// unlink and rejects the pointer.
#[inline]
pub fn light_membarrier() {
    fence(Ordering::SeqCst);
}
