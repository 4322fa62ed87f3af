use core::mem;
use core::ptr;
use core::sync::atomic::{fence, AtomicPtr, Ordering};

use crate::domain::Domain;
use crate::hazard::{HazardArray, ThreadRecord};
use crate::retire::Retired;

/// A per-thread participant of a reclamation domain. Owns the thread's free
/// hazard-slot indices and its retired list.
///
/// Hand out raw pointers to a `Thread` only from a stable address (e.g. keep
/// it boxed): `HazardPointer` stores one.
pub struct Thread<'domain> {
    domain: &'domain Domain,
    pub(crate) hazards: &'domain ThreadRecord,
    available_indices: Vec<usize>,
    retired: Vec<Retired>,
    collect_count: usize,
}

const COUNTS_BETWEEN_COLLECT: usize = 128;

impl<'domain> Thread<'domain> {
    pub fn new(domain: &'domain Domain) -> Self {
        let (hazards, available_indices) = domain.threads.acquire();
        Self {
            domain,
            hazards,
            available_indices,
            retired: Vec::new(),
            collect_count: 0,
        }
    }

    pub(crate) fn acquire_slot(&mut self) -> usize {
        match self.available_indices.pop() {
            Some(idx) => idx,
            None => {
                self.grow_array();
                self.acquire_slot()
            }
        }
    }

    pub(crate) fn release_slot(&mut self, idx: usize) {
        self.available_indices.push(idx);
    }

    fn grow_array(&mut self) {
        let array = unsafe { &*self.hazards.hazptrs.load(Ordering::Relaxed) };
        let len = array.len();
        let grown: HazardArray = array
            .iter()
            .map(|slot| AtomicPtr::new(slot.load(Ordering::Relaxed)))
            .chain((len..2 * len).map(|_| AtomicPtr::new(ptr::null_mut())))
            .collect();
        // The previous array stays allocated; a reclaimer may be scanning it.
        self.hazards
            .hazptrs
            .store(Box::into_raw(Box::new(grown)), Ordering::Release);
        self.available_indices.extend(len..2 * len);
    }

    /// Queue `ptr` for reclamation once no hazard protects it.
    ///
    /// # Safety
    /// `ptr` must be a uniquely retired, `Box`-allocated `T` that has already
    /// been unlinked from every shared location.
    pub unsafe fn retire<T>(&mut self, ptr: *mut T) {
        self.retired.push(Retired::new(ptr));
        self.collect_count = self.collect_count.wrapping_add(1);
        if self.collect_count % COUNTS_BETWEEN_COLLECT == 0 {
            self.do_reclamation();
        }
    }

    /// Free every retired pointer that no thread currently protects; the rest
    /// stay queued for a later pass.
    pub fn do_reclamation(&mut self) {
        fence(Ordering::SeqCst);

        self.retired.extend(self.domain.orphans.pop_all());
        if self.retired.is_empty() {
            return;
        }

        let guarded_ptrs = self.domain.collect_guarded_ptrs();
        let mut blocked = Vec::new();
        for element in self.retired.drain(..) {
            if guarded_ptrs.contains(&element.ptr) {
                blocked.push(element);
            } else {
                unsafe { (element.deleter)(element.ptr) };
            }
        }
        self.retired = blocked;
    }
}

impl Drop for Thread<'_> {
    fn drop(&mut self) {
        self.do_reclamation();
        self.domain.threads.release(self.hazards);
        if !self.retired.is_empty() {
            // Whatever is still protected is handed to the domain; the next
            // reclamation pass of any surviving thread picks it up.
            self.domain.orphans.push(mem::take(&mut self.retired));
        }
    }
}
