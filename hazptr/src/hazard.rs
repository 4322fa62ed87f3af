use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use core::{mem, ptr};

use crossbeam_utils::CachePadded;

use crate::light_membarrier;
use crate::thread::Thread;

/// A claimed slot in the owning thread's hazard array.
///
/// Dropping it resets the protection and returns the slot to the thread.
pub struct HazardPointer<'domain> {
    thread: *const Thread<'domain>,
    idx: usize,
}

impl<'domain> HazardPointer<'domain> {
    /// Claim a slot of `thread`'s hazard array.
    pub fn new(thread: &mut Thread<'domain>) -> Self {
        let idx = thread.acquire_slot();
        Self { thread, idx }
    }

    #[inline]
    fn slot(&self) -> &AtomicPtr<u8> {
        let array = unsafe { &*(*self.thread).hazards.hazptrs.load(Ordering::Relaxed) };
        &array[self.idx]
    }

    /// Publish `ptr` in this slot.
    ///
    /// Publication alone proves nothing: the caller must re-validate that
    /// `ptr` is still reachable (after a `light_membarrier`) before
    /// dereferencing it.
    #[inline]
    pub fn protect_raw<T>(&mut self, ptr: *mut T) {
        self.slot().store(ptr as *mut u8, Ordering::Release);
    }

    /// Release the protection awarded by this hazard pointer, if any.
    #[inline]
    pub fn reset_protection(&mut self) {
        self.slot().store(ptr::null_mut(), Ordering::Release);
    }

    /// Check if `src` still points to `pointer`. If not, returns the current
    /// value of `src`.
    pub fn validate<T>(pointer: *mut T, src: &AtomicPtr<T>) -> Result<(), *mut T> {
        light_membarrier();
        let new = src.load(Ordering::Acquire);
        if pointer == new {
            Ok(())
        } else {
            Err(new)
        }
    }

    /// Try protecting `pointer` obtained from `src`; fails with the current
    /// value if `src` moved on in the meantime.
    pub fn try_protect<T>(&mut self, pointer: *mut T, src: &AtomicPtr<T>) -> Result<(), *mut T> {
        self.protect_raw(pointer);
        Self::validate(pointer, src)
    }

    /// Get a validated, protected pointer from `src`.
    pub fn protect<T>(&mut self, src: &AtomicPtr<T>) -> *mut T {
        let mut pointer = src.load(Ordering::Relaxed);
        while let Err(new) = self.try_protect(pointer, src) {
            pointer = new;
        }
        pointer
    }

    /// Exchange the protections held by two hazard pointers of the same
    /// thread.
    #[inline]
    pub fn swap(x: &mut HazardPointer<'_>, y: &mut HazardPointer<'_>) {
        mem::swap(&mut x.idx, &mut y.idx);
    }
}

impl Drop for HazardPointer<'_> {
    fn drop(&mut self) {
        self.reset_protection();
        unsafe { (*(self.thread as *mut Thread<'_>)).release_slot(self.idx) };
    }
}

pub(crate) type HazardArray = Vec<AtomicPtr<u8>>;

/// One participant's hazard slots. The array is written only by its owner;
/// growth publishes a copy and intentionally leaks the old array so that a
/// concurrent scanner never reads freed memory. Doubling keeps the waste
/// below the size of the final array.
pub(crate) struct ThreadRecord {
    next: *mut ThreadRecord,
    available: AtomicBool,
    pub(crate) hazptrs: CachePadded<AtomicPtr<HazardArray>>,
}

/// Push-only list of recyclable thread records.
pub(crate) struct ThreadRecords {
    head: AtomicPtr<ThreadRecord>,
}

const HAZARD_ARRAY_INIT_SIZE: usize = 16;

impl ThreadRecords {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn acquire(&self) -> (&ThreadRecord, Vec<usize>) {
        if let Some(avail) = self.try_acquire_available() {
            return avail;
        }
        self.acquire_new()
    }

    fn try_acquire_available(&self) -> Option<(&ThreadRecord, Vec<usize>)> {
        let mut cur = self.head.load(Ordering::Acquire);
        while let Some(cur_ref) = unsafe { cur.as_ref() } {
            if cur_ref.available.load(Ordering::Relaxed)
                && cur_ref
                    .available
                    .compare_exchange(true, false, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                let len = unsafe { &*cur_ref.hazptrs.load(Ordering::Relaxed) }.len();
                return Some((cur_ref, (0..len).collect()));
            }
            cur = cur_ref.next;
        }
        None
    }

    fn acquire_new(&self) -> (&ThreadRecord, Vec<usize>) {
        let array: HazardArray = (0..HAZARD_ARRAY_INIT_SIZE)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        let new = Box::leak(Box::new(ThreadRecord {
            next: ptr::null_mut(),
            available: AtomicBool::new(false),
            hazptrs: CachePadded::new(AtomicPtr::new(Box::into_raw(Box::new(array)))),
        }));

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            new.next = head;
            match self
                .head
                .compare_exchange(head, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return (new, (0..HAZARD_ARRAY_INIT_SIZE).collect()),
                Err(head_new) => head = head_new,
            }
        }
    }

    pub(crate) fn release(&self, rec: &ThreadRecord) {
        rec.available.store(true, Ordering::Release);
    }

    pub(crate) fn iter(&self) -> ThreadRecordsIter<'_> {
        ThreadRecordsIter {
            cur: self.head.load(Ordering::Acquire).cast_const(),
            _marker: PhantomData,
        }
    }
}

pub(crate) struct ThreadRecordsIter<'domain> {
    cur: *const ThreadRecord,
    _marker: PhantomData<&'domain ThreadRecord>,
}

impl<'domain> Iterator for ThreadRecordsIter<'domain> {
    type Item = &'domain ThreadRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let cur_ref = unsafe { self.cur.as_ref() }?;
        self.cur = cur_ref.next;
        Some(cur_ref)
    }
}

impl ThreadRecord {
    /// Snapshot of this record's published hazards. Reads the freshest array
    /// pointer; old arrays are never freed, so a stale read is still safe.
    pub(crate) fn guarded_ptrs(&self) -> impl Iterator<Item = *mut u8> + '_ {
        let array = unsafe { &*self.hazptrs.load(Ordering::Acquire) };
        array.iter().map(|slot| slot.load(Ordering::Acquire))
    }
}
