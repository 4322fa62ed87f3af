//! Tagged atomic pointers. The low alignment bits of a node address are free,
//! and bit 0 of a `next` link doubles as the logical-deletion mark.

use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::sync::atomic::{AtomicUsize, Ordering};

pub struct CompareExchangeError<T, P: Pointer<T>> {
    /// The would-be new value, handed back so the caller can retry or drop it
    /// without reallocating.
    pub new: P,
    pub current: Shared<T>,
}

/// An atomic tagged pointer. Backed by `AtomicUsize` so the mark bit can be
/// set with `fetch_or` on stable Rust.
pub struct Atomic<T> {
    link: AtomicUsize,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T> Sync for Atomic<T> {}
unsafe impl<T> Send for Atomic<T> {}

impl<T> Atomic<T> {
    #[inline]
    pub fn new(init: T) -> Self {
        Self {
            link: AtomicUsize::new(Box::into_raw(Box::new(init)) as usize),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub const fn null() -> Self {
        Self {
            link: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> Shared<T> {
        Shared::from_usize(self.link.load(order))
    }

    #[inline]
    pub fn store(&self, ptr: Shared<T>, order: Ordering) {
        self.link.store(ptr.into_usize(), order)
    }

    /// Atomically ORs `tag` into the link and returns the previous value.
    /// This is the logical-deletion primitive.
    #[inline]
    pub fn fetch_or(&self, tag: usize, order: Ordering) -> Shared<T> {
        Shared::from_usize(self.link.fetch_or(tag & low_bits::<T>(), order))
    }

    #[inline]
    pub fn compare_exchange<P: Pointer<T>>(
        &self,
        current: Shared<T>,
        new: P,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Shared<T>, CompareExchangeError<T, P>> {
        let new = new.into_raw();
        match self.link.compare_exchange(
            current.into_usize(),
            new as usize,
            success,
            failure,
        ) {
            Ok(current) => Ok(Shared::from_usize(current)),
            Err(current) => Err(CompareExchangeError {
                new: unsafe { P::from_raw(new) },
                current: Shared::from_usize(current),
            }),
        }
    }

    /// Take ownership of the pointee, ignoring any tag.
    #[inline]
    pub unsafe fn try_into_owned(self) -> Option<Box<T>> {
        let ptr = base_ptr(self.link.into_inner() as *mut T);
        if ptr.is_null() {
            None
        } else {
            Some(Box::from_raw(ptr))
        }
    }
}

impl<T> Default for Atomic<T> {
    #[inline]
    fn default() -> Self {
        Self::null()
    }
}

impl<T> From<Shared<T>> for Atomic<T> {
    #[inline]
    fn from(ptr: Shared<T>) -> Self {
        Self {
            link: AtomicUsize::new(ptr.into_usize()),
            _marker: PhantomData,
        }
    }
}

/// A copyable tagged pointer value, as read from an [`Atomic`].
pub struct Shared<T> {
    data: usize,
    _marker: PhantomData<*mut T>,
}

impl<T> Shared<T> {
    #[inline]
    fn from_usize(data: usize) -> Self {
        Self {
            data,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn into_usize(self) -> usize {
        self.data
    }

    #[inline]
    pub fn from_owned(init: T) -> Self {
        Self::from_usize(Box::into_raw(Box::new(init)) as usize)
    }

    #[inline]
    pub fn null() -> Self {
        Self::from_usize(0)
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        base_ptr(self.data as *mut T).is_null()
    }

    #[inline]
    pub fn tag(&self) -> usize {
        self.data & low_bits::<T>()
    }

    #[inline]
    pub fn with_tag(&self, tag: usize) -> Self {
        Self::from_usize((self.data & !low_bits::<T>()) | (tag & low_bits::<T>()))
    }

    /// # Safety
    /// The pointer must be valid (protected or otherwise known live) and
    /// untagged or the tag must be stripped by the caller first.
    #[inline]
    pub unsafe fn deref<'g>(&self) -> &'g T {
        &*base_ptr(self.data as *mut T)
    }
}

impl<T> Clone for Shared<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Shared<T> {}

// Manual impl: a derive would demand `T: Debug`, but a `Shared<T>` is just an
// address and a tag.
impl<T> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("ptr", &base_ptr(self.data as *mut T))
            .field("tag", &self.tag())
            .finish()
    }
}

impl<T> PartialEq for Shared<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl<T> Eq for Shared<T> {}

pub trait Pointer<T> {
    fn into_raw(self) -> *mut T;
    /// # Safety
    /// `raw` must have been produced by `into_raw` of the same impl.
    unsafe fn from_raw(raw: *mut T) -> Self;
}

impl<T> Pointer<T> for Shared<T> {
    #[inline]
    fn into_raw(self) -> *mut T {
        self.data as *mut T
    }

    #[inline]
    unsafe fn from_raw(raw: *mut T) -> Self {
        Self::from_usize(raw as usize)
    }
}

impl<T> Pointer<T> for Box<T> {
    #[inline]
    fn into_raw(self) -> *mut T {
        Box::into_raw(self)
    }

    #[inline]
    unsafe fn from_raw(raw: *mut T) -> Self {
        Box::from_raw(raw)
    }
}

/// Bitmask of the unused least significant bits of an aligned pointer to `T`.
#[inline]
fn low_bits<T: Sized>() -> usize {
    (1 << mem::align_of::<T>().trailing_zeros()) - 1
}

#[inline]
fn base_ptr<T: Sized>(ptr: *mut T) -> *mut T {
    (ptr as usize & !low_bits::<T>()) as *mut T
}
