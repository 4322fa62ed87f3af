//! Lazily allocated bucket directory. Capacity for every bucket the map can
//! ever grow to is reserved up front as a small fixed array of segment
//! pointers; the segments themselves are allocated on first touch, so
//! doubling the bucket count allocates nothing and moves nothing.

use core::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::list::Node;
use crate::pointers::Shared;

/// Segment `0` holds the first `seg0_len` buckets; segment `s >= 1` holds
/// `seg0_len << (s - 1)` buckets, so each new segment doubles the total.
type Segment<K, V> = [Slot<K, V>];

struct Slot<K, V>(AtomicPtr<Node<K, V>>);

pub(crate) struct BucketTable<K, V> {
    segments: Box<[AtomicPtr<Slot<K, V>>]>,
    seg0_len: usize,
}

const SEGMENT_COUNT: usize = usize::BITS as usize;

unsafe impl<K, V> Sync for BucketTable<K, V> {}
unsafe impl<K, V> Send for BucketTable<K, V> {}

impl<K, V> BucketTable<K, V> {
    /// `seg0_len` must be a power of two.
    pub(crate) fn new(seg0_len: usize) -> Self {
        debug_assert!(seg0_len.is_power_of_two());
        let segments = (0..SEGMENT_COUNT - seg0_len.trailing_zeros() as usize)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Self { segments, seg0_len }
    }

    /// Largest bucket count this directory can address.
    pub(crate) fn max_buckets(&self) -> usize {
        self.seg0_len << (self.segments.len() - 1)
    }

    fn locate(&self, index: usize) -> (usize, usize) {
        if index < self.seg0_len {
            return (0, index);
        }
        let seg = ((index / self.seg0_len).ilog2() + 1) as usize;
        (seg, index - (self.seg0_len << (seg - 1)))
    }

    fn segment_len(&self, seg: usize) -> usize {
        if seg == 0 {
            self.seg0_len
        } else {
            self.seg0_len << (seg - 1)
        }
    }

    fn alloc_segment(len: usize) -> *mut Slot<K, V> {
        let segment: Box<Segment<K, V>> = (0..len)
            .map(|_| Slot(AtomicPtr::new(ptr::null_mut())))
            .collect();
        Box::into_raw(segment) as *mut Slot<K, V>
    }

    /// Slot for `index`, allocating its segment on first touch. Losers of
    /// the allocation race free their copy and use the winner's.
    fn slot(&self, index: usize) -> &AtomicPtr<Node<K, V>> {
        let (seg, offset) = self.locate(index);
        let head = &self.segments[seg];

        let mut base = head.load(Ordering::Acquire);
        if base.is_null() {
            let len = self.segment_len(seg);
            let fresh = Self::alloc_segment(len);
            match head.compare_exchange(
                ptr::null_mut(),
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => base = fresh,
                Err(winner) => {
                    drop(unsafe {
                        Box::from_raw(ptr::slice_from_raw_parts_mut(fresh, len))
                    });
                    base = winner;
                }
            }
        }
        unsafe { &(*base.add(offset)).0 }
    }

    /// The dummy published for bucket `index`, or null while the bucket is
    /// uninitialized.
    pub(crate) fn lookup(&self, index: usize) -> Shared<Node<K, V>> {
        let raw = self.slot(index).load(Ordering::Acquire);
        unsafe { crate::pointers::Pointer::from_raw(raw) }
    }

    /// Publish `dummy` as bucket `index`'s head. First publisher wins; the
    /// winning pointer is returned either way.
    pub(crate) fn publish(
        &self,
        index: usize,
        dummy: Shared<Node<K, V>>,
    ) -> Shared<Node<K, V>> {
        use crate::pointers::Pointer;
        match self.slot(index).compare_exchange(
            ptr::null_mut(),
            dummy.into_raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => dummy,
            Err(winner) => unsafe { Shared::from_raw(winner) },
        }
    }
}

impl<K, V> Drop for BucketTable<K, V> {
    fn drop(&mut self) {
        // Dummies belong to the chain; only the segments are freed here.
        let seg0_len = self.seg0_len;
        for (seg, head) in self.segments.iter_mut().enumerate() {
            let base = *head.get_mut();
            if !base.is_null() {
                let len = if seg == 0 { seg0_len } else { seg0_len << (seg - 1) };
                drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(base, len)) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::Node;
    use crate::pointers::{Pointer, Shared};

    fn dummy(order_key: usize) -> Shared<Node<u64, u64>> {
        unsafe { Shared::from_raw(Box::into_raw(Box::new(Node::dummy(order_key)))) }
    }

    fn free(node: Shared<Node<u64, u64>>) {
        drop(unsafe { Box::from_raw(node.into_raw()) });
    }

    #[test]
    fn locate_covers_doubling_segments() {
        let table = BucketTable::<u64, u64>::new(8);
        assert_eq!(table.locate(0), (0, 0));
        assert_eq!(table.locate(7), (0, 7));
        assert_eq!(table.locate(8), (1, 0));
        assert_eq!(table.locate(15), (1, 7));
        assert_eq!(table.locate(16), (2, 0));
        assert_eq!(table.locate(31), (2, 15));
        assert_eq!(table.locate(32), (3, 0));
        assert!(table.max_buckets() >= 1 << 40);
    }

    #[test]
    fn publish_is_first_writer_wins() {
        let table = BucketTable::<u64, u64>::new(2);
        assert!(table.lookup(5).is_null());

        let first = dummy(5);
        assert_eq!(table.publish(5, first), first);
        assert_eq!(table.lookup(5), first);

        let second = dummy(5);
        assert_eq!(table.publish(5, second), first);
        assert_eq!(table.lookup(5), first);

        free(first);
        free(second);
    }

    #[test]
    fn distant_buckets_share_nothing() {
        let table = BucketTable::<u64, u64>::new(2);
        let low = dummy(1);
        let high = dummy(1000);
        table.publish(1, low);
        table.publish(1000, high);
        assert_eq!(table.lookup(1), low);
        assert_eq!(table.lookup(1000), high);
        assert!(table.lookup(999).is_null());
        free(low);
        free(high);
    }
}
