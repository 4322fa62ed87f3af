//! The ordered bucket chain: one globally sorted lock-free singly linked
//! list holding every entry and every bucket-head dummy, ordered by
//! bit-reversed order keys so that a bucket's nodes form a contiguous range
//! and bucket splits never move nodes.

use core::mem;
use std::cmp::Ordering::{Equal, Greater, Less};
use std::sync::atomic::Ordering;

use hazptr::{light_membarrier, HazardPointer, Thread, DEFAULT_DOMAIN};

use crate::pointers::{Atomic, Pointer, Shared};

/// Order key of an entry: bit-reversed hash with the lowest bit forced to 1,
/// so an entry always sorts after its bucket's dummy.
#[inline]
pub(crate) fn entry_order_key(hash: usize) -> usize {
    hash.reverse_bits() | 1
}

/// Order key of a bucket dummy: bit-reversed bucket index, lowest bit 0.
#[inline]
pub(crate) fn bucket_order_key(bucket: usize) -> usize {
    bucket.reverse_bits()
}

pub struct Node<K, V> {
    /// Tag bit 1 marks this node as logically deleted. A set mark is never
    /// cleared.
    next: Atomic<Node<K, V>>,
    order_key: usize,
    /// `None` for bucket-head dummies, which carry no user payload and are
    /// never erased.
    data: Option<(K, V)>,
}

impl<K, V> Node<K, V> {
    pub(crate) fn entry(order_key: usize, key: K, value: V) -> Self {
        Self {
            next: Atomic::null(),
            order_key,
            data: Some((key, value)),
        }
    }

    pub(crate) fn dummy(order_key: usize) -> Self {
        Self {
            next: Atomic::null(),
            order_key,
            data: None,
        }
    }

    fn is_dummy(&self) -> bool {
        self.data.is_none()
    }
}

impl<K, V> Node<K, V>
where
    K: Ord,
{
    /// Position of this node relative to a search target. Ties on the order
    /// key are broken by the key, which only ever happens between two
    /// entries: a dummy and an entry never share an order key (their low
    /// bits differ), and two dummies with equal order keys are the same
    /// bucket's.
    fn cmp_target(&self, order_key: usize, key: Option<&K>) -> std::cmp::Ordering {
        self.order_key.cmp(&order_key).then_with(|| {
            match (&self.data, key) {
                (Some((own, _)), Some(target)) => own.cmp(target),
                _ => Equal,
            }
        })
    }
}

/// The chain itself; `head` points at the bucket-0 dummy, which has the
/// smallest possible order key and heads every traversal at teardown.
pub struct SplitList<K, V> {
    head: Atomic<Node<K, V>>,
}

impl<K, V> Drop for SplitList<K, V> {
    fn drop(&mut self) {
        let mut o_curr = mem::take(&mut self.head);

        while let Some(curr) = unsafe { o_curr.try_into_owned() } {
            o_curr = curr.next;
        }
    }
}

/// Hazard slots and the reclamation participant for one thread's operations
/// on one map. Create one per thread and reuse it across calls.
pub struct Handle<'domain> {
    prev_h: HazardPointer<'domain>,
    curr_h: HazardPointer<'domain>,
    thread: Box<Thread<'domain>>,
}

impl Default for Handle<'static> {
    fn default() -> Self {
        let mut thread = Box::new(Thread::new(&DEFAULT_DOMAIN));
        Self {
            prev_h: HazardPointer::new(&mut thread),
            curr_h: HazardPointer::new(&mut thread),
            thread,
        }
    }
}

impl<'domain> Handle<'domain> {
    // bypass E0499-E0503, etc that are supposed to be fixed by polonius
    #[inline]
    pub(crate) fn launder<'hp2>(&mut self) -> &'hp2 mut Self {
        unsafe { core::mem::transmute(self) }
    }
}

pub(crate) struct Cursor<'domain, 'hp, K, V> {
    prev: Shared<Node<K, V>>,
    pub(crate) curr: Shared<Node<K, V>>,
    handle: &'hp mut Handle<'domain>,
}

impl<'domain, 'hp, K, V> Cursor<'domain, 'hp, K, V> {
    /// Start a traversal at `start`, which must be a dummy (dummies are
    /// never reclaimed, so `start` needs no protection).
    fn new(start: Shared<Node<K, V>>, handle: &'hp mut Handle<'domain>) -> Self {
        let curr = unsafe { start.deref() }.next.load(Ordering::Acquire).with_tag(0);
        Self {
            prev: start,
            curr,
            handle,
        }
    }
}

impl<'domain, 'hp, K, V> Cursor<'domain, 'hp, K, V>
where
    K: Ord,
{
    /// Harris-Michael traversal: walk until the first node at or past the
    /// target, physically unlinking every marked node on the way. `Err(())`
    /// means a validation or unlink CAS failed and the caller must restart
    /// from its start dummy.
    fn find(&mut self, order_key: usize, key: Option<&K>) -> Result<bool, ()> {
        loop {
            debug_assert_eq!(self.curr.tag(), 0);
            if self.curr.is_null() {
                return Ok(false);
            }

            let prev = unsafe { &self.prev.deref().next };

            self.handle.curr_h.protect_raw(self.curr.into_raw());
            light_membarrier();
            let curr_new = prev.load(Ordering::Acquire);
            if curr_new.tag() != 0 {
                // prev was logically deleted under us; its link can no
                // longer be trusted.
                return Err(());
            } else if curr_new != self.curr {
                // Retrying the protection is fine as long as prev itself is
                // not marked.
                self.curr = curr_new;
                continue;
            }

            let curr_node = unsafe { self.curr.deref() };
            let next = curr_node.next.load(Ordering::Acquire);

            if next.tag() == 0 {
                match curr_node.cmp_target(order_key, key) {
                    Less => {
                        self.prev = self.curr;
                        HazardPointer::swap(&mut self.handle.prev_h, &mut self.handle.curr_h);
                    }
                    Equal => return Ok(true),
                    Greater => return Ok(false),
                }
            } else if prev
                .compare_exchange(
                    self.curr,
                    next.with_tag(0),
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                unsafe { self.handle.thread.retire(self.curr.into_raw()) };
            } else {
                return Err(());
            }
            self.curr = next.with_tag(0);
        }
    }
}

impl<K, V> SplitList<K, V>
where
    K: Ord + 'static,
    V: 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            head: Atomic::new(Node::dummy(bucket_order_key(0))),
        }
    }

    /// The bucket-0 dummy. Immortal, so the returned pointer never dangles.
    pub(crate) fn head_node(&self) -> Shared<Node<K, V>> {
        self.head.load(Ordering::Relaxed)
    }

    /// Insert `node` into the chain, starting the walk at the dummy `start`.
    /// On a duplicate, the allocation is handed back together with the
    /// incumbent node (protected by the handle until its next operation).
    pub(crate) fn insert_at<'domain, 'hp>(
        &self,
        start: Shared<Node<K, V>>,
        mut node: Box<Node<K, V>>,
        handle: &'hp mut Handle<'domain>,
    ) -> Result<Shared<Node<K, V>>, (Box<Node<K, V>>, Shared<Node<K, V>>)> {
        loop {
            let mut cursor = Cursor::new(start, handle.launder());
            let Ok(found) = cursor.find(node.order_key, node.data.as_ref().map(|(k, _)| k))
            else {
                continue;
            };
            if found {
                return Err((node, cursor.curr));
            }

            node.next = cursor.curr.into();
            let new = unsafe { Shared::from_raw(Box::into_raw(node)) };
            match unsafe { cursor.prev.deref() }.next.compare_exchange(
                cursor.curr,
                new,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(new),
                Err(e) => node = unsafe { Box::from_raw(e.new.into_raw()) },
            }
        }
    }

    /// Look up the entry for `key`; the reference stays valid until the
    /// handle's next operation.
    pub(crate) fn get_at<'domain, 'hp>(
        &self,
        start: Shared<Node<K, V>>,
        order_key: usize,
        key: &K,
        handle: &'hp mut Handle<'domain>,
    ) -> Option<&'hp V> {
        loop {
            let mut cursor = Cursor::new(start, handle.launder());
            match cursor.find(order_key, Some(key)) {
                Ok(true) => {
                    return unsafe { cursor.curr.deref() }.data.as_ref().map(|(_, v)| v)
                }
                Ok(false) => return None,
                Err(()) => continue,
            }
        }
    }

    /// Erase the entry for `key`. Setting the mark bit is the linearization
    /// point; exactly one thread wins it and returns the value. Physical
    /// unlinking (and retirement) is best-effort here, completed by later
    /// traversals if the CAS fails.
    pub(crate) fn remove_at<'domain, 'hp>(
        &self,
        start: Shared<Node<K, V>>,
        order_key: usize,
        key: &K,
        handle: &'hp mut Handle<'domain>,
    ) -> Option<&'hp V> {
        loop {
            let mut cursor = Cursor::new(start, handle.launder());
            let Ok(found) = cursor.find(order_key, Some(key)) else {
                continue;
            };
            if !found {
                return None;
            }

            let curr_node = unsafe { cursor.curr.deref() };
            let next = curr_node.next.fetch_or(1, Ordering::AcqRel);
            if next.tag() == 1 {
                // Another eraser beat us to the mark; retry resolves to
                // not-found.
                continue;
            }

            let prev = unsafe { &cursor.prev.deref().next };
            if prev
                .compare_exchange(cursor.curr, next, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                unsafe { cursor.handle.thread.retire(cursor.curr.into_raw()) };
            }

            return curr_node.data.as_ref().map(|(_, v)| v);
        }
    }

    /// Erase the first live entry in chain order. Returns false once only
    /// dummies remain.
    pub(crate) fn pop_first_entry(&self, handle: &mut Handle<'_>) -> bool {
        loop {
            match self.try_pop_first(handle.launder()) {
                Ok(popped) => return popped,
                Err(()) => continue,
            }
        }
    }

    fn try_pop_first(&self, handle: &mut Handle<'_>) -> Result<bool, ()> {
        let mut cursor = Cursor::new(self.head_node(), handle.launder());
        loop {
            if cursor.curr.is_null() {
                return Ok(false);
            }

            let prev = unsafe { &cursor.prev.deref().next };

            cursor.handle.curr_h.protect_raw(cursor.curr.into_raw());
            light_membarrier();
            let curr_new = prev.load(Ordering::Acquire);
            if curr_new.tag() != 0 {
                return Err(());
            } else if curr_new != cursor.curr {
                cursor.curr = curr_new;
                continue;
            }

            let curr_node = unsafe { cursor.curr.deref() };
            let next = curr_node.next.load(Ordering::Acquire);

            if next.tag() != 0 {
                if prev
                    .compare_exchange(
                        cursor.curr,
                        next.with_tag(0),
                        Ordering::Release,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    unsafe { cursor.handle.thread.retire(cursor.curr.into_raw()) };
                    cursor.curr = next.with_tag(0);
                    continue;
                }
                return Err(());
            }

            if curr_node.is_dummy() {
                cursor.prev = cursor.curr;
                cursor.curr = next;
                HazardPointer::swap(&mut cursor.handle.prev_h, &mut cursor.handle.curr_h);
                continue;
            }

            let next = curr_node.next.fetch_or(1, Ordering::AcqRel);
            if next.tag() == 1 {
                return Err(());
            }
            if prev
                .compare_exchange(cursor.curr, next, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                unsafe { cursor.handle.thread.retire(cursor.curr.into_raw()) };
            }
            return Ok(true);
        }
    }

    pub(crate) fn iter<'domain, 'hp>(
        &self,
        handle: &'hp mut Handle<'domain>,
    ) -> Iter<'domain, 'hp, K, V> {
        let head = self.head_node();
        let curr = unsafe { head.deref() }.next.load(Ordering::Acquire).with_tag(0);
        Iter {
            prev: head,
            curr,
            anchor: head,
            last: None,
            handle,
        }
    }
}

/// Weakly consistent iteration over the whole chain. Entries inserted or
/// erased concurrently may or may not be observed, but a logically deleted
/// entry is never yielded and no key is yielded twice.
pub struct Iter<'domain, 'hp, K, V> {
    prev: Shared<Node<K, V>>,
    curr: Shared<Node<K, V>>,
    /// Most recent dummy passed. Dummies are immortal, so this is always a
    /// safe node to restart from after losing a race.
    anchor: Shared<Node<K, V>>,
    /// Position of the last entry yielded; everything at or before it is
    /// skipped after a restart.
    last: Option<(usize, K)>,
    handle: &'hp mut Handle<'domain>,
}

impl<'domain, 'hp, K, V> Iter<'domain, 'hp, K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    fn restart(&mut self) {
        self.prev = self.anchor;
        self.curr = unsafe { self.anchor.deref() }
            .next
            .load(Ordering::Acquire)
            .with_tag(0);
    }

    fn step(&mut self) -> Result<Option<(K, V)>, ()> {
        loop {
            if self.curr.is_null() {
                return Ok(None);
            }

            let prev = unsafe { &self.prev.deref().next };

            self.handle.curr_h.protect_raw(self.curr.into_raw());
            light_membarrier();
            let curr_new = prev.load(Ordering::Acquire);
            if curr_new.tag() != 0 {
                return Err(());
            } else if curr_new != self.curr {
                self.curr = curr_new;
                continue;
            }

            let curr_node = unsafe { self.curr.deref() };
            let next = curr_node.next.load(Ordering::Acquire);

            if next.tag() != 0 {
                // A marked node's successor cannot be validated, so unlink
                // rather than walk through it.
                if prev
                    .compare_exchange(
                        self.curr,
                        next.with_tag(0),
                        Ordering::Release,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    unsafe { self.handle.thread.retire(self.curr.into_raw()) };
                    self.curr = next.with_tag(0);
                    continue;
                }
                return Err(());
            }

            match &curr_node.data {
                None => {
                    self.anchor = self.curr;
                }
                Some((key, value)) => {
                    let already_yielded = self
                        .last
                        .as_ref()
                        .map_or(false, |(lo, lk)| (curr_node.order_key, key) <= (*lo, lk));
                    if !already_yielded {
                        self.last = Some((curr_node.order_key, key.clone()));
                        return Ok(Some((key.clone(), value.clone())));
                    }
                }
            }

            self.prev = self.curr;
            self.curr = next;
            HazardPointer::swap(&mut self.handle.prev_h, &mut self.handle.curr_h);
        }
    }
}

impl<'domain, 'hp, K, V> Iterator for Iter<'domain, 'hp, K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        loop {
            match self.step() {
                Ok(item) => return item,
                Err(()) => self.restart(),
            }
        }
    }
}
