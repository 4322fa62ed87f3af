//! Split-ordered hash map: a single sorted lock-free list partitioned by
//! lazily initialized bucket-head dummies. Growing the map doubles the
//! bucket count; no node ever moves.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::buckets::BucketTable;
use crate::list::{bucket_order_key, entry_order_key, Iter, Node, SplitList};
use crate::pointers::Shared;

pub use crate::list::Handle;

const DEFAULT_EXPECTED_ITEMS: usize = 64;
const DEFAULT_LOAD_FACTOR: usize = 1;
const MIN_BUCKETS: usize = 2;

pub struct SplitListMap<K, V> {
    chain: SplitList<K, V>,
    table: BucketTable<K, V>,
    /// Always a power of two; grows by CAS-doubling, never shrinks.
    bucket_count: AtomicUsize,
    size: AtomicUsize,
    /// Average entries per bucket tolerated before doubling.
    load_factor: usize,
}

impl<K, V> Default for SplitListMap<K, V>
where
    K: Ord + Hash + 'static,
    V: 'static,
{
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EXPECTED_ITEMS, DEFAULT_LOAD_FACTOR)
    }
}

impl<K, V> SplitListMap<K, V>
where
    K: Ord + Hash + 'static,
    V: 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Size the initial bucket count for `expected_items`. `load_factor`
    /// must be nonzero.
    pub fn with_capacity(expected_items: usize, load_factor: usize) -> Self {
        assert!(load_factor > 0, "load factor must be nonzero");
        let initial = (expected_items / load_factor)
            .next_power_of_two()
            .max(MIN_BUCKETS);

        let chain = SplitList::new();
        let table = BucketTable::new(initial);
        // Bucket 0's dummy is the chain head itself.
        table.publish(0, chain.head_node());
        Self {
            chain,
            table,
            bucket_count: AtomicUsize::new(initial),
            size: AtomicUsize::new(0),
            load_factor,
        }
    }

    pub fn handle(&self) -> Handle<'static> {
        Handle::default()
    }

    fn hash(key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish() as usize
    }

    /// Head dummy for `index`, initializing the bucket (and, recursively,
    /// its parent) on first touch.
    fn bucket_head(&self, index: usize, handle: &mut Handle<'_>) -> Shared<Node<K, V>> {
        let head = self.table.lookup(index);
        if !head.is_null() {
            return head;
        }
        self.init_bucket(index, handle)
    }

    fn init_bucket(&self, index: usize, handle: &mut Handle<'_>) -> Shared<Node<K, V>> {
        // Parent bucket: the index with its highest set bit cleared. It
        // covers a superset of this bucket's range, so the new dummy is
        // inserted starting from the parent's dummy.
        let parent = index & !(1 << index.ilog2());
        let parent_head = self.bucket_head(parent, handle);

        let dummy = Box::new(Node::dummy(bucket_order_key(index)));
        let dummy = match self.chain.insert_at(parent_head, dummy, handle) {
            Ok(inserted) => inserted,
            // Another initializer already chained this bucket's dummy.
            Err((_, existing)) => existing,
        };
        self.table.publish(index, dummy)
    }

    /// Double the bucket count if the load factor is exceeded. Lock-free:
    /// a failed CAS means another thread already grew the map.
    fn maybe_grow(&self) {
        let buckets = self.bucket_count.load(Ordering::Relaxed);
        if self.size.load(Ordering::Relaxed) / buckets < self.load_factor {
            return;
        }
        if buckets < self.table.max_buckets() {
            let _ = self.bucket_count.compare_exchange(
                buckets,
                buckets * 2,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }
    }

    fn bucket_of(&self, hash: usize) -> usize {
        hash & (self.bucket_count.load(Ordering::Relaxed) - 1)
    }

    /// Insert `key`, failing if it is already present.
    pub fn try_add(&self, key: K, value: V, handle: &mut Handle<'_>) -> bool {
        let hash = Self::hash(&key);
        let head = self.bucket_head(self.bucket_of(hash), handle);
        let node = Box::new(Node::entry(entry_order_key(hash), key, value));
        match self.chain.insert_at(head, node, handle) {
            Ok(_) => {
                self.size.fetch_add(1, Ordering::Relaxed);
                self.maybe_grow();
                true
            }
            Err(_) => false,
        }
    }

    /// Reference to `key`'s value; valid until `handle`'s next operation.
    pub fn get<'hp>(&'hp self, key: &K, handle: &'hp mut Handle<'_>) -> Option<&'hp V> {
        let hash = Self::hash(key);
        let head = self.bucket_head(self.bucket_of(hash), handle.launder());
        self.chain.get_at(head, entry_order_key(hash), key, handle)
    }

    /// Erase `key`, returning a reference to the removed value; valid until
    /// `handle`'s next operation.
    pub fn remove<'hp>(&'hp self, key: &K, handle: &'hp mut Handle<'_>) -> Option<&'hp V> {
        let hash = Self::hash(key);
        let head = self.bucket_head(self.bucket_of(hash), handle.launder());
        let removed = self
            .chain
            .remove_at(head, entry_order_key(hash), key, handle);
        if removed.is_some() {
            self.size.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Number of entries. Exact only in quiescence; concurrent operations
    /// make it a moment-in-time approximation.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Erase entries one at a time until none remain. Entries inserted
    /// concurrently may survive.
    pub fn clear(&self, handle: &mut Handle<'_>) {
        while self.chain.pop_first_entry(handle.launder()) {
            self.size.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl<K, V> SplitListMap<K, V>
where
    K: Ord + Hash + Clone + 'static,
    V: Clone + 'static,
{
    pub fn try_erase(&self, key: &K, handle: &mut Handle<'_>) -> Option<V> {
        self.remove(key, handle.launder()).cloned()
    }

    pub fn try_get(&self, key: &K, handle: &mut Handle<'_>) -> Option<V> {
        self.get(key, handle.launder()).cloned()
    }

    /// Weakly consistent snapshot iteration: entries present for the whole
    /// iteration are yielded exactly once; concurrently mutated entries may
    /// or may not appear.
    pub fn iter<'domain, 'hp>(
        &self,
        handle: &'hp mut Handle<'domain>,
    ) -> Iter<'domain, 'hp, K, V> {
        self.chain.iter(handle)
    }

    pub fn get_keys(&self, handle: &mut Handle<'_>) -> Vec<K> {
        self.iter(handle.launder()).map(|(k, _)| k).collect()
    }

    pub fn get_values(&self, handle: &mut Handle<'_>) -> Vec<V> {
        self.iter(handle.launder()).map(|(_, v)| v).collect()
    }
}

impl<K, V> crate::concurrent_map::ConcurrentMap<K, V> for SplitListMap<K, V>
where
    K: Ord + Hash + 'static,
    V: 'static,
{
    type Handle<'domain> = Handle<'domain>;

    fn new() -> Self {
        SplitListMap::new()
    }

    fn handle() -> Self::Handle<'static> {
        Handle::default()
    }

    #[inline(always)]
    fn get<'hp>(&'hp self, handle: &'hp mut Self::Handle<'_>, key: &K) -> Option<&'hp V> {
        self.get(key, handle)
    }

    #[inline(always)]
    fn insert(&self, handle: &mut Self::Handle<'_>, key: K, value: V) -> bool {
        self.try_add(key, value, handle)
    }

    #[inline(always)]
    fn remove<'hp>(&'hp self, handle: &'hp mut Self::Handle<'_>, key: &K) -> Option<&'hp V> {
        self.remove(key, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::SplitListMap;
    use crate::concurrent_map;

    #[test]
    fn smoke() {
        concurrent_map::tests::smoke::<SplitListMap<i32, String>>();
    }

    #[test]
    fn add_get_erase() {
        let map = SplitListMap::new();
        let mut handle = map.handle();

        assert!(map.try_add(1u64, "one", &mut handle));
        assert!(!map.try_add(1u64, "uno", &mut handle));
        assert_eq!(map.try_get(&1, &mut handle), Some("one"));
        assert_eq!(map.size(), 1);

        assert_eq!(map.try_erase(&1, &mut handle), Some("one"));
        assert_eq!(map.try_erase(&1, &mut handle), None);
        assert_eq!(map.try_get(&1, &mut handle), None);
        assert!(map.is_empty());
    }

    #[test]
    fn survives_growth() {
        let map = SplitListMap::with_capacity(2, 1);
        let mut handle = map.handle();

        for key in 0u64..1024 {
            assert!(map.try_add(key, key * 3, &mut handle));
        }
        assert_eq!(map.size(), 1024);
        for key in 0u64..1024 {
            assert_eq!(map.try_get(&key, &mut handle), Some(key * 3));
        }
        for key in (0u64..1024).step_by(2) {
            assert_eq!(map.try_erase(&key, &mut handle), Some(key * 3));
        }
        assert_eq!(map.size(), 512);
        for key in 0u64..1024 {
            assert_eq!(map.try_get(&key, &mut handle).is_some(), key % 2 == 1);
        }
    }

    #[test]
    fn clear_empties_and_map_stays_usable() {
        let map = SplitListMap::new();
        let mut handle = map.handle();

        for key in 0u64..100 {
            assert!(map.try_add(key, key, &mut handle));
        }
        map.clear(&mut handle);
        assert_eq!(map.size(), 0);
        assert_eq!(map.try_get(&50, &mut handle), None);

        assert!(map.try_add(7, 7, &mut handle));
        assert_eq!(map.try_get(&7, &mut handle), Some(7));
    }

    #[test]
    fn doubled_values_then_erase_evens() {
        let map = SplitListMap::new();
        let mut handle = map.handle();

        for k in 1u64..=1000 {
            assert!(map.try_add(k, 2 * k, &mut handle));
        }
        assert_eq!(map.size(), 1000);
        let sum: u64 = map.get_values(&mut handle).iter().sum();
        assert_eq!(sum, 1000 * 1001);

        for k in (2u64..=1000).step_by(2) {
            assert_eq!(map.try_erase(&k, &mut handle), Some(2 * k));
        }
        assert_eq!(map.size(), 500);
        for k in (2u64..=1000).step_by(2) {
            assert_eq!(map.try_get(&k, &mut handle), None);
        }
        for k in (1u64..=1000).step_by(2) {
            assert_eq!(map.try_get(&k, &mut handle), Some(2 * k));
        }
    }

    #[test]
    fn concurrent_insert_erase_converges_to_empty() {
        use crossbeam_utils::thread;

        const THREADS: u64 = 8;
        const PER_THREAD: u64 = 2000;

        let map = &SplitListMap::new();
        thread::scope(|s| {
            for t in 0..THREADS {
                s.spawn(move |_| {
                    let mut handle = map.handle();
                    for i in 0..PER_THREAD {
                        let key = i * THREADS + t;
                        assert!(map.try_add(key, key, &mut handle));
                    }
                    for i in 0..PER_THREAD {
                        let key = i * THREADS + t;
                        assert_eq!(map.try_erase(&key, &mut handle), Some(key));
                    }
                });
            }
        })
        .unwrap();

        let mut handle = map.handle();
        assert_eq!(map.size(), 0);
        assert!(map.get_keys(&mut handle).is_empty());
    }

    #[test]
    fn contended_single_key_has_one_winner() {
        use crossbeam_utils::thread;
        use std::sync::atomic::{AtomicUsize, Ordering};

        const THREADS: usize = 16;

        let map = &SplitListMap::new();
        {
            let mut handle = map.handle();
            assert!(map.try_add(0u64, 0u64, &mut handle));
        }

        let erased = &AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(move |_| {
                    let mut handle = map.handle();
                    if map.try_erase(&0, &mut handle).is_some() {
                        erased.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        })
        .unwrap();

        assert_eq!(erased.load(Ordering::Relaxed), 1);
        assert_eq!(map.size(), 0);
    }

    #[test]
    fn iteration_stays_consistent_under_churn() {
        use crossbeam_utils::thread;
        use std::collections::HashSet;
        use std::sync::atomic::{AtomicBool, Ordering};

        const CHURN_THREADS: u64 = 4;
        const STABLE: u64 = 512;
        const TRAVERSALS: usize = 200;

        let map = &SplitListMap::new();
        {
            let mut handle = map.handle();
            for k in 0..STABLE {
                assert!(map.try_add(k, k * 7, &mut handle));
            }
        }

        let stop = &AtomicBool::new(false);
        thread::scope(|s| {
            // Churn threads add and erase keys above the stable range while
            // the main thread keeps traversing.
            for t in 0..CHURN_THREADS {
                s.spawn(move |_| {
                    let mut handle = map.handle();
                    let mut k = STABLE + t;
                    while !stop.load(Ordering::Relaxed) {
                        map.try_add(k, k * 7, &mut handle);
                        map.try_erase(&k, &mut handle);
                        k += CHURN_THREADS;
                        if k > STABLE * 16 {
                            k = STABLE + t;
                        }
                    }
                });
            }

            let mut handle = map.handle();
            for _ in 0..TRAVERSALS {
                let mut seen = HashSet::new();
                for (k, v) in map.iter(&mut handle) {
                    // Values are a pure function of the key, so a torn or
                    // reclaimed node cannot produce this pair.
                    assert_eq!(v, k * 7);
                    // A traversal restart must never re-yield a key.
                    assert!(seen.insert(k));
                }
                // Keys untouched by the churn are present for the whole
                // traversal and must all be observed.
                for k in 0..STABLE {
                    assert!(seen.contains(&k));
                }
            }
            stop.store(true, Ordering::Relaxed);
        })
        .unwrap();

        // Once erases have completed, the erased keys must never be yielded
        // again.
        let mut handle = map.handle();
        for k in (0..STABLE).step_by(2) {
            assert_eq!(map.try_erase(&k, &mut handle), Some(k * 7));
        }
        for (k, _) in map.iter(&mut handle) {
            assert!(k >= STABLE || k % 2 == 1);
        }
    }

    #[test]
    fn iteration_yields_each_entry_once() {
        let map = SplitListMap::new();
        let mut handle = map.handle();

        for key in 0u64..256 {
            assert!(map.try_add(key, key + 1, &mut handle));
        }

        let mut keys = map.get_keys(&mut handle);
        keys.sort_unstable();
        assert_eq!(keys, (0u64..256).collect::<Vec<_>>());

        let values: u64 = map.get_values(&mut handle).iter().sum();
        assert_eq!(values, (1u64..=256).sum());

        for (k, v) in map.iter(&mut handle) {
            assert_eq!(v, k + 1);
        }
    }
}
