//! A lock-free split-ordered hash map with hazard-pointer reclamation.
//!
//! The map keeps every entry in one sorted lock-free linked list, ordered by
//! the bit-reversed key hash. Buckets are dummy nodes spliced into that
//! list; doubling the bucket count only splices new dummies, so growth never
//! moves an entry. Reads and writes are lock-free; memory is reclaimed with
//! hazard pointers, so a slow reader never blocks reclamation of more than
//! the nodes it actually protects.

pub mod buckets;
pub mod concurrent_map;
pub mod list;
pub mod map;
pub mod pointers;

pub use concurrent_map::ConcurrentMap;
pub use map::{Handle, SplitListMap};
