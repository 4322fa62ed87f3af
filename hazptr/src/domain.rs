use std::collections::HashSet;

use crate::hazard::ThreadRecords;
use crate::retire::RetiredList;

/// A reclamation domain: the set of participating thread records plus a
/// fallback list for retirees orphaned by exiting threads.
pub struct Domain {
    pub(crate) threads: ThreadRecords,
    pub(crate) orphans: RetiredList,
}

impl Domain {
    pub const fn new() -> Self {
        Self {
            threads: ThreadRecords::new(),
            orphans: RetiredList::new(),
        }
    }

    pub(crate) fn collect_guarded_ptrs(&self) -> HashSet<*mut u8> {
        self.threads
            .iter()
            .flat_map(|record| record.guarded_ptrs())
            .filter(|ptr| !ptr.is_null())
            .collect()
    }
}
