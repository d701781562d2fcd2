//! Duplicate request filtering.
//!
//! The filter only ever answers "seen" for fingerprints that were recorded, so
//! a distinct request is never dropped. The bounded variant may forget old
//! fingerprints and let a duplicate through, which is tolerated.

use crate::fingerprint::Fingerprint;
use dashmap::DashSet;
use moka::sync::Cache;

pub trait DupeFilter: Send + Sync {
    fn seen(&self, fingerprint: &Fingerprint) -> bool;

    fn record(&self, fingerprint: Fingerprint);

    /// Atomically records `fingerprint`; true when it was not seen before.
    fn check_and_record(&self, fingerprint: Fingerprint) -> bool;

    /// Removes a fingerprint whose request never made it into the queue.
    fn forget(&self, fingerprint: &Fingerprint);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recorded fingerprints, for checkpoints.
    fn snapshot(&self) -> Vec<Fingerprint>;
}

/// Exact, unbounded filter.
#[derive(Debug, Default)]
pub struct MemoryDupeFilter {
    seen: DashSet<Fingerprint>,
}

impl MemoryDupeFilter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DupeFilter for MemoryDupeFilter {
    fn seen(&self, fingerprint: &Fingerprint) -> bool {
        self.seen.contains(fingerprint)
    }

    fn record(&self, fingerprint: Fingerprint) {
        self.seen.insert(fingerprint);
    }

    fn check_and_record(&self, fingerprint: Fingerprint) -> bool {
        self.seen.insert(fingerprint)
    }

    fn forget(&self, fingerprint: &Fingerprint) {
        self.seen.remove(fingerprint);
    }

    fn len(&self) -> usize {
        self.seen.len()
    }

    fn snapshot(&self) -> Vec<Fingerprint> {
        self.seen.iter().map(|fp| *fp).collect()
    }
}

/// Memory-capped filter backed by a moka cache.
pub struct BoundedDupeFilter {
    seen: Cache<Fingerprint, ()>,
}

impl BoundedDupeFilter {
    pub fn new(capacity: u64) -> Self {
        BoundedDupeFilter {
            seen: Cache::builder().max_capacity(capacity).build(),
        }
    }
}

impl DupeFilter for BoundedDupeFilter {
    fn seen(&self, fingerprint: &Fingerprint) -> bool {
        self.seen.contains_key(fingerprint)
    }

    fn record(&self, fingerprint: Fingerprint) {
        self.seen.insert(fingerprint, ());
    }

    fn check_and_record(&self, fingerprint: Fingerprint) -> bool {
        self.seen.entry(fingerprint).or_insert(()).is_fresh()
    }

    fn forget(&self, fingerprint: &Fingerprint) {
        self.seen.invalidate(fingerprint);
    }

    fn len(&self) -> usize {
        self.seen.run_pending_tasks();
        self.seen.entry_count() as usize
    }

    fn snapshot(&self) -> Vec<Fingerprint> {
        self.seen.iter().map(|(fp, _)| *fp).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;
    use std::sync::Arc;

    fn fp(url: &str) -> Fingerprint {
        Request::get(url).unwrap().fingerprint()
    }

    #[test]
    fn memory_filter_check_and_record() {
        let filter = MemoryDupeFilter::new();
        assert!(!filter.seen(&fp("http://a.com/1")));
        assert!(filter.check_and_record(fp("http://a.com/1")));
        assert!(!filter.check_and_record(fp("http://a.com/1")));
        assert!(filter.check_and_record(fp("http://a.com/2")));
        assert_eq!(filter.len(), 2);

        filter.forget(&fp("http://a.com/1"));
        assert!(filter.check_and_record(fp("http://a.com/1")));
    }

    #[test]
    fn bounded_filter_check_and_record() {
        let filter = BoundedDupeFilter::new(1000);
        assert!(filter.check_and_record(fp("http://a.com/1")));
        assert!(!filter.check_and_record(fp("http://a.com/1")));
        assert!(filter.seen(&fp("http://a.com/1")));
        assert!(!filter.seen(&fp("http://a.com/3")));
    }

    #[test]
    fn concurrent_inserts_admit_each_fingerprint_once() {
        let filter = Arc::new(MemoryDupeFilter::new());
        let target = fp("http://a.com/race");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let filter = Arc::clone(&filter);
                std::thread::spawn(move || filter.check_and_record(target) as usize)
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 1);
    }
}
