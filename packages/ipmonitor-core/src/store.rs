//! Latest snapshot per segment.
//!
//! Writers replace a segment's whole `Arc<Snapshot>` under a short write lock,
//! so a reader holding a clone keeps a complete, consistent list no matter
//! how many replacements happen afterwards.

use crate::config::SegmentId;
use crate::scanner::Snapshot;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

/// Result of looking up one segment
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentStatus {
    /// No sweep of this segment has completed since process start
    Unscanned,
    Scanned(Arc<Snapshot>),
}

impl SegmentStatus {
    pub fn snapshot(&self) -> Option<&Arc<Snapshot>> {
        match self {
            SegmentStatus::Unscanned => None,
            SegmentStatus::Scanned(snapshot) => Some(snapshot),
        }
    }

    pub fn is_scanned(&self) -> bool {
        matches!(self, SegmentStatus::Scanned(_))
    }
}

#[derive(Debug, Default)]
pub struct StatusStore {
    snapshots: RwLock<HashMap<SegmentId, Arc<Snapshot>>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, segment: SegmentId) -> SegmentStatus {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&segment)
            .cloned()
            .map_or(SegmentStatus::Unscanned, SegmentStatus::Scanned)
    }

    /// Every segment scanned since process start, including ones no longer active
    pub fn get_all(&self) -> BTreeMap<SegmentId, Arc<Snapshot>> {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(segment, snapshot)| (*segment, Arc::clone(snapshot)))
            .collect()
    }

    /// Replace a segment's snapshot. Last writer wins.
    pub fn set(&self, segment: SegmentId, snapshot: Snapshot) {
        let snapshot = Arc::new(snapshot);
        let previous = self
            .snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(segment, snapshot);
        // Drop the old list outside the lock
        drop(previous);
    }

    pub fn len(&self) -> usize {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{DeviceRecord, DeviceStatus};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn snapshot(segment: SegmentId, hosts: usize) -> Snapshot {
        Snapshot::new(
            segment,
            (1..=hosts)
                .map(|i| DeviceRecord::new(format!("172.17.{}.{}", segment, i), DeviceStatus::online()))
                .collect(),
        )
    }

    #[test]
    fn test_unscanned_differs_from_empty() {
        let store = StatusStore::new();
        assert_eq!(store.get(70), SegmentStatus::Unscanned);

        store.set(70, snapshot(70, 0));
        let status = store.get(70);
        assert!(status.is_scanned());
        assert!(status.snapshot().unwrap().devices.is_empty());
    }

    #[test]
    fn test_last_writer_wins() {
        let store = StatusStore::new();
        store.set(80, snapshot(80, 3));
        store.set(80, snapshot(80, 5));
        assert_eq!(store.get(80).snapshot().unwrap().devices.len(), 5);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_all_keeps_every_scanned_segment() {
        let store = StatusStore::new();
        store.set(200, snapshot(200, 1));
        store.set(70, snapshot(70, 2));
        let all = store.get_all();
        assert_eq!(all.keys().copied().collect::<Vec<_>>(), vec![70, 200]);
    }

    #[test]
    fn test_readers_see_whole_snapshots() {
        let store = Arc::new(StatusStore::new());
        store.set(70, snapshot(70, 10));
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    while !done.load(Ordering::Relaxed) {
                        let len = store.get(70).snapshot().unwrap().devices.len();
                        assert!(len == 10 || len == 200, "torn snapshot of {} devices", len);
                    }
                })
            })
            .collect();

        for i in 0..500 {
            store.set(70, snapshot(70, if i % 2 == 0 { 200 } else { 10 }));
        }
        done.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
