// # Allocation Tags
//
// Every live allocation gets an out-of-line record in a two-level hash
// table keyed by the upper bits of its address. The table drives
// fencepost verification sweeps, leak reporting, and per-pool accounting
// checks. Records store the client pointer and size (fenceposts
// excluded).
//
// Mutation happens only inside allocation paths; a lock serializes it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::alloc::AllocClass;

const TABLE_BITS1: usize = 12;
const TABLE_BITS2: usize = 12;
const LEVEL1_ENTRIES: usize = 1 << TABLE_BITS1;
const LEVEL2_ENTRIES: usize = 1 << TABLE_BITS2;
const TAG_START_BIT: usize = 32;

fn level1_hash(addr: usize) -> usize {
    (addr >> (TAG_START_BIT - TABLE_BITS1)) & (LEVEL1_ENTRIES - 1)
}

fn level2_hash(addr: usize) -> usize {
    (addr >> (TAG_START_BIT - TABLE_BITS1 - TABLE_BITS2)) & (LEVEL2_ENTRIES - 1)
}

/// One live allocation record.
#[derive(Debug, Clone, Serialize)]
pub struct Tag {
    pub ptr: usize,
    pub size: usize,
    pub pool: Uuid,
    pub class: AllocClass,
    pub seq: u64,
}

/// Level-2 table: chains keyed by the middle address bits.
#[derive(Default)]
struct TagBucket {
    chains: HashMap<usize, Vec<Tag>>,
}

struct TagTableInner {
    level1: Vec<Option<Box<TagBucket>>>,
}

pub(crate) struct TagTable {
    enabled: bool,
    inner: Mutex<TagTableInner>,
    seq: AtomicU64,
}

/// Summary of tags still live, for leak reporting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LeakReport {
    pub count: usize,
    pub total_bytes: usize,
    pub tags: Vec<Tag>,
}

impl TagTable {
    pub fn new(enabled: bool) -> TagTable {
        TagTable {
            enabled,
            inner: Mutex::new(TagTableInner {
                level1: (0..LEVEL1_ENTRIES).map(|_| None).collect(),
            }),
            seq: AtomicU64::new(1),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn add(&self, ptr: usize, size: usize, pool: Uuid, class: AllocClass) {
        if !self.enabled {
            return;
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        let bucket = inner.level1[level1_hash(ptr)].get_or_insert_with(Default::default);
        bucket
            .chains
            .entry(level2_hash(ptr))
            .or_default()
            .push(Tag { ptr, size, pool, class, seq });
    }

    pub fn remove(&self, ptr: usize) -> Option<Tag> {
        if !self.enabled {
            return None;
        }
        let mut inner = self.inner.lock();
        let bucket = inner.level1[level1_hash(ptr)].as_mut()?;
        let chain = bucket.chains.get_mut(&level2_hash(ptr))?;
        let i = chain.iter().position(|t| t.ptr == ptr)?;
        Some(chain.swap_remove(i))
    }

    /// Rewrite the recorded size after a truncation.
    pub fn truncate(&self, ptr: usize, new_size: usize) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(bucket) = inner.level1[level1_hash(ptr)].as_mut() {
            if let Some(chain) = bucket.chains.get_mut(&level2_hash(ptr)) {
                if let Some(tag) = chain.iter_mut().find(|t| t.ptr == ptr) {
                    debug_assert!(new_size <= tag.size, "truncate grew an allocation");
                    tag.size = new_size;
                }
            }
        }
    }

    /// Drop every tag belonging to a pool (pool destroy / clear).
    pub fn remove_pool(&self, pool: Uuid) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        for bucket in inner.level1.iter_mut().flatten() {
            for chain in bucket.chains.values_mut() {
                chain.retain(|t| t.pool != pool);
            }
        }
    }

    /// Apply `f` to every live tag.
    pub fn apply(&self, mut f: impl FnMut(&Tag)) {
        let inner = self.inner.lock();
        for bucket in inner.level1.iter().flatten() {
            for chain in bucket.chains.values() {
                for tag in chain {
                    f(tag);
                }
            }
        }
    }

    /// Everything still live, largest first.
    pub fn report_leaks(&self) -> LeakReport {
        let mut report = LeakReport::default();
        self.apply(|tag| {
            report.count += 1;
            report.total_bytes += tag.size;
            report.tags.push(tag.clone());
        });
        report.tags.sort_by(|a, b| b.size.cmp(&a.size));
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TagTable {
        TagTable::new(true)
    }

    #[test]
    fn add_remove_roundtrip() {
        let t = table();
        let pool = Uuid::new_v4();
        t.add(0x10_0000, 128, pool, AllocClass::Unspecified);
        t.add(0x20_0000, 64, pool, AllocClass::Mm);

        let tag = t.remove(0x10_0000).unwrap();
        assert_eq!(tag.size, 128);
        assert!(t.remove(0x10_0000).is_none());
        assert_eq!(t.report_leaks().count, 1);
    }

    #[test]
    fn truncate_updates_size() {
        let t = table();
        let pool = Uuid::new_v4();
        t.add(0x30_0000, 256, pool, AllocClass::Unspecified);
        t.truncate(0x30_0000, 100);
        assert_eq!(t.remove(0x30_0000).unwrap().size, 100);
    }

    #[test]
    fn remove_pool_sweeps_only_that_pool() {
        let t = table();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        t.add(0x1000, 16, a, AllocClass::Unspecified);
        t.add(0x2000, 16, b, AllocClass::Unspecified);
        t.remove_pool(a);

        let report = t.report_leaks();
        assert_eq!(report.count, 1);
        assert_eq!(report.tags[0].pool, b);
    }

    #[test]
    fn disabled_table_is_inert() {
        let t = TagTable::new(false);
        t.add(0x1000, 16, Uuid::new_v4(), AllocClass::Unspecified);
        assert_eq!(t.report_leaks().count, 0);
    }
}
