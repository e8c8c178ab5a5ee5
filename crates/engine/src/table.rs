// SPDX-License-Identifier: BSD-3-Clause

//! Capture-side flow tables.
//!
//! One table per module. Buckets are keyed by the module's `hash`; the
//! module's `matches` resolves collisions. The table stores arena blocks,
//! never record bytes, and remembers insertion order because the export
//! walk is defined in that order for non-flexible modules.

use como_shmem::ShmBlock;
use hashbrown::HashMap;

/// One module's flow table for the current flush interval.
#[derive(Debug, Default)]
pub struct FlowTable {
    buckets: HashMap<u64, Vec<ShmBlock>>,
    order: Vec<ShmBlock>,
}

impl FlowTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        FlowTable::default()
    }

    /// Records in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when no record exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Candidate records for a key, in bucket order.
    #[must_use]
    pub fn bucket(&self, key: u64) -> &[ShmBlock] {
        self.buckets.get(&key).map_or(&[], Vec::as_slice)
    }

    /// Inserts a fresh record under a key.
    pub fn insert(&mut self, key: u64, rec: ShmBlock) {
        self.buckets.entry(key).or_default().push(rec);
        self.order.push(rec);
    }

    /// Detaches the table's records in insertion order, leaving it empty.
    /// This is the flush handoff: the records now belong to the snapshot.
    pub fn take(&mut self) -> Vec<ShmBlock> {
        self.buckets.clear();
        std::mem::take(&mut self.order)
    }
}
