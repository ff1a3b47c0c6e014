//! IdAllocator: monotonic address/cluster/transaction id counters seeded
//! from the transformed keyspace's current high-water mark (spec §4.9
//! identifier assignment; derived from the update strategy's id
//! bookkeeping).

/// Issues strictly increasing address, cluster, and (EVM) transaction ids
/// for one run. Seeded once from the sink's current maxima and never
/// re-queried mid-batch — every id handed out within a run is unique even
/// across concurrent transformer workers, since allocation only ever
/// happens on this single owner.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    highest_address_id: i64,
    highest_cluster_id: i64,
    highest_transaction_id: i64,
    new_addresses: i64,
    new_clusters: i64,
}

impl IdAllocator {
    /// `highest_address_id`/`highest_cluster_id`/`highest_transaction_id`
    /// are the sink's reported maxima before this run started (0, 1, and 0
    /// respectively when the transformed keyspace is empty, matching the
    /// Python default). `highest_transaction_id` only matters for EVM
    /// networks; Tron derives its transaction ids statelessly from
    /// `(block_id, transaction_index)` instead (spec §4.6 step 3).
    pub fn new(highest_address_id: i64, highest_cluster_id: i64, highest_transaction_id: i64) -> Self {
        IdAllocator {
            highest_address_id,
            highest_cluster_id,
            highest_transaction_id,
            new_addresses: 0,
            new_clusters: 0,
        }
    }

    pub fn consume_address_id(&mut self) -> i64 {
        self.highest_address_id += 1;
        self.new_addresses += 1;
        self.highest_address_id
    }

    pub fn consume_cluster_id(&mut self) -> i64 {
        self.highest_cluster_id += 1;
        self.new_clusters += 1;
        self.highest_cluster_id
    }

    pub fn consume_transaction_id(&mut self) -> i64 {
        self.highest_transaction_id += 1;
        self.highest_transaction_id
    }

    pub fn highest_address_id(&self) -> i64 {
        self.highest_address_id
    }

    pub fn highest_cluster_id(&self) -> i64 {
        self.highest_cluster_id
    }

    pub fn highest_transaction_id(&self) -> i64 {
        self.highest_transaction_id
    }

    pub fn new_addresses(&self) -> i64 {
        self.new_addresses
    }

    pub fn new_clusters(&self) -> i64 {
        self.new_clusters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_address_id_is_monotonic_and_counted() {
        let mut alloc = IdAllocator::new(100, 1, 0);
        assert_eq!(alloc.consume_address_id(), 101);
        assert_eq!(alloc.consume_address_id(), 102);
        assert_eq!(alloc.new_addresses(), 2);
        assert_eq!(alloc.highest_address_id(), 102);
    }

    #[test]
    fn consume_cluster_id_starts_above_seed() {
        let mut alloc = IdAllocator::new(0, 1, 0);
        assert_eq!(alloc.consume_cluster_id(), 2);
        assert_eq!(alloc.new_clusters(), 1);
    }

    #[test]
    fn consume_transaction_id_is_monotonic() {
        let mut alloc = IdAllocator::new(0, 1, 500);
        assert_eq!(alloc.consume_transaction_id(), 501);
        assert_eq!(alloc.consume_transaction_id(), 502);
        assert_eq!(alloc.highest_transaction_id(), 502);
    }

    #[test]
    fn empty_keyspace_defaults_match_source() {
        let alloc = IdAllocator::new(0, 1, 0);
        assert_eq!(alloc.highest_address_id(), 0);
        assert_eq!(alloc.highest_cluster_id(), 1);
        assert_eq!(alloc.highest_transaction_id(), 0);
    }
}
