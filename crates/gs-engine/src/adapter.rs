//! RawAdapter: normalizes heterogeneous raw-source rows to the internal
//! dataclasses the Transformer consumes (spec §4.3).

/// A raw block as read from the raw sink.
#[derive(Debug, Clone)]
pub struct RawBlock {
    pub block_id: u64,
    pub block_hash: Vec<u8>,
    pub timestamp: i64,
    pub miner: Vec<u8>,
    pub base_fee_per_gas: Option<i128>,
}

#[derive(Debug, Clone)]
pub struct RawTransaction {
    pub block_id: u64,
    pub tx_hash: Vec<u8>,
    pub transaction_index: i32,
    pub from_address: Option<Vec<u8>>,
    pub to_address: Option<Vec<u8>>,
    pub value: i128,
    pub gas_price: i128,
    pub gas_used: i64,
    pub receipt_gas_used: i64,
    pub status: i32,
    /// Tron only: fee charged to the sender, debited separately from
    /// EVM-style base-fee/priority-fee accounting.
    pub fee: Option<i128>,
}

impl RawTransaction {
    pub fn failed(&self) -> bool {
        self.status != 1
    }
}

/// Internal/external classification used by the account dialect (spec §4.3:
/// "per-trace type based on empty trace address and trace index").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    External,
    Internal,
}

#[derive(Debug, Clone)]
pub struct RawTrace {
    pub block_id: u64,
    /// `None` for reward traces (no owning transaction).
    pub tx_hash: Option<Vec<u8>>,
    pub trace_index: i32,
    pub from_address: Vec<u8>,
    pub to_address: Vec<u8>,
    pub value: i128,
    pub call_type: String,
    pub status: i32,
    pub contract_creation: bool,
    pub kind: TraceKind,
}

impl RawTrace {
    pub fn is_successful(&self) -> bool {
        self.status == 1
    }

    pub fn is_reward(&self) -> bool {
        self.tx_hash.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct RawLog {
    pub block_id: u64,
    pub tx_hash: Vec<u8>,
    pub log_index: i32,
    pub transaction_index: i32,
    pub address: Vec<u8>,
    pub topics: Vec<Vec<u8>>,
    pub data: Vec<u8>,
}

/// A UTXO-network transaction as read from the raw sink: one row per
/// input/output rather than the account model's single from/to pair.
#[derive(Debug, Clone)]
pub struct RawUtxoTx {
    pub block_id: u64,
    pub tx_hash: Vec<u8>,
    pub tx_index: i32,
    pub failed: bool,
    pub inputs: Vec<(Vec<u8>, i128)>,
    pub outputs: Vec<(Vec<u8>, i128)>,
}

/// `block_id_group = block_id / block_bucket_size`.
pub fn block_id_group(block_id: u64, block_bucket_size: u64) -> u64 {
    block_id / block_bucket_size
}

/// `partition = block_id / partition_size` (default 100_000).
pub fn partition(block_id: u64, partition_size: u64) -> u64 {
    block_id / partition_size
}

/// Field renaming for Tron traces: `caller_address -> from_address`,
/// `transferto_address -> to_address`, `call_value -> value`. EVM traces need
/// no rename, so this is the identity when `is_tron` is false; Tron's
/// transaction-level `fee` likewise only applies on that network.
pub struct AccountTraceAdapter {
    pub is_tron: bool,
}

impl AccountTraceAdapter {
    pub fn trace_kind(&self, trace_address_is_empty: bool, trace_index: i32) -> TraceKind {
        if trace_address_is_empty && trace_index == 0 {
            TraceKind::External
        } else {
            TraceKind::Internal
        }
    }

    pub fn contract_creation(&self, trace_type: &str) -> bool {
        trace_type == "create"
    }
}

/// Tron block timestamps arrive in milliseconds and are divided by 1000 to
/// seconds (spec §4.3).
pub fn tron_timestamp_to_seconds(ms: i64) -> i64 {
    ms / 1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_id_group_matches_bucket_size() {
        assert_eq!(block_id_group(1_999, 1_000), 1);
        assert_eq!(partition(250_000, 100_000), 2);
    }

    #[test]
    fn tron_timestamp_converts_to_seconds() {
        assert_eq!(tron_timestamp_to_seconds(1_700_000_000_000), 1_700_000_000);
    }

    #[test]
    fn trace_kind_requires_empty_address_and_zero_index() {
        let adapter = AccountTraceAdapter { is_tron: false };
        assert_eq!(adapter.trace_kind(true, 0), TraceKind::External);
        assert_eq!(adapter.trace_kind(true, 1), TraceKind::Internal);
        assert_eq!(adapter.trace_kind(false, 0), TraceKind::Internal);
    }
}
