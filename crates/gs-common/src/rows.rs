//! Persisted state layout (spec §6) and the bucket/partition/fiat-pricing
//! math shared by the Transformer and ChangeBuilder.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// `id_group = id / bucket_size` (spec glossary).
pub fn id_group(id: i64, bucket_size: u64) -> i64 {
    id.div_euclid(bucket_size as i64)
}

/// `partition = block_id / partition_size`.
pub fn partition(block_id: u64, partition_size: u64) -> u64 {
    block_id / partition_size
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Secondary group for a relation row: `hash(src, dst) mod bucket_size`,
/// used to shard hot address pairs (spec glossary / §4.8).
pub fn relation_secondary_group(src_id: i64, dst_id: i64, bucket_size: u64) -> (i64, i64) {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&src_id.to_be_bytes());
    key.extend_from_slice(&dst_id.to_be_bytes());
    let secondary = (fnv1a(&key) % bucket_size) as i64;
    (id_group(src_id, bucket_size), secondary)
}

/// Secondary group for an `address_transactions` row: sharded by block id
/// rather than by the peer address, since a single address can accumulate
/// an unbounded number of transactions over time.
pub fn address_transactions_secondary_group(address_id: i64, bucket_size: u64, block_id: u64) -> (i64, i64) {
    let secondary = (block_id % bucket_size) as i64;
    (id_group(address_id, bucket_size), secondary)
}

/// Fiat conversion (spec §4.6 step 7): `[euro_value, dollar_value]`.
///
/// `rates = [euro_per_eth, dollar_per_eth]` (fiat per whole native coin).
/// - `usd_equivalent`: the asset already trades 1:1 with USD (e.g. USDT).
/// - `coin_equivalent`: the asset trades 1:1 with the native coin (e.g. WETH).
pub fn get_prices(
    value: i128,
    decimals: u32,
    rates: &[f64; 2],
    usd_equivalent: bool,
    coin_equivalent: bool,
) -> [f64; 2] {
    let scaled = value as f64 / 10f64.powi(decimals as i32);
    let euro_per_eth = rates[0];
    let dollar_per_eth = rates[1];

    let dollar_value = if usd_equivalent {
        scaled
    } else if coin_equivalent {
        scaled * dollar_per_eth
    } else {
        0.0
    };

    let dollar_per_euro = if euro_per_eth != 0.0 {
        dollar_per_eth / euro_per_eth
    } else {
        0.0
    };
    let euro_value = if dollar_per_euro != 0.0 {
        dollar_value / dollar_per_euro
    } else {
        0.0
    };

    [euro_value, dollar_value]
}

/// Native-coin decimals by network, per spec §4.6 step 7.
pub fn native_decimals(network: &str) -> u32 {
    match network.to_ascii_lowercase().as_str() {
        "eth" => 18,
        "trx" => 6,
        _ => 8,
    }
}

/// Not `FromRow`: `total_received`/`total_spent` are `i128`, which sqlx has
/// no native `Postgres` decode impl for. Sinks decode through a TEXT-column
/// shim row and convert, the way [`crate::delta::ChangeValue::I128`] is
/// written back out as a string.
#[derive(Debug, Clone)]
pub struct AddressRow {
    pub address_id_group: i64,
    pub address_id: i64,
    pub address: Vec<u8>,
    pub no_incoming_txs: i64,
    pub no_outgoing_txs: i64,
    pub no_incoming_txs_zero_value: i64,
    pub no_outgoing_txs_zero_value: i64,
    pub first_tx_id: i64,
    pub last_tx_id: i64,
    pub total_received: i128,
    pub total_received_fiat: Vec<f64>,
    pub total_spent: i128,
    pub total_spent_fiat: Vec<f64>,
    pub total_tokens_received: serde_json::Value,
    pub total_tokens_spent: serde_json::Value,
    pub in_degree: i64,
    pub out_degree: i64,
    pub in_degree_zero_value: i64,
    pub out_degree_zero_value: i64,
    pub is_contract: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct AddressIdByPrefixRow {
    pub address_prefix: String,
    pub address: Vec<u8>,
    pub address_id: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct AddressTransactionRow {
    pub address_id_group: i64,
    pub address_id_secondary_group: i64,
    pub address_id: i64,
    pub currency: String,
    pub transaction_id: i64,
    pub is_outgoing: bool,
    pub trace_index: Option<i32>,
    pub log_index: Option<i32>,
}

/// Not `FromRow`: see [`AddressRow`]'s note on `i128` columns.
#[derive(Debug, Clone)]
pub struct RelationRow {
    pub address_id_group: i64,
    pub address_id_secondary_group: i64,
    pub src_address_id: i64,
    pub dst_address_id: i64,
    pub no_transactions: i64,
    pub value: i128,
    pub value_fiat: Vec<f64>,
    pub token_values: serde_json::Value,
}

/// Not `FromRow`: see [`AddressRow`]'s note on `i128` columns.
#[derive(Debug, Clone)]
pub struct BalanceRow {
    pub address_id_group: i64,
    pub address_id: i64,
    pub currency: String,
    pub balance: i128,
}

#[derive(Debug, Clone, FromRow)]
pub struct TransactionIdByGroupRow {
    pub transaction_id_group: i64,
    pub transaction_id: i64,
    pub transaction: Vec<u8>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TransactionIdByPrefixRow {
    pub transaction_prefix: String,
    pub transaction: Vec<u8>,
    pub transaction_id: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct BlockTransactionRow {
    pub block_id_group: i64,
    pub block_id: i64,
    pub tx_id: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct ExchangeRateRow {
    pub block_id: i64,
    pub fiat_values: Vec<f64>,
}

#[derive(Debug, Clone, FromRow)]
pub struct SummaryStatisticsRow {
    pub id: i32,
    pub no_blocks: i64,
    pub no_address_relations: i64,
    pub no_addresses: i64,
    pub no_transactions: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct DeltaUpdaterStatusRow {
    pub last_synced_block: i64,
    pub last_synced_block_timestamp: i64,
    pub highest_address_id: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct DeltaUpdaterHistoryRow {
    pub last_synced_block: i64,
    pub timestamp: DateTime<Utc>,
    pub write_new: i64,
    pub write_dirty: i64,
    pub runtime_seconds: f64,
}

/// Max secondary-group id observed so far for a sharded table, keyed by the
/// primary group. Used by the Transformer's secondary-group-maxima
/// bookkeeping (spec §4.8): a write is only emitted when the new maximum
/// strictly exceeds the stored one.
pub type SecondaryIdMaxima = BTreeMap<i64, i64>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usd_equivalent_uses_raw_scaled_value() {
        let rates = [1800.0, 2000.0];
        let [_, dollar] = get_prices(29_000_000, 6, &rates, true, false);
        assert!((dollar - 29.0).abs() < 1e-9);
    }

    #[test]
    fn coin_equivalent_multiplies_by_dollar_per_eth() {
        let rates = [1800.0, 2000.0];
        let [euro, dollar] = get_prices(1_000_000_000_000_000_000, 18, &rates, false, true);
        assert!((dollar - 2000.0).abs() < 1e-9);
        assert!((euro - 1800.0).abs() < 1e-6);
    }

    #[test]
    fn id_group_is_floor_division() {
        assert_eq!(id_group(1999, 1000), 1);
        assert_eq!(id_group(0, 1000), 0);
    }
}
