//! Account-model dialect (EVM/Tron): per-trace and per-transfer delta
//! construction, fee/burn balance bookkeeping, and the batch orchestrator
//! (spec §4.6).

use std::collections::HashMap;

use gs_common::delta::{
    AssetMap, BalanceDelta, DbDelta, DeltaValue, EntityDelta, RawEntityTx, RelationDelta,
    RelationType, Tx, TxReference,
};
use gs_common::rows::get_prices;

use crate::adapter::{RawBlock, RawLog, RawTrace, RawTransaction, TraceKind};
use crate::idalloc::IdAllocator;
use crate::tokens::TokenTransfer;

use super::{get_sorted_unique_addresses, push_token_transfer_addresses, OrderedAddress};

/// Builds the entity-side delta for one trace endpoint. Reward traces (no
/// owning transaction) never count as an "incoming tx" on the receiving
/// side — block/uncle rewards aren't transactions — only as an outgoing tx
/// from the coinbase/issuance side when `is_outgoing` is true (spec §4.6
/// step 4, "spark logic": a reward's first/last tx id stays `-1`).
pub fn get_entitydelta_from_trace(trace: &RawTrace, identifier: Vec<u8>, is_outgoing: bool, fiat: [f64; 2]) -> EntityDelta {
    let is_reward = trace.is_reward();
    let zero_value = trace.value == 0;

    let (first_tx_id, last_tx_id) = if is_reward { (-1, -1) } else { (0, 0) };
    // Caller overwrites first/last_tx_id with the real tx id for non-reward
    // traces; reward traces keep the `-1` sentinel permanently.

    let value = DeltaValue::new(trace.value, fiat.to_vec());
    let zero = DeltaValue::zero(fiat.len());

    EntityDelta {
        identifier,
        total_received: if is_outgoing { zero.clone() } else { value.clone() },
        total_spent: if is_outgoing { value } else { zero },
        total_tokens_received: AssetMap::new(),
        total_tokens_spent: AssetMap::new(),
        first_tx_id,
        last_tx_id,
        no_incoming_txs: if is_reward { 0 } else { i64::from(!is_outgoing) },
        no_outgoing_txs: i64::from(is_outgoing),
        no_incoming_txs_zero_value: if is_reward || is_outgoing { 0 } else { i64::from(zero_value) },
        no_outgoing_txs_zero_value: if is_outgoing { i64::from(zero_value) } else { 0 },
    }
}

pub fn relationdelta_from_trace(trace: &RawTrace, src: Vec<u8>, dst: Vec<u8>, fiat: [f64; 2]) -> RelationDelta {
    let rel_type = match trace.call_type.as_str() {
        "delegatecall" => RelationType::Delegatecall,
        "staticcall" => RelationType::Staticcall,
        "callcode" => RelationType::Callcode,
        _ => RelationType::Call,
    };
    RelationDelta {
        src_identifier: src,
        dst_identifier: dst,
        no_transactions: 1,
        value: DeltaValue::new(trace.value, fiat.to_vec()),
        token_values: AssetMap::new(),
        rel_type,
    }
}

/// Tron-only: the transaction itself (not a trace) moves value between
/// sender and receiver, tagged `type="tx"`.
pub fn relationdelta_from_transaction(tx: &RawTransaction, src: Vec<u8>, dst: Vec<u8>, fiat: [f64; 2]) -> RelationDelta {
    RelationDelta {
        src_identifier: src,
        dst_identifier: dst,
        no_transactions: 1,
        value: DeltaValue::new(tx.value, fiat.to_vec()),
        token_values: AssetMap::new(),
        rel_type: RelationType::Tx,
    }
}

/// Token relations carry zero native value; the transferred amount lives
/// under `token_values[asset]` instead (spec §4.6 step 5).
pub fn relationdelta_from_tokentransfer(transfer: &TokenTransfer, fiat: [f64; 2], fiat_width: usize) -> RelationDelta {
    let asset_value = DeltaValue::new(transfer.value, fiat.to_vec());
    RelationDelta {
        src_identifier: transfer.from_address.clone(),
        dst_identifier: transfer.to_address.clone(),
        no_transactions: 1,
        value: DeltaValue::zero(fiat_width),
        token_values: AssetMap::single(transfer.asset.clone(), asset_value),
        rel_type: RelationType::Token,
    }
}

/// Call types excluded from balance updates (spec §4.6 step 8 / §9): these
/// move no value of their own between the declared src/dst under EVM
/// semantics, only their context's storage/code.
fn trace_affects_balance(trace: &RawTrace) -> bool {
    if !trace.is_successful() {
        return false;
    }
    !matches!(trace.call_type.as_str(), "delegatecall" | "staticcall" | "callcode")
}

/// Per-batch account-model transform. Consumes one block's adapter output
/// plus a resolver that returns (allocating if needed) the address id for
/// a raw address, and produces the batch's uncompressed `DbDelta` plus the
/// `identifier -> address_id` map the ChangeBuilder needs.
pub struct AccountTransformResult {
    pub delta: DbDelta,
    pub resolve_identifier: HashMap<Vec<u8>, i64>,
    pub txs: Vec<Tx>,
}

pub struct AccountBatchInput<'a> {
    pub block: &'a RawBlock,
    pub transactions: &'a [RawTransaction],
    pub traces: &'a [RawTrace],
    pub logs: &'a [RawLog],
    pub token_transfers: &'a [TokenTransfer],
    pub rates: [f64; 2],
    pub is_tron: bool,
}

pub fn transform_block(
    input: &AccountBatchInput,
    allocator: &mut IdAllocator,
    known_addresses: &mut HashMap<Vec<u8>, i64>,
) -> AccountTransformResult {
    let fiat_width = 2;
    let rates = input.rates;

    // Tron only ever builds deltas and tx-id/address-ordering inputs from
    // transactions that were actually executed on-chain (spec §4.6 step 3);
    // ETH carries the full unfiltered list through.
    let tron_filtered: Vec<RawTransaction>;
    let transactions_for_ids: &[RawTransaction] = if input.is_tron {
        tron_filtered = input
            .transactions
            .iter()
            .filter(|tx| tx.to_address.is_some() && tx.status == 1)
            .cloned()
            .collect();
        &tron_filtered
    } else {
        input.transactions
    };

    let successful_traces: Vec<RawTrace> =
        input.traces.iter().filter(|t| !t.is_reward() && t.is_successful()).cloned().collect();
    let reward_traces: Vec<RawTrace> = input.traces.iter().filter(|t| t.is_reward()).cloned().collect();

    let ordering_transactions: &[RawTransaction] = if input.is_tron { transactions_for_ids } else { &[] };
    let mut ordered: Vec<OrderedAddress> =
        get_sorted_unique_addresses(input.logs, &successful_traces, &reward_traces, ordering_transactions);
    for tt in input.token_transfers {
        push_token_transfer_addresses(&mut ordered, input.block.block_id, tt.log_index, &tt.from_address, &tt.to_address);
    }
    ordered.sort_by(|a, b| {
        (a.block_id, a.is_log, a.index, a.is_from_address).cmp(&(b.block_id, b.is_log, b.index, b.is_from_address))
    });
    let mut seen = std::collections::HashSet::new();
    ordered.retain(|o| seen.insert(o.address.clone()));

    for addr in &ordered {
        known_addresses
            .entry(addr.address.clone())
            .or_insert_with(|| allocator.consume_address_id());
    }

    // Transaction-id derivation (spec §4.6 step 3): Tron derives a
    // stateless, deterministic id from its own coordinates; EVM draws from
    // the allocator's monotonic counter, mirroring `consume_address_id`.
    let tx_id_by_hash: HashMap<Vec<u8>, i64> = if input.is_tron {
        transactions_for_ids
            .iter()
            .map(|tx| (tx.tx_hash.clone(), ((tx.block_id as i64) << 32) + tx.transaction_index as i64))
            .collect()
    } else {
        transactions_for_ids
            .iter()
            .map(|tx| (tx.tx_hash.clone(), allocator.consume_transaction_id()))
            .collect()
    };

    let txs: Vec<Tx> = transactions_for_ids
        .iter()
        .map(|tx| Tx {
            block_id: tx.block_id,
            tx_id: *tx_id_by_hash.get(&tx.tx_hash).unwrap(),
            tx_hash: tx.tx_hash.clone(),
            tx_index: tx.transaction_index,
            failed: tx.failed(),
        })
        .collect();

    let mut delta = DbDelta::new();
    let mut balances: HashMap<i64, BalanceDelta> = HashMap::new();

    let mut credit = |balances: &mut HashMap<i64, BalanceDelta>, identifier: &[u8], asset: &str, amount: i128| {
        if let Some(&id) = known_addresses.get(identifier) {
            balances.entry(id).or_insert_with(|| BalanceDelta::new(id)).credit(asset.to_string(), amount);
        }
    };

    for trace in input.traces {
        if !trace.is_successful() {
            continue;
        }
        let tx_id = trace
            .tx_hash
            .as_ref()
            .and_then(|h| tx_id_by_hash.get(h))
            .copied()
            .unwrap_or(-1);

        let mut from_delta = get_entitydelta_from_trace(trace, trace.from_address.clone(), true, rates);
        from_delta.first_tx_id = tx_id;
        from_delta.last_tx_id = tx_id;
        let mut to_delta = get_entitydelta_from_trace(trace, trace.to_address.clone(), false, rates);
        to_delta.first_tx_id = tx_id;
        to_delta.last_tx_id = tx_id;

        delta.entity_updates.push(from_delta);
        delta.entity_updates.push(to_delta);
        delta
            .relation_updates
            .push(relationdelta_from_trace(trace, trace.from_address.clone(), trace.to_address.clone(), rates));

        if tx_id >= 0 {
            delta.new_entity_txs.push(RawEntityTx {
                identifier: trace.from_address.clone(),
                is_outgoing: true,
                tx_id,
                tx_reference: TxReference { trace_index: Some(trace.trace_index), log_index: None },
                value: trace.value,
                token_values: AssetMap::new(),
                block_id: trace.block_id,
            });
            delta.new_entity_txs.push(RawEntityTx {
                identifier: trace.to_address.clone(),
                is_outgoing: false,
                tx_id,
                tx_reference: TxReference { trace_index: Some(trace.trace_index), log_index: None },
                value: trace.value,
                token_values: AssetMap::new(),
                block_id: trace.block_id,
            });
        }

        if trace_affects_balance(trace) && trace.value != 0 {
            credit(&mut balances, &trace.from_address, "native", -trace.value);
            credit(&mut balances, &trace.to_address, "native", trace.value);
        }
    }

    for tt in input.token_transfers {
        let fiat = get_prices(tt.value, tt.decimals, &rates, tt.usd_equivalent, tt.coin_equivalent);
        delta.relation_updates.push(relationdelta_from_tokentransfer(tt, fiat, fiat_width));

        let token_map = AssetMap::single(tt.asset.clone(), DeltaValue::new(tt.value, fiat.to_vec()));
        delta.new_entity_txs.push(RawEntityTx {
            identifier: tt.from_address.clone(),
            is_outgoing: true,
            tx_id: *tx_id_by_hash.get(&tt.tx_hash).unwrap_or(&-1),
            tx_reference: TxReference { trace_index: None, log_index: Some(tt.log_index) },
            value: tt.value,
            token_values: token_map.clone(),
            block_id: tt.block_id,
        });
        delta.new_entity_txs.push(RawEntityTx {
            identifier: tt.to_address.clone(),
            is_outgoing: false,
            tx_id: *tx_id_by_hash.get(&tt.tx_hash).unwrap_or(&-1),
            tx_reference: TxReference { trace_index: None, log_index: Some(tt.log_index) },
            value: tt.value,
            token_values: token_map,
            block_id: tt.block_id,
        });
    }

    if input.is_tron {
        for tx in transactions_for_ids {
            if let (Some(from), Some(to)) = (&tx.from_address, &tx.to_address) {
                if tx.value != 0 {
                    delta.relation_updates.push(relationdelta_from_transaction(tx, from.clone(), to.clone(), rates));
                    credit(&mut balances, from, "native", -tx.value);
                    credit(&mut balances, to, "native", tx.value);
                }
            }
            if let (Some(from), Some(fee)) = (&tx.from_address, tx.fee) {
                if fee != 0 {
                    credit(&mut balances, from, "native", -fee);
                }
            }
        }
    } else {
        // EIP-1559: the base fee is burnt (leaves circulation entirely),
        // the remainder goes to the block's miner.
        for tx in input.transactions {
            if let Some(from) = &tx.from_address {
                let total_fee = (tx.gas_price as i128) * (tx.receipt_gas_used as i128);
                if total_fee != 0 {
                    credit(&mut balances, from, "native", -total_fee);
                    if let Some(base_fee) = input.block.base_fee_per_gas {
                        let burnt = base_fee * (tx.receipt_gas_used as i128);
                        let to_miner = total_fee - burnt;
                        if to_miner != 0 {
                            credit(&mut balances, &input.block.miner, "native", to_miner);
                        }
                    } else {
                        credit(&mut balances, &input.block.miner, "native", total_fee);
                    }
                }
            }
        }
    }

    delta.balance_updates = balances.into_values().collect();

    let resolve_identifier = known_addresses.clone();
    AccountTransformResult {
        delta: delta.compress(),
        resolve_identifier,
        txs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> RawBlock {
        RawBlock {
            block_id: 100,
            block_hash: vec![0; 32],
            timestamp: 1_700_000_000,
            miner: vec![0xFE; 20],
            base_fee_per_gas: Some(10),
        }
    }

    #[test]
    fn reward_trace_has_sentinel_tx_ids_and_no_incoming_count() {
        let trace = RawTrace {
            block_id: 100,
            tx_hash: None,
            trace_index: 0,
            from_address: vec![0xFE; 20],
            to_address: vec![0xFE; 20],
            value: 2_000_000_000_000_000_000,
            call_type: "reward".to_string(),
            status: 1,
            contract_creation: false,
            kind: TraceKind::External,
        };
        let delta = get_entitydelta_from_trace(&trace, trace.to_address.clone(), false, [1800.0, 2000.0]);
        assert_eq!(delta.first_tx_id, -1);
        assert_eq!(delta.last_tx_id, -1);
        assert_eq!(delta.no_incoming_txs, 0);
    }

    #[test]
    fn delegatecall_is_excluded_from_balance_updates() {
        let trace = RawTrace {
            block_id: 100,
            tx_hash: Some(vec![1; 32]),
            trace_index: 1,
            from_address: vec![0xAA; 20],
            to_address: vec![0xBB; 20],
            value: 500,
            call_type: "delegatecall".to_string(),
            status: 1,
            contract_creation: false,
            kind: TraceKind::Internal,
        };
        assert!(!trace_affects_balance(&trace));
    }

    #[test]
    fn base_fee_is_burnt_and_tip_goes_to_miner() {
        let mut allocator = IdAllocator::new(0, 1, 0);
        let mut known = HashMap::new();
        let tx = RawTransaction {
            block_id: 100,
            tx_hash: vec![9; 32],
            transaction_index: 0,
            from_address: Some(vec![0xAA; 20]),
            to_address: Some(vec![0xBB; 20]),
            value: 0,
            gas_price: 20,
            gas_used: 21_000,
            receipt_gas_used: 21_000,
            status: 1,
            fee: None,
        };
        let b = block();
        let input = AccountBatchInput {
            block: &b,
            transactions: std::slice::from_ref(&tx),
            traces: &[],
            logs: &[],
            token_transfers: &[],
            rates: [1800.0, 2000.0],
            is_tron: false,
        };
        let result = transform_block(&input, &mut allocator, &mut known);
        let from_id = known[&vec![0xAA; 20]];
        let miner_id = known[&vec![0xFE; 20]];
        let from_balance = result.delta.balance_updates.iter().find(|b| b.identifier == from_id).unwrap();
        let miner_balance = result.delta.balance_updates.iter().find(|b| b.identifier == miner_id).unwrap();
        assert_eq!(from_balance.asset_balances["native"].value, -420_000);
        assert_eq!(miner_balance.asset_balances["native"].value, 210_000);
    }
}
