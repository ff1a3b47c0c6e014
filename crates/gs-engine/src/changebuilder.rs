//! ChangeBuilder: turns a compressed [`DbDelta`] plus the sink reads the
//! Transformer gathered for it into the ordered list of [`DbChange`] writes
//! the Applier sends downstream (spec §4.8).
//!
//! Each `prepare_*_for_ingest` function mirrors one stage of the source
//! ingest pipeline; `build_changes` runs them in the fixed order the spec
//! requires (transactions, balances, relations, entities, entity
//! transactions) so that entity in/out-degree bookkeeping can fold in the
//! relation counts computed just before it.

use std::collections::{BTreeMap, HashMap};

use gs_common::delta::{
    minusone_respecting_max, minusone_respecting_min, AssetMap, BalanceDelta, ChangeValue, DbChange, DbDelta,
    EntityDelta, RawEntityTx, RelationDelta, Tx,
};
use gs_common::rows::{
    id_group, relation_secondary_group, address_transactions_secondary_group, AddressRow, BalanceRow,
    RelationRow, SecondaryIdMaxima,
};

/// Everything the ChangeBuilder needs that isn't in the `DbDelta` itself:
/// rows the Transformer already read from the sink, and the mapping from a
/// delta's raw identifier bytes to its resolved address id.
pub struct ChangeContext<'a> {
    pub resolve_identifier: &'a HashMap<Vec<u8>, i64>,
    pub existing_addresses: &'a HashMap<i64, AddressRow>,
    pub existing_incoming_relations: &'a HashMap<(i64, i64), RelationRow>,
    pub existing_outgoing_relations: &'a HashMap<(i64, i64), RelationRow>,
    pub existing_balances: &'a HashMap<(i64, String), BalanceRow>,
    /// Current `*_secondary_ids` bookkeeping maxima (spec §4.8), one map per
    /// sharded table, keyed by primary group.
    pub existing_atx_secondary_maxima: &'a SecondaryIdMaxima,
    pub existing_outgoing_secondary_maxima: &'a SecondaryIdMaxima,
    pub existing_incoming_secondary_maxima: &'a SecondaryIdMaxima,
    pub id_bucket_size: u64,
    /// Bucket size for `block_transactions.block_id_group`, configured
    /// separately from `id_bucket_size` since blocks and addresses/relations
    /// shard independently (spec §4.8).
    pub block_bucket_size: u64,
    pub address_prefix_length: usize,
}

fn resolve(ctx: &ChangeContext, identifier: &[u8]) -> i64 {
    *ctx.resolve_identifier
        .get(identifier)
        .unwrap_or_else(|| panic!("unresolved identifier in ChangeBuilder input"))
}

fn asset_map_to_json(assets: &AssetMap) -> ChangeValue {
    ChangeValue::AssetMap(assets.clone())
}

pub fn prepare_txs_for_ingest(
    txs: &[Tx],
    tx_prefix_length: usize,
    id_bucket_size: u64,
    block_bucket_size: u64,
) -> Vec<DbChange> {
    let mut changes = Vec::new();
    for tx in txs {
        let group = id_group(tx.tx_id, id_bucket_size);
        let prefix: String = hex::encode(&tx.tx_hash)
            .chars()
            .take(tx_prefix_length)
            .collect();

        let mut by_group = BTreeMap::new();
        by_group.insert("transaction_id_group".to_string(), ChangeValue::I64(group));
        by_group.insert("transaction_id".to_string(), ChangeValue::I64(tx.tx_id));
        by_group.insert("transaction".to_string(), ChangeValue::Bytes(tx.tx_hash.clone()));
        changes.push(DbChange::new("transaction_ids_by_transaction_id_group", by_group));

        let mut by_prefix = BTreeMap::new();
        by_prefix.insert("transaction_prefix".to_string(), ChangeValue::Text(prefix));
        by_prefix.insert("transaction".to_string(), ChangeValue::Bytes(tx.tx_hash.clone()));
        by_prefix.insert("transaction_id".to_string(), ChangeValue::I64(tx.tx_id));
        changes.push(DbChange::new("transaction_ids_by_transaction_prefix", by_prefix));

        if !tx.failed {
            let mut block_tx = BTreeMap::new();
            block_tx.insert(
                "block_id_group".to_string(),
                ChangeValue::I64(id_group(tx.block_id as i64, block_bucket_size)),
            );
            block_tx.insert("block_id".to_string(), ChangeValue::I64(tx.block_id as i64));
            block_tx.insert("tx_id".to_string(), ChangeValue::I64(tx.tx_id));
            changes.push(DbChange::new("block_transactions", block_tx));
        }
    }
    changes
}

pub fn prepare_balances_for_ingest(balance_updates: &[BalanceDelta], ctx: &ChangeContext) -> Vec<DbChange> {
    let mut changes = Vec::new();
    for update in balance_updates {
        for (asset, delta) in &update.asset_balances.0 {
            let existing = ctx
                .existing_balances
                .get(&(update.identifier, asset.clone()))
                .map(|r| r.balance)
                .unwrap_or(0);
            let new_balance = existing + delta.value;

            let mut data = BTreeMap::new();
            data.insert(
                "address_id_group".to_string(),
                ChangeValue::I64(id_group(update.identifier, ctx.id_bucket_size)),
            );
            data.insert("address_id".to_string(), ChangeValue::I64(update.identifier));
            data.insert("currency".to_string(), ChangeValue::Text(asset.clone()));
            data.insert("balance".to_string(), ChangeValue::I128(new_balance));
            changes.push(DbChange::update("balance", data));
        }
    }
    changes
}

pub struct RelationIngestResult {
    pub changes: Vec<DbChange>,
    /// New in-/out-relation counts per address id, to fold into entity
    /// in/out-degree before `prepare_entities_for_ingest` runs.
    pub new_relations_in: HashMap<i64, i64>,
    pub new_relations_out: HashMap<i64, i64>,
    /// Count of relation edges that didn't exist before this batch, for
    /// `summary_statistics.no_address_relations` bookkeeping.
    pub new_relation_edges: i64,
}

pub fn prepare_relations_for_ingest(relation_updates: &[RelationDelta], ctx: &ChangeContext) -> RelationIngestResult {
    let mut changes = Vec::new();
    let mut new_relations_in: HashMap<i64, i64> = HashMap::new();
    let mut new_relations_out: HashMap<i64, i64> = HashMap::new();
    let mut new_relation_edges = 0i64;

    for rel in relation_updates {
        let src = resolve(ctx, &rel.src_identifier);
        let dst = resolve(ctx, &rel.dst_identifier);

        let outr = ctx.existing_outgoing_relations.get(&(src, dst));
        let inr = ctx.existing_incoming_relations.get(&(src, dst));
        assert_eq!(outr.is_none(), inr.is_none(), "relation must exist on both sides or neither");

        let (no_transactions, value, token_values) = if let (Some(outr), Some(inr)) = (outr, inr) {
            assert_eq!(outr.no_transactions, inr.no_transactions, "relation sides diverged");
            let existing_tokens = AssetMap::from_json(&outr.token_values);
            (
                outr.no_transactions + rel.no_transactions,
                outr.value + rel.value.value,
                existing_tokens.merge(rel.token_values.clone()),
            )
        } else {
            *new_relations_in.entry(dst).or_insert(0) += 1;
            *new_relations_out.entry(src).or_insert(0) += 1;
            new_relation_edges += 1;
            (rel.no_transactions, rel.value.value, rel.token_values.clone())
        };

        let (out_group, out_secondary) = relation_secondary_group(src, dst, ctx.id_bucket_size);
        let mut out_data = BTreeMap::new();
        out_data.insert("address_id_group".to_string(), ChangeValue::I64(out_group));
        out_data.insert("address_id_secondary_group".to_string(), ChangeValue::I64(out_secondary));
        out_data.insert("src_address_id".to_string(), ChangeValue::I64(src));
        out_data.insert("dst_address_id".to_string(), ChangeValue::I64(dst));
        out_data.insert("no_transactions".to_string(), ChangeValue::I64(no_transactions));
        out_data.insert("value".to_string(), ChangeValue::I128(value));
        out_data.insert("token_values".to_string(), asset_map_to_json(&token_values));
        changes.push(DbChange::update("address_outgoing_relations", out_data.clone()));

        let (in_group, in_secondary) = relation_secondary_group(dst, src, ctx.id_bucket_size);
        let mut in_data = out_data;
        in_data.insert("address_id_group".to_string(), ChangeValue::I64(in_group));
        in_data.insert("address_id_secondary_group".to_string(), ChangeValue::I64(in_secondary));
        changes.push(DbChange::update("address_incoming_relations", in_data));
    }

    RelationIngestResult {
        changes,
        new_relations_in,
        new_relations_out,
        new_relation_edges,
    }
}

pub struct EntityIngestResult {
    pub changes: Vec<DbChange>,
}

pub fn prepare_entities_for_ingest(
    entity_updates: &[EntityDelta],
    ctx: &ChangeContext,
    new_relations_in: &HashMap<i64, i64>,
    new_relations_out: &HashMap<i64, i64>,
) -> EntityIngestResult {
    let mut changes = Vec::new();

    for update in entity_updates {
        let address_id = resolve(ctx, &update.identifier);
        let existing = ctx.existing_addresses.get(&address_id);
        let new_in = *new_relations_in.get(&address_id).unwrap_or(&0);
        let new_out = *new_relations_out.get(&address_id).unwrap_or(&0);

        let (no_incoming_txs, no_outgoing_txs, no_in_zero, no_out_zero, first_tx_id, last_tx_id, total_received, total_spent, total_tokens_received, total_tokens_spent, in_degree, out_degree, is_contract) =
            if let Some(existing) = existing {
                let first_tx_id = minusone_respecting_min(existing.first_tx_id, update.first_tx_id);
                let last_tx_id = minusone_respecting_max(existing.last_tx_id, update.last_tx_id);
                assert!(first_tx_id <= last_tx_id || first_tx_id == -1 || last_tx_id == -1);
                (
                    existing.no_incoming_txs + update.no_incoming_txs,
                    existing.no_outgoing_txs + update.no_outgoing_txs,
                    existing.no_incoming_txs_zero_value + update.no_incoming_txs_zero_value,
                    existing.no_outgoing_txs_zero_value + update.no_outgoing_txs_zero_value,
                    first_tx_id,
                    last_tx_id,
                    existing.total_received + update.total_received.value,
                    existing.total_spent + update.total_spent.value,
                    merge_json_assets(&existing.total_tokens_received, &update.total_tokens_received),
                    merge_json_assets(&existing.total_tokens_spent, &update.total_tokens_spent),
                    existing.in_degree + new_in,
                    existing.out_degree + new_out,
                    existing.is_contract,
                )
            } else {
                assert!(
                    update.first_tx_id <= update.last_tx_id || update.first_tx_id == -1 || update.last_tx_id == -1
                );
                (
                    update.no_incoming_txs,
                    update.no_outgoing_txs,
                    update.no_incoming_txs_zero_value,
                    update.no_outgoing_txs_zero_value,
                    update.first_tx_id,
                    update.last_tx_id,
                    update.total_received.value,
                    update.total_spent.value,
                    update.total_tokens_received.clone(),
                    update.total_tokens_spent.clone(),
                    new_in,
                    new_out,
                    false,
                )
            };

        let mut data = BTreeMap::new();
        data.insert(
            "address_id_group".to_string(),
            ChangeValue::I64(id_group(address_id, ctx.id_bucket_size)),
        );
        data.insert("address_id".to_string(), ChangeValue::I64(address_id));
        data.insert("no_incoming_txs".to_string(), ChangeValue::I64(no_incoming_txs));
        data.insert("no_outgoing_txs".to_string(), ChangeValue::I64(no_outgoing_txs));
        data.insert("no_incoming_txs_zero_value".to_string(), ChangeValue::I64(no_in_zero));
        data.insert("no_outgoing_txs_zero_value".to_string(), ChangeValue::I64(no_out_zero));
        data.insert("first_tx_id".to_string(), ChangeValue::I64(first_tx_id));
        data.insert("last_tx_id".to_string(), ChangeValue::I64(last_tx_id));
        data.insert("total_received".to_string(), ChangeValue::I128(total_received));
        data.insert("total_spent".to_string(), ChangeValue::I128(total_spent));
        data.insert("total_tokens_received".to_string(), asset_map_to_json(&total_tokens_received));
        data.insert("total_tokens_spent".to_string(), asset_map_to_json(&total_tokens_spent));
        data.insert("in_degree".to_string(), ChangeValue::I64(in_degree));
        data.insert("out_degree".to_string(), ChangeValue::I64(out_degree));
        data.insert("is_contract".to_string(), ChangeValue::Bool(is_contract));
        changes.push(DbChange::update("address", data));

        if existing.is_none() {
            let prefix: String = hex::encode(&update.identifier)
                .chars()
                .take(ctx.address_prefix_length)
                .collect();
            let mut prefix_row = BTreeMap::new();
            prefix_row.insert("address_prefix".to_string(), ChangeValue::Text(prefix));
            prefix_row.insert("address".to_string(), ChangeValue::Bytes(update.identifier.clone()));
            prefix_row.insert("address_id".to_string(), ChangeValue::I64(address_id));
            changes.push(DbChange::new("address_ids_by_address_prefix", prefix_row));
        }
    }

    EntityIngestResult { changes }
}

fn merge_json_assets(existing: &serde_json::Value, update: &AssetMap) -> AssetMap {
    let existing_map = AssetMap::from_json(existing);
    existing_map.merge(update)
}

pub fn prepare_entity_txs_for_ingest(raw_entity_txs: &[RawEntityTx], ctx: &ChangeContext) -> Vec<DbChange> {
    let mut changes = Vec::new();
    for atx in raw_entity_txs {
        let address_id = resolve(ctx, &atx.identifier);
        let (group, secondary) = address_transactions_secondary_group(address_id, ctx.id_bucket_size, atx.block_id);

        let mut push_row = |currency: String| {
            let mut data = BTreeMap::new();
            data.insert("address_id_group".to_string(), ChangeValue::I64(group));
            data.insert("address_id_secondary_group".to_string(), ChangeValue::I64(secondary));
            data.insert("address_id".to_string(), ChangeValue::I64(address_id));
            data.insert("currency".to_string(), ChangeValue::Text(currency));
            data.insert("transaction_id".to_string(), ChangeValue::I64(atx.tx_id));
            data.insert("is_outgoing".to_string(), ChangeValue::Bool(atx.is_outgoing));
            data.insert(
                "trace_index".to_string(),
                atx.tx_reference
                    .trace_index
                    .map(|i| ChangeValue::I64(i as i64))
                    .unwrap_or(ChangeValue::Null),
            );
            data.insert(
                "log_index".to_string(),
                atx.tx_reference
                    .log_index
                    .map(|i| ChangeValue::I64(i as i64))
                    .unwrap_or(ChangeValue::Null),
            );
            changes.push(DbChange::new("address_transactions", data));
        };

        if atx.token_values.0.is_empty() {
            push_row("native".to_string());
        } else {
            for asset in atx.token_values.0.keys() {
                push_row(asset.clone());
            }
        }
    }
    changes
}

/// Merges this batch's observed secondary-group maxima for one sharded
/// table against the stored maxima, emitting an UPDATE only where the new
/// value strictly exceeds the old one (mirrors Python's
/// `get_max_secondary_changes`, -1 standing in for "nothing stored yet" so
/// it never wins the `max`).
fn secondary_maxima_changes(table: &'static str, observed: &SecondaryIdMaxima, existing: &SecondaryIdMaxima) -> Vec<DbChange> {
    let mut changes = Vec::new();
    for (&group, &observed_max) in observed {
        let old_max = existing.get(&group).copied().unwrap_or(-1);
        let merged = observed_max.max(old_max);
        if merged != old_max {
            let mut data = BTreeMap::new();
            data.insert("address_id_group".to_string(), ChangeValue::I64(group));
            data.insert("max_secondary_id".to_string(), ChangeValue::I64(merged));
            changes.push(DbChange::update(table, data));
        }
    }
    changes
}

/// Secondary-group-maxima bookkeeping rows for `address_transactions`,
/// `address_outgoing_relations`, and `address_incoming_relations` (spec
/// §4.8): each sharded table's secondary group is capped by a bucket size,
/// and downstream readers need to know the current maximum in use per
/// primary group without scanning the whole shard.
pub fn prepare_secondary_id_maxima_for_ingest(
    relation_updates: &[RelationDelta],
    new_entity_txs: &[RawEntityTx],
    ctx: &ChangeContext,
) -> Vec<DbChange> {
    let mut atx_observed: SecondaryIdMaxima = BTreeMap::new();
    for atx in new_entity_txs {
        let address_id = resolve(ctx, &atx.identifier);
        let (group, secondary) = address_transactions_secondary_group(address_id, ctx.id_bucket_size, atx.block_id);
        let slot = atx_observed.entry(group).or_insert(secondary);
        *slot = (*slot).max(secondary);
    }

    let mut out_observed: SecondaryIdMaxima = BTreeMap::new();
    let mut in_observed: SecondaryIdMaxima = BTreeMap::new();
    for rel in relation_updates {
        let src = resolve(ctx, &rel.src_identifier);
        let dst = resolve(ctx, &rel.dst_identifier);

        let (out_group, out_secondary) = relation_secondary_group(src, dst, ctx.id_bucket_size);
        let slot = out_observed.entry(out_group).or_insert(out_secondary);
        *slot = (*slot).max(out_secondary);

        let (in_group, in_secondary) = relation_secondary_group(dst, src, ctx.id_bucket_size);
        let slot = in_observed.entry(in_group).or_insert(in_secondary);
        *slot = (*slot).max(in_secondary);
    }

    let mut changes = secondary_maxima_changes(
        "address_transactions_secondary_ids",
        &atx_observed,
        ctx.existing_atx_secondary_maxima,
    );
    changes.extend(secondary_maxima_changes(
        "address_outgoing_relations_secondary_ids",
        &out_observed,
        ctx.existing_outgoing_secondary_maxima,
    ));
    changes.extend(secondary_maxima_changes(
        "address_incoming_relations_secondary_ids",
        &in_observed,
        ctx.existing_incoming_secondary_maxima,
    ));
    changes
}

pub struct BuiltChanges {
    pub changes: Vec<DbChange>,
    pub new_relation_edges: i64,
}

/// Runs every ChangeBuilder stage in the fixed write order the Applier
/// expects (spec §4.8): transaction lookups and `block_transactions`,
/// secondary-group maxima, entity transactions, balances, relations,
/// entities. Relations are still computed before entities internally
/// (entity in/out-degree folds in the new-relation counts), independent of
/// their emission order.
pub fn build_changes(
    delta: &DbDelta,
    txs: &[Tx],
    tx_prefix_length: usize,
    ctx: &ChangeContext,
) -> BuiltChanges {
    let mut changes = prepare_txs_for_ingest(txs, tx_prefix_length, ctx.id_bucket_size, ctx.block_bucket_size);
    changes.extend(prepare_secondary_id_maxima_for_ingest(&delta.relation_updates, &delta.new_entity_txs, ctx));
    changes.extend(prepare_entity_txs_for_ingest(&delta.new_entity_txs, ctx));
    changes.extend(prepare_balances_for_ingest(&delta.balance_updates, ctx));

    let rel_result = prepare_relations_for_ingest(&delta.relation_updates, ctx);
    let new_relation_edges = rel_result.new_relation_edges;
    changes.extend(rel_result.changes);

    let entity_result = prepare_entities_for_ingest(
        &delta.entity_updates,
        ctx,
        &rel_result.new_relations_in,
        &rel_result.new_relations_out,
    );
    changes.extend(entity_result.changes);

    BuiltChanges { changes, new_relation_edges }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gs_common::delta::{DeltaValue, TxReference};

    fn empty_ctx<'a>(
        resolve_identifier: &'a HashMap<Vec<u8>, i64>,
        existing_addresses: &'a HashMap<i64, AddressRow>,
        existing_in: &'a HashMap<(i64, i64), RelationRow>,
        existing_out: &'a HashMap<(i64, i64), RelationRow>,
        existing_balances: &'a HashMap<(i64, String), BalanceRow>,
    ) -> ChangeContext<'a> {
        empty_ctx_with_maxima(resolve_identifier, existing_addresses, existing_in, existing_out, existing_balances, &EMPTY_MAXIMA, &EMPTY_MAXIMA, &EMPTY_MAXIMA)
    }

    const EMPTY_MAXIMA: SecondaryIdMaxima = BTreeMap::new();

    #[allow(clippy::too_many_arguments)]
    fn empty_ctx_with_maxima<'a>(
        resolve_identifier: &'a HashMap<Vec<u8>, i64>,
        existing_addresses: &'a HashMap<i64, AddressRow>,
        existing_in: &'a HashMap<(i64, i64), RelationRow>,
        existing_out: &'a HashMap<(i64, i64), RelationRow>,
        existing_balances: &'a HashMap<(i64, String), BalanceRow>,
        existing_atx_secondary_maxima: &'a SecondaryIdMaxima,
        existing_outgoing_secondary_maxima: &'a SecondaryIdMaxima,
        existing_incoming_secondary_maxima: &'a SecondaryIdMaxima,
    ) -> ChangeContext<'a> {
        ChangeContext {
            resolve_identifier,
            existing_addresses,
            existing_incoming_relations: existing_in,
            existing_outgoing_relations: existing_out,
            existing_balances,
            existing_atx_secondary_maxima,
            existing_outgoing_secondary_maxima,
            existing_incoming_secondary_maxima,
            id_bucket_size: 1000,
            block_bucket_size: 1000,
            address_prefix_length: 5,
        }
    }

    #[test]
    fn new_entity_emits_address_and_prefix_rows() {
        let mut resolve = HashMap::new();
        resolve.insert(vec![0xAA; 20], 7i64);
        let existing_addresses = HashMap::new();
        let existing_in = HashMap::new();
        let existing_out = HashMap::new();
        let existing_balances = HashMap::new();
        let ctx = empty_ctx(&resolve, &existing_addresses, &existing_in, &existing_out, &existing_balances);

        let update = EntityDelta {
            identifier: vec![0xAA; 20],
            total_received: DeltaValue::zero(2),
            total_spent: DeltaValue::zero(2),
            total_tokens_received: AssetMap::default(),
            total_tokens_spent: AssetMap::default(),
            first_tx_id: 5,
            last_tx_id: 5,
            no_incoming_txs: 1,
            no_outgoing_txs: 0,
            no_incoming_txs_zero_value: 0,
            no_outgoing_txs_zero_value: 0,
        };

        let result = prepare_entities_for_ingest(&[update], &ctx, &HashMap::new(), &HashMap::new());
        assert_eq!(result.changes.len(), 2);
        assert_eq!(result.changes[0].table, "address");
        assert_eq!(result.changes[1].table, "address_ids_by_address_prefix");
    }

    #[test]
    fn entity_tx_without_token_values_uses_native_row() {
        let mut resolve = HashMap::new();
        resolve.insert(vec![0xBB; 20], 3i64);
        let existing_addresses = HashMap::new();
        let existing_in = HashMap::new();
        let existing_out = HashMap::new();
        let existing_balances = HashMap::new();
        let ctx = empty_ctx(&resolve, &existing_addresses, &existing_in, &existing_out, &existing_balances);

        let atx = RawEntityTx {
            identifier: vec![0xBB; 20],
            is_outgoing: true,
            tx_id: 99,
            tx_reference: TxReference { trace_index: Some(0), log_index: None },
            value: 100,
            token_values: AssetMap::default(),
            block_id: 12345,
        };

        let changes = prepare_entity_txs_for_ingest(&[atx], &ctx);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].table, "address_transactions");
    }

    #[test]
    fn failed_tx_skips_block_transactions_row() {
        let tx = Tx {
            block_id: 10,
            tx_id: 1,
            tx_hash: vec![0xCC; 32],
            tx_index: 0,
            failed: true,
        };
        let changes = prepare_txs_for_ingest(&[tx], 5, 1000, 1000);
        assert!(!changes.iter().any(|c| c.table == "block_transactions"));
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn block_transactions_row_uses_block_bucket_size_not_id_bucket_size() {
        let tx = Tx { block_id: 2500, tx_id: 1, tx_hash: vec![0xDD; 32], tx_index: 0, failed: false };
        let changes = prepare_txs_for_ingest(&[tx], 5, 1_000_000, 1_000);
        let block_tx = changes.iter().find(|c| c.table == "block_transactions").unwrap();
        assert_eq!(block_tx.data.get("block_id_group"), Some(&ChangeValue::I64(2)));
    }

    #[test]
    fn secondary_maxima_only_emitted_when_new_max_exceeds_stored() {
        let mut resolve = HashMap::new();
        resolve.insert(vec![0xAA; 20], 1i64);
        resolve.insert(vec![0xBB; 20], 2i64);
        let existing_addresses = HashMap::new();
        let existing_in = HashMap::new();
        let existing_out = HashMap::new();
        let existing_balances = HashMap::new();

        let atx = RawEntityTx {
            identifier: vec![0xAA; 20],
            is_outgoing: true,
            tx_id: 1,
            tx_reference: TxReference { trace_index: Some(0), log_index: None },
            value: 1,
            token_values: AssetMap::default(),
            block_id: 42,
        };
        let (group, secondary) = address_transactions_secondary_group(1, 1000, 42);
        let mut stale = SecondaryIdMaxima::new();
        stale.insert(group, secondary);

        let ctx = empty_ctx_with_maxima(
            &resolve, &existing_addresses, &existing_in, &existing_out, &existing_balances,
            &stale, &EMPTY_MAXIMA, &EMPTY_MAXIMA,
        );
        let changes = prepare_secondary_id_maxima_for_ingest(&[], &[atx], &ctx);
        assert!(changes.iter().all(|c| c.table != "address_transactions_secondary_ids"));

        let ctx = empty_ctx(&resolve, &existing_addresses, &existing_in, &existing_out, &existing_balances);
        let atx2 = RawEntityTx {
            identifier: vec![0xAA; 20],
            is_outgoing: true,
            tx_id: 1,
            tx_reference: TxReference { trace_index: Some(0), log_index: None },
            value: 1,
            token_values: AssetMap::default(),
            block_id: 42,
        };
        let changes = prepare_secondary_id_maxima_for_ingest(&[], &[atx2], &ctx);
        assert!(changes.iter().any(|c| c.table == "address_transactions_secondary_ids"));
    }
}
