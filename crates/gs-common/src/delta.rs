//! Pure value types for the per-batch delta algebra (spec §3/§4.2).
//!
//! Everything in this module is a value type with an associative, mostly
//! commutative merge operation; nothing here talks to a sink. `-1` is used
//! throughout as the "absent" sentinel for `first_tx_id`/`last_tx_id`
//! (reward traces with no owning transaction), matching the source's
//! `minusone_respecting_function` convention.

use std::collections::BTreeMap;

/// An additive integer counter. Merge is plain addition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeltaScalar {
    pub value: i128,
}

impl DeltaScalar {
    pub fn new(value: i128) -> Self {
        DeltaScalar { value }
    }

    pub fn merge(self, other: DeltaScalar) -> DeltaScalar {
        DeltaScalar::new(self.value + other.value)
    }
}

/// A raw integer amount paired with its fiat-denominated value vector
/// (currently `[euro, dollar]`, see [`crate::rows::get_prices`]). Merge is
/// elementwise addition; the fiat-vector length is fixed per process.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeltaValue {
    pub value: i128,
    pub fiat_values: Vec<f64>,
}

impl DeltaValue {
    pub fn new(value: i128, fiat_values: Vec<f64>) -> Self {
        DeltaValue { value, fiat_values }
    }

    pub fn zero(fiat_width: usize) -> Self {
        DeltaValue {
            value: 0,
            fiat_values: vec![0.0; fiat_width],
        }
    }

    pub fn merge(mut self, other: DeltaValue) -> DeltaValue {
        assert_eq!(
            self.fiat_values.len(),
            other.fiat_values.len(),
            "fiat vector width must be constant within a process"
        );
        self.value += other.value;
        for (a, b) in self.fiat_values.iter_mut().zip(other.fiat_values.iter()) {
            *a += b;
        }
        self
    }
}

/// Mapping from asset code (e.g. "USDT") to a [`DeltaValue`]. Merge is
/// pointwise; a missing key on either side is treated as zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssetMap(pub BTreeMap<String, DeltaValue>);

impl AssetMap {
    pub fn new() -> Self {
        AssetMap(BTreeMap::new())
    }

    pub fn single(asset: impl Into<String>, value: DeltaValue) -> Self {
        let mut m = BTreeMap::new();
        m.insert(asset.into(), value);
        AssetMap(m)
    }

    pub fn merge(mut self, other: AssetMap) -> AssetMap {
        for (asset, v) in other.0 {
            self.0
                .entry(asset)
                .and_modify(|existing| *existing = existing.clone().merge(v.clone()))
                .or_insert(v);
        }
        self
    }

    /// Parses the JSONB-style column shape written by [`Self::to_json`]:
    /// `{"<asset>": {"value": "<i128 as string>", "fiat_values": [..]}}`.
    /// An unrecognized or absent value decodes to an empty map rather than
    /// failing — a fresh address with no stored token totals yet.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let mut map = BTreeMap::new();
        if let Some(obj) = value.as_object() {
            for (asset, entry) in obj {
                let raw_value = entry
                    .get("value")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<i128>().ok())
                    .unwrap_or(0);
                let fiat_values = entry
                    .get("fiat_values")
                    .and_then(|v| v.as_array())
                    .map(|arr| arr.iter().filter_map(|x| x.as_f64()).collect())
                    .unwrap_or_default();
                map.insert(asset.clone(), DeltaValue::new(raw_value, fiat_values));
            }
        }
        AssetMap(map)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        for (asset, v) in &self.0 {
            obj.insert(
                asset.clone(),
                serde_json::json!({
                    "value": v.value.to_string(),
                    "fiat_values": v.fiat_values,
                }),
            );
        }
        serde_json::Value::Object(obj)
    }
}

/// Merges `first_tx_id`/`last_tx_id` respecting the `-1` ("absent") sentinel
/// used for reward traces that have no owning transaction.
fn minusone_respecting(a: i64, b: i64, pick: impl Fn(i64, i64) -> i64) -> i64 {
    match (a, b) {
        (-1, x) => x,
        (x, -1) => x,
        (x, y) => pick(x, y),
    }
}

pub fn minusone_respecting_min(a: i64, b: i64) -> i64 {
    minusone_respecting(a, b, i64::min)
}

pub fn minusone_respecting_max(a: i64, b: i64) -> i64 {
    minusone_respecting(a, b, i64::max)
}

/// Address-centric aggregate delta. Network-agnostic: the account dialect
/// additionally tags relations with a `type`, modeled in
/// [`crate::delta::RelationType`].
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDelta {
    pub identifier: Vec<u8>,
    pub total_received: DeltaValue,
    pub total_spent: DeltaValue,
    pub total_tokens_received: AssetMap,
    pub total_tokens_spent: AssetMap,
    pub first_tx_id: i64,
    pub last_tx_id: i64,
    pub no_incoming_txs: i64,
    pub no_outgoing_txs: i64,
    pub no_incoming_txs_zero_value: i64,
    pub no_outgoing_txs_zero_value: i64,
}

impl EntityDelta {
    pub fn merge(self, other: EntityDelta) -> EntityDelta {
        assert_eq!(self.identifier, other.identifier, "merge requires identifier equality");
        EntityDelta {
            identifier: self.identifier,
            total_received: self.total_received.merge(other.total_received),
            total_spent: self.total_spent.merge(other.total_spent),
            total_tokens_received: self.total_tokens_received.merge(other.total_tokens_received),
            total_tokens_spent: self.total_tokens_spent.merge(other.total_tokens_spent),
            first_tx_id: minusone_respecting_min(self.first_tx_id, other.first_tx_id),
            last_tx_id: minusone_respecting_max(self.last_tx_id, other.last_tx_id),
            no_incoming_txs: self.no_incoming_txs + other.no_incoming_txs,
            no_outgoing_txs: self.no_outgoing_txs + other.no_outgoing_txs,
            no_incoming_txs_zero_value: self.no_incoming_txs_zero_value
                + other.no_incoming_txs_zero_value,
            no_outgoing_txs_zero_value: self.no_outgoing_txs_zero_value
                + other.no_outgoing_txs_zero_value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationType {
    Tx,
    Call,
    Delegatecall,
    Staticcall,
    Callcode,
    Token,
}

impl RelationType {
    /// Relations of these types are excluded from balance updates
    /// (spec §4.6 step 8 / §9 open question): they move no value of their
    /// own between the declared src/dst in EVM semantics.
    pub fn excluded_from_balance_updates(self) -> bool {
        matches!(
            self,
            RelationType::Delegatecall | RelationType::Staticcall | RelationType::Callcode
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationDelta {
    pub src_identifier: Vec<u8>,
    pub dst_identifier: Vec<u8>,
    pub no_transactions: i64,
    pub value: DeltaValue,
    pub token_values: AssetMap,
    pub rel_type: RelationType,
}

impl RelationDelta {
    /// Merge identity is `(src, dst)`; `type` does not participate in
    /// compression per spec §3.
    pub fn merge(self, other: RelationDelta) -> RelationDelta {
        assert_eq!(self.src_identifier, other.src_identifier);
        assert_eq!(self.dst_identifier, other.dst_identifier);
        RelationDelta {
            src_identifier: self.src_identifier,
            dst_identifier: self.dst_identifier,
            no_transactions: self.no_transactions + other.no_transactions,
            value: self.value.merge(other.value),
            token_values: self.token_values.merge(other.token_values),
            rel_type: self.rel_type,
        }
    }
}

/// A reference to where, within a transaction, an entity-tx row originated:
/// a value trace (`trace_index`) or a decoded log (`log_index`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxReference {
    pub trace_index: Option<i32>,
    pub log_index: Option<i32>,
}

/// One row per `(address, tx, is_outgoing, kind)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEntityTx {
    pub identifier: Vec<u8>,
    pub is_outgoing: bool,
    pub tx_id: i64,
    pub tx_reference: TxReference,
    pub value: i128,
    pub token_values: AssetMap,
    pub block_id: u64,
}

/// `BalanceDelta{identifier, asset_balances}`. `left_join` merges with a
/// database-loaded balance, keeping all keys from `self` and adding values
/// for shared keys — it is associative with `BalanceDelta(id, {})` as right
/// identity (spec §8).
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceDelta {
    pub identifier: i64,
    pub asset_balances: BTreeMap<String, DeltaScalar>,
}

impl BalanceDelta {
    pub fn new(identifier: i64) -> Self {
        BalanceDelta {
            identifier,
            asset_balances: BTreeMap::new(),
        }
    }

    pub fn credit(&mut self, asset: impl Into<String>, amount: i128) {
        self.asset_balances
            .entry(asset.into())
            .and_modify(|s| *s = s.merge(DeltaScalar::new(amount)))
            .or_insert(DeltaScalar::new(amount));
    }

    pub fn debit(&mut self, asset: impl Into<String>, amount: i128) {
        self.credit(asset, -amount);
    }

    pub fn left_join(&self, db_value: &BalanceDelta) -> BalanceDelta {
        assert_eq!(self.identifier, db_value.identifier);
        let mut out = self.clone();
        for (asset, v) in &db_value.asset_balances {
            out.asset_balances
                .entry(asset.clone())
                .and_modify(|s| *s = s.merge(*v))
                .or_insert(*v);
        }
        out
    }
}

/// A persisted transaction record.
#[derive(Debug, Clone, PartialEq)]
pub struct Tx {
    pub block_id: u64,
    pub tx_id: i64,
    pub tx_hash: Vec<u8>,
    pub tx_index: i32,
    pub failed: bool,
}

/// The composite per-batch delta (spec §3).
#[derive(Debug, Clone, Default)]
pub struct DbDelta {
    pub entity_updates: Vec<EntityDelta>,
    pub new_entity_txs: Vec<RawEntityTx>,
    pub relation_updates: Vec<RelationDelta>,
    pub balance_updates: Vec<BalanceDelta>,
}

impl DbDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain concatenation of two deltas, uncompressed.
    pub fn concat(mut self, other: DbDelta) -> DbDelta {
        self.entity_updates.extend(other.entity_updates);
        self.new_entity_txs.extend(other.new_entity_txs);
        self.relation_updates.extend(other.relation_updates);
        self.balance_updates.extend(other.balance_updates);
        self
    }

    pub fn merge(deltas: impl IntoIterator<Item = DbDelta>) -> DbDelta {
        let mut acc = DbDelta::new();
        for d in deltas {
            acc = acc.concat(d);
        }
        acc.compress()
    }

    /// Groups `entity_updates` by identifier (order-preserving, ordered by
    /// the minimum `first_tx_id` of the group) and `relation_updates` by
    /// `(src, dst)`, merging each group. `new_entity_txs` passes through
    /// unchanged. Insensitive to input permutation up to the group ordering
    /// key (spec §8).
    pub fn compress(self) -> DbDelta {
        let mut entity_order: Vec<Vec<u8>> = Vec::new();
        let mut entity_groups: std::collections::HashMap<Vec<u8>, EntityDelta> =
            std::collections::HashMap::new();
        for e in self.entity_updates {
            match entity_groups.get(&e.identifier) {
                Some(existing) => {
                    let merged = existing.clone().merge(e);
                    entity_groups.insert(merged.identifier.clone(), merged);
                }
                None => {
                    entity_order.push(e.identifier.clone());
                    entity_groups.insert(e.identifier.clone(), e);
                }
            }
        }
        entity_order.sort_by_key(|id| entity_groups[id].first_tx_id);
        let entity_updates = entity_order
            .into_iter()
            .map(|id| entity_groups.remove(&id).unwrap())
            .collect();

        let mut relation_order: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut relation_groups: std::collections::HashMap<(Vec<u8>, Vec<u8>), RelationDelta> =
            std::collections::HashMap::new();
        for r in self.relation_updates {
            let key = (r.src_identifier.clone(), r.dst_identifier.clone());
            match relation_groups.remove(&key) {
                Some(existing) => {
                    relation_groups.insert(key, existing.merge(r));
                }
                None => {
                    relation_order.push(key.clone());
                    relation_groups.insert(key, r);
                }
            }
        }
        let relation_updates = relation_order
            .into_iter()
            .map(|k| relation_groups.remove(&k).unwrap())
            .collect();

        DbDelta {
            entity_updates,
            new_entity_txs: self.new_entity_txs,
            relation_updates,
            balance_updates: self.balance_updates,
        }
    }
}

/// A single database write, in the order the [`ChangeBuilder`] emitted it.
/// Ordering is significant: two runs on the same input must produce
/// byte-equal change lists.
///
/// [`ChangeBuilder`]: gs_engine concept; kept in `gs-common` because both the
/// engine and the sink adapters need this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeAction {
    New,
    Update,
    Delete,
    Truncate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DbChange {
    pub action: ChangeAction,
    pub table: &'static str,
    pub data: BTreeMap<String, ChangeValue>,
}

impl DbChange {
    pub fn new(table: &'static str, data: BTreeMap<String, ChangeValue>) -> Self {
        DbChange {
            action: ChangeAction::New,
            table,
            data,
        }
    }

    pub fn update(table: &'static str, data: BTreeMap<String, ChangeValue>) -> Self {
        DbChange {
            action: ChangeAction::Update,
            table,
            data,
        }
    }
}

/// A loosely-typed column value for a [`DbChange`]; sink adapters downcast
/// this into the concrete `sqlx` bind types for the target table.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeValue {
    I64(i64),
    I128(i128),
    U64(u64),
    Bool(bool),
    Bytes(Vec<u8>),
    Text(String),
    FiatVec(Vec<f64>),
    AssetMap(AssetMap),
    Null,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: &[u8], first: i64, last: i64) -> EntityDelta {
        EntityDelta {
            identifier: id.to_vec(),
            total_received: DeltaValue::zero(2),
            total_spent: DeltaValue::zero(2),
            total_tokens_received: AssetMap::new(),
            total_tokens_spent: AssetMap::new(),
            first_tx_id: first,
            last_tx_id: last,
            no_incoming_txs: 1,
            no_outgoing_txs: 0,
            no_incoming_txs_zero_value: 0,
            no_outgoing_txs_zero_value: 0,
        }
    }

    #[test]
    fn minusone_sentinel_is_identity() {
        assert_eq!(minusone_respecting_min(-1, 5), 5);
        assert_eq!(minusone_respecting_max(-1, 5), 5);
        assert_eq!(minusone_respecting_min(3, -1), 3);
    }

    #[test]
    fn entity_merge_keeps_first_and_last() {
        let a = entity(b"addr", 10, 10);
        let b = entity(b"addr", 5, 20);
        let merged = a.merge(b);
        assert_eq!(merged.first_tx_id, 5);
        assert_eq!(merged.last_tx_id, 20);
        assert_eq!(merged.no_incoming_txs, 2);
    }

    #[test]
    fn compress_is_permutation_insensitive() {
        let d1 = DbDelta {
            entity_updates: vec![entity(b"a", 3, 3), entity(b"b", 1, 1), entity(b"a", 2, 2)],
            ..Default::default()
        };
        let d2 = DbDelta {
            entity_updates: vec![entity(b"b", 1, 1), entity(b"a", 2, 2), entity(b"a", 3, 3)],
            ..Default::default()
        };
        let c1 = d1.compress();
        let c2 = d2.compress();
        let ids1: Vec<_> = c1.entity_updates.iter().map(|e| e.identifier.clone()).collect();
        let ids2: Vec<_> = c2.entity_updates.iter().map(|e| e.identifier.clone()).collect();
        assert_eq!(ids1, ids2);
        assert_eq!(ids1, vec![b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn balance_left_join_right_identity() {
        let mut a = BalanceDelta::new(1);
        a.credit("ETH", 100);
        let identity = BalanceDelta::new(1);
        let joined = a.left_join(&identity);
        assert_eq!(joined, a);
    }

    #[test]
    fn asset_map_json_round_trips() {
        let map = AssetMap::single("USDT", DeltaValue::new(29_000_000, vec![1.1, 1.2]));
        let json = map.to_json();
        let parsed = AssetMap::from_json(&json);
        assert_eq!(parsed, map);
    }

    #[test]
    fn balance_left_join_merges_shared_keys() {
        let mut a = BalanceDelta::new(1);
        a.credit("ETH", 100);
        let mut db = BalanceDelta::new(1);
        db.credit("ETH", 900);
        db.credit("USDT", 5);
        let joined = a.left_join(&db);
        assert_eq!(joined.asset_balances["ETH"].value, 1000);
        assert_eq!(joined.asset_balances["USDT"].value, 5);
    }
}
