//! External interfaces (spec §6): the raw source and the transformed sink
//! the engine reads from / writes to. Kept as async traits so production
//! code can implement them over `sqlx`/`tokio-postgres` while tests supply
//! an in-memory fake.

use async_trait::async_trait;

use gs_common::delta::DbChange;
use gs_common::rows::{
    AddressRow, BalanceRow, DeltaUpdaterHistoryRow, RelationRow, SecondaryIdMaxima,
    SummaryStatisticsRow,
};

use crate::adapter::{RawBlock, RawLog, RawTrace, RawTransaction, RawUtxoTx};
use crate::GsResult;

/// Exchange rates for one block: `[euro_per_coin, dollar_per_coin]`.
pub type ExchangeRates = [f64; 2];

#[async_trait]
pub trait RawSink: Send + Sync {
    async fn get_highest_block(&self) -> GsResult<Option<u64>>;
    async fn get_block(&self, block_id: u64) -> GsResult<Option<RawBlock>>;
    async fn get_transactions_in_block(&self, block_id: u64) -> GsResult<Vec<RawTransaction>>;
    async fn get_traces_in_block(&self, block_id: u64) -> GsResult<Vec<RawTrace>>;
    async fn get_logs_in_block(&self, block_id: u64) -> GsResult<Vec<RawLog>>;

    /// `None` when no rate is recorded for the block (spec §7: a gap here
    /// is an error in validate mode, a zero-fill or forward-fill otherwise).
    async fn get_exchange_rates_for_block_batch(
        &self,
        block_ids: &[u64],
    ) -> GsResult<Vec<(u64, Option<ExchangeRates>)>>;

    /// UTXO-dialect raw reads (spec §4.11 step 1: "for UTXO, also
    /// block_transactions indices"). Account-model sinks never call this and
    /// may leave the default empty implementation in place.
    async fn get_utxo_transactions_in_block(&self, _block_id: u64) -> GsResult<Vec<RawUtxoTx>> {
        Ok(Vec::new())
    }
}

#[async_trait]
pub trait TransformedSink: Send + Sync {
    async fn get_highest_address_id(&self) -> GsResult<Option<i64>>;
    async fn get_highest_cluster_id(&self) -> GsResult<Option<i64>>;
    /// Seeds the EVM transaction-id allocator (spec §4.6 step 3); Tron never
    /// consults this since its transaction ids are derived statelessly.
    async fn get_highest_transaction_id(&self) -> GsResult<Option<i64>>;

    async fn get_address_id(&self, address: &[u8]) -> GsResult<Option<i64>>;
    async fn get_address(&self, address_id: i64) -> GsResult<Option<AddressRow>>;
    async fn known_addresses_batch(&self, addresses: &[Vec<u8>]) -> GsResult<Vec<bool>>;

    async fn get_incoming_relation(&self, src: i64, dst: i64) -> GsResult<Option<RelationRow>>;
    async fn get_outgoing_relation(&self, src: i64, dst: i64) -> GsResult<Option<RelationRow>>;

    async fn get_balance(&self, address_id: i64, currency: &str) -> GsResult<Option<BalanceRow>>;
    async fn get_balances_batch(&self, address_ids: &[i64]) -> GsResult<Vec<Vec<BalanceRow>>>;

    async fn get_max_secondary_id(&self, table: &str, primary_group: i64) -> GsResult<Option<i64>>;
    async fn get_secondary_id_maxima(&self, table: &str) -> GsResult<SecondaryIdMaxima>;

    async fn get_summary_statistics(&self) -> GsResult<Option<SummaryStatisticsRow>>;
    async fn get_last_delta_updater_state(&self) -> GsResult<Option<i64>>;
    async fn get_delta_updater_history(&self) -> GsResult<Vec<DeltaUpdaterHistoryRow>>;

    /// Writes a batch of changes. `atomic` requests a single transaction
    /// spanning the whole batch (spec §4.9 batch-apply mode); when false,
    /// the sink may commit per-change (per-transaction apply mode, only
    /// meaningful for UTXO-dialect networks).
    async fn apply_changes(&self, changes: &[DbChange], atomic: bool) -> GsResult<()>;

    async fn ensure_table_exists(&self, table: &str, columns: &[(&str, &str)]) -> GsResult<()>;
}
