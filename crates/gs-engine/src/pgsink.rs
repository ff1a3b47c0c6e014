//! Postgres-backed implementations of [`RawSink`] and [`TransformedSink`]
//! (spec §6 external interfaces), the production counterpart to the fakes
//! used in the rest of the engine's tests. Reads go through `sqlx` the way
//! `atlas-api`'s handlers do (`query_as(..).bind(..).fetch_*`); writes go
//! through a dedicated `tokio-postgres` connection so the [`applier`]
//! module's parameterized `INSERT ... ON CONFLICT` builder can run inside
//! one transaction per batch.

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::Mutex as AsyncMutex;
use tokio_postgres_rustls::MakeRustlsConnect;

use gs_common::delta::DbChange;
use gs_common::rows::{
    AddressRow, BalanceRow, DeltaUpdaterHistoryRow, RelationRow, SecondaryIdMaxima,
    SummaryStatisticsRow,
};
use gs_common::{GsError, GsResult};

use crate::adapter::{AccountTraceAdapter, RawBlock, RawLog, RawTrace, RawTransaction, RawUtxoTx};
use crate::applier;
use crate::sink::{ExchangeRates, RawSink, TransformedSink};

fn sqlx_error(err: sqlx::Error) -> GsError {
    GsError::Sink(err)
}

fn pg_error(err: tokio_postgres::Error) -> GsError {
    GsError::AssertionFailure(format!("sink connection failed: {err}"))
}

/// Row shapes wide enough that sqlx's tuple `FromRow` impl doesn't cover
/// them (it tops out at 9 columns); on-chain values stay `String`/`Option<String>`
/// here and get parsed to `i128` after the fetch.
#[derive(sqlx::FromRow)]
struct TransactionRow {
    block_id: i64,
    tx_hash: Vec<u8>,
    transaction_index: i32,
    from_address: Option<Vec<u8>>,
    to_address: Option<Vec<u8>>,
    value: String,
    gas_price: String,
    gas_used: i64,
    receipt_gas_used: i64,
    status: i32,
    fee: Option<String>,
}

/// Mirrors of [`AddressRow`], [`RelationRow`] and [`BalanceRow`] with their
/// `i128` columns read back as `TEXT` — sqlx has no `Type<Postgres>` impl for
/// `i128`, so the derived `FromRow` on those types only works against an
/// already-parsed in-memory value, never against a live query.
#[derive(sqlx::FromRow)]
struct AddressSqlRow {
    address_id_group: i64,
    address_id: i64,
    address: Vec<u8>,
    no_incoming_txs: i64,
    no_outgoing_txs: i64,
    no_incoming_txs_zero_value: i64,
    no_outgoing_txs_zero_value: i64,
    first_tx_id: i64,
    last_tx_id: i64,
    total_received: String,
    total_received_fiat: Vec<f64>,
    total_spent: String,
    total_spent_fiat: Vec<f64>,
    total_tokens_received: serde_json::Value,
    total_tokens_spent: serde_json::Value,
    in_degree: i64,
    out_degree: i64,
    in_degree_zero_value: i64,
    out_degree_zero_value: i64,
    is_contract: bool,
}

impl AddressSqlRow {
    fn into_row(self) -> GsResult<AddressRow> {
        Ok(AddressRow {
            address_id_group: self.address_id_group,
            address_id: self.address_id,
            address: self.address,
            no_incoming_txs: self.no_incoming_txs,
            no_outgoing_txs: self.no_outgoing_txs,
            no_incoming_txs_zero_value: self.no_incoming_txs_zero_value,
            no_outgoing_txs_zero_value: self.no_outgoing_txs_zero_value,
            first_tx_id: self.first_tx_id,
            last_tx_id: self.last_tx_id,
            total_received: parse_i128(&self.total_received)?,
            total_received_fiat: self.total_received_fiat,
            total_spent: parse_i128(&self.total_spent)?,
            total_spent_fiat: self.total_spent_fiat,
            total_tokens_received: self.total_tokens_received,
            total_tokens_spent: self.total_tokens_spent,
            in_degree: self.in_degree,
            out_degree: self.out_degree,
            in_degree_zero_value: self.in_degree_zero_value,
            out_degree_zero_value: self.out_degree_zero_value,
            is_contract: self.is_contract,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RelationSqlRow {
    address_id_group: i64,
    address_id_secondary_group: i64,
    src_address_id: i64,
    dst_address_id: i64,
    no_transactions: i64,
    value: String,
    value_fiat: Vec<f64>,
    token_values: serde_json::Value,
}

impl RelationSqlRow {
    fn into_row(self) -> GsResult<RelationRow> {
        Ok(RelationRow {
            address_id_group: self.address_id_group,
            address_id_secondary_group: self.address_id_secondary_group,
            src_address_id: self.src_address_id,
            dst_address_id: self.dst_address_id,
            no_transactions: self.no_transactions,
            value: parse_i128(&self.value)?,
            value_fiat: self.value_fiat,
            token_values: self.token_values,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BalanceSqlRow {
    address_id_group: i64,
    address_id: i64,
    currency: String,
    balance: String,
}

impl BalanceSqlRow {
    fn into_row(self) -> GsResult<BalanceRow> {
        Ok(BalanceRow {
            address_id_group: self.address_id_group,
            address_id: self.address_id,
            currency: self.currency,
            balance: parse_i128(&self.balance)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TraceRow {
    block_id: i64,
    tx_hash: Option<Vec<u8>>,
    trace_index: i32,
    from_address: Vec<u8>,
    to_address: Vec<u8>,
    value: String,
    call_type: String,
    status: i32,
    contract_creation: bool,
    trace_address_is_empty: bool,
}

/// Reads the raw-source schema (blocks, transactions, traces, logs, and for
/// UTXO networks, per-transaction inputs/outputs). `is_tron` selects the
/// Tron field-rename/timestamp-scaling dialect in [`AccountTraceAdapter`].
pub struct PgRawSink {
    pool: PgPool,
    is_tron: bool,
}

impl PgRawSink {
    pub fn new(pool: PgPool, is_tron: bool) -> Self {
        PgRawSink { pool, is_tron }
    }
}

#[async_trait]
impl RawSink for PgRawSink {
    async fn get_highest_block(&self) -> GsResult<Option<u64>> {
        let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(block_id) FROM block")
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error)?;
        Ok(row.0.map(|v| v as u64))
    }

    async fn get_block(&self, block_id: u64) -> GsResult<Option<RawBlock>> {
        let row: Option<(i64, Vec<u8>, i64, Vec<u8>, Option<String>)> = sqlx::query_as(
            "SELECT block_id, block_hash, timestamp, miner, base_fee_per_gas FROM block WHERE block_id = $1",
        )
        .bind(block_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error)?;

        Ok(row.map(|(id, hash, ts, miner, fee)| {
            let timestamp = if self.is_tron { crate::adapter::tron_timestamp_to_seconds(ts) } else { ts };
            RawBlock {
                block_id: id as u64,
                block_hash: hash,
                timestamp,
                miner,
                base_fee_per_gas: fee.and_then(|f| f.parse::<i128>().ok()),
            }
        }))
    }

    async fn get_transactions_in_block(&self, block_id: u64) -> GsResult<Vec<RawTransaction>> {
        let rows: Vec<TransactionRow> = sqlx::query_as(
            "SELECT block_id, tx_hash, transaction_index, from_address, to_address, value, gas_price, \
             gas_used, receipt_gas_used, status, fee \
             FROM transaction WHERE block_id = $1 ORDER BY transaction_index",
        )
        .bind(block_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error)?;

        rows.into_iter()
            .map(|r| {
                Ok(RawTransaction {
                    block_id: r.block_id as u64,
                    tx_hash: r.tx_hash,
                    transaction_index: r.transaction_index,
                    from_address: r.from_address,
                    to_address: r.to_address,
                    value: parse_i128(&r.value)?,
                    gas_price: parse_i128(&r.gas_price)?,
                    gas_used: r.gas_used,
                    receipt_gas_used: r.receipt_gas_used,
                    status: r.status,
                    fee: r.fee.map(|f| parse_i128(&f)).transpose()?,
                })
            })
            .collect()
    }

    async fn get_traces_in_block(&self, block_id: u64) -> GsResult<Vec<RawTrace>> {
        let rows: Vec<TraceRow> = sqlx::query_as(
            "SELECT block_id, tx_hash, trace_index, from_address, to_address, value, call_type, \
             status, contract_creation, trace_address_is_empty \
             FROM trace WHERE block_id = $1 ORDER BY trace_index",
        )
        .bind(block_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error)?;

        let adapter = AccountTraceAdapter { is_tron: self.is_tron };
        rows.into_iter()
            .map(|r| {
                let kind = adapter.trace_kind(r.trace_address_is_empty, r.trace_index);
                Ok(RawTrace {
                    block_id: r.block_id as u64,
                    tx_hash: r.tx_hash,
                    trace_index: r.trace_index,
                    from_address: r.from_address,
                    to_address: r.to_address,
                    value: parse_i128(&r.value)?,
                    call_type: r.call_type,
                    status: r.status,
                    contract_creation: r.contract_creation,
                    kind,
                })
            })
            .collect()
    }

    async fn get_logs_in_block(&self, block_id: u64) -> GsResult<Vec<RawLog>> {
        let rows: Vec<(i64, Vec<u8>, i32, i32, Vec<u8>, Vec<Vec<u8>>, Vec<u8>)> = sqlx::query_as(
            "SELECT block_id, tx_hash, log_index, transaction_index, address, topics, data \
             FROM log WHERE block_id = $1 ORDER BY log_index",
        )
        .bind(block_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error)?;

        Ok(rows
            .into_iter()
            .map(|(bid, tx_hash, log_index, tx_index, address, topics, data)| RawLog {
                block_id: bid as u64,
                tx_hash,
                log_index,
                transaction_index: tx_index,
                address,
                topics,
                data,
            })
            .collect())
    }

    async fn get_exchange_rates_for_block_batch(
        &self,
        block_ids: &[u64],
    ) -> GsResult<Vec<(u64, Option<ExchangeRates>)>> {
        let ids: Vec<i64> = block_ids.iter().map(|&b| b as i64).collect();
        let rows: Vec<(i64, Vec<f64>)> =
            sqlx::query_as("SELECT block_id, fiat_values FROM exchange_rates WHERE block_id = ANY($1)")
                .bind(&ids)
                .fetch_all(&self.pool)
                .await
                .map_err(sqlx_error)?;

        let mut by_block: std::collections::HashMap<u64, ExchangeRates> = std::collections::HashMap::new();
        for (id, fiat) in rows {
            if fiat.len() == 2 {
                by_block.insert(id as u64, [fiat[0], fiat[1]]);
            }
        }
        Ok(block_ids.iter().map(|&b| (b, by_block.get(&b).copied())).collect())
    }

    async fn get_utxo_transactions_in_block(&self, block_id: u64) -> GsResult<Vec<RawUtxoTx>> {
        let tx_rows: Vec<(i64, Vec<u8>, i32, bool)> = sqlx::query_as(
            "SELECT block_id, tx_hash, tx_index, failed FROM utxo_transaction WHERE block_id = $1 ORDER BY tx_index",
        )
        .bind(block_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error)?;

        let mut out = Vec::with_capacity(tx_rows.len());
        for (bid, tx_hash, tx_index, failed) in tx_rows {
            let inputs: Vec<(Vec<u8>, String)> = sqlx::query_as(
                "SELECT address, value FROM utxo_input WHERE block_id = $1 AND tx_hash = $2 ORDER BY input_index",
            )
            .bind(bid)
            .bind(&tx_hash)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error)?;
            let outputs: Vec<(Vec<u8>, String)> = sqlx::query_as(
                "SELECT address, value FROM utxo_output WHERE block_id = $1 AND tx_hash = $2 ORDER BY output_index",
            )
            .bind(bid)
            .bind(&tx_hash)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error)?;

            out.push(RawUtxoTx {
                block_id: bid as u64,
                tx_hash,
                tx_index,
                failed,
                inputs: inputs.into_iter().map(|(a, v)| Ok::<_, GsError>((a, parse_i128(&v)?))).collect::<GsResult<_>>()?,
                outputs: outputs.into_iter().map(|(a, v)| Ok::<_, GsError>((a, parse_i128(&v)?))).collect::<GsResult<_>>()?,
            });
        }
        Ok(out)
    }
}

fn parse_i128(s: &str) -> GsResult<i128> {
    s.parse::<i128>().map_err(|_| GsError::DecodeError(format!("not a valid i128: {s:?}")))
}

/// The transformed store (spec §6 persisted state layout). Reads run on the
/// shared `sqlx::PgPool`; writes take the single `tokio-postgres::Client`
/// behind a mutex (the lock file already guarantees only one process writes
/// this keyspace pair, but `apply_changes` calls within the process must
/// still be serialized onto one connection's transaction).
pub struct PgTransformedSink {
    pool: PgPool,
    writer: AsyncMutex<tokio_postgres::Client>,
}

fn tls_connector() -> MakeRustlsConnect {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
    MakeRustlsConnect::new(tls_config)
}

impl PgTransformedSink {
    pub async fn connect(pool: PgPool, database_url: &str) -> GsResult<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, tls_connector()).await.map_err(pg_error)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "transformed-sink writer connection closed");
            }
        });
        Ok(PgTransformedSink { pool, writer: AsyncMutex::new(client) })
    }
}

#[async_trait]
impl TransformedSink for PgTransformedSink {
    async fn get_highest_address_id(&self) -> GsResult<Option<i64>> {
        let row: (Option<i64>,) =
            sqlx::query_as("SELECT MAX(address_id) FROM address").fetch_one(&self.pool).await.map_err(sqlx_error)?;
        Ok(row.0)
    }

    async fn get_highest_cluster_id(&self) -> GsResult<Option<i64>> {
        // Cluster-layer projection (spec §4.6) is not persisted by this
        // implementation; no cluster table exists to query against.
        Ok(None)
    }

    async fn get_highest_transaction_id(&self) -> GsResult<Option<i64>> {
        let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(transaction_id) FROM transaction_ids_by_transaction_id_group")
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error)?;
        Ok(row.0)
    }

    async fn get_address_id(&self, address: &[u8]) -> GsResult<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT address_id FROM address WHERE address = $1")
            .bind(address)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error)?;
        Ok(row.map(|(id,)| id))
    }

    async fn get_address(&self, address_id: i64) -> GsResult<Option<AddressRow>> {
        let row: Option<AddressSqlRow> = sqlx::query_as(
            "SELECT address_id_group, address_id, address, no_incoming_txs, no_outgoing_txs, \
             no_incoming_txs_zero_value, no_outgoing_txs_zero_value, first_tx_id, last_tx_id, \
             total_received, total_received_fiat, total_spent, total_spent_fiat, \
             total_tokens_received, total_tokens_spent, in_degree, out_degree, \
             in_degree_zero_value, out_degree_zero_value, is_contract \
             FROM address WHERE address_id = $1",
        )
        .bind(address_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error)?;
        row.map(AddressSqlRow::into_row).transpose()
    }

    async fn known_addresses_batch(&self, addresses: &[Vec<u8>]) -> GsResult<Vec<bool>> {
        let rows: Vec<(Vec<u8>,)> = sqlx::query_as("SELECT address FROM address WHERE address = ANY($1)")
            .bind(addresses)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error)?;
        let known: std::collections::HashSet<Vec<u8>> = rows.into_iter().map(|(a,)| a).collect();
        Ok(addresses.iter().map(|a| known.contains(a)).collect())
    }

    async fn get_incoming_relation(&self, src: i64, dst: i64) -> GsResult<Option<RelationRow>> {
        let row: Option<RelationSqlRow> = sqlx::query_as(
            "SELECT address_id_group, address_id_secondary_group, src_address_id, dst_address_id, \
             no_transactions, value, value_fiat, token_values \
             FROM address_incoming_relations WHERE src_address_id = $1 AND dst_address_id = $2",
        )
        .bind(src)
        .bind(dst)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error)?;
        row.map(RelationSqlRow::into_row).transpose()
    }

    async fn get_outgoing_relation(&self, src: i64, dst: i64) -> GsResult<Option<RelationRow>> {
        let row: Option<RelationSqlRow> = sqlx::query_as(
            "SELECT address_id_group, address_id_secondary_group, src_address_id, dst_address_id, \
             no_transactions, value, value_fiat, token_values \
             FROM address_outgoing_relations WHERE src_address_id = $1 AND dst_address_id = $2",
        )
        .bind(src)
        .bind(dst)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error)?;
        row.map(RelationSqlRow::into_row).transpose()
    }

    async fn get_balance(&self, address_id: i64, currency: &str) -> GsResult<Option<BalanceRow>> {
        let row: Option<BalanceSqlRow> = sqlx::query_as(
            "SELECT address_id_group, address_id, currency, balance FROM balance \
             WHERE address_id = $1 AND currency = $2",
        )
        .bind(address_id)
        .bind(currency)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error)?;
        row.map(BalanceSqlRow::into_row).transpose()
    }

    async fn get_balances_batch(&self, address_ids: &[i64]) -> GsResult<Vec<Vec<BalanceRow>>> {
        let rows: Vec<BalanceSqlRow> =
            sqlx::query_as("SELECT address_id_group, address_id, currency, balance FROM balance WHERE address_id = ANY($1)")
                .bind(address_ids)
                .fetch_all(&self.pool)
                .await
                .map_err(sqlx_error)?;

        let mut by_id: std::collections::HashMap<i64, Vec<BalanceRow>> = std::collections::HashMap::new();
        for row in rows {
            let row = row.into_row()?;
            by_id.entry(row.address_id).or_default().push(row);
        }
        Ok(address_ids.iter().map(|id| by_id.remove(id).unwrap_or_default()).collect())
    }

    async fn get_max_secondary_id(&self, table: &str, primary_group: i64) -> GsResult<Option<i64>> {
        if !matches!(table, "address_incoming_relations" | "address_outgoing_relations" | "address_transactions") {
            return Err(GsError::AssertionFailure(format!("unknown sharded table {table:?}")));
        }
        let query = format!("SELECT MAX(address_id_secondary_group) FROM {table} WHERE address_id_group = $1");
        let row: (Option<i64>,) = sqlx::query_as(&query).bind(primary_group).fetch_one(&self.pool).await.map_err(sqlx_error)?;
        Ok(row.0)
    }

    async fn get_secondary_id_maxima(&self, table: &str) -> GsResult<SecondaryIdMaxima> {
        if !matches!(table, "address_incoming_relations" | "address_outgoing_relations" | "address_transactions") {
            return Err(GsError::AssertionFailure(format!("unknown sharded table {table:?}")));
        }
        let query = format!("SELECT address_id_group, MAX(address_id_secondary_group) FROM {table} GROUP BY address_id_group");
        let rows: Vec<(i64, i64)> = sqlx::query_as(&query).fetch_all(&self.pool).await.map_err(sqlx_error)?;
        Ok(rows.into_iter().collect())
    }

    async fn get_summary_statistics(&self) -> GsResult<Option<SummaryStatisticsRow>> {
        sqlx::query_as(
            "SELECT id, no_blocks, no_address_relations, no_addresses, no_transactions, timestamp \
             FROM summary_statistics WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error)
    }

    async fn get_last_delta_updater_state(&self) -> GsResult<Option<i64>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_synced_block FROM delta_updater_status WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(sqlx_error)?;
        Ok(row.map(|(b,)| b))
    }

    async fn get_delta_updater_history(&self) -> GsResult<Vec<DeltaUpdaterHistoryRow>> {
        sqlx::query_as(
            "SELECT last_synced_block, timestamp, write_new, write_dirty, runtime_seconds \
             FROM delta_updater_history ORDER BY timestamp DESC LIMIT 100",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error)
    }

    async fn apply_changes(&self, changes: &[DbChange], atomic: bool) -> GsResult<()> {
        let mut client = self.writer.lock().await;
        if atomic {
            applier::apply_batch_atomic(&mut client, changes).await
        } else {
            applier::apply_per_change(&mut client, changes).await
        }
    }

    async fn ensure_table_exists(&self, table: &str, columns: &[(&str, &str)]) -> GsResult<()> {
        let cols: Vec<String> = columns.iter().map(|(name, ty)| format!("{name} {ty}")).collect();
        let ddl = format!("CREATE TABLE IF NOT EXISTS {table} ({})", cols.join(", "));
        let client = self.writer.lock().await;
        client.batch_execute(&ddl).await.map_err(pg_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_i128_rejects_non_numeric() {
        assert!(parse_i128("not-a-number").is_err());
        assert_eq!(parse_i128("-12345678901234567890").unwrap(), -12345678901234567890i128);
    }
}
