//! UpdateStrategy: orchestrates one run of the engine over a raw/transformed
//! sink pair (spec §4.11). Owns the `IdAllocator` and the `CrashRecoverer`,
//! and is the only place the core issues concurrent I/O (spec §5).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;

use gs_common::config::{ApplyMode, Config, Network};
use gs_common::delta::{ChangeAction, ChangeValue, DbChange, DbDelta, Tx};
use gs_common::rows::{AddressRow, BalanceRow, RelationRow};
use gs_common::{GsError, GsResult};

use crate::adapter::RawBlock;
use crate::changebuilder::{build_changes, ChangeContext};
use crate::crash::CrashRecoverer;
use crate::idalloc::IdAllocator;
use crate::sink::{RawSink, TransformedSink};
use crate::tokens::Erc20Decoder;
use crate::transformer::account::{self, AccountBatchInput};
use crate::transformer::utxo::{self, InOutput, UtxoTransaction};
use crate::workerpool::{run_bounded, WorkResult};

const ADDRESS_READ_CONCURRENCY: usize = 16;
const RAW_READ_CONCURRENCY: usize = 8;

/// Summary of one batch, surfaced in the `delta_updater_history` row and to
/// the caller for logging/metrics.
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub first_block: u64,
    pub last_block: u64,
    pub new_addresses: i64,
    pub new_clusters: i64,
    pub changes_written: usize,
}

pub struct UpdateStrategy<R: RawSink + 'static, T: TransformedSink + 'static> {
    config: Config,
    raw: Arc<R>,
    sink: Arc<T>,
    crash: CrashRecoverer,
    shutdown: Arc<AtomicBool>,
}

impl<R: RawSink + 'static, T: TransformedSink + 'static> UpdateStrategy<R, T> {
    pub fn new(config: Config, raw: Arc<R>, sink: Arc<T>) -> Self {
        let crash = CrashRecoverer::new(
            if config.apply_mode == ApplyMode::Batch { "batch" } else { "per-tx" },
            &config.raw_keyspace,
            &config.transformed_keyspace,
        );
        UpdateStrategy {
            config,
            raw,
            sink,
            crash,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for a signal handler to flip when SIGINT/SIGTERM arrives; the
    /// run loop only observes it between batches (spec §5 cancellation).
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Runs batches from the inferred start block through `end_block`,
    /// checking the shutdown flag between batches.
    pub async fn run(&self) -> GsResult<()> {
        if self.crash.is_in_recovery_mode() {
            metrics::gauge!("gs_recovery_mode").set(1.0);
            let hint = self.crash.get_recovery_hint()?;
            return Err(GsError::AssertionFailure(format!(
                "refusing to start: unresolved crash hint at {}: {hint}",
                self.crash.path().display()
            )));
        }
        metrics::gauge!("gs_recovery_mode").set(0.0);

        let mut start = self.determine_start_block().await?;
        let end = self.determine_end_block().await?;

        let mut allocator = self.seed_id_allocator().await?;

        while start <= end {
            if self.shutdown.load(Ordering::Relaxed) {
                tracing::info!(next_block = start, "shutdown requested, stopping between batches");
                break;
            }
            let batch_end = (start + self.config.batch_size - 1).min(end);
            let block_ids: Vec<u64> = (start..=batch_end).collect();

            let summary = self.run_batch(&mut allocator, &block_ids).await?;
            tracing::info!(
                first_block = summary.first_block,
                last_block = summary.last_block,
                new_addresses = summary.new_addresses,
                new_clusters = summary.new_clusters,
                changes = summary.changes_written,
                "batch applied"
            );

            start = batch_end + 1;
        }

        Ok(())
    }

    /// Start block: `last_synced_block + 1`, unless overridden by config, with
    /// the startup safety checks from spec §4.11 (skipped under
    /// `disable_safety_checks`).
    async fn determine_start_block(&self) -> GsResult<u64> {
        let last_synced = self.sink.get_last_delta_updater_state().await?;

        let mut start = match (self.config.start_block, last_synced) {
            (Some(s), _) => s,
            (None, Some(last)) => (last + 1) as u64,
            (None, None) => 0,
        };

        if self.config.disable_safety_checks {
            return Ok(start);
        }

        if let Some(last) = last_synced {
            if self.config.start_block.is_some() && start <= last as u64 {
                return Err(GsError::AssertionFailure(format!(
                    "start block {start} must not precede the last delta-updated block {last}"
                )));
            }
            if start != (last + 1) as u64 {
                return Err(GsError::AssertionFailure(format!(
                    "start block {start} must equal last_synced_block + 1 ({})",
                    last + 1
                )));
            }
        } else if self.sink.get_summary_statistics().await?.is_some() {
            // Delta-updater state absent but the transformed store already has
            // rows: seek forward up to three blocks for a populated
            // exchange_rates row (spec §4.11).
            let mut found = None;
            for candidate in start..start.saturating_add(3) {
                let rates = self.raw.get_exchange_rates_for_block_batch(&[candidate]).await?;
                if rates.first().is_some_and(|(_, r)| r.is_some()) {
                    found = Some(candidate);
                    break;
                }
            }
            if let Some(candidate) = found {
                start = candidate + 1;
            }
        }

        Ok(start)
    }

    /// End block: the configured end, capped at the highest raw block that
    /// also has an exchange rate recorded.
    async fn determine_end_block(&self) -> GsResult<u64> {
        let highest_raw = self.raw.get_highest_block().await?.unwrap_or(0);
        Ok(match self.config.end_block {
            Some(configured) => configured.min(highest_raw),
            None => highest_raw,
        })
    }

    async fn seed_id_allocator(&self) -> GsResult<IdAllocator> {
        let highest_address_id = self.sink.get_highest_address_id().await?.unwrap_or(0);
        let highest_cluster_id = self.sink.get_highest_cluster_id().await?.unwrap_or(1);
        let highest_transaction_id = self.sink.get_highest_transaction_id().await?.unwrap_or(0);
        Ok(IdAllocator::new(highest_address_id, highest_cluster_id, highest_transaction_id))
    }

    async fn run_batch(&self, allocator: &mut IdAllocator, block_ids: &[u64]) -> GsResult<BatchSummary> {
        let _span = tracing::info_span!(
            "batch",
            first_block = block_ids.first().copied().unwrap_or(0),
            last_block = block_ids.last().copied().unwrap_or(0),
        )
        .entered();
        let started = std::time::Instant::now();

        let summary = self.run_batch_inner(allocator, block_ids).await?;

        metrics::histogram!("gs_batch_duration_seconds").record(started.elapsed().as_secs_f64());
        metrics::counter!("gs_rows_written").increment(summary.changes_written as u64);
        Ok(summary)
    }

    async fn run_batch_inner(&self, allocator: &mut IdAllocator, block_ids: &[u64]) -> GsResult<BatchSummary> {
        if self.config.apply_mode == ApplyMode::PerTransaction {
            return self.run_batch_per_transaction(allocator, block_ids).await;
        }

        let rate_rows = self.raw.get_exchange_rates_for_block_batch(block_ids).await?;
        let rates: HashMap<u64, [f64; 2]> = rate_rows
            .into_iter()
            .filter_map(|(b, r)| r.map(|r| (b, r)))
            .collect();

        let (delta, txs, resolve_identifier) = if self.config.network.is_account_model() {
            self.transform_account_batch(allocator, block_ids, &rates).await?
        } else {
            self.transform_utxo_batch(allocator, block_ids, &rates).await?
        };

        let ctx_resolve = resolve_identifier;
        let resolved_ids: Vec<i64> = ctx_resolve.values().copied().collect();

        let existing_addresses = self.read_existing_addresses(&resolved_ids).await?;
        let existing_balances = self.read_existing_balances(&resolved_ids).await?;
        let (existing_incoming, existing_outgoing) =
            self.read_existing_relations(&delta, &ctx_resolve).await?;

        let existing_atx_secondary_maxima = self.sink.get_secondary_id_maxima("address_transactions").await?;
        let existing_outgoing_secondary_maxima =
            self.sink.get_secondary_id_maxima("address_outgoing_relations").await?;
        let existing_incoming_secondary_maxima =
            self.sink.get_secondary_id_maxima("address_incoming_relations").await?;

        let ctx = ChangeContext {
            resolve_identifier: &ctx_resolve,
            existing_addresses: &existing_addresses,
            existing_incoming_relations: &existing_incoming,
            existing_outgoing_relations: &existing_outgoing,
            existing_balances: &existing_balances,
            existing_atx_secondary_maxima: &existing_atx_secondary_maxima,
            existing_outgoing_secondary_maxima: &existing_outgoing_secondary_maxima,
            existing_incoming_secondary_maxima: &existing_incoming_secondary_maxima,
            id_bucket_size: self.config.id_bucket_size,
            block_bucket_size: self.config.block_bucket_size,
            address_prefix_length: 5,
        };

        let built = build_changes(&delta, &txs, 5, &ctx);
        let mut changes = built.changes;
        changes.push(
            self.summary_statistics_change(block_ids, allocator.new_addresses(), built.new_relation_edges, txs.len() as i64)
                .await?,
        );
        changes.push(self.checkpoint_status_change(block_ids, allocator));
        changes.push(self.checkpoint_history_change(block_ids));

        let atomic = self.config.apply_mode == ApplyMode::Batch;
        let hint = json!({
            "current_block_id": block_ids.last().copied(),
            "first_block_in_batch": block_ids.first().copied(),
        });
        self.apply_with_crash_hint(&changes, atomic, hint).await?;

        Ok(BatchSummary {
            first_block: *block_ids.first().unwrap_or(&0),
            last_block: *block_ids.last().unwrap_or(&0),
            new_addresses: allocator.new_addresses(),
            new_clusters: allocator.new_clusters(),
            changes_written: changes.len(),
        })
    }

    /// UTXO per-transaction apply mode (spec §4.9/§4.10): transforms and
    /// commits one blockchain transaction at a time instead of merging the
    /// whole batch's deltas first. Each transaction's changes (plus its own
    /// bookkeeping row) land in one sink-side transaction before the next
    /// transaction's existing-state reads run, so those reads always see
    /// every prior transaction's writes — the crash hint only needs to
    /// remember the last transaction that committed successfully, mirroring
    /// the Python `ApplicationStrategy.TX` loop.
    async fn run_batch_per_transaction(&self, allocator: &mut IdAllocator, block_ids: &[u64]) -> GsResult<BatchSummary> {
        let rate_rows = self.raw.get_exchange_rates_for_block_batch(block_ids).await?;
        let rates: HashMap<u64, [f64; 2]> = rate_rows
            .into_iter()
            .filter_map(|(b, r)| r.map(|r| (b, r)))
            .collect();

        let mut known_addresses: HashMap<Vec<u8>, i64> = HashMap::new();
        let mut next_tx_id: i64 = 0;
        let mut total_changes = 0usize;
        let mut last_successful_tx_id: Option<i64> = None;
        let mut last_successful_tx_block_id: Option<u64> = None;
        let mut last_block_for_stats: Option<u64> = None;

        for &block_id in block_ids {
            let raw_txs = self.raw.get_utxo_transactions_in_block(block_id).await?;
            let rate = rates.get(&block_id).copied().unwrap_or([0.0, 0.0]);

            for raw in &raw_txs {
                for (addr, _) in raw.inputs.iter().chain(&raw.outputs) {
                    if !known_addresses.contains_key(addr) {
                        let id = match self.sink.get_address_id(addr).await? {
                            Some(id) => id,
                            None => {
                                tracing::warn!(address = %hex::encode(addr), "unseen UTXO address, allocating new id");
                                allocator.consume_address_id()
                            }
                        };
                        known_addresses.insert(addr.clone(), id);
                    }
                }

                let tx = UtxoTransaction {
                    tx_id: next_tx_id,
                    tx_hash: raw.tx_hash.clone(),
                    tx_index: raw.tx_index,
                    block_id: raw.block_id,
                    failed: raw.failed,
                    inputs: raw.inputs.iter().map(|(a, v)| InOutput { address: a.clone(), value: *v }).collect(),
                    outputs: raw.outputs.iter().map(|(a, v)| InOutput { address: a.clone(), value: *v }).collect(),
                };
                next_tx_id += 1;

                let new_addresses_before = allocator.new_addresses();
                let delta = utxo::dbdelta_from_utxo_transaction(&tx, rate).compress();
                let tx_row = Tx { block_id: tx.block_id, tx_id: tx.tx_id, tx_hash: tx.tx_hash.clone(), tx_index: tx.tx_index, failed: tx.failed };
                let txs_slice = [tx_row];

                let resolve_identifier = known_addresses.clone();
                let resolved_ids: Vec<i64> = resolve_identifier.values().copied().collect();

                let existing_addresses = self.read_existing_addresses(&resolved_ids).await?;
                let existing_balances = self.read_existing_balances(&resolved_ids).await?;
                let (existing_incoming, existing_outgoing) =
                    self.read_existing_relations(&delta, &resolve_identifier).await?;
                let existing_atx_secondary_maxima = self.sink.get_secondary_id_maxima("address_transactions").await?;
                let existing_outgoing_secondary_maxima =
                    self.sink.get_secondary_id_maxima("address_outgoing_relations").await?;
                let existing_incoming_secondary_maxima =
                    self.sink.get_secondary_id_maxima("address_incoming_relations").await?;

                let ctx = ChangeContext {
                    resolve_identifier: &resolve_identifier,
                    existing_addresses: &existing_addresses,
                    existing_incoming_relations: &existing_incoming,
                    existing_outgoing_relations: &existing_outgoing,
                    existing_balances: &existing_balances,
                    existing_atx_secondary_maxima: &existing_atx_secondary_maxima,
                    existing_outgoing_secondary_maxima: &existing_outgoing_secondary_maxima,
                    existing_incoming_secondary_maxima: &existing_incoming_secondary_maxima,
                    id_bucket_size: self.config.id_bucket_size,
                    block_bucket_size: self.config.block_bucket_size,
                    address_prefix_length: 5,
                };

                let built = build_changes(&delta, &txs_slice, 5, &ctx);
                let mut changes = built.changes;

                let block_ids_for_stats: &[u64] =
                    if last_block_for_stats == Some(tx.block_id) { &[] } else { &[tx.block_id] };
                let new_addresses_this_tx = allocator.new_addresses() - new_addresses_before;
                changes.push(
                    self.summary_statistics_change(block_ids_for_stats, new_addresses_this_tx, built.new_relation_edges, 1)
                        .await?,
                );
                changes.push(self.checkpoint_status_change(&[tx.block_id], allocator));
                changes.push(self.checkpoint_history_change(&[tx.block_id]));
                last_block_for_stats = Some(tx.block_id);

                total_changes += changes.len();

                let hint = json!({
                    "current_block_id": tx.block_id,
                    "current_tx_id": tx.tx_id,
                    "last_successful_tx_id": last_successful_tx_id,
                    "last_successful_tx_block_id": last_successful_tx_block_id,
                });
                self.apply_with_crash_hint(&changes, false, hint).await?;

                last_successful_tx_id = Some(tx.tx_id);
                last_successful_tx_block_id = Some(tx.block_id);
            }
        }

        Ok(BatchSummary {
            first_block: *block_ids.first().unwrap_or(&0),
            last_block: *block_ids.last().unwrap_or(&0),
            new_addresses: allocator.new_addresses(),
            new_clusters: allocator.new_clusters(),
            changes_written: total_changes,
        })
    }

    async fn transform_account_batch(
        &self,
        allocator: &mut IdAllocator,
        block_ids: &[u64],
        rates: &HashMap<u64, [f64; 2]>,
    ) -> GsResult<(DbDelta, Vec<Tx>, HashMap<Vec<u8>, i64>)> {
        let is_tron = self.config.network == Network::Trx;
        let decoder = Erc20Decoder::new(if is_tron { "trx" } else { "eth" });

        let blocks = self.read_blocks(block_ids).await?;

        let mut known_addresses: HashMap<Vec<u8>, i64> = HashMap::new();
        let mut acc = DbDelta::new();
        let mut all_txs = Vec::new();

        for block in &blocks {
            let transactions = self.raw.get_transactions_in_block(block.block_id).await?;
            let traces = self.raw.get_traces_in_block(block.block_id).await?;
            let logs = self.raw.get_logs_in_block(block.block_id).await?;

            let token_transfers = match &decoder {
                Some(d) => logs.iter().filter_map(|l| d.log_to_transfer(l)).collect(),
                None => Vec::new(),
            };

            let rate = rates.get(&block.block_id).copied().unwrap_or_else(|| {
                tracing::warn!(block_id = block.block_id, "missing exchange rate, zero-filling");
                [0.0, 0.0]
            });

            self.prefetch_known_addresses(&mut known_addresses, &transactions, &traces, &logs).await?;

            let input = AccountBatchInput {
                block,
                transactions: &transactions,
                traces: &traces,
                logs: &logs,
                token_transfers: &token_transfers,
                rates: rate,
                is_tron,
            };
            let result = account::transform_block(&input, allocator, &mut known_addresses);
            acc = acc.concat(result.delta);
            all_txs.extend(result.txs);
        }

        Ok((acc.compress(), all_txs, known_addresses))
    }

    async fn transform_utxo_batch(
        &self,
        allocator: &mut IdAllocator,
        block_ids: &[u64],
        rates: &HashMap<u64, [f64; 2]>,
    ) -> GsResult<(DbDelta, Vec<Tx>, HashMap<Vec<u8>, i64>)> {
        let mut acc = DbDelta::new();
        let mut all_txs = Vec::new();
        let mut next_tx_id: i64 = 0;
        let mut known_addresses: HashMap<Vec<u8>, i64> = HashMap::new();

        for &block_id in block_ids {
            let raw_txs = self.raw.get_utxo_transactions_in_block(block_id).await?;
            let rate = rates.get(&block_id).copied().unwrap_or([0.0, 0.0]);

            let mut candidates: Vec<Vec<u8>> =
                raw_txs.iter().flat_map(|t| t.inputs.iter().chain(&t.outputs).map(|(a, _)| a.clone())).collect();
            candidates.retain(|a| !known_addresses.contains_key(a));
            candidates.sort();
            candidates.dedup();
            let sink = Arc::clone(&self.sink);
            let results = run_bounded(candidates.clone(), ADDRESS_READ_CONCURRENCY, move |addr: Vec<u8>| {
                let sink = Arc::clone(&sink);
                async move { sink.get_address_id(&addr).await }
            })
            .await;
            for (addr, result) in candidates.into_iter().zip(results) {
                // An input address never seen before allocates a new id with
                // a warning rather than failing — the mainline-data frequency
                // of this path is unconfirmed (spec §9 open question),
                // preserved as-is.
                match result {
                    WorkResult::Success(Some(id)) => {
                        known_addresses.insert(addr, id);
                    }
                    WorkResult::Success(None) => {
                        tracing::warn!(address = %hex::encode(&addr), "unseen UTXO address, allocating new id");
                        known_addresses.insert(addr, allocator.consume_address_id());
                    }
                    WorkResult::Error { error, .. } => {
                        return Err(GsError::AssertionFailure(error));
                    }
                }
            }

            let mut txs = Vec::with_capacity(raw_txs.len());
            for raw in &raw_txs {
                for (addr, _) in raw.inputs.iter().chain(&raw.outputs) {
                    known_addresses.entry(addr.clone()).or_insert_with(|| allocator.consume_address_id());
                }
                let tx = UtxoTransaction {
                    tx_id: next_tx_id,
                    tx_hash: raw.tx_hash.clone(),
                    tx_index: raw.tx_index,
                    block_id: raw.block_id,
                    failed: raw.failed,
                    inputs: raw.inputs.iter().map(|(a, v)| InOutput { address: a.clone(), value: *v }).collect(),
                    outputs: raw.outputs.iter().map(|(a, v)| InOutput { address: a.clone(), value: *v }).collect(),
                };
                next_tx_id += 1;
                txs.push(tx);
            }
            for tx in &txs {
                all_txs.push(Tx {
                    block_id: tx.block_id,
                    tx_id: tx.tx_id,
                    tx_hash: tx.tx_hash.clone(),
                    tx_index: tx.tx_index,
                    failed: tx.failed,
                });
            }
            acc = acc.concat(utxo::transform_block(&txs, rate));
        }

        Ok((acc.compress(), all_txs, known_addresses))
    }

    /// Fans out `get_address_id` lookups for every address touched by this
    /// block that isn't already cached, so the Transformer only allocates a
    /// new id for genuinely unseen addresses (spec §5: these reads are the
    /// one place the core issues concurrent I/O).
    async fn prefetch_known_addresses(
        &self,
        known_addresses: &mut HashMap<Vec<u8>, i64>,
        transactions: &[crate::adapter::RawTransaction],
        traces: &[crate::adapter::RawTrace],
        logs: &[crate::adapter::RawLog],
    ) -> GsResult<()> {
        let mut candidates: Vec<Vec<u8>> = Vec::new();
        for tx in transactions {
            if let Some(a) = &tx.from_address {
                candidates.push(a.clone());
            }
            if let Some(a) = &tx.to_address {
                candidates.push(a.clone());
            }
        }
        for trace in traces {
            candidates.push(trace.from_address.clone());
            candidates.push(trace.to_address.clone());
        }
        for log in logs {
            candidates.push(log.address.clone());
        }
        candidates.retain(|a| !known_addresses.contains_key(a));
        candidates.sort();
        candidates.dedup();

        let sink = Arc::clone(&self.sink);
        let results = run_bounded(candidates.clone(), ADDRESS_READ_CONCURRENCY, move |addr: Vec<u8>| {
            let sink = Arc::clone(&sink);
            async move { sink.get_address_id(&addr).await }
        })
        .await;

        for (addr, result) in candidates.into_iter().zip(results) {
            if let WorkResult::Success(Some(id)) = result {
                known_addresses.insert(addr, id);
            }
        }
        Ok(())
    }

    async fn read_blocks(&self, block_ids: &[u64]) -> GsResult<Vec<RawBlock>> {
        let raw = Arc::clone(&self.raw);
        let results = run_bounded(block_ids.to_vec(), RAW_READ_CONCURRENCY, move |id: u64| {
            let raw = Arc::clone(&raw);
            async move { raw.get_block(id).await }
        })
        .await;

        let mut blocks = Vec::with_capacity(results.len());
        for r in results {
            match r {
                WorkResult::Success(Some(b)) => blocks.push(b),
                WorkResult::Success(None) => {
                    return Err(GsError::AssertionFailure("raw sink missing a block within range".to_string()));
                }
                WorkResult::Error { error, .. } => return Err(GsError::AssertionFailure(error)),
            }
        }
        blocks.sort_by_key(|b| b.block_id);
        Ok(blocks)
    }

    async fn read_existing_addresses(&self, ids: &[i64]) -> GsResult<HashMap<i64, AddressRow>> {
        let sink = Arc::clone(&self.sink);
        let results = run_bounded(ids.to_vec(), ADDRESS_READ_CONCURRENCY, move |id: i64| {
            let sink = Arc::clone(&sink);
            async move { sink.get_address(id).await }
        })
        .await;
        let mut out = HashMap::new();
        for (id, r) in ids.iter().zip(results) {
            if let WorkResult::Success(Some(row)) = r {
                out.insert(*id, row);
            }
        }
        Ok(out)
    }

    async fn read_existing_balances(&self, ids: &[i64]) -> GsResult<HashMap<(i64, String), BalanceRow>> {
        let batches = self.sink.get_balances_batch(ids).await?;
        let mut out = HashMap::new();
        for rows in batches {
            for row in rows {
                out.insert((row.address_id, row.currency.clone()), row);
            }
        }
        Ok(out)
    }

    async fn read_existing_relations(
        &self,
        delta: &DbDelta,
        resolve_identifier: &HashMap<Vec<u8>, i64>,
    ) -> GsResult<(HashMap<(i64, i64), RelationRow>, HashMap<(i64, i64), RelationRow>)> {
        let mut incoming = HashMap::new();
        let mut outgoing = HashMap::new();
        for rel in &delta.relation_updates {
            let src = match resolve_identifier.get(&rel.src_identifier) {
                Some(id) => *id,
                None => continue,
            };
            let dst = match resolve_identifier.get(&rel.dst_identifier) {
                Some(id) => *id,
                None => continue,
            };
            if let Some(row) = self.sink.get_outgoing_relation(src, dst).await? {
                outgoing.insert((src, dst), row);
            }
            if let Some(row) = self.sink.get_incoming_relation(src, dst).await? {
                incoming.insert((src, dst), row);
            }
        }
        Ok((incoming, outgoing))
    }

    /// Async equivalent of [`CrashRecoverer::run_critical_section`]: applies
    /// the batch, and on failure records `extra_hint` plus the error before
    /// re-raising, instead of calling the synchronous helper (which would
    /// need to block on this future from inside the async runtime).
    async fn apply_with_crash_hint(
        &self,
        changes: &[DbChange],
        atomic: bool,
        mut extra_hint: serde_json::Value,
    ) -> GsResult<()> {
        if self.crash.is_in_recovery_mode() {
            return Err(GsError::AlreadyInRecoveryMode(self.crash.path().display().to_string()));
        }
        match self.sink.apply_changes(changes, atomic).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let serde_json::Value::Object(ref mut map) = extra_hint {
                    map.insert("exception".to_string(), serde_json::Value::String(e.to_string()));
                }
                self.crash.enter_recovery_mode(&extra_hint)?;
                Err(e)
            }
        }
    }

    /// Bookkeeping row for `summary_statistics` (spec §4.11 step 12):
    /// cumulative counts folded onto whatever is already stored, with
    /// `no_blocks` suppressed under patch mode when this batch's blocks
    /// were already accounted for (spec §4.11 patch-mode note).
    async fn summary_statistics_change(
        &self,
        block_ids: &[u64],
        new_addresses: i64,
        new_relations: i64,
        new_transactions: i64,
    ) -> GsResult<DbChange> {
        let existing = self.sink.get_summary_statistics().await?;
        let last_synced = self.sink.get_last_delta_updater_state().await?;

        let already_accounted = self.config.patch_mode
            && last_synced.is_some_and(|last| (*block_ids.last().unwrap_or(&0) as i64) <= last);
        let no_blocks_increment = if already_accounted { 0 } else { block_ids.len() as i64 };

        let (no_blocks, no_address_relations, no_addresses, no_transactions) = match &existing {
            Some(s) => (
                s.no_blocks + no_blocks_increment,
                s.no_address_relations + new_relations,
                s.no_addresses + new_addresses,
                s.no_transactions + new_transactions,
            ),
            None => (no_blocks_increment, new_relations, new_addresses, new_transactions),
        };

        let mut data = BTreeMap::new();
        data.insert("id".to_string(), ChangeValue::I64(1));
        data.insert("no_blocks".to_string(), ChangeValue::I64(no_blocks));
        data.insert("no_address_relations".to_string(), ChangeValue::I64(no_address_relations));
        data.insert("no_addresses".to_string(), ChangeValue::I64(no_addresses));
        data.insert("no_transactions".to_string(), ChangeValue::I64(no_transactions));
        Ok(DbChange { action: ChangeAction::Update, table: "summary_statistics", data })
    }

    fn checkpoint_status_change(&self, block_ids: &[u64], allocator: &IdAllocator) -> DbChange {
        let mut data = BTreeMap::new();
        data.insert("id".to_string(), ChangeValue::I64(1));
        data.insert(
            "last_synced_block".to_string(),
            ChangeValue::I64(*block_ids.last().unwrap_or(&0) as i64),
        );
        data.insert("highest_address_id".to_string(), ChangeValue::I64(allocator.highest_address_id()));
        DbChange { action: ChangeAction::Update, table: "delta_updater_status", data }
    }

    fn checkpoint_history_change(&self, block_ids: &[u64]) -> DbChange {
        let mut data = BTreeMap::new();
        data.insert(
            "last_synced_block".to_string(),
            ChangeValue::I64(*block_ids.last().unwrap_or(&0) as i64),
        );
        DbChange { action: ChangeAction::New, table: "delta_updater_history", data }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use gs_common::rows::{DeltaUpdaterHistoryRow, SecondaryIdMaxima, SummaryStatisticsRow};

    use crate::adapter::{RawLog, RawTrace, RawTransaction, RawUtxoTx};
    use crate::sink::ExchangeRates;

    use super::*;

    /// Each test gets its own keyspace pair so the `CrashRecoverer` hint file
    /// (named from `raw_keyspace`/`transformed_keyspace`) doesn't collide
    /// with another test running concurrently.
    fn test_config(unique: &str) -> Config {
        Config {
            network: Network::Eth,
            raw_keyspace: format!("raw_eth_{unique}"),
            transformed_keyspace: format!("trf_eth_{unique}"),
            database_url: String::new(),
            db_max_connections: 1,
            raw_source_url: String::new(),
            start_block: None,
            end_block: None,
            batch_size: 10,
            id_bucket_size: 1_000,
            block_bucket_size: 1_000,
            partition_size: 100_000,
            disable_safety_checks: false,
            forward_fill_rates: false,
            patch_mode: false,
            validate_mode: false,
            apply_mode: ApplyMode::Batch,
            metrics_addr: "0.0.0.0:9100".to_string(),
        }
    }

    /// Minimal `RawSink` double: only `get_highest_block` and
    /// `get_exchange_rates_for_block_batch` carry test-controlled state, the
    /// rest panic since `determine_start_block`/`apply_with_crash_hint` never
    /// reach them.
    #[derive(Default)]
    struct FakeRaw {
        highest_block: Option<u64>,
        rated_blocks: Vec<u64>,
    }

    #[async_trait]
    impl RawSink for FakeRaw {
        async fn get_highest_block(&self) -> GsResult<Option<u64>> {
            Ok(self.highest_block)
        }
        async fn get_block(&self, _block_id: u64) -> GsResult<Option<RawBlock>> {
            unimplemented!("not exercised by these tests")
        }
        async fn get_transactions_in_block(&self, _block_id: u64) -> GsResult<Vec<RawTransaction>> {
            unimplemented!("not exercised by these tests")
        }
        async fn get_traces_in_block(&self, _block_id: u64) -> GsResult<Vec<RawTrace>> {
            unimplemented!("not exercised by these tests")
        }
        async fn get_logs_in_block(&self, _block_id: u64) -> GsResult<Vec<RawLog>> {
            unimplemented!("not exercised by these tests")
        }
        async fn get_exchange_rates_for_block_batch(
            &self,
            block_ids: &[u64],
        ) -> GsResult<Vec<(u64, Option<ExchangeRates>)>> {
            Ok(block_ids
                .iter()
                .map(|&b| (b, if self.rated_blocks.contains(&b) { Some([1.0, 1.0]) } else { None }))
                .collect())
        }
        async fn get_utxo_transactions_in_block(&self, _block_id: u64) -> GsResult<Vec<RawUtxoTx>> {
            Ok(Vec::new())
        }
    }

    /// Minimal `TransformedSink` double: `last_synced`/`summary_present` drive
    /// `determine_start_block`; `apply_changes` fails when `fail_apply` is set,
    /// to exercise the crash-hint path.
    #[derive(Default)]
    struct FakeSink {
        last_synced: Option<i64>,
        summary_present: bool,
        fail_apply: bool,
        applied: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl TransformedSink for FakeSink {
        async fn get_highest_address_id(&self) -> GsResult<Option<i64>> {
            Ok(None)
        }
        async fn get_highest_cluster_id(&self) -> GsResult<Option<i64>> {
            Ok(None)
        }
        async fn get_highest_transaction_id(&self) -> GsResult<Option<i64>> {
            Ok(None)
        }
        async fn get_address_id(&self, _address: &[u8]) -> GsResult<Option<i64>> {
            unimplemented!("not exercised by these tests")
        }
        async fn get_address(&self, _address_id: i64) -> GsResult<Option<AddressRow>> {
            unimplemented!("not exercised by these tests")
        }
        async fn known_addresses_batch(&self, _addresses: &[Vec<u8>]) -> GsResult<Vec<bool>> {
            unimplemented!("not exercised by these tests")
        }
        async fn get_incoming_relation(&self, _src: i64, _dst: i64) -> GsResult<Option<RelationRow>> {
            unimplemented!("not exercised by these tests")
        }
        async fn get_outgoing_relation(&self, _src: i64, _dst: i64) -> GsResult<Option<RelationRow>> {
            unimplemented!("not exercised by these tests")
        }
        async fn get_balance(&self, _address_id: i64, _currency: &str) -> GsResult<Option<BalanceRow>> {
            unimplemented!("not exercised by these tests")
        }
        async fn get_balances_batch(&self, _address_ids: &[i64]) -> GsResult<Vec<Vec<BalanceRow>>> {
            unimplemented!("not exercised by these tests")
        }
        async fn get_max_secondary_id(&self, _table: &str, _primary_group: i64) -> GsResult<Option<i64>> {
            unimplemented!("not exercised by these tests")
        }
        async fn get_secondary_id_maxima(&self, _table: &str) -> GsResult<SecondaryIdMaxima> {
            unimplemented!("not exercised by these tests")
        }
        async fn get_summary_statistics(&self) -> GsResult<Option<SummaryStatisticsRow>> {
            Ok(self.summary_present.then(|| SummaryStatisticsRow {
                id: 1,
                no_blocks: 1,
                no_address_relations: 0,
                no_addresses: 1,
                no_transactions: 1,
                timestamp: chrono::Utc::now(),
            }))
        }
        async fn get_last_delta_updater_state(&self) -> GsResult<Option<i64>> {
            Ok(self.last_synced)
        }
        async fn get_delta_updater_history(&self) -> GsResult<Vec<DeltaUpdaterHistoryRow>> {
            Ok(Vec::new())
        }
        async fn apply_changes(&self, changes: &[DbChange], _atomic: bool) -> GsResult<()> {
            if self.fail_apply {
                return Err(GsError::AssertionFailure("sink write failed".to_string()));
            }
            self.applied.lock().unwrap().push(changes.len());
            Ok(())
        }
        async fn ensure_table_exists(&self, _table: &str, _columns: &[(&str, &str)]) -> GsResult<()> {
            Ok(())
        }
    }

    fn strategy(unique: &str, raw: FakeRaw, sink: FakeSink) -> UpdateStrategy<FakeRaw, FakeSink> {
        UpdateStrategy::new(test_config(unique), Arc::new(raw), Arc::new(sink))
    }

    #[tokio::test]
    async fn start_block_defaults_to_zero_with_no_prior_state() {
        let s = strategy("defaults_zero", FakeRaw::default(), FakeSink::default());
        assert_eq!(s.determine_start_block().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn start_block_follows_last_synced_plus_one() {
        let s = strategy("follows_last", FakeRaw::default(), FakeSink { last_synced: Some(99), ..Default::default() });
        assert_eq!(s.determine_start_block().await.unwrap(), 100);
    }

    #[tokio::test]
    async fn explicit_start_preceding_last_synced_is_rejected() {
        let mut config = test_config("preceding");
        config.start_block = Some(50);
        let s = UpdateStrategy::new(
            config,
            Arc::new(FakeRaw::default()),
            Arc::new(FakeSink { last_synced: Some(99), ..Default::default() }),
        );
        assert!(matches!(s.determine_start_block().await, Err(GsError::AssertionFailure(_))));
    }

    #[tokio::test]
    async fn explicit_start_skipping_ahead_of_last_synced_is_rejected() {
        let mut config = test_config("skipping_ahead");
        config.start_block = Some(150);
        let s = UpdateStrategy::new(
            config,
            Arc::new(FakeRaw::default()),
            Arc::new(FakeSink { last_synced: Some(99), ..Default::default() }),
        );
        assert!(matches!(s.determine_start_block().await, Err(GsError::AssertionFailure(_))));
    }

    #[tokio::test]
    async fn disabled_safety_checks_accept_any_explicit_start() {
        let mut config = test_config("disabled_checks");
        config.start_block = Some(150);
        config.disable_safety_checks = true;
        let s = UpdateStrategy::new(
            config,
            Arc::new(FakeRaw::default()),
            Arc::new(FakeSink { last_synced: Some(99), ..Default::default() }),
        );
        assert_eq!(s.determine_start_block().await.unwrap(), 150);
    }

    #[tokio::test]
    async fn seeks_forward_for_a_populated_rate_when_state_is_absent_but_summary_exists() {
        let raw = FakeRaw { highest_block: Some(10), rated_blocks: vec![1] };
        let sink = FakeSink { last_synced: None, summary_present: true, ..Default::default() };
        let s = strategy("seeks_forward", raw, sink);
        assert_eq!(s.determine_start_block().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn end_block_is_capped_at_highest_raw_block() {
        let s = strategy("end_block_uncapped", FakeRaw { highest_block: Some(42), ..Default::default() }, FakeSink::default());
        assert_eq!(s.determine_end_block().await.unwrap(), 42);

        let mut config = test_config("end_block_capped");
        config.end_block = Some(10);
        let s = UpdateStrategy::new(config, Arc::new(FakeRaw { highest_block: Some(42), ..Default::default() }), Arc::new(FakeSink::default()));
        assert_eq!(s.determine_end_block().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn failed_apply_leaves_a_crash_hint_and_reraises() {
        let s = strategy("failed_apply", FakeRaw::default(), FakeSink { fail_apply: true, ..Default::default() });
        let _ = s.crash.leave_recovery_mode();

        let result = s.apply_with_crash_hint(&[], true, json!({"first_block_in_batch": 1})).await;
        assert!(result.is_err());
        assert!(s.crash.is_in_recovery_mode());
        let hint = s.crash.get_recovery_hint().unwrap();
        assert_eq!(hint["exception"], "assertion failure: sink write failed");

        s.crash.leave_recovery_mode().unwrap();
    }

    #[tokio::test]
    async fn successful_apply_records_no_hint() {
        let s = strategy("successful_apply", FakeRaw::default(), FakeSink::default());
        let _ = s.crash.leave_recovery_mode();

        s.apply_with_crash_hint(&[], true, json!({})).await.unwrap();
        assert!(!s.crash.is_in_recovery_mode());
    }

    #[tokio::test]
    async fn per_transaction_apply_mode_dispatches_to_the_per_tx_path() {
        let mut config = test_config("per_tx_dispatch");
        config.network = Network::Btc;
        config.apply_mode = ApplyMode::PerTransaction;
        let s = UpdateStrategy::new(config, Arc::new(FakeRaw::default()), Arc::new(FakeSink::default()));
        let mut allocator = IdAllocator::new(0, 1, 0);

        let summary = s.run_batch_inner(&mut allocator, &[]).await.unwrap();
        assert_eq!(summary.changes_written, 0);
        assert_eq!(summary.first_block, 0);
        assert_eq!(summary.last_block, 0);
    }
}
