//! DeFiExtractor: recognizes DEX pair creations and reconstructs logical
//! swaps from a transaction's decoded logs and traces (spec §4.5).
//!
//! Swap reconstruction builds a directed multigraph of asset flows (token
//! transfers, native-coin-moving traces, WETH deposit/withdrawal) and walks
//! an Eulerian path through it, pruning dangling edges on two retries before
//! giving up (mirrors the un-dropped control flow of the source analyzer).

use std::collections::{BTreeMap, HashSet};

use crate::{GsError, GsResult};

/// Placeholder asset id for the network's native coin within asset-flow
/// tuples (ETH has no token contract address).
pub const NATIVE_COIN_SENTINEL: &str = "0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee";

#[derive(Debug, Clone, PartialEq)]
pub struct DexPair {
    pub t0: String,
    pub t1: Option<String>,
    pub version: String,
    pub pool_address: String,
    pub pair_id: Option<String>,
    pub issuer: String,
    pub creation_log: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExternalSwap {
    pub swapper: String,
    pub from_amount: String,
    pub to_amount: String,
    pub from_token: String,
    pub to_token: Option<String>,
    pub version: String,
    pub swap_log: String,
}

/// A decoded event log: the event name, emitting contract, indexed
/// parameters, and the tag set its ABI registry entry carries (used to
/// pick a reconstruction strategy without re-decoding).
#[derive(Debug, Clone)]
pub struct DecodedLog {
    pub name: String,
    pub address: String,
    pub tx_hash: Vec<u8>,
    pub log_index: i32,
    pub parameters: BTreeMap<String, String>,
    pub tags: Vec<String>,
}

impl DecodedLog {
    fn param(&self, key: &str) -> GsResult<&str> {
        self.parameters
            .get(key)
            .map(|s| s.as_str())
            .ok_or_else(|| GsError::DecodeError(format!("missing log parameter {key:?}")))
    }

    fn tx_hash_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.tx_hash))
    }
}

#[derive(Debug, Clone)]
pub struct DecodedTrace {
    pub call_type: String,
    pub value: i128,
    pub from_address: Vec<u8>,
    pub to_address: Vec<u8>,
    /// `true` for the transaction's root (external) trace.
    pub is_root: bool,
}

pub fn get_pair_from_decoded_log(log: &DecodedLog) -> GsResult<DexPair> {
    let issuer = log.address.clone();
    let creation_log = format!("{}_L{}", log.tx_hash_hex(), log.log_index);

    let (t0, t1, version, pool_address, pair_id) = match log.name.as_str() {
        "PairCreated" => (
            log.param("token0")?.to_string(),
            Some(log.param("token1")?.to_string()),
            "uni2".to_string(),
            log.param("pair")?.to_string(),
            None,
        ),
        "PoolCreated" => (
            log.param("token0")?.to_string(),
            Some(log.param("token1")?.to_string()),
            "uni3".to_string(),
            log.param("pool")?.to_string(),
            None,
        ),
        "Initialize" => (
            log.param("currency0")?.to_string(),
            Some(log.param("currency1")?.to_string()),
            "uni4".to_string(),
            "0x000000000004444c5dc75cB358380D2e3dE08A90".to_string(),
            Some(log.param("id")?.to_string()),
        ),
        "NewExchange" => (
            log.param("token")?.to_string(),
            None,
            "uni1".to_string(),
            log.param("exchange")?.to_string(),
            None,
        ),
        other => {
            tracing::debug!(log_name = other, "trading pair type not supported");
            return Err(GsError::DecodeError(format!("unsupported trading pair log {other:?}")));
        }
    };

    Ok(DexPair {
        t0,
        t1,
        version,
        pool_address,
        pair_id,
        issuer,
        creation_log,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    OrderRecord,
    Ignore,
    Swap,
}

fn get_strategy_from_decoded_logs(logs: &[DecodedLog]) -> Option<Strategy> {
    if logs.is_empty() {
        return None;
    }
    let last = logs.last().unwrap();
    if last.name == "OrderRecord" {
        return Some(Strategy::OrderRecord);
    }

    let final_tags = &last.tags;
    let has_cow_settlement =
        final_tags.iter().any(|t| t == "settlement") && final_tags.iter().any(|t| t == "cow-protocol");
    let has_cross_chain = logs.iter().any(|l| l.tags.iter().any(|t| t == "cross-chain"));
    if has_cow_settlement || has_cross_chain {
        return Some(Strategy::Ignore);
    }

    if logs.iter().any(|l| l.tags.iter().any(|t| t == "swap")) {
        return Some(Strategy::Swap);
    }

    None
}

type Flow = (String, String, String, String);

fn get_asset_flows_of_address(address: &str, flows: &[Flow]) -> (Vec<(String, String)>, Vec<(String, String)>) {
    let addr = address.to_ascii_lowercase();
    let outgoing = flows
        .iter()
        .filter(|f| f.0.to_ascii_lowercase() == addr)
        .map(|f| (f.2.clone(), f.3.clone()))
        .collect();
    let incoming = flows
        .iter()
        .filter(|f| f.1.to_ascii_lowercase() == addr)
        .map(|f| (f.2.clone(), f.3.clone()))
        .collect();
    (outgoing, incoming)
}

struct FlowGraph {
    edges: Vec<(String, String)>,
}

impl FlowGraph {
    fn from_flows(flows: &[Flow]) -> Self {
        FlowGraph {
            edges: flows
                .iter()
                .map(|f| (f.0.to_ascii_lowercase(), f.1.to_ascii_lowercase()))
                .collect(),
        }
    }

    fn nodes(&self) -> HashSet<String> {
        let mut set = HashSet::new();
        for (a, b) in &self.edges {
            set.insert(a.clone());
            set.insert(b.clone());
        }
        set
    }

    fn in_degree(&self, node: &str) -> usize {
        self.edges.iter().filter(|(_, b)| b == node).count()
    }

    fn out_degree(&self, node: &str) -> usize {
        self.edges.iter().filter(|(a, _)| a == node).count()
    }

    fn degree_balanced(&self) -> bool {
        self.nodes().iter().all(|n| self.in_degree(n) == self.out_degree(n))
    }

    fn is_weakly_connected(&self) -> bool {
        let nodes = self.nodes();
        if nodes.len() <= 1 {
            return true;
        }
        let mut parent: BTreeMap<String, String> = nodes.iter().map(|n| (n.clone(), n.clone())).collect();

        fn find(parent: &mut BTreeMap<String, String>, x: &str) -> String {
            let p = parent.get(x).cloned().unwrap_or_else(|| x.to_string());
            if p == x {
                x.to_string()
            } else {
                let root = find(parent, &p);
                parent.insert(x.to_string(), root.clone());
                root
            }
        }

        for (a, b) in &self.edges {
            let ra = find(&mut parent, a);
            let rb = find(&mut parent, b);
            if ra != rb {
                parent.insert(ra, rb);
            }
        }
        let roots: HashSet<String> = nodes.iter().map(|n| find(&mut parent, n)).collect();
        roots.len() == 1
    }

    fn is_strongly_connected(&self) -> bool {
        let nodes = self.nodes();
        if nodes.len() <= 1 {
            return true;
        }
        let start = nodes.iter().next().unwrap();
        self.reachable_from(start, false).len() == nodes.len()
            && self.reachable_from(start, true).len() == nodes.len()
    }

    fn reachable_from(&self, start: &str, reversed: bool) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack = vec![start.to_string()];
        seen.insert(start.to_string());
        while let Some(n) = stack.pop() {
            for (a, b) in &self.edges {
                let (from, to) = if reversed { (b, a) } else { (a, b) };
                if from == &n && seen.insert(to.clone()) {
                    stack.push(to.clone());
                }
            }
        }
        seen
    }

    /// Simplification of `networkx.is_eulerian` for directed graphs: every
    /// node's in-degree equals its out-degree, and the graph is strongly
    /// connected.
    fn is_eulerian(&self) -> bool {
        self.degree_balanced() && self.is_strongly_connected()
    }

    fn filter_out(&self, excluded: &HashSet<String>) -> Vec<Flow> {
        self.edges
            .iter()
            .filter(|(a, b)| !excluded.contains(a) && !excluded.contains(b))
            .map(|(a, b)| (a.clone(), b.clone(), String::new(), String::new()))
            .collect()
    }
}

/// `flows` is the (possibly pruned) asset-flow set the Eulerian check ran
/// against; `transfer_flows` is always the unfiltered ERC20/native-transfer
/// flows, used only as the sender fallback when the tx root address itself
/// has no flows (e.g. a router or aggregator contract).
fn get_swap_from_eulerian_path(
    flows: &[Flow],
    transfer_flows: &[Flow],
    traces: &[DecodedTrace],
    version: String,
    swap_log: String,
) -> GsResult<ExternalSwap> {
    let root = traces.iter().find(|t| t.is_root).ok_or_else(|| GsError::DecodeError("no root trace in swap".to_string()))?;
    let root_from = format!("0x{}", hex::encode(&root.from_address));

    let mut sender = root_from.clone();
    let mut version = version;
    let (mut outgoing, mut incoming) = get_asset_flows_of_address(&sender, flows);

    if outgoing.is_empty() && incoming.is_empty() {
        sender = transfer_flows
            .first()
            .map(|f| f.0.clone())
            .ok_or_else(|| GsError::DecodeError("no asset flows in swap".to_string()))?;
        let (o, i) = get_asset_flows_of_address(&sender, flows);
        outgoing = o;
        incoming = i;
        version = format!("{version}sender-not-swapper");
    }

    if outgoing.len() != 1 {
        tracing::debug!(count = outgoing.len(), "expected exactly one outgoing amount");
        return Err(GsError::DecodeError(format!("expected one outgoing amount, got {}", outgoing.len())));
    }
    if incoming.len() != 1 {
        tracing::debug!(count = incoming.len(), "expected exactly one incoming amount");
        return Err(GsError::DecodeError(format!("expected one incoming amount, got {}", incoming.len())));
    }

    Ok(ExternalSwap {
        swapper: sender,
        from_amount: outgoing[0].1.clone(),
        to_amount: incoming[0].1.clone(),
        from_token: outgoing[0].0.clone(),
        to_token: Some(incoming[0].0.clone()),
        version,
        swap_log,
    })
}

pub fn get_swap_from_decoded_logs(logs: &[DecodedLog], traces: &[DecodedTrace]) -> GsResult<Option<ExternalSwap>> {
    if logs.is_empty() {
        return Ok(None);
    }
    let mut sorted: Vec<&DecodedLog> = logs.iter().collect();
    sorted.sort_by_key(|l| l.log_index);

    match get_strategy_from_decoded_logs(logs) {
        Some(Strategy::Ignore) | None => Ok(None),
        Some(Strategy::OrderRecord) => {
            let order_logs: Vec<&&DecodedLog> = sorted.iter().filter(|l| l.name == "OrderRecord").collect();
            if order_logs.len() != 1 {
                return Err(GsError::AssertionFailure("expected exactly one OrderRecord log".to_string()));
            }
            let log = order_logs[0];
            let swap_log = format!("{}_S{}", log.tx_hash_hex(), log.log_index);
            Ok(Some(ExternalSwap {
                swapper: log.param("sender")?.to_string(),
                from_amount: log.param("fromAmount")?.to_string(),
                to_amount: log.param("toAmount")?.to_string(),
                from_token: log.param("fromToken")?.to_string(),
                to_token: Some(log.param("toToken")?.to_string()),
                version: "okx-router".to_string(),
                swap_log,
            }))
        }
        Some(Strategy::Swap) => {
            let transfers: Vec<&&DecodedLog> = sorted.iter().filter(|l| l.name == "Transfer").collect();
            if transfers.len() < 2 {
                tracing::debug!("not enough transfers to detect a general swap");
                return Err(GsError::DecodeError("not enough transfers to detect a general swap".to_string()));
            }

            let transfer_flows: Vec<Flow> = transfers
                .iter()
                .map(|l| {
                    (
                        l.param("from").unwrap_or_default().to_string(),
                        l.param("to").unwrap_or_default().to_string(),
                        l.address.to_ascii_lowercase(),
                        l.param("value").unwrap_or_default().to_string(),
                    )
                })
                .collect();

            let trace_flows: Vec<Flow> = traces
                .iter()
                .filter(|t| t.call_type == "call" && t.value != 0)
                .map(|t| {
                    (
                        format!("0x{}", hex::encode(&t.from_address)),
                        format!("0x{}", hex::encode(&t.to_address)),
                        NATIVE_COIN_SENTINEL.to_string(),
                        t.value.to_string(),
                    )
                })
                .collect();

            let withdrawal_flows: Vec<Flow> = sorted
                .iter()
                .filter(|l| l.name == "Withdrawal")
                .map(|l| {
                    (
                        l.param("src").unwrap_or_default().to_string(),
                        l.address.to_ascii_lowercase(),
                        l.address.to_ascii_lowercase(),
                        l.param("value").unwrap_or_default().to_string(),
                    )
                })
                .collect();

            let deposit_flows: Vec<Flow> = sorted
                .iter()
                .filter(|l| l.name == "Deposit")
                .map(|l| {
                    (
                        l.address.to_ascii_lowercase(),
                        l.param("dst").unwrap_or_default().to_string(),
                        l.address.to_ascii_lowercase(),
                        l.param("wad").unwrap_or_default().to_string(),
                    )
                })
                .collect();

            let mut all_flows = transfer_flows.clone();
            all_flows.extend(trace_flows);
            all_flows.extend(withdrawal_flows);
            all_flows.extend(deposit_flows);

            let graph = FlowGraph::from_flows(&all_flows);
            if !graph.is_weakly_connected() {
                tracing::debug!("asset flow graph is not weakly connected");
                return Err(GsError::AssertionFailure("asset flow graph is not weakly connected".to_string()));
            }

            let swap_log = format!("{}_S{}", sorted[0].tx_hash_hex(), sorted[0].log_index);

            if graph.is_eulerian() {
                return Ok(Some(get_swap_from_eulerian_path(
                    &all_flows,
                    &transfer_flows,
                    traces,
                    "swap".to_string(),
                    swap_log,
                )?));
            }

            let nodes = graph.nodes();
            let missing_outgoing: HashSet<String> = nodes
                .iter()
                .filter(|n| graph.in_degree(n) == 1 && graph.out_degree(n) == 0)
                .cloned()
                .collect();
            let filtered = graph.filter_out(&missing_outgoing);
            let flows_pruned_out: Vec<Flow> = all_flows
                .iter()
                .filter(|f| !missing_outgoing.contains(&f.0.to_ascii_lowercase()) && !missing_outgoing.contains(&f.1.to_ascii_lowercase()))
                .cloned()
                .collect();
            let graph_filtered = FlowGraph { edges: filtered.iter().map(|f| (f.0.clone(), f.1.clone())).collect() };
            if graph_filtered.is_eulerian() {
                return Ok(Some(get_swap_from_eulerian_path(
                    &flows_pruned_out,
                    &transfer_flows,
                    traces,
                    "swap-prune-dangling-out".to_string(),
                    swap_log,
                )?));
            }

            let missing_incoming: HashSet<String> = nodes
                .iter()
                .filter(|n| graph.out_degree(n) == 1 && graph.in_degree(n) == 0)
                .cloned()
                .collect();
            let flows_pruned_in: Vec<Flow> = all_flows
                .iter()
                .filter(|f| !missing_incoming.contains(&f.0.to_ascii_lowercase()) && !missing_incoming.contains(&f.1.to_ascii_lowercase()))
                .cloned()
                .collect();
            let graph_filtered_in = FlowGraph { edges: flows_pruned_in.iter().map(|f| (f.0.clone(), f.1.clone())).collect() };
            if graph_filtered_in.is_eulerian() {
                tracing::warn!("asset flow graph had dangling incoming edges, likely a MEV bot interaction");
                return Err(GsError::AssertionFailure("asset flow graph had dangling incoming edges after pruning".to_string()));
            }

            Ok(Some(get_swap_from_eulerian_path(
                &all_flows,
                &transfer_flows,
                traces,
                "swap-non-eulerian".to_string(),
                swap_log,
            )?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(name: &str, address: &str, params: &[(&str, &str)], tags: &[&str]) -> DecodedLog {
        DecodedLog {
            name: name.to_string(),
            address: address.to_string(),
            tx_hash: vec![0xAB; 32],
            log_index: 0,
            parameters: params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            tags: tags.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn pair_created_is_uni2() {
        let l = log(
            "PairCreated",
            "0xfactory",
            &[("token0", "0xaaa"), ("token1", "0xbbb"), ("pair", "0xpool")],
            &[],
        );
        let pair = get_pair_from_decoded_log(&l).unwrap();
        assert_eq!(pair.version, "uni2");
        assert_eq!(pair.pool_address, "0xpool");
        assert_eq!(pair.t1.as_deref(), Some("0xbbb"));
    }

    #[test]
    fn initialize_is_uni4_with_fixed_pool() {
        let l = log(
            "Initialize",
            "0xpm",
            &[("currency0", "0xaaa"), ("currency1", "0xbbb"), ("id", "1")],
            &[],
        );
        let pair = get_pair_from_decoded_log(&l).unwrap();
        assert_eq!(pair.version, "uni4");
        assert_eq!(pair.pool_address, "0x000000000004444c5dc75cB358380D2e3dE08A90");
    }

    #[test]
    fn unsupported_pair_type_errors() {
        let l = log("Mint", "0xpool", &[], &[]);
        assert!(get_pair_from_decoded_log(&l).is_err());
    }

    #[test]
    fn strategy_prefers_order_record_when_last() {
        let logs = vec![log("Transfer", "0xtoken", &[], &["swap"]), log("OrderRecord", "0xrouter", &[], &[])];
        assert_eq!(get_strategy_from_decoded_logs(&logs), Some(Strategy::OrderRecord));
    }

    #[test]
    fn strategy_ignores_cross_chain() {
        let logs = vec![log("Settle", "0xbridge", &[], &["cross-chain"])];
        assert_eq!(get_strategy_from_decoded_logs(&logs), Some(Strategy::Ignore));
    }

    #[test]
    fn strategy_detects_swap_tag() {
        let logs = vec![log("Swap", "0xpool", &[], &["swap"])];
        assert_eq!(get_strategy_from_decoded_logs(&logs), Some(Strategy::Swap));
    }

    #[test]
    fn eulerian_two_hop_swap_resolves() {
        // sender -> pool -> sender, a balanced 2-cycle.
        let mut t1 = log(
            "Transfer",
            "0xtokenA",
            &[("from", "0xsender"), ("to", "0xpool"), ("value", "100")],
            &["swap"],
        );
        t1.log_index = 0;
        let mut t2 = log(
            "Transfer",
            "0xtokenB",
            &[("from", "0xpool"), ("to", "0xsender"), ("value", "200")],
            &["swap"],
        );
        t2.log_index = 1;
        let logs = vec![t1, t2];
        let traces = vec![DecodedTrace {
            call_type: "call".to_string(),
            value: 0,
            from_address: vec![0x11; 20],
            to_address: vec![0x22; 20],
            is_root: true,
        }];

        let swap = get_swap_from_decoded_logs(&logs, &traces).unwrap().unwrap();
        assert_eq!(swap.swapper, "0xsender");
        assert_eq!(swap.from_amount, "100");
        assert_eq!(swap.to_amount, "200");
        assert_eq!(swap.version, "swap");
    }
}
