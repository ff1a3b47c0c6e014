use std::env;
use std::str::FromStr;

use crate::error::{GsError, GsResult};

/// Which transformer dialect to run. Account covers EVM-style chains (ETH)
/// and Tron; Utxo covers Bitcoin-family chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Eth,
    Trx,
    Btc,
    Ltc,
    Bch,
    Zec,
}

impl Network {
    pub fn is_account_model(self) -> bool {
        matches!(self, Network::Eth | Network::Trx)
    }

    pub fn native_decimals(self) -> u32 {
        match self {
            Network::Eth => 18,
            Network::Trx => 6,
            Network::Btc | Network::Ltc | Network::Bch | Network::Zec => 8,
        }
    }
}

impl FromStr for Network {
    type Err = GsError;

    fn from_str(s: &str) -> GsResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "eth" => Ok(Network::Eth),
            "trx" => Ok(Network::Trx),
            "btc" => Ok(Network::Btc),
            "ltc" => Ok(Network::Ltc),
            "bch" => Ok(Network::Bch),
            "zec" => Ok(Network::Zec),
            other => Err(GsError::Config(format!("unknown network {other:?}"))),
        }
    }
}

/// How the Applier commits a batch to the transformed sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// One atomic `apply_changes` per block batch.
    Batch,
    /// Apply after each transaction (UTXO legacy path only).
    PerTransaction,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub network: Network,
    pub raw_keyspace: String,
    pub transformed_keyspace: String,
    pub database_url: String,
    pub db_max_connections: u32,
    pub raw_source_url: String,

    pub start_block: Option<u64>,
    pub end_block: Option<u64>,
    pub batch_size: u64,

    pub id_bucket_size: u64,
    pub block_bucket_size: u64,
    pub partition_size: u64,

    pub disable_safety_checks: bool,
    pub forward_fill_rates: bool,
    pub patch_mode: bool,
    pub validate_mode: bool,
    pub apply_mode: ApplyMode,

    pub metrics_addr: String,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> GsResult<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|e| GsError::Config(format!("invalid {key}: {e}"))),
        Err(_) => Ok(default),
    }
}

fn env_parse_opt<T: FromStr>(key: &str) -> GsResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|e| GsError::Config(format!("invalid {key}: {e}"))),
        Err(_) => Ok(None),
    }
}

fn env_bool(key: &str, default: bool) -> GsResult<bool> {
    match env::var(key) {
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(GsError::Config(format!("invalid {key}: {other:?}"))),
        },
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> GsResult<Self> {
        let network_str = env::var("NETWORK")
            .map_err(|_| GsError::Config("NETWORK must be set".to_string()))?;
        let network = network_str.parse()?;

        let apply_mode = match env_or("APPLY_MODE", "batch").as_str() {
            "batch" => ApplyMode::Batch,
            "per-tx" | "per_transaction" => ApplyMode::PerTransaction,
            other => {
                return Err(GsError::Config(format!("invalid APPLY_MODE: {other:?}")));
            }
        };

        if apply_mode == ApplyMode::PerTransaction && network.is_account_model() {
            return Err(GsError::Config(
                "APPLY_MODE=per-tx is only supported for UTXO networks".to_string(),
            ));
        }

        Ok(Self {
            network,
            raw_keyspace: env::var("RAW_KEYSPACE")
                .map_err(|_| GsError::Config("RAW_KEYSPACE must be set".to_string()))?,
            transformed_keyspace: env::var("TRANSFORMED_KEYSPACE")
                .map_err(|_| GsError::Config("TRANSFORMED_KEYSPACE must be set".to_string()))?,
            database_url: env::var("DATABASE_URL")
                .map_err(|_| GsError::Config("DATABASE_URL must be set".to_string()))?,
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", 20)?,
            raw_source_url: env::var("RAW_SOURCE_URL")
                .map_err(|_| GsError::Config("RAW_SOURCE_URL must be set".to_string()))?,

            start_block: env_parse_opt("START_BLOCK")?,
            end_block: env_parse_opt("END_BLOCK")?,
            batch_size: env_parse("BATCH_SIZE", 10)?,

            id_bucket_size: env_parse("ID_BUCKET_SIZE", 1_000)?,
            block_bucket_size: env_parse("BLOCK_BUCKET_SIZE", 1_000)?,
            partition_size: env_parse("PARTITION_SIZE", 100_000)?,

            disable_safety_checks: env_bool("DISABLE_SAFETY_CHECKS", false)?,
            forward_fill_rates: env_bool("FORWARD_FILL_RATES", false)?,
            patch_mode: env_bool("PATCH_MODE", false)?,
            validate_mode: env_bool("VALIDATE_MODE", false)?,
            apply_mode,

            metrics_addr: env_or("METRICS_ADDR", "0.0.0.0:9100"),
        })
    }
}
