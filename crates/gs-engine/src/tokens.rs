//! TokenDecoder: recognizes ERC-20/TRC-20 `Transfer` events from a small,
//! configurable allow-list (spec §4.4).

use sha3::{Digest, Keccak256};

use crate::adapter::RawLog;

#[derive(Debug, Clone, PartialEq)]
pub struct TokenTransfer {
    pub from_address: Vec<u8>,
    pub to_address: Vec<u8>,
    pub value: i128,
    pub asset: String,
    pub decimals: u32,
    pub coin_equivalent: bool,
    pub usd_equivalent: bool,
    pub block_id: u64,
    pub tx_hash: Vec<u8>,
    pub log_index: i32,
}

#[derive(Debug, Clone)]
pub struct SupportedToken {
    pub address: Vec<u8>,
    pub asset: &'static str,
    pub decimals: u32,
    pub coin_equivalent: bool,
    pub usd_equivalent: bool,
}

fn eth_tokens() -> Vec<SupportedToken> {
    vec![
        SupportedToken {
            address: hex::decode("dac17f958d2ee523a2206206994597c13d831ec").unwrap(),
            asset: "USDT",
            decimals: 6,
            coin_equivalent: false,
            usd_equivalent: true,
        },
        SupportedToken {
            address: hex::decode("a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48").unwrap(),
            asset: "USDC",
            decimals: 6,
            coin_equivalent: false,
            usd_equivalent: true,
        },
        SupportedToken {
            address: hex::decode("c02aaa39b223fe8d0a0e5c4f27ead9083c756cc2").unwrap(),
            asset: "WETH",
            decimals: 18,
            coin_equivalent: true,
            usd_equivalent: false,
        },
    ]
}

fn trx_tokens() -> Vec<SupportedToken> {
    vec![
        SupportedToken {
            address: hex::decode("a614f803b6fd780986a42c78ec9c7f77e6ded13c").unwrap(),
            asset: "USDT",
            decimals: 6,
            coin_equivalent: false,
            usd_equivalent: true,
        },
        SupportedToken {
            address: vec![0u8; 20],
            asset: "WTRX",
            decimals: 6,
            coin_equivalent: true,
            usd_equivalent: false,
        },
    ]
}

/// `keccak("Transfer(address,address,uint256)")`, compared by its first 4
/// bytes (the event selector) against `topics[0]` (spec §4.4).
fn transfer_event_selector() -> [u8; 4] {
    let mut hasher = Keccak256::new();
    hasher.update(b"Transfer(address,address,uint256)");
    let digest = hasher.finalize();
    [digest[0], digest[1], digest[2], digest[3]]
}

pub struct Erc20Decoder {
    selector: [u8; 4],
    supported: Vec<SupportedToken>,
}

impl Erc20Decoder {
    pub fn new(network: &str) -> Option<Self> {
        let supported = match network {
            "eth" => eth_tokens(),
            "trx" => trx_tokens(),
            _ => return None,
        };
        Some(Erc20Decoder {
            selector: transfer_event_selector(),
            supported,
        })
    }

    fn find_token(&self, address: &[u8]) -> Option<&SupportedToken> {
        self.supported.iter().find(|t| t.address == address)
    }

    /// Returns `None` for a log that isn't a recognized Transfer event from
    /// an allow-listed contract — not an error (spec §4.4).
    pub fn log_to_transfer(&self, log: &RawLog) -> Option<TokenTransfer> {
        let token = self.find_token(&log.address)?;
        self.decode_transfer(log, token)
    }

    fn decode_transfer(&self, log: &RawLog, token: &SupportedToken) -> Option<TokenTransfer> {
        let topic0 = log.topics.first()?;
        if topic0.len() < 4 || topic0[..4] != self.selector {
            return None;
        }
        if log.topics.len() < 3 {
            tracing::debug!("malformed transfer log, missing indexed topics");
            return None;
        }

        let from_address = last20(&log.topics[1])?;
        let to_address = last20(&log.topics[2])?;
        let value = decode_uint256(&log.data)?;

        Some(TokenTransfer {
            from_address,
            to_address,
            value,
            asset: token.asset.to_string(),
            decimals: token.decimals,
            coin_equivalent: token.coin_equivalent,
            usd_equivalent: token.usd_equivalent,
            block_id: log.block_id,
            tx_hash: log.tx_hash.clone(),
            log_index: log.log_index,
        })
    }
}

/// A 32-byte left-zero-padded `address` topic; the last 20 bytes are the
/// payload.
fn last20(word: &[u8]) -> Option<Vec<u8>> {
    if word.len() < 20 {
        return None;
    }
    Some(word[word.len() - 20..].to_vec())
}

fn decode_uint256(data: &[u8]) -> Option<i128> {
    if data.len() < 32 {
        tracing::debug!("malformed transfer log, short data word");
        return None;
    }
    // uint256 values observed in Transfer logs fit comfortably in i128 for
    // any token with a sane supply; reject the (practically unreachable)
    // overflow case rather than silently truncate.
    let word = &data[data.len() - 32..];
    if word[..16].iter().any(|b| *b != 0) {
        tracing::debug!("transfer value exceeds i128 range");
        return None;
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&word[16..]);
    Some(i128::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word_address(addr: &[u8]) -> Vec<u8> {
        let mut w = vec![0u8; 12];
        w.extend_from_slice(addr);
        w
    }

    fn word_u256(v: i128) -> Vec<u8> {
        let mut w = vec![0u8; 16];
        w.extend_from_slice(&v.to_be_bytes());
        w
    }

    #[test]
    fn unsupported_token_returns_none() {
        let decoder = Erc20Decoder::new("eth").unwrap();
        let log = RawLog {
            block_id: 1,
            tx_hash: vec![0; 32],
            log_index: 0,
            transaction_index: 1,
            address: vec![0xAA; 20],
            topics: vec![transfer_event_selector().to_vec()],
            data: vec![],
        };
        assert!(decoder.log_to_transfer(&log).is_none());
    }

    #[test]
    fn usdt_transfer_decodes() {
        let decoder = Erc20Decoder::new("eth").unwrap();
        let usdt = decoder.supported[0].address.clone();
        let from = hex::decode("B3a8226461F0e6A9a1063fEBeA88C6f6A5a0857E").unwrap();
        let to = hex::decode("F04C54F6b6A29aF05A54958c4974C383B4D922ac").unwrap();

        let mut sel = transfer_event_selector().to_vec();
        sel.extend_from_slice(&[0; 28]);

        let log = RawLog {
            block_id: 50_000_101,
            tx_hash: vec![0xe0; 32],
            log_index: 0,
            transaction_index: 1,
            address: usdt,
            topics: vec![sel, word_address(&from), word_address(&to)],
            data: word_u256(29_000_000),
        };

        let transfer = decoder.log_to_transfer(&log).unwrap();
        assert_eq!(transfer.asset, "USDT");
        assert_eq!(transfer.value, 29_000_000);
        assert_eq!(transfer.from_address, from);
        assert_eq!(transfer.to_address, to);
        assert!(transfer.usd_equivalent);
        assert!(!transfer.coin_equivalent);
    }
}
