//! Chain-facing collaborator boundary.
//!
//! Jobs never talk to an RPC endpoint directly: they go through [`PairSource`]
//! (enumerating an append-only on-chain list such as a factory's pairs) and
//! [`TokenProbe`] (per-address contract probing and metadata). The alloy-backed
//! implementation lives in [`rpc`].

pub mod rpc;

pub use rpc::RpcChainClient;

use alloy::primitives::Address;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sentinel used when a token's name or symbol could not be read.
pub const UNKNOWN: &str = "UNKNOWN";

#[derive(Error, Debug, Clone)]
pub enum ChainError {
    #[error("rpc transport error: {0}")]
    Transport(String),
    #[error("execution reverted: {method} on {address}")]
    Reverted { address: Address, method: &'static str },
    #[error("malformed return data from {method} on {address}: {message}")]
    Decode {
        address: Address,
        method: &'static str,
        message: String,
    },
    #[error("invalid rpc url {0}")]
    InvalidUrl(String),
}

impl ChainError {
    /// Maps an alloy contract-call failure onto the chain error taxonomy.
    pub(crate) fn from_call(address: Address, method: &'static str, err: impl std::fmt::Display) -> Self {
        let message = err.to_string();
        let lowered = message.to_lowercase();
        if lowered.contains("execution reverted") {
            ChainError::Reverted { address, method }
        } else if lowered.contains("abi") || lowered.contains("decode") || lowered.contains("buffer overrun") {
            ChainError::Decode { address, method, message }
        } else {
            ChainError::Transport(message)
        }
    }
}

/// A freshly observed composite asset and its two constituents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairInfo {
    pub pair: Address,
    pub token0: Address,
    pub token1: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

impl TokenMetadata {
    /// Degraded metadata for an address whose reads failed.
    pub fn unknown() -> Self {
        Self {
            name: UNKNOWN.to_string(),
            symbol: UNKNOWN.to_string(),
            decimals: 18,
        }
    }

    /// Builds metadata from raw contract strings. NUL bytes and control
    /// characters are stripped (bytes32-style tokens pad with `\0`, which
    /// Postgres `TEXT` rejects); a label left empty becomes `UNKNOWN`.
    pub fn from_chain(name: &str, symbol: &str, decimals: u8) -> Self {
        Self {
            name: clean_label(name),
            symbol: clean_label(symbol),
            decimals,
        }
    }

    /// True when both name and symbol were actually read from chain.
    pub fn is_resolved(&self) -> bool {
        self.name != UNKNOWN && self.symbol != UNKNOWN
    }
}

fn clean_label(raw: &str) -> String {
    let cleaned: String = raw.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        UNKNOWN.to_string()
    } else {
        cleaned.to_string()
    }
}

/// Result of probing an address for pair-like shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairShape {
    /// Zero/zero constituents: a plain asset.
    Single,
    /// Two non-zero constituents: the address is itself a pool share.
    Composite { token0: Address, token1: Address },
}

/// Enumerates an externally growing, append-only on-chain list.
#[async_trait]
pub trait PairSource: Send + Sync {
    async fn total_count(&self) -> Result<u64, ChainError>;

    /// Returns one entry per requested index; `None` where the index could not
    /// be resolved to a pair.
    async fn fetch_batch(&self, indices: &[u64]) -> Result<Vec<Option<PairInfo>>, ChainError>;
}

/// Per-address probing used by the discovery pipeline.
#[async_trait]
pub trait TokenProbe: Send + Sync {
    async fn is_contract(&self, address: Address) -> Result<bool, ChainError>;
    async fn pair_shape(&self, address: Address) -> Result<PairShape, ChainError>;
    async fn metadata(&self, address: Address) -> Result<TokenMetadata, ChainError>;
}
