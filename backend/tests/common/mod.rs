#![allow(dead_code)]

use alloy::primitives::Address;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chainsync_backend::chain::{ChainError, PairInfo, PairShape, PairSource, TokenMetadata, TokenProbe};
use chainsync_backend::database::InMemoryStorage;
use chainsync_backend::scheduler::{CursorJobRunner, ErrorClassifier, JobContext, TaskRunner};
use chainsync_backend::token_registry::{PairDiscoveryJob, ProbeFailurePolicy};

pub const NETWORK_ID: i64 = 1;

pub fn addr(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

pub fn pair(pair: u8, token0: u8, token1: u8) -> PairInfo {
    PairInfo {
        pair: addr(pair),
        token0: addr(token0),
        token1: addr(token1),
    }
}

#[derive(Default)]
struct ChainState {
    pairs: Vec<PairInfo>,
    contracts: HashSet<Address>,
    pair_shaped: HashMap<Address, (Address, Address)>,
    malformed: HashSet<Address>,
    flaky: HashSet<Address>,
    broken_metadata: HashSet<Address>,
    failing_totals: usize,
}

/// Scripted chain: an append-only factory pair list plus per-address probe answers.
#[derive(Clone, Default)]
pub struct FakeChain {
    state: Arc<Mutex<ChainState>>,
    metadata_calls: Arc<AtomicUsize>,
}

impl FakeChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends pairs to the factory list. Pair and constituent addresses
    /// become contracts; pairs become pair-shaped.
    pub fn push_pairs(&self, pairs: &[PairInfo]) {
        let mut state = self.state.lock().unwrap();
        for info in pairs {
            state.pairs.push(*info);
            state.contracts.insert(info.pair);
            state.pair_shaped.insert(info.pair, (info.token0, info.token1));
            for token in [info.token0, info.token1] {
                if !token.is_zero() {
                    state.contracts.insert(token);
                }
            }
        }
    }

    /// A pair contract that exists on chain but is not in the factory list.
    pub fn add_foreign_pair(&self, address: Address, token0: Address, token1: Address) {
        let mut state = self.state.lock().unwrap();
        state.contracts.insert(address);
        state.pair_shaped.insert(address, (token0, token1));
    }

    pub fn remove_code(&self, address: Address) {
        self.state.lock().unwrap().contracts.remove(&address);
    }

    pub fn make_malformed(&self, address: Address) {
        self.state.lock().unwrap().malformed.insert(address);
    }

    pub fn make_flaky(&self, address: Address) {
        self.state.lock().unwrap().flaky.insert(address);
    }

    pub fn break_metadata(&self, address: Address) {
        self.state.lock().unwrap().broken_metadata.insert(address);
    }

    pub fn fail_next_totals(&self, count: usize) {
        self.state.lock().unwrap().failing_totals = count;
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PairSource for FakeChain {
    async fn total_count(&self) -> Result<u64, ChainError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_totals > 0 {
            state.failing_totals -= 1;
            return Err(ChainError::Transport("request timeout after 30s".to_string()));
        }
        Ok(state.pairs.len() as u64)
    }

    async fn fetch_batch(&self, indices: &[u64]) -> Result<Vec<Option<PairInfo>>, ChainError> {
        let state = self.state.lock().unwrap();
        Ok(indices.iter().map(|&i| state.pairs.get(i as usize).copied()).collect())
    }
}

#[async_trait]
impl TokenProbe for FakeChain {
    async fn is_contract(&self, address: Address) -> Result<bool, ChainError> {
        let state = self.state.lock().unwrap();
        if state.flaky.contains(&address) {
            return Err(ChainError::Transport("429 Too Many Requests".to_string()));
        }
        Ok(state.contracts.contains(&address))
    }

    async fn pair_shape(&self, address: Address) -> Result<PairShape, ChainError> {
        let state = self.state.lock().unwrap();
        if state.malformed.contains(&address) {
            return Err(ChainError::Decode {
                address,
                method: "token0",
                message: "buffer overrun while deserializing".to_string(),
            });
        }
        Ok(match state.pair_shaped.get(&address) {
            Some(&(token0, token1)) => PairShape::Composite { token0, token1 },
            None => PairShape::Single,
        })
    }

    async fn metadata(&self, address: Address) -> Result<TokenMetadata, ChainError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        if state.broken_metadata.contains(&address) {
            return Err(ChainError::Transport("error sending request".to_string()));
        }
        let tag = format!("{:x}", address.0[0]);
        Ok(TokenMetadata {
            name: format!("Token {}", tag),
            symbol: format!("T{}", tag),
            decimals: 18,
        })
    }
}

pub fn job_context(storage: &InMemoryStorage, chain: &FakeChain) -> JobContext {
    JobContext {
        network_id: NETWORK_ID,
        network_name: "testnet".to_string(),
        contract_address: addr(0xfa),
        storage: Arc::new(storage.clone()),
        pairs: Arc::new(chain.clone()),
        probe: Arc::new(chain.clone()),
    }
}

pub fn discovery_runner(storage: &InMemoryStorage, chain: &FakeChain, policy: ProbeFailurePolicy) -> Arc<dyn TaskRunner> {
    let job = PairDiscoveryJob::new(
        job_context(storage, chain),
        Arc::new(ErrorClassifier::default()),
        policy,
    );
    CursorJobRunner::arc(job, Arc::new(storage.clone()))
}
