use alloy::primitives::Address;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::chain::{ChainError, PairShape, TokenMetadata, TokenProbe};
use crate::scheduler::{ErrorClassifier, Severity};

/// What to do when a per-address probe call fails outright (as opposed to
/// answering "not a contract").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProbeFailurePolicy {
    /// Recoverable-classified failures abort the batch so it is retried from
    /// the same cursor; fatal-classified ones mark the entry invalid.
    #[default]
    ClassifyError,
    /// Every probe failure marks just that entry invalid.
    IsolateEntry,
}

/// Result of the contract-existence probe.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ContractCheck {
    pub contracts: Vec<Address>,
    pub invalid: Vec<Address>,
}

/// Result of the pair-shape probe over plain constituents.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShapeCheck {
    pub singles: Vec<Address>,
    /// Pair-like addresses in constituent position; picked up as composites
    /// when their own pair is discovered.
    pub composite_shaped: Vec<Address>,
    pub malformed: Vec<Address>,
}

pub struct TokenValidationService {
    probe: Arc<dyn TokenProbe>,
    classifier: Arc<ErrorClassifier>,
    policy: ProbeFailurePolicy,
}

impl TokenValidationService {
    pub fn new(probe: Arc<dyn TokenProbe>, classifier: Arc<ErrorClassifier>, policy: ProbeFailurePolicy) -> Self {
        Self {
            probe,
            classifier,
            policy,
        }
    }

    pub fn policy(&self) -> ProbeFailurePolicy {
        self.policy
    }

    /// Keeps addresses with deployed code. The zero address is invalid
    /// without a probe.
    pub async fn check_contracts(&self, addresses: &[Address]) -> Result<ContractCheck, ChainError> {
        let mut check = ContractCheck::default();
        let candidates: Vec<Address> = addresses
            .iter()
            .copied()
            .filter(|address| {
                if address.is_zero() {
                    check.invalid.push(*address);
                    false
                } else {
                    true
                }
            })
            .collect();

        let probes = join_all(candidates.iter().map(|&address| self.probe.is_contract(address))).await;
        for (address, result) in candidates.into_iter().zip(probes) {
            match result {
                Ok(true) => check.contracts.push(address),
                Ok(false) => {
                    debug!("{} has no code", address);
                    check.invalid.push(address);
                }
                Err(e) => {
                    self.isolate_or_abort(address, e)?;
                    check.invalid.push(address);
                }
            }
        }

        Ok(check)
    }

    /// Separates genuinely plain assets from pair-shaped ones.
    pub async fn check_shapes(&self, addresses: &[Address]) -> Result<ShapeCheck, ChainError> {
        let mut check = ShapeCheck::default();
        let probes = join_all(addresses.iter().map(|&address| self.probe.pair_shape(address))).await;

        for (&address, result) in addresses.iter().zip(probes) {
            match result {
                Ok(PairShape::Single) => check.singles.push(address),
                Ok(PairShape::Composite { .. }) => check.composite_shaped.push(address),
                Err(e) => {
                    self.isolate_or_abort(address, e)?;
                    check.malformed.push(address);
                }
            }
        }

        Ok(check)
    }

    /// Fetches metadata for every address. A fetch failing on all
    /// `1 + max_retry` attempts degrades that entry to `UNKNOWN`.
    pub async fn fetch_metadata(&self, addresses: &[Address], max_retry: u32) -> HashMap<Address, TokenMetadata> {
        let fetched = join_all(addresses.iter().map(|&address| self.metadata_with_retry(address, max_retry))).await;
        addresses.iter().copied().zip(fetched).collect()
    }

    async fn metadata_with_retry(&self, address: Address, max_retry: u32) -> TokenMetadata {
        let mut attempt = 0;
        loop {
            match self.probe.metadata(address).await {
                Ok(metadata) => return metadata,
                Err(e) if attempt < max_retry => {
                    attempt += 1;
                    debug!("metadata fetch for {} failed (attempt {}): {}", address, attempt, e);
                }
                Err(e) => {
                    warn!("metadata for {} unavailable, storing as UNKNOWN: {}", address, e);
                    return TokenMetadata::unknown();
                }
            }
        }
    }

    fn isolate_or_abort(&self, address: Address, err: ChainError) -> Result<(), ChainError> {
        match self.policy {
            ProbeFailurePolicy::IsolateEntry => {
                warn!("probe failed for {}, marking invalid: {}", address, err);
                Ok(())
            }
            ProbeFailurePolicy::ClassifyError => {
                let verdict = self.classifier.classify(&err);
                if verdict.severity() == Severity::Recoverable {
                    return Err(err);
                }
                warn!("probe for {} failed ({}), marking invalid: {}", address, verdict.code(), err);
                Ok(())
            }
        }
    }
}
