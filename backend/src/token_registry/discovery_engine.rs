//! Token discovery and deduplication.
//!
//! Turns a batch of freshly enumerated pairs into token rows: every plain
//! constituent and every pair share is persisted once per `(network, address)`,
//! and a pair share is only ever written once both of its constituents exist.
//! Chain probing happens in [`TokenDiscoveryPipeline::prepare`] before any
//! transaction is opened; all writes go through the caller's transaction in
//! [`TokenDiscoveryPipeline::persist`], so a failed batch leaves nothing
//! behind and the pipeline can safely see the same pairs again.

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use super::validation_service::TokenValidationService;
use crate::chain::{PairInfo, TokenMetadata};
use crate::database::{NewToken, Storage, StorageTx, Token};
use crate::scheduler::JobError;

/// Outcome of one pipeline pass over a batch.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryReport {
    pub pairs_seen: usize,
    pub already_known: usize,
    pub singles_inserted: u64,
    pub composites_inserted: u64,
    pub invalid_constituents: Vec<Address>,
    pub composite_shaped_constituents: Vec<Address>,
    pub skipped_composites: Vec<Address>,
}

/// Pairs split into de-duplicated composite and constituent sets, in first-seen order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GroupedPairs {
    pub composites: Vec<Address>,
    pub constituents: Vec<Address>,
    pub members: HashMap<Address, (Address, Address)>,
}

impl GroupedPairs {
    pub fn from_pairs(pairs: &[PairInfo]) -> Self {
        let mut grouped = GroupedPairs::default();
        let mut seen_constituents = HashSet::new();

        for info in pairs {
            if !grouped.members.contains_key(&info.pair) {
                grouped.members.insert(info.pair, (info.token0, info.token1));
                grouped.composites.push(info.pair);
            }
            for token in [info.token0, info.token1] {
                if seen_constituents.insert(token) {
                    grouped.constituents.push(token);
                }
            }
        }

        grouped
    }
}

/// A validated batch waiting to be written.
#[derive(Debug, Default, Clone)]
pub struct PreparedBatch {
    pub report: DiscoveryReport,
    pub singles: Vec<Address>,
    pub composites: Vec<Address>,
    pub members: HashMap<Address, (Address, Address)>,
    pub metadata: HashMap<Address, TokenMetadata>,
}

pub struct TokenDiscoveryPipeline {
    network_id: i64,
    validation: TokenValidationService,
}

impl TokenDiscoveryPipeline {
    pub fn new(network_id: i64, validation: TokenValidationService) -> Self {
        Self { network_id, validation }
    }

    pub fn network_id(&self) -> i64 {
        self.network_id
    }

    /// Stages 1 to 5: grouping, registered-removal against committed rows,
    /// contract and shape probes, and metadata. Runs with no transaction
    /// open; nothing is written.
    pub async fn prepare(
        &self,
        storage: &dyn Storage,
        pairs: &[PairInfo],
        max_retry: u32,
    ) -> Result<PreparedBatch, JobError> {
        let mut prepared = PreparedBatch {
            report: DiscoveryReport {
                pairs_seen: pairs.len(),
                ..Default::default()
            },
            ..Default::default()
        };
        if pairs.is_empty() {
            return Ok(prepared);
        }

        let grouped = GroupedPairs::from_pairs(pairs);
        let report = &mut prepared.report;

        // A batch composite never doubles as a plain constituent
        let composite_set: HashSet<Address> = grouped.composites.iter().copied().collect();
        let constituents: Vec<Address> = grouped
            .constituents
            .iter()
            .copied()
            .filter(|address| !composite_set.contains(address))
            .collect();

        // Registered-removal
        let composites = self.unregistered(storage, &grouped.composites, report).await?;
        let constituents = self.unregistered(storage, &constituents, report).await?;

        // Invalid-removal
        let contracts = self.validation.check_contracts(&constituents).await?;
        report.invalid_constituents = contracts.invalid;

        // Composite-in-constituent-position detection
        let shapes = self.validation.check_shapes(&contracts.contracts).await?;
        report.invalid_constituents.extend(shapes.malformed);
        report.composite_shaped_constituents = shapes.composite_shaped;

        let mut to_describe = shapes.singles.clone();
        to_describe.extend(composites.iter().copied());
        prepared.metadata = self.validation.fetch_metadata(&to_describe, max_retry).await;

        prepared.singles = shapes.singles;
        prepared.composites = composites;
        prepared.members = grouped.members;
        Ok(prepared)
    }

    /// Stage 6: writes singles, then composites, inside `tx`. Inserts are
    /// create-if-not-exists, so rows committed by someone else since
    /// [`prepare`](Self::prepare) are left alone.
    pub async fn persist(&self, tx: &mut dyn StorageTx, prepared: PreparedBatch) -> Result<DiscoveryReport, JobError> {
        let PreparedBatch {
            mut report,
            singles,
            composites,
            members,
            metadata,
        } = prepared;

        report.singles_inserted = self.insert_singles(tx, &singles, &metadata).await?;
        let (inserted, skipped) = self.insert_composites(tx, &composites, &members, &metadata).await?;
        report.composites_inserted = inserted;
        report.skipped_composites = skipped;

        info!(
            network = self.network_id,
            "discovered {} singles and {} composites from {} pairs ({} known, {} invalid, {} skipped)",
            report.singles_inserted,
            report.composites_inserted,
            report.pairs_seen,
            report.already_known,
            report.invalid_constituents.len(),
            report.skipped_composites.len()
        );
        Ok(report)
    }

    async fn unregistered(
        &self,
        storage: &dyn Storage,
        addresses: &[Address],
        report: &mut DiscoveryReport,
    ) -> Result<Vec<Address>, JobError> {
        let known: HashSet<Address> = storage
            .find_tokens(self.network_id, addresses)
            .await?
            .into_iter()
            .map(|token| token.address)
            .collect();
        report.already_known += known.len();

        Ok(addresses.iter().copied().filter(|a| !known.contains(a)).collect())
    }

    async fn insert_singles(
        &self,
        tx: &mut dyn StorageTx,
        singles: &[Address],
        metadata: &HashMap<Address, TokenMetadata>,
    ) -> Result<u64, JobError> {
        if singles.is_empty() {
            return Ok(0);
        }
        let rows: Vec<NewToken> = singles
            .iter()
            .map(|&address| NewToken::single(self.network_id, address, &describe(metadata, address)))
            .collect();
        Ok(tx.insert_tokens(&rows).await?)
    }

    /// Inserts composites whose constituents both resolve. Composites waiting
    /// on a constituent written later in this batch are retried in further
    /// passes until a pass makes no progress; the rest are returned as skipped.
    async fn insert_composites(
        &self,
        tx: &mut dyn StorageTx,
        composites: &[Address],
        members: &HashMap<Address, (Address, Address)>,
        metadata: &HashMap<Address, TokenMetadata>,
    ) -> Result<(u64, Vec<Address>), JobError> {
        let mut pending: Vec<Address> = composites.to_vec();
        let mut inserted = 0;
        let mut pass = 0;

        while !pending.is_empty() {
            pass += 1;
            let wanted: Vec<Address> = pending
                .iter()
                .filter_map(|p| members.get(p))
                .flat_map(|&(a, b)| [a, b])
                .collect();
            let resolved: HashMap<Address, Token> = tx
                .find_tokens(self.network_id, &wanted)
                .await?
                .into_iter()
                .map(|token| (token.address, token))
                .collect();

            let mut ready = Vec::new();
            let mut deferred = Vec::new();
            for &pair in &pending {
                let constituents = members
                    .get(&pair)
                    .and_then(|(a, b)| Some((resolved.get(a)?, resolved.get(b)?)));
                match constituents {
                    Some((a, b)) => ready.push(NewToken::composite(
                        self.network_id,
                        pair,
                        &describe(metadata, pair),
                        a,
                        b,
                    )),
                    None => deferred.push(pair),
                }
            }

            if ready.is_empty() {
                break;
            }
            inserted += tx.insert_tokens(&ready).await?;
            debug!(network = self.network_id, "composite pass {}: {} ready, {} deferred", pass, ready.len(), deferred.len());
            pending = deferred;
        }

        for pair in &pending {
            debug!(network = self.network_id, "skipping {}: constituents unresolved", pair);
        }
        Ok((inserted, pending))
    }
}

fn describe(metadata: &HashMap<Address, TokenMetadata>, address: Address) -> TokenMetadata {
    metadata.get(&address).cloned().unwrap_or_else(TokenMetadata::unknown)
}
