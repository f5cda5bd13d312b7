mod common;

use alloy::primitives::Address;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

use chainsync_backend::chain::{TokenMetadata, UNKNOWN};
use chainsync_backend::database::{InMemoryStorage, NewToken, Storage, StorageTx, TaskRecord, TokenKind};
use chainsync_backend::scheduler::{ErrorClassifier, JobError, TaskRunner};
use chainsync_backend::token_registry::{ProbeFailurePolicy, TokenDiscoveryPipeline, TokenValidationService};

use common::{addr, discovery_runner, pair, FakeChain, NETWORK_ID};

const TASK: &str = "testnet-pair-discovery";

fn setup(config: serde_json::Value) -> (InMemoryStorage, FakeChain) {
    let storage = InMemoryStorage::new();
    storage.insert_task(TaskRecord::new(TASK, "0 */5 * * * *").with_config(config));
    (storage, FakeChain::new())
}

fn pipeline(chain: &FakeChain, policy: ProbeFailurePolicy) -> TokenDiscoveryPipeline {
    let validation = TokenValidationService::new(Arc::new(chain.clone()), Arc::new(ErrorClassifier::default()), policy);
    TokenDiscoveryPipeline::new(NETWORK_ID, validation)
}

#[tokio::test]
async fn test_composite_resolves_against_composite_from_same_batch() {
    let (storage, chain) = setup(json!({}));
    // P = (A, B) arrives before B = (X, Y)
    chain.push_pairs(&[pair(0x50, 0x01, 0x51), pair(0x51, 0x02, 0x03)]);
    let runner = discovery_runner(&storage, &chain, ProbeFailurePolicy::default());

    let payload = runner.run(storage.task(TASK).unwrap()).await.unwrap();
    let report = &payload["outcome"]["report"];
    assert_eq!(report["singlesInserted"], 3);
    assert_eq!(report["compositesInserted"], 2);
    assert!(report["skippedComposites"].as_array().unwrap().is_empty());

    let a = storage.token(NETWORK_ID, addr(0x01)).unwrap();
    let x = storage.token(NETWORK_ID, addr(0x02)).unwrap();
    let y = storage.token(NETWORK_ID, addr(0x03)).unwrap();
    let b = storage.token(NETWORK_ID, addr(0x51)).unwrap();
    let p = storage.token(NETWORK_ID, addr(0x50)).unwrap();

    assert_eq!(b.kind, TokenKind::Composite);
    assert_eq!((b.constituent_a, b.constituent_b), (Some(x.id), Some(y.id)));
    assert_eq!((p.constituent_a, p.constituent_b), (Some(a.id), Some(b.id)));
    assert!(p.status && b.status && a.status);
    assert_eq!(storage.task(TASK).unwrap().cursor, Some(2));
}

#[tokio::test]
async fn test_composite_shaped_constituent_is_deferred_not_dangling() {
    let (storage, chain) = setup(json!({}));
    chain.add_foreign_pair(addr(0x60), addr(0x02), addr(0x03));
    chain.push_pairs(&[pair(0x61, 0x01, 0x60)]);
    let runner = discovery_runner(&storage, &chain, ProbeFailurePolicy::default());

    let payload = runner.run(storage.task(TASK).unwrap()).await.unwrap();
    let report = &payload["outcome"]["report"];
    assert_eq!(report["compositeShapedConstituents"], json!([addr(0x60)]));
    assert_eq!(report["skippedComposites"], json!([addr(0x61)]));

    assert!(storage.token(NETWORK_ID, addr(0x01)).is_some());
    assert!(storage.token(NETWORK_ID, addr(0x60)).is_none());
    assert!(storage.token(NETWORK_ID, addr(0x61)).is_none());
    // Cursor advances regardless
    assert_eq!(storage.task(TASK).unwrap().cursor, Some(1));
}

#[tokio::test]
async fn test_reprocessing_a_batch_creates_no_duplicates() {
    let (storage, chain) = setup(json!({}));
    let pairs = [pair(0x50, 0x01, 0x51), pair(0x51, 0x02, 0x03)];
    chain.push_pairs(&pairs);
    let pipeline = pipeline(&chain, ProbeFailurePolicy::default());

    let prepared = pipeline.prepare(&storage, &pairs, 2).await.unwrap();
    let mut tx = storage.begin().await.unwrap();
    let first = pipeline.persist(tx.as_mut(), prepared).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(first.singles_inserted + first.composites_inserted, 5);

    let prepared = pipeline.prepare(&storage, &pairs, 2).await.unwrap();
    let mut tx = storage.begin().await.unwrap();
    let second = pipeline.persist(tx.as_mut(), prepared).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(second.singles_inserted, 0);
    assert_eq!(second.composites_inserted, 0);
    assert_eq!(second.already_known, 5);
    assert_eq!(storage.tokens().len(), 5);
}

#[tokio::test]
async fn test_crash_before_commit_reprocesses_same_range() {
    let (storage, chain) = setup(json!({ "chunk": 10 }));
    let pairs = [pair(0x50, 0x01, 0x02), pair(0x51, 0x02, 0x03)];
    chain.push_pairs(&pairs);
    let pipeline = pipeline(&chain, ProbeFailurePolicy::default());

    {
        let prepared = pipeline.prepare(&storage, &pairs, 2).await.unwrap();
        let mut tx = storage.begin().await.unwrap();
        pipeline.persist(tx.as_mut(), prepared).await.unwrap();
        tx.save_cursor(TASK, 2).await.unwrap();
        // Process dies here: the transaction is dropped without commit
    }
    assert!(storage.tokens().is_empty());
    assert_eq!(storage.task(TASK).unwrap().cursor, None);
    assert_eq!(storage.open_transactions(), 0);

    let runner = discovery_runner(&storage, &chain, ProbeFailurePolicy::default());
    let payload = runner.run(storage.task(TASK).unwrap()).await.unwrap();
    assert_eq!(payload["start"], 0);
    assert_eq!(payload["end"], 2);
    assert_eq!(storage.tokens().len(), 5);
    assert_eq!(storage.task(TASK).unwrap().cursor, Some(2));
}

#[tokio::test]
async fn test_chain_reads_happen_before_the_transaction() {
    let (storage, chain) = setup(json!({}));
    chain.push_pairs(&[pair(0x50, 0x01, 0x02)]);
    chain.make_flaky(addr(0x02));
    let runner = discovery_runner(&storage, &chain, ProbeFailurePolicy::ClassifyError);

    assert!(runner.run(storage.task(TASK).unwrap()).await.is_err());
    assert_eq!(storage.transactions_begun(), 0);

    let pipeline = pipeline(&chain, ProbeFailurePolicy::IsolateEntry);
    let prepared = pipeline.prepare(&storage, &[pair(0x50, 0x01, 0x02)], 2).await.unwrap();
    assert_eq!(storage.transactions_begun(), 0);
    assert_eq!(prepared.singles, vec![addr(0x01)]);
    assert_eq!(prepared.report.invalid_constituents, vec![addr(0x02)]);
    assert!(storage.tokens().is_empty());
}

#[tokio::test]
async fn test_metadata_failure_degrades_single_entry() {
    let (storage, chain) = setup(json!({ "maxRetry": 1 }));
    chain.push_pairs(&[pair(0x50, 0x01, 0x02)]);
    chain.break_metadata(addr(0x01));
    let runner = discovery_runner(&storage, &chain, ProbeFailurePolicy::default());

    runner.run(storage.task(TASK).unwrap()).await.unwrap();

    let broken = storage.token(NETWORK_ID, addr(0x01)).unwrap();
    assert_eq!(broken.name, UNKNOWN);
    assert_eq!(broken.symbol, UNKNOWN);
    assert_eq!(broken.decimals, 18);
    assert!(!broken.status);

    assert!(storage.token(NETWORK_ID, addr(0x02)).unwrap().status);
    let composite = storage.token(NETWORK_ID, addr(0x50)).unwrap();
    assert!(!composite.status, "composite over an unreliable constituent stays inactive");

    // Two attempts for the broken token, one each for the others
    assert_eq!(chain.metadata_calls(), 4);
}

#[tokio::test]
async fn test_structurally_invalid_constituents_are_dropped() {
    let (storage, chain) = setup(json!({}));
    chain.push_pairs(&[
        pair(0x50, 0x01, 0x00),
        pair(0x52, 0x03, 0x04),
        pair(0x53, 0x05, 0x06),
    ]);
    chain.remove_code(addr(0x04));
    chain.make_malformed(addr(0x06));
    let pipeline = pipeline(&chain, ProbeFailurePolicy::default());

    let pairs = [pair(0x50, 0x01, 0x00), pair(0x52, 0x03, 0x04), pair(0x53, 0x05, 0x06)];
    let prepared = pipeline.prepare(&storage, &pairs, 2).await.unwrap();
    let mut tx = storage.begin().await.unwrap();
    let report = pipeline.persist(tx.as_mut(), prepared).await.unwrap();
    tx.commit().await.unwrap();

    let invalid: HashSet<Address> = report.invalid_constituents.iter().copied().collect();
    let expected: HashSet<Address> = [Address::ZERO, addr(0x04), addr(0x06)].into_iter().collect();
    assert_eq!(invalid, expected);
    assert_eq!(report.singles_inserted, 3);
    assert_eq!(report.composites_inserted, 0);
    assert_eq!(report.skipped_composites.len(), 3);

    for kept in [0x01, 0x03, 0x05] {
        assert_eq!(storage.token(NETWORK_ID, addr(kept)).unwrap().kind, TokenKind::Single);
    }
    assert_eq!(storage.tokens().len(), 3);
}

#[tokio::test]
async fn test_recoverable_probe_failure_aborts_batch_by_default() {
    let (storage, chain) = setup(json!({}));
    chain.push_pairs(&[pair(0x50, 0x01, 0x02)]);
    chain.make_flaky(addr(0x02));
    let runner = discovery_runner(&storage, &chain, ProbeFailurePolicy::ClassifyError);

    let err = runner.run(storage.task(TASK).unwrap()).await.unwrap_err();
    assert!(matches!(err, JobError::Chain(_)));
    assert!(!ErrorClassifier::default().classify(&err).is_fatal());

    assert!(storage.tokens().is_empty());
    assert_eq!(storage.task(TASK).unwrap().cursor, None);
}

#[tokio::test]
async fn test_isolate_policy_skips_only_the_failing_entry() {
    let (storage, chain) = setup(json!({}));
    chain.push_pairs(&[pair(0x50, 0x01, 0x02)]);
    chain.make_flaky(addr(0x02));
    let runner = discovery_runner(&storage, &chain, ProbeFailurePolicy::IsolateEntry);

    let payload = runner.run(storage.task(TASK).unwrap()).await.unwrap();
    let report = &payload["outcome"]["report"];
    assert_eq!(report["invalidConstituents"], json!([addr(0x02)]));
    assert_eq!(report["skippedComposites"], json!([addr(0x50)]));

    assert!(storage.token(NETWORK_ID, addr(0x01)).is_some());
    assert!(storage.token(NETWORK_ID, addr(0x50)).is_none());
    assert_eq!(storage.task(TASK).unwrap().cursor, Some(1));
}

#[tokio::test]
async fn test_known_constituent_is_reused() {
    let (storage, chain) = setup(json!({}));
    let weth = TokenMetadata {
        name: "Wrapped Ether".to_string(),
        symbol: "WETH".to_string(),
        decimals: 18,
    };
    let seeded = storage.insert_token(NewToken::single(NETWORK_ID, addr(0x01), &weth));
    // Same address on another network does not count as known here
    storage.insert_token(NewToken::single(NETWORK_ID + 1, addr(0x02), &weth));
    chain.push_pairs(&[pair(0x50, 0x01, 0x02)]);
    let runner = discovery_runner(&storage, &chain, ProbeFailurePolicy::default());

    let payload = runner.run(storage.task(TASK).unwrap()).await.unwrap();
    let report = &payload["outcome"]["report"];
    assert_eq!(report["alreadyKnown"], 1);
    assert_eq!(report["singlesInserted"], 1);

    let composite = storage.token(NETWORK_ID, addr(0x50)).unwrap();
    assert_eq!(composite.constituent_a, Some(seeded.id));
    assert_eq!(storage.token(NETWORK_ID, addr(0x01)).unwrap().name, "Wrapped Ether");
}
