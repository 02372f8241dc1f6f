//! Two miners behind real transport servers, one validator epoch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use neuron_crypto::{KeyPair, Keystore};
use neuron_network::{MemoryLedger, MirrorConfig, SnapshotMirror};
use neuron_rpc::{
    bind_listener, ClientConfig, OptimizationError, OptimizationPipeline, PipelineHandler,
    RetryPolicy, ServerConfig, SubmissionHandler, TransportClient, TransportServer,
};
use neuron_scoring::{
    CheckpointRubric, ContestConfig, EpochEngine, EpochPhase, GenerationChallenges,
    GenerationSource, RubricError, SamplingPolicy, ScoreBook, ScoringConfig,
};
use neuron_security::{AdmissionGuard, SecurityConfig};
use neuron_types::{
    CheckpointSubmission, Endpoint, GenerationOutput, GenerationRequest, RequestKind,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::TcpListener;

fn latent_for(request: &GenerationRequest) -> Vec<f32> {
    let seed = request.seed as f32;
    vec![seed.sin(), seed.cos(), 1.0, request.prompt.len() as f32]
}

/// Reference checkpoint: deterministic latent, one second per generation.
struct Baseline;

#[async_trait]
impl GenerationSource for Baseline {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, RubricError> {
        Ok(GenerationOutput {
            output: latent_for(request),
            generation_time_secs: 1.0,
        })
    }
}

/// Reproduces the baseline exactly at the same speed.
struct Faithful;

#[async_trait]
impl OptimizationPipeline for Faithful {
    async fn optimize(&self, payload: Vec<u8>) -> Result<Vec<u8>, OptimizationError> {
        let request: GenerationRequest = serde_json::from_slice(&payload)
            .map_err(|err| OptimizationError::InvalidInput(err.to_string()))?;
        let output = GenerationOutput {
            output: latent_for(&request),
            generation_time_secs: 1.0,
        };
        serde_json::to_vec(&output).map_err(|err| OptimizationError::InvalidInput(err.to_string()))
    }
}

/// Never answers in time.
struct Stalled;

#[async_trait]
impl OptimizationPipeline for Stalled {
    async fn optimize(&self, _payload: Vec<u8>) -> Result<Vec<u8>, OptimizationError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Vec::new())
    }
}

async fn listen() -> (TcpListener, Endpoint) {
    let listener = bind_listener("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, Endpoint::new("127.0.0.1", port))
}

async fn spawn_miner<P: OptimizationPipeline>(
    key: KeyPair,
    listener: TcpListener,
    mirror: Arc<SnapshotMirror>,
    pipeline: P,
    submission: Option<CheckpointSubmission>,
) {
    let mut server = TransportServer::new(
        Arc::new(Keystore::new(key)),
        mirror,
        Arc::new(AdmissionGuard::new(SecurityConfig::default()).unwrap()),
        ServerConfig::default(),
    );
    server
        .register_handler(RequestKind::OPTIMIZE, Arc::new(PipelineHandler::new(pipeline)))
        .unwrap();
    server
        .register_handler(
            RequestKind::SUBMISSION,
            Arc::new(SubmissionHandler::new(submission)),
        )
        .unwrap();
    tokio::spawn(async move {
        server
            .serve(listener, std::future::pending::<()>())
            .await
            .unwrap();
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn responsive_miner_gains_weight_over_stalled_one() {
    let validator = KeyPair::generate();
    let miner_a = KeyPair::generate();
    let miner_b = KeyPair::generate();
    let (key_a, key_b) = (miner_a.public_key(), miner_b.public_key());

    let listener_a = bind_listener("127.0.0.1:0").await.unwrap();
    let listener_b = bind_listener("127.0.0.1:0").await.unwrap();
    let port_a = listener_a.local_addr().unwrap().port();
    let port_b = listener_b.local_addr().unwrap().port();

    let ledger = Arc::new(MemoryLedger::default());
    ledger.register(0, validator.public_key(), 100, None);
    ledger.register(1, key_a, 10, Some(Endpoint::new("127.0.0.1", port_a)));
    ledger.register(2, key_b, 5, Some(Endpoint::new("127.0.0.1", port_b)));
    ledger.advance_block(100);

    let mirror = Arc::new(SnapshotMirror::new(ledger.clone(), MirrorConfig::default()));
    mirror.refresh().await.unwrap();

    spawn_miner(miner_a, listener_a, mirror.clone(), Faithful, None).await;
    spawn_miner(miner_b, listener_b, mirror.clone(), Stalled, None).await;

    let keystore = Arc::new(Keystore::new(validator));
    let client = TransportClient::new(
        keystore.clone(),
        ClientConfig {
            retry: RetryPolicy::none(),
            ..Default::default()
        },
    )
    .unwrap();

    let mut book = ScoreBook::new();
    book.seed(1, key_a, 0.6, 90);
    book.seed(2, key_b, 0.6, 90);

    let engine = EpochEngine::new(
        keystore,
        mirror,
        Arc::new(client),
        Arc::new(CheckpointRubric::new(Baseline)),
        Arc::new(GenerationChallenges::with_rng(5, StdRng::seed_from_u64(42))),
        ledger.clone(),
        ScoringConfig {
            alpha: 0.5,
            sampling: SamplingPolicy::All,
            epoch_deadline_ms: 10_000,
            query_timeout_ms: 200,
            ..Default::default()
        },
    )
    .unwrap()
    .with_book(book);

    let report = engine.run_epoch().await.unwrap();
    assert_eq!(engine.phase(), EpochPhase::Idle);
    assert_eq!(report.sampled, vec![1, 2]);
    assert_eq!(report.answered[&1], 5);
    assert_eq!(report.answered[&2], 0);
    assert!((report.epoch_scores[&1] - 1.0).abs() < 1e-6);
    assert_eq!(report.epoch_scores[&2], 0.0);

    let book = engine.book();
    assert!((book.ema(1) - 0.8).abs() < 1e-6);
    assert!((book.ema(2) - 0.3).abs() < 1e-6);
    assert_eq!(book.get(1).unwrap().last_updated_block, 100);

    let submissions = ledger.submissions();
    assert_eq!(submissions.len(), 1);
    let weights = &submissions[0].weights;
    assert_eq!(submissions[0].block, 100);
    assert!((weights.get(1) - 0.727).abs() < 1e-3);
    assert!((weights.get(2) - 0.273).abs() < 1e-3);
    assert!((weights.total() - 1.0).abs() < 1e-9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stalled_miner_cannot_stretch_the_epoch_deadline() {
    let validator = KeyPair::generate();
    let miner = KeyPair::generate();
    let (listener, endpoint) = listen().await;

    let ledger = Arc::new(MemoryLedger::default());
    ledger.register(0, validator.public_key(), 100, None);
    ledger.register(1, miner.public_key(), 10, Some(endpoint));
    ledger.advance_block(7);
    let mirror = Arc::new(SnapshotMirror::new(ledger.clone(), MirrorConfig::default()));
    mirror.refresh().await.unwrap();
    spawn_miner(miner, listener, mirror.clone(), Stalled, None).await;

    // default retry policy: timeouts would be retried with backoff
    let keystore = Arc::new(Keystore::new(validator));
    let client = TransportClient::new(keystore.clone(), ClientConfig::default()).unwrap();
    let engine = EpochEngine::new(
        keystore,
        mirror,
        Arc::new(client),
        Arc::new(CheckpointRubric::new(Baseline)),
        Arc::new(GenerationChallenges::with_rng(1, StdRng::seed_from_u64(3))),
        ledger.clone(),
        ScoringConfig {
            epoch_deadline_ms: 500,
            query_timeout_ms: 500,
            ..Default::default()
        },
    )
    .unwrap();

    let started = Instant::now();
    let report = engine.run_epoch().await.unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(1_500), "epoch took {elapsed:?}");
    assert_eq!(report.answered[&1], 0);
    assert_eq!(ledger.submissions().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn contest_epoch_rewards_only_verified_submissions() {
    let validator = KeyPair::generate();
    let honest = KeyPair::generate();
    let resubmitted = KeyPair::generate();
    let boastful = KeyPair::generate();

    let (listener_1, endpoint_1) = listen().await;
    let (listener_2, endpoint_2) = listen().await;
    let (listener_3, endpoint_3) = listen().await;

    let ledger = Arc::new(MemoryLedger::default());
    ledger.register(0, validator.public_key(), 100, None);
    ledger.register(1, honest.public_key(), 10, Some(endpoint_1));
    ledger.register(2, resubmitted.public_key(), 10, Some(endpoint_2));
    ledger.register(3, boastful.public_key(), 10, Some(endpoint_3));
    ledger.advance_block(50);
    let mirror = Arc::new(SnapshotMirror::new(ledger.clone(), MirrorConfig::default()));
    mirror.refresh().await.unwrap();

    // all three reproduce the baseline at its speed; only the claims differ
    let claims = [
        CheckpointSubmission::new("miner/fast", 1.0, 3),
        CheckpointSubmission::new("baseline/model", 1.0, 3),
        CheckpointSubmission::new("miner/boast", 0.5, 3),
    ];
    let [claim_1, claim_2, claim_3] = claims;
    spawn_miner(honest, listener_1, mirror.clone(), Faithful, Some(claim_1)).await;
    spawn_miner(resubmitted, listener_2, mirror.clone(), Faithful, Some(claim_2)).await;
    spawn_miner(boastful, listener_3, mirror.clone(), Faithful, Some(claim_3)).await;

    let keystore = Arc::new(Keystore::new(validator));
    let client = TransportClient::new(keystore.clone(), ClientConfig::default()).unwrap();
    let engine = EpochEngine::new(
        keystore,
        mirror,
        Arc::new(client),
        Arc::new(CheckpointRubric::new(Baseline)),
        Arc::new(GenerationChallenges::with_rng(3, StdRng::seed_from_u64(9))),
        ledger.clone(),
        ScoringConfig {
            alpha: 0.5,
            epoch_deadline_ms: 10_000,
            query_timeout_ms: 2_000,
            ..Default::default()
        },
    )
    .unwrap()
    .with_contest(ContestConfig {
        contest: 3,
        baseline_repository: "baseline/model".into(),
    });

    let report = engine.run_epoch().await.unwrap();
    assert_eq!(report.sampled, vec![1, 2, 3]);
    assert!((report.epoch_scores[&1] - 1.0).abs() < 1e-6);
    assert_eq!(report.answered[&2], 0);
    assert_eq!(report.epoch_scores[&2], 0.0);
    assert_eq!(report.epoch_scores[&3], 0.0);
    assert_eq!(report.disqualified, vec![2, 3]);

    let weights = &ledger.submissions()[0].weights;
    assert!((weights.get(1) - 1.0).abs() < 1e-9);
    assert_eq!(weights.get(3), 0.0);
}
