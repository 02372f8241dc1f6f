//! Epoch state machine: query sampled peers, fold scores into the book and
//! commit normalized weights to the ledger.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use metrics::{counter, gauge, histogram};
use neuron_crypto::{KeyError, Keystore};
use neuron_network::{LedgerError, LedgerWriter, SnapshotMirror};
use neuron_types::{short_key, Peer, PeerIndex, WeightSubmission, WeightVector};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout_at, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::book::ScoreBook;
use crate::challenge::{Answer, Challenge, ChallengeSource, PeerQuerier};
use crate::contest::ContestConfig;
use crate::rubric::Rubric;
use crate::sampling::SamplingPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// EMA smoothing factor in (0, 1]
    pub alpha: f64,
    pub sampling: SamplingPolicy,
    /// Wall-clock budget for the whole querying phase
    pub epoch_deadline_ms: u64,
    /// Per-challenge timeout, further capped by the remaining epoch budget
    pub query_timeout_ms: u64,
    pub epoch_interval_secs: u64,
    pub challenges_per_epoch: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            sampling: SamplingPolicy::All,
            epoch_deadline_ms: 120_000,
            query_timeout_ms: 30_000,
            epoch_interval_secs: 360,
            challenges_per_epoch: 5,
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<(), EpochError> {
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(EpochError::InvalidConfig(format!(
                "alpha must be in (0, 1], got {}",
                self.alpha
            )));
        }
        if self.epoch_deadline_ms == 0 || self.query_timeout_ms == 0 {
            return Err(EpochError::InvalidConfig(
                "epoch deadline and query timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EpochPhase {
    Idle,
    Querying,
    Aggregating,
    Committing,
}

impl EpochPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpochPhase::Idle => "idle",
            EpochPhase::Querying => "querying",
            EpochPhase::Aggregating => "aggregating",
            EpochPhase::Committing => "committing",
        }
    }
}

impl fmt::Display for EpochPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum EpochError {
    #[error("invalid scoring configuration: {0}")]
    InvalidConfig(String),

    #[error("network snapshot is empty")]
    EmptySnapshot,

    #[error("network snapshot is stale")]
    StaleSnapshot,

    #[error("no challenges for this epoch")]
    NoChallenges,

    #[error("signing key unavailable: {0}")]
    Key(#[from] KeyError),

    #[error("weight commit failed: {0}")]
    Commit(#[from] LedgerError),
}

/// What one completed epoch did.
#[derive(Debug, Clone, Serialize)]
pub struct EpochReport {
    pub epoch: u64,
    pub block: u64,
    pub sampled: Vec<PeerIndex>,
    /// Mean rubric score per sampled peer
    pub epoch_scores: BTreeMap<PeerIndex, f64>,
    /// Challenges answered and scored, per sampled peer
    pub answered: BTreeMap<PeerIndex, usize>,
    /// Peers scored zero because their submission was missing, ineligible or
    /// failed its benchmark
    pub disqualified: Vec<PeerIndex>,
    pub weights: WeightVector,
}

struct PeerOutcome {
    index: PeerIndex,
    scores: Vec<f64>,
    disqualified: bool,
}

/// Validator scoring loop.
///
/// Score state is written only at the end of the aggregating phase, so an
/// epoch aborted while querying leaves the book untouched.
pub struct EpochEngine {
    keystore: Arc<Keystore>,
    mirror: Arc<SnapshotMirror>,
    querier: Arc<dyn PeerQuerier>,
    rubric: Arc<dyn Rubric>,
    challenges: Arc<dyn ChallengeSource>,
    ledger: Arc<dyn LedgerWriter>,
    config: ScoringConfig,
    contest: Option<ContestConfig>,
    book: Mutex<ScoreBook>,
    phase: RwLock<EpochPhase>,
    epoch: Mutex<u64>,
    rng: Mutex<StdRng>,
}

impl EpochEngine {
    pub fn new(
        keystore: Arc<Keystore>,
        mirror: Arc<SnapshotMirror>,
        querier: Arc<dyn PeerQuerier>,
        rubric: Arc<dyn Rubric>,
        challenges: Arc<dyn ChallengeSource>,
        ledger: Arc<dyn LedgerWriter>,
        config: ScoringConfig,
    ) -> Result<Self, EpochError> {
        config.validate()?;
        Ok(Self {
            keystore,
            mirror,
            querier,
            rubric,
            challenges,
            ledger,
            config,
            contest: None,
            book: Mutex::new(ScoreBook::new()),
            phase: RwLock::new(EpochPhase::Idle),
            epoch: Mutex::new(0),
            rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    /// Start from previously accumulated scores.
    pub fn with_book(self, book: ScoreBook) -> Self {
        *self.book.lock() = book;
        self
    }

    /// Challenge only peers whose submission is eligible for `contest`, and
    /// let the rubric review each admitted submission.
    pub fn with_contest(mut self, contest: ContestConfig) -> Self {
        self.contest = Some(contest);
        self
    }

    pub fn with_rng(self, rng: StdRng) -> Self {
        *self.rng.lock() = rng;
        self
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn phase(&self) -> EpochPhase {
        *self.phase.read()
    }

    pub fn book(&self) -> ScoreBook {
        self.book.lock().clone()
    }

    fn set_phase(&self, phase: EpochPhase) {
        *self.phase.write() = phase;
        debug!(phase = %phase, "epoch phase");
    }

    /// Run one full epoch. The engine is back in `Idle` when this returns,
    /// whatever the outcome.
    pub async fn run_epoch(&self) -> Result<EpochReport, EpochError> {
        let started = Instant::now();
        let result = self.run_phases().await;
        self.set_phase(EpochPhase::Idle);

        let outcome = match &result {
            Ok(_) => "committed",
            Err(EpochError::Commit(_)) | Err(EpochError::Key(KeyError::Rotated { .. })) => {
                "commit_failed"
            }
            Err(_) => "aborted",
        };
        counter!("neuron_epochs_total", "outcome" => outcome).increment(1);
        histogram!("neuron_epoch_seconds").record(started.elapsed().as_secs_f64());
        result
    }

    async fn run_phases(&self) -> Result<EpochReport, EpochError> {
        // Querying
        self.set_phase(EpochPhase::Querying);
        let status = self.mirror.status();
        if status.snapshot.is_empty() {
            return Err(EpochError::EmptySnapshot);
        }
        if status.stale {
            return Err(EpochError::StaleSnapshot);
        }
        let snapshot = status.snapshot;
        let signer = self.keystore.signer()?;
        let self_key = signer.public_key();

        let challenges = self.challenges.challenges(snapshot.block());
        if challenges.is_empty() {
            return Err(EpochError::NoChallenges);
        }
        self.rubric.begin_epoch();
        let sampled = {
            let mut rng = self.rng.lock();
            self.config
                .sampling
                .select(&snapshot, &self_key, &mut *rng)
        };
        let epoch = {
            let mut epoch = self.epoch.lock();
            *epoch += 1;
            *epoch
        };
        info!(
            epoch,
            block = snapshot.block(),
            peers = sampled.len(),
            challenges = challenges.len(),
            "epoch started"
        );

        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.config.epoch_deadline_ms);
        let outcomes = join_all(
            sampled
                .iter()
                .map(|peer| self.challenge_peer(peer, &challenges, deadline)),
        )
        .await;

        // Aggregating
        self.set_phase(EpochPhase::Aggregating);
        let challenge_count = challenges.len() as f64;
        let mut epoch_scores = BTreeMap::new();
        let mut answered = BTreeMap::new();
        let mut disqualified = Vec::new();
        for outcome in outcomes {
            let mean = outcome.scores.iter().sum::<f64>() / challenge_count;
            epoch_scores.insert(outcome.index, mean);
            answered.insert(outcome.index, outcome.scores.len());
            if outcome.disqualified {
                disqualified.push(outcome.index);
            }
        }
        let weights = {
            let mut book = self.book.lock();
            let scores: HashMap<PeerIndex, f64> =
                epoch_scores.iter().map(|(index, score)| (*index, *score)).collect();
            book.apply_epoch(&snapshot, &scores, self.config.alpha);
            book.weights()
        };

        // Committing
        self.set_phase(EpochPhase::Committing);
        let validator = signer.public_key();
        let signature =
            signer.sign(&WeightSubmission::signing_bytes(&validator, snapshot.block(), &weights))?;
        let submission = WeightSubmission {
            validator,
            block: snapshot.block(),
            weights: weights.clone(),
            signature,
        };
        self.ledger.submit_weights(&submission).await?;

        for (index, weight) in weights.iter() {
            gauge!("neuron_peer_weight", "peer" => index.to_string()).set(weight);
        }
        info!(
            epoch,
            block = snapshot.block(),
            validator = %short_key(&validator),
            weights = weights.len(),
            "weights committed"
        );

        Ok(EpochReport {
            epoch,
            block: snapshot.block(),
            sampled: sampled.iter().map(|peer| peer.index).collect(),
            epoch_scores,
            answered,
            disqualified,
            weights,
        })
    }

    /// Issue every challenge to `peer` in order. Returns the scores of the
    /// challenges that were answered and scored before the deadline.
    async fn challenge_peer(
        &self,
        peer: &Peer,
        challenges: &[Challenge],
        deadline: tokio::time::Instant,
    ) -> PeerOutcome {
        let per_query = Duration::from_millis(self.config.query_timeout_ms);
        let mut outcome = PeerOutcome {
            index: peer.index,
            scores: Vec::with_capacity(challenges.len()),
            disqualified: false,
        };

        let submission = match &self.contest {
            Some(contest) => {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                let admit = contest.admit(self.querier.as_ref(), peer, per_query.min(remaining));
                match timeout_at(deadline, admit).await {
                    Ok(Ok(submission)) => Some(submission),
                    Ok(Err(rejection)) => {
                        debug!(peer = peer.index, reason = %rejection, "submission rejected");
                        counter!("neuron_submissions_total", "outcome" => rejection.as_str()).increment(1);
                        outcome.disqualified = true;
                        return outcome;
                    }
                    Err(_) => {
                        debug!(peer = peer.index, "epoch deadline reached while fetching submission");
                        outcome.disqualified = true;
                        return outcome;
                    }
                }
            }
            None => None,
        };

        let mut answers = Vec::new();
        for challenge in challenges {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                debug!(peer = peer.index, "epoch deadline reached");
                break;
            }

            let started = tokio::time::Instant::now();
            let query = self.querier.query(peer, challenge, per_query.min(remaining));
            let payload = match timeout_at(deadline, query).await {
                Ok(Ok(payload)) => payload,
                Ok(Err(err)) => {
                    debug!(peer = peer.index, kind = %challenge.kind, error = %err, "challenge failed");
                    continue;
                }
                Err(_) => {
                    debug!(peer = peer.index, "epoch deadline reached while querying");
                    break;
                }
            };
            let answer = Answer {
                payload,
                latency: started.elapsed(),
            };

            match timeout_at(deadline, self.rubric.score(peer, challenge, &answer)).await {
                Ok(Ok(score)) if score.is_finite() => {
                    outcome.scores.push(score.clamp(0.0, 1.0));
                    if submission.is_some() {
                        answers.push((challenge.clone(), answer));
                    }
                }
                Ok(Ok(_)) => debug!(peer = peer.index, "rubric returned a non-finite score"),
                Ok(Err(err)) => debug!(peer = peer.index, error = %err, "response not scorable"),
                Err(_) => {
                    debug!(peer = peer.index, "epoch deadline reached while scoring");
                    break;
                }
            }
        }

        if let Some(submission) = submission {
            let passed = if answers.is_empty() {
                false
            } else {
                match timeout_at(deadline, self.rubric.review(peer, &submission, &answers)).await {
                    Ok(Ok(passed)) => passed,
                    Ok(Err(err)) => {
                        debug!(peer = peer.index, error = %err, "submission review failed");
                        false
                    }
                    Err(_) => {
                        debug!(peer = peer.index, "epoch deadline reached while reviewing");
                        false
                    }
                }
            };
            counter!("neuron_submissions_total", "outcome" => if passed { "passed" } else { "failed" })
                .increment(1);
            if !passed {
                info!(
                    peer = peer.index,
                    repository = %submission.repository,
                    "submission failed review"
                );
                outcome.scores.clear();
                outcome.disqualified = true;
            }
        }

        outcome
    }

    /// Run epochs on a fixed interval until `shutdown` flips to `true` or its
    /// sender is dropped. Failed epochs are retried on the next tick; an epoch
    /// in flight at shutdown is abandoned.
    pub fn spawn_epoch_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.epoch_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs(), "epoch loop started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_requested(&mut shutdown) => break,
                }
                tokio::select! {
                    result = self.run_epoch() => match result {
                        Ok(report) => debug!(epoch = report.epoch, "epoch complete"),
                        Err(EpochError::Commit(err)) => {
                            warn!(error = %err, "weight commit failed; scores kept for next epoch");
                        }
                        Err(err) => warn!(error = %err, "epoch aborted"),
                    },
                    _ = shutdown_requested(&mut shutdown) => {
                        self.set_phase(EpochPhase::Idle);
                        info!("epoch abandoned at shutdown");
                        break;
                    }
                }
            }
            info!("epoch loop stopped");
        })
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use neuron_crypto::KeyPair;
    use neuron_network::{MemoryLedger, MirrorConfig};
    use neuron_rpc::ClientError;
    use neuron_types::RequestKind;

    use neuron_types::CheckpointSubmission;

    use crate::challenge::StaticChallenges;
    use crate::rubric::RubricError;

    /// Answers with the peer index; the rubric turns it into a score.
    struct IndexQuerier;

    #[async_trait]
    impl PeerQuerier for IndexQuerier {
        async fn query(
            &self,
            peer: &Peer,
            _challenge: &Challenge,
            _timeout: Duration,
        ) -> Result<Vec<u8>, ClientError> {
            if peer.index == 3 {
                return Err(ClientError::Timeout);
            }
            Ok(vec![peer.index as u8])
        }
    }

    /// index 1 scores 1.0, index 2 scores 0.5
    struct ByIndex;

    #[async_trait]
    impl Rubric for ByIndex {
        async fn score(
            &self,
            _peer: &Peer,
            _challenge: &Challenge,
            answer: &Answer,
        ) -> Result<f64, RubricError> {
            match answer.payload.as_slice() {
                [1] => Ok(1.0),
                [2] => Ok(0.5),
                _ => Err(RubricError::Malformed("unexpected".into())),
            }
        }
    }

    /// Sleeps far past whatever timeout it is given.
    struct Unresponsive;

    #[async_trait]
    impl PeerQuerier for Unresponsive {
        async fn query(
            &self,
            _peer: &Peer,
            _challenge: &Challenge,
            _timeout: Duration,
        ) -> Result<Vec<u8>, ClientError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![1])
        }
    }

    /// Serves a submission for peer 1 (eligible) and peer 2 (the baseline),
    /// otherwise behaves like [`IndexQuerier`].
    struct ContestQuerier;

    #[async_trait]
    impl PeerQuerier for ContestQuerier {
        async fn query(
            &self,
            peer: &Peer,
            challenge: &Challenge,
            timeout: Duration,
        ) -> Result<Vec<u8>, ClientError> {
            if challenge.kind != RequestKind::SUBMISSION || peer.index == 3 {
                return IndexQuerier.query(peer, challenge, timeout).await;
            }
            let repository = if peer.index == 1 { "miner/fast" } else { "baseline/model" };
            Ok(CheckpointSubmission::new(repository, 1.0, 0).to_bytes().unwrap())
        }
    }

    struct Fixture {
        engine: EpochEngine,
        ledger: Arc<MemoryLedger>,
        keystore: Arc<Keystore>,
    }

    async fn fixture() -> Fixture {
        fixture_with(
            Arc::new(IndexQuerier),
            Arc::new(ByIndex),
            ScoringConfig {
                alpha: 1.0,
                ..Default::default()
            },
        )
        .await
    }

    async fn fixture_with(
        querier: Arc<dyn PeerQuerier>,
        rubric: Arc<dyn Rubric>,
        config: ScoringConfig,
    ) -> Fixture {
        let validator = KeyPair::generate();
        let ledger = Arc::new(MemoryLedger::default());
        ledger.register(0, validator.public_key(), 50, None);
        for index in 1..=3u16 {
            ledger.register(index, [index as u8; 32], 10, None);
        }
        ledger.advance_block(10);
        let mirror = Arc::new(SnapshotMirror::new(ledger.clone(), MirrorConfig::default()));
        mirror.refresh().await.unwrap();

        let keystore = Arc::new(Keystore::new(validator));
        let engine = EpochEngine::new(
            keystore.clone(),
            mirror,
            querier,
            rubric,
            Arc::new(StaticChallenges(vec![
                Challenge::new(RequestKind::OPTIMIZE, b"a".to_vec()),
                Challenge::new(RequestKind::OPTIMIZE, b"b".to_vec()),
            ])),
            ledger.clone(),
            config,
        )
        .unwrap();
        Fixture {
            engine,
            ledger,
            keystore,
        }
    }

    #[tokio::test]
    async fn epoch_scores_and_commits() {
        let fx = fixture().await;
        let report = fx.engine.run_epoch().await.unwrap();
        assert_eq!(fx.engine.phase(), EpochPhase::Idle);

        assert_eq!(report.block, 10);
        assert_eq!(report.sampled, vec![1, 2, 3]);
        assert_eq!(report.epoch_scores[&1], 1.0);
        assert_eq!(report.epoch_scores[&2], 0.5);
        assert_eq!(report.epoch_scores[&3], 0.0);
        assert_eq!(report.answered[&3], 0);

        let submissions = fx.ledger.submissions();
        assert_eq!(submissions.len(), 1);
        let submission = &submissions[0];
        assert_eq!(submission.validator, fx.keystore.public_identifier().unwrap());
        neuron_crypto::verify_signature(
            &submission.validator,
            &submission.message(),
            &submission.signature,
        )
        .unwrap();
        assert!((submission.weights.get(1) - 2.0 / 3.0).abs() < 1e-9);
        assert!((submission.weights.get(2) - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(submission.weights.get(3), 0.0);
    }

    #[tokio::test]
    async fn unresponsive_query_is_cut_off_at_the_epoch_deadline() {
        let fx = fixture_with(
            Arc::new(Unresponsive),
            Arc::new(ByIndex),
            ScoringConfig {
                epoch_deadline_ms: 300,
                query_timeout_ms: 10_000,
                ..Default::default()
            },
        )
        .await;
        let started = Instant::now();
        let report = fx.engine.run_epoch().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
        assert!(report.answered.values().all(|answered| *answered == 0));
        assert_eq!(fx.ledger.submissions().len(), 1);
    }

    #[tokio::test]
    async fn rubric_sees_measured_round_trip() {
        /// Answers after 150ms.
        struct Delayed;

        #[async_trait]
        impl PeerQuerier for Delayed {
            async fn query(
                &self,
                peer: &Peer,
                _challenge: &Challenge,
                _timeout: Duration,
            ) -> Result<Vec<u8>, ClientError> {
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok(vec![peer.index as u8])
            }
        }

        /// Full marks only for answers that took at least 150ms.
        struct Latency;

        #[async_trait]
        impl Rubric for Latency {
            async fn score(
                &self,
                _peer: &Peer,
                _challenge: &Challenge,
                answer: &Answer,
            ) -> Result<f64, RubricError> {
                Ok(if answer.latency >= Duration::from_millis(150) { 1.0 } else { 0.0 })
            }
        }

        let fx = fixture_with(Arc::new(Delayed), Arc::new(Latency), ScoringConfig::default()).await;
        let report = fx.engine.run_epoch().await.unwrap();
        assert_eq!(report.epoch_scores[&1], 1.0);
        assert_eq!(report.epoch_scores[&3], 1.0);
    }

    #[tokio::test]
    async fn contest_mode_scores_only_admitted_peers() {
        let fx = fixture_with(
            Arc::new(ContestQuerier),
            Arc::new(ByIndex),
            ScoringConfig {
                alpha: 1.0,
                ..Default::default()
            },
        )
        .await;
        let engine = fx.engine.with_contest(ContestConfig {
            contest: 0,
            baseline_repository: "baseline/model".into(),
        });
        let report = engine.run_epoch().await.unwrap();
        assert_eq!(report.epoch_scores[&1], 1.0);
        assert_eq!(report.epoch_scores[&2], 0.0);
        assert_eq!(report.answered[&2], 0);
        assert_eq!(report.disqualified, vec![2, 3]);
        assert_eq!(fx.ledger.submissions()[0].weights.get(1), 1.0);
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_running_epoch() {
        let fx = fixture_with(
            Arc::new(Unresponsive),
            Arc::new(ByIndex),
            ScoringConfig {
                epoch_deadline_ms: 60_000,
                query_timeout_ms: 60_000,
                ..Default::default()
            },
        )
        .await;
        let engine = Arc::new(fx.engine);
        let (stop, shutdown) = watch::channel(false);
        let handle = Arc::clone(&engine).spawn_epoch_loop(shutdown);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.phase(), EpochPhase::Querying);
        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("epoch loop ignored shutdown")
            .unwrap();
        assert_eq!(engine.phase(), EpochPhase::Idle);
        assert!(fx.ledger.submissions().is_empty());
    }

    #[tokio::test]
    async fn commit_failure_keeps_scores() {
        let fx = fixture().await;
        fx.ledger.fail_writes(Some("ledger busy"));
        let err = fx.engine.run_epoch().await.unwrap_err();
        assert!(matches!(err, EpochError::Commit(_)));
        assert_eq!(fx.engine.phase(), EpochPhase::Idle);
        assert_eq!(fx.engine.book().ema(1), 1.0);
        assert!(fx.ledger.submissions().is_empty());
    }

    #[tokio::test]
    async fn missing_key_aborts_without_state_change() {
        let fx = fixture().await;
        let engine = EpochEngine {
            keystore: Arc::new(Keystore::empty()),
            ..fx.engine
        };
        let err = engine.run_epoch().await.unwrap_err();
        assert!(matches!(err, EpochError::Key(KeyError::KeyUnavailable)));
        assert!(engine.book().is_empty());
        assert!(fx.ledger.submissions().is_empty());
    }

    #[tokio::test]
    async fn empty_snapshot_aborts() {
        let ledger = Arc::new(MemoryLedger::default());
        let engine = EpochEngine::new(
            Arc::new(Keystore::new(KeyPair::generate())),
            Arc::new(SnapshotMirror::new(ledger.clone(), MirrorConfig::default())),
            Arc::new(IndexQuerier),
            Arc::new(ByIndex),
            Arc::new(StaticChallenges::default()),
            ledger,
            ScoringConfig::default(),
        )
        .unwrap();
        assert!(matches!(
            engine.run_epoch().await,
            Err(EpochError::EmptySnapshot)
        ));
    }

    #[tokio::test]
    async fn stale_snapshot_aborts() {
        let fx = fixture().await;
        let ledger = fx.ledger.clone();
        let mirror = Arc::new(SnapshotMirror::new(
            ledger.clone(),
            MirrorConfig {
                stale_after: Duration::ZERO,
                ..Default::default()
            },
        ));
        mirror.refresh().await.unwrap();
        let engine = EpochEngine { mirror, ..fx.engine };
        assert!(matches!(
            engine.run_epoch().await,
            Err(EpochError::StaleSnapshot)
        ));
        assert!(engine.book().is_empty());
    }

    #[test]
    fn alpha_is_validated() {
        for alpha in [0.0, -0.5, 1.5, f64::NAN] {
            let config = ScoringConfig {
                alpha,
                ..Default::default()
            };
            assert!(config.validate().is_err());
        }
        assert!(ScoringConfig::default().validate().is_ok());
    }
}
