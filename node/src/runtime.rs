//! Wiring for the miner and validator roles.

use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use neuron_crypto::{KeyFile, KeyPair, Keystore};
use neuron_network::{HttpLedger, LedgerReader, LedgerWriter, MemoryLedger, SnapshotMirror};
use neuron_rpc::{
    bind_listener, CommandPipeline, PipelineHandler, SubmissionHandler, TransportClient,
    TransportServer,
};
use neuron_scoring::{CheckpointRubric, EpochEngine, GenerationChallenges};
use neuron_security::AdmissionGuard;
use neuron_types::{short_key, Endpoint, RequestKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::AppConfig;

/// Environment variable holding the key file password.
pub const PASSWORD_ENV: &str = "NEURON_KEY_PASSWORD";

/// Decrypt the node identity from its key file.
pub fn load_identity(path: &Path) -> Result<KeyPair> {
    let keyfile = KeyFile::load(path)
        .with_context(|| format!("failed to read key file {}", path.display()))?;
    let password = std::env::var(PASSWORD_ENV).ok();
    if keyfile.is_encrypted() && password.is_none() {
        anyhow::bail!(
            "key file {} is encrypted; set {PASSWORD_ENV}",
            path.display()
        );
    }
    let keypair = keyfile
        .unlock(password.as_deref())
        .with_context(|| format!("failed to unlock key file {}", path.display()))?;
    info!(public_key = %short_key(&keypair.public_key()), "identity loaded");
    Ok(keypair)
}

/// Shared plumbing both roles start from.
struct NodeContext {
    config: AppConfig,
    keystore: Arc<Keystore>,
    mirror: Arc<SnapshotMirror>,
    writer: Arc<dyn LedgerWriter>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeContext {
    async fn start(config: AppConfig, keypair: KeyPair) -> Result<Self> {
        let public_key = keypair.public_key();
        let keystore = Arc::new(Keystore::new(keypair));

        let (reader, writer): (Arc<dyn LedgerReader>, Arc<dyn LedgerWriter>) =
            match &config.ledger.url {
                Some(url) => {
                    let ledger = Arc::new(HttpLedger::new(url.clone(), config.ledger.timeout())?);
                    info!(url = %ledger.base_url(), "using ledger gateway");
                    (ledger.clone(), ledger)
                }
                None => {
                    let ledger = Arc::new(MemoryLedger::default());
                    let endpoint = advertised_endpoint(&config.server.listen_addr);
                    ledger.register(config.ledger.dev_index, public_key, 1, endpoint);
                    ledger.advance_block(1);
                    warn!(
                        index = config.ledger.dev_index,
                        "no ledger.url configured; running against an in-process ledger"
                    );
                    (ledger.clone(), ledger)
                }
            };

        let mirror = Arc::new(SnapshotMirror::new(reader, config.mirror_config()));
        if let Err(err) = mirror.refresh().await {
            warn!(error = %err, "initial network sync failed; starting with an empty snapshot");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            Arc::clone(&mirror).spawn_sync_loop(shutdown_rx.clone()),
            spawn_registration_watch(Arc::clone(&keystore), Arc::clone(&mirror), shutdown_rx),
        ];
        confirm_registration(&keystore, &mirror);

        Ok(Self {
            config,
            keystore,
            mirror,
            writer,
            shutdown_tx,
            tasks,
        })
    }

    fn server(&self, metrics: Option<PrometheusHandle>) -> Result<TransportServer> {
        let guard = Arc::new(AdmissionGuard::new(self.config.security.clone())?);
        let server = TransportServer::new(
            Arc::clone(&self.keystore),
            Arc::clone(&self.mirror),
            guard,
            self.config.server.clone(),
        );
        Ok(match metrics {
            Some(handle) => server.with_metrics(handle),
            None => server,
        })
    }

    async fn spawn_server(&mut self, server: TransportServer) -> Result<()> {
        let listener = bind_listener(&self.config.server.listen_addr).await?;
        let mut shutdown = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            let stop = async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            };
            if let Err(err) = server.serve(listener, stop).await {
                warn!(error = %err, "transport server stopped with error");
            }
        }));
        Ok(())
    }

    async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "background task panicked");
            }
        }
        info!("neuron stopped");
    }
}

/// Where peers can reach a server bound to `listen_addr`.
pub(crate) fn advertised_endpoint(listen_addr: &str) -> Option<Endpoint> {
    let endpoint = Endpoint::from_str(listen_addr).ok()?;
    if endpoint.host == "0.0.0.0" || endpoint.host == "::" {
        Some(Endpoint::new("127.0.0.1", endpoint.port))
    } else {
        Some(endpoint)
    }
}

fn confirm_registration(keystore: &Keystore, mirror: &SnapshotMirror) {
    let Ok(public_key) = keystore.public_identifier() else {
        return;
    };
    let snapshot = mirror.current_snapshot();
    match snapshot.by_key(&public_key) {
        Some(peer) if keystore.registered_index() != Some(peer.index) => {
            keystore.confirm_registration(peer.index);
            info!(index = peer.index, block = snapshot.block(), "registration confirmed");
        }
        Some(_) => {}
        None if keystore.registered_index().is_some() => {
            warn!(block = snapshot.block(), "identity no longer registered");
        }
        None => {}
    }
}

fn spawn_registration_watch(
    keystore: Arc<Keystore>,
    mirror: Arc<SnapshotMirror>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let period = mirror.config().sync_interval;
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => confirm_registration(&keystore, &mirror),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// Serve the optimization pipeline and the current submission until
/// `stop` resolves.
pub async fn run_miner(
    config: AppConfig,
    keypair: KeyPair,
    metrics: Option<PrometheusHandle>,
    stop: impl Future<Output = Result<()>>,
) -> Result<()> {
    let mut node = NodeContext::start(config, keypair).await?;

    let mut server = node.server(metrics)?;
    let pipeline = CommandPipeline::new(node.config.miner.pipeline.clone());
    server.register_handler(RequestKind::OPTIMIZE, Arc::new(PipelineHandler::new(pipeline)))?;

    let submission = node
        .config
        .miner
        .submission
        .as_ref()
        .map(|section| section.to_submission());
    if let Some(submission) = &submission {
        info!(
            repository = %submission.repository,
            contest = submission.contest,
            commitment = %submission.to_hex()?,
            "serving checkpoint submission"
        );
    }
    server.register_handler(
        RequestKind::SUBMISSION,
        Arc::new(SubmissionHandler::new(submission)),
    )?;

    node.spawn_server(server).await?;
    info!(listen = %node.config.server.listen_addr, "miner started");

    let result = stop.await;
    node.shutdown().await;
    result
}

/// Score peers every epoch until `stop` resolves, or run a single epoch when
/// `once` is set.
pub async fn run_validator(
    config: AppConfig,
    keypair: KeyPair,
    metrics: Option<PrometheusHandle>,
    once: bool,
    stop: impl Future<Output = Result<()>>,
) -> Result<()> {
    let mut node = NodeContext::start(config, keypair).await?;

    let scoring = node.config.validator.scoring.clone();
    let client = TransportClient::new(Arc::clone(&node.keystore), node.config.client.clone())?;
    let baseline = CommandPipeline::new(node.config.validator.baseline.clone());
    let mut engine = EpochEngine::new(
        Arc::clone(&node.keystore),
        Arc::clone(&node.mirror),
        Arc::new(client),
        Arc::new(CheckpointRubric::new(baseline)),
        Arc::new(GenerationChallenges::new(scoring.challenges_per_epoch)),
        Arc::clone(&node.writer),
        scoring,
    )?;
    if let Some(contest) = node.config.validator.contest.clone() {
        info!(
            contest = contest.contest,
            baseline = %contest.baseline_repository,
            "challenging eligible submissions only"
        );
        engine = engine.with_contest(contest);
    }
    let engine = Arc::new(engine);

    if once {
        let result = engine.run_epoch().await;
        node.shutdown().await;
        let report = result?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let server = node.server(metrics)?;
    node.spawn_server(server).await?;
    node.tasks
        .push(Arc::clone(&engine).spawn_epoch_loop(node.shutdown_tx.subscribe()));
    info!(listen = %node.config.server.listen_addr, "validator started");

    let result = stop.await;
    node.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_listen_address_is_advertised_on_loopback() {
        let endpoint = advertised_endpoint("0.0.0.0:8091").unwrap();
        assert_eq!(endpoint, Endpoint::new("127.0.0.1", 8091));
        assert_eq!(
            advertised_endpoint("10.0.0.5:9000"),
            Some(Endpoint::new("10.0.0.5", 9000))
        );
        assert!(advertised_endpoint("no-port").is_none());
    }

    #[test]
    fn plaintext_key_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.json");
        let (keyfile, keypair) = KeyFile::generate(None, Some("miner".into()), true).unwrap();
        keyfile.save(&path, false).unwrap();

        let loaded = load_identity(&path).unwrap();
        assert_eq!(loaded.public_key(), keypair.public_key());
    }

    #[tokio::test]
    async fn dev_ledger_confirms_own_registration() {
        let mut config = AppConfig::default();
        config.server.listen_addr = "127.0.0.1:0".into();
        config.ledger.dev_index = 3;
        let node = NodeContext::start(config, KeyPair::generate()).await.unwrap();
        assert_eq!(node.keystore.registered_index(), Some(3));
        assert_eq!(node.mirror.current_snapshot().block(), 1);
        node.shutdown().await;
    }
}
