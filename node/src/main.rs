use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use neuron_crypto::KeyFile;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod runtime;
mod version;

use config::AppConfig;
use runtime::PASSWORD_ENV;
use version::{git_commit_hash, NEURON_VERSION};

fn load_config_with_overrides(matches: &ArgMatches) -> Result<AppConfig> {
    let path = matches.get_one::<PathBuf>("config").map(PathBuf::as_path);
    let mut config = AppConfig::load(path)?;
    apply_overrides(matches, &mut config);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(matches: &ArgMatches, config: &mut AppConfig) {
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.logging.format = format.clone();
    }
    if matches.get_flag("disable-metrics") {
        config.metrics.enabled = false;
    }
    if let Ok(Some(listen)) = matches.try_get_one::<String>("listen") {
        config.server.listen_addr = listen.clone();
    }
    if let Ok(Some(key_file)) = matches.try_get_one::<PathBuf>("key-file") {
        config.node.key_file = key_file.clone();
    }
    if let Ok(Some(url)) = matches.try_get_one::<String>("ledger-url") {
        config.ledger.url = Some(url.clone());
    }
}

fn init_metrics(config: &AppConfig) -> Option<PrometheusHandle> {
    if !config.metrics.enabled {
        info!("Prometheus metrics exporter disabled via configuration");
        return None;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            info!("Prometheus metrics exporter registered");
            describe_counter!(
                "neuron_rpc_requests_total",
                "Inbound requests by kind and outcome"
            );
            describe_histogram!(
                "neuron_rpc_request_seconds",
                "End to end latency of inbound requests"
            );
            describe_histogram!(
                "neuron_rpc_handler_seconds",
                "Time spent inside request handlers"
            );
            describe_counter!(
                "neuron_rpc_client_calls_total",
                "Outbound calls by kind and outcome"
            );
            describe_counter!(
                "neuron_mirror_refresh_total",
                "Network snapshot refreshes by outcome"
            );
            describe_gauge!("neuron_snapshot_block", "Block of the current network snapshot");
            describe_gauge!("neuron_snapshot_peers", "Peers in the current network snapshot");
            describe_counter!("neuron_epochs_total", "Scoring epochs by outcome");
            describe_histogram!("neuron_epoch_seconds", "Duration of scoring epochs");
            describe_gauge!("neuron_peer_weight", "Last committed weight per peer");
            describe_counter!(
                "neuron_submissions_total",
                "Contest submissions by admission or review outcome"
            );
            Some(handle)
        }
        Err(err) => {
            warn!("Failed to install Prometheus metrics exporter: {}", err);
            None
        }
    }
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    Ok(())
}

async fn check_status(url: &str) -> Result<()> {
    let response = reqwest::Client::new().get(url).send().await?;
    let status = response.status();
    let body = response.text().await?;
    println!("GET {url} -> {status}");
    println!("{body}");
    if status.is_success() {
        Ok(())
    } else {
        anyhow::bail!("Health check failed with status {status}")
    }
}

fn status_url(matches: &ArgMatches, config: &AppConfig) -> String {
    if let Some(url) = matches.get_one::<String>("url") {
        return url.clone();
    }
    let base = runtime::advertised_endpoint(&config.server.listen_addr)
        .map(|endpoint| endpoint.base_url())
        .unwrap_or_else(|| format!("http://{}", config.server.listen_addr));
    format!("{base}/health")
}

fn keygen(matches: &ArgMatches, config: &AppConfig) -> Result<()> {
    let path = matches
        .get_one::<PathBuf>("out")
        .cloned()
        .unwrap_or_else(|| config.node.key_file.clone());
    let force = matches.get_flag("force");
    let plaintext = matches.get_flag("plaintext");
    let role = matches.get_one::<String>("role").cloned();

    let password = std::env::var(PASSWORD_ENV).ok().filter(|value| !value.is_empty());
    if password.is_none() && !plaintext {
        anyhow::bail!("set {PASSWORD_ENV} to encrypt the key, or pass --plaintext");
    }

    let (keyfile, keypair) = KeyFile::generate(password.as_deref(), role, plaintext)?;
    keyfile
        .save(&path, force)
        .with_context(|| format!("failed to write {}", path.display()))?;

    println!("Wrote key file {}", path.display());
    println!("Public key: {}", hex::encode(keypair.public_key()));
    if !keyfile.is_encrypted() {
        println!("WARNING: the private key is stored unencrypted");
    }
    Ok(())
}

fn role_command(name: &'static str, about: &'static str) -> Command {
    Command::new(name)
        .about(about)
        .arg(
            Arg::new("listen")
                .long("listen")
                .value_name("ADDR")
                .help("Address the transport server binds to"),
        )
        .arg(
            Arg::new("key-file")
                .long("key-file")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Key file holding the node identity"),
        )
        .arg(
            Arg::new("ledger-url")
                .long("ledger-url")
                .value_name("URL")
                .help("Ledger gateway; omit to run against an in-process ledger"),
        )
}

fn cli() -> Command {
    Command::new("neuron")
        .version(NEURON_VERSION)
        .about("Neuron miner and validator")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Configuration file path")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log filter, e.g. info or neuron_rpc=debug")
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["pretty", "json"])
                .help("Log output format")
                .global(true),
        )
        .arg(
            Arg::new("disable-metrics")
                .long("disable-metrics")
                .action(ArgAction::SetTrue)
                .help("Do not install the Prometheus exporter")
                .global(true),
        )
        .subcommand(role_command(
            "miner",
            "Serve the optimization pipeline to validators",
        ))
        .subcommand(
            role_command("validator", "Challenge miners and commit weights").arg(
                Arg::new("once")
                    .long("once")
                    .action(ArgAction::SetTrue)
                    .help("Run a single epoch, print its report and exit"),
            ),
        )
        .subcommand(
            Command::new("keygen")
                .about("Generate a node identity")
                .arg(
                    Arg::new("out")
                        .long("out")
                        .value_name("FILE")
                        .value_parser(value_parser!(PathBuf))
                        .help("Where to write the key file (default: node.key_file)"),
                )
                .arg(
                    Arg::new("force")
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Overwrite an existing key file"),
                )
                .arg(
                    Arg::new("plaintext")
                        .long("plaintext")
                        .action(ArgAction::SetTrue)
                        .help("Allow storing the key without a password"),
                )
                .arg(
                    Arg::new("role")
                        .long("role")
                        .value_name("ROLE")
                        .help("Free-form label stored with the key"),
                ),
        )
        .subcommand(
            Command::new("status")
                .about("Query the health endpoint of a running neuron")
                .arg(
                    Arg::new("url")
                        .long("url")
                        .value_name("URL")
                        .help("Health URL (default: derived from server.listen_addr)"),
                ),
        )
}

async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    match matches.subcommand() {
        Some(("keygen", sub)) => {
            let config = load_config_with_overrides(sub)?;
            keygen(sub, &config)
        }
        Some(("status", sub)) => {
            let config = load_config_with_overrides(sub)?;
            check_status(&status_url(sub, &config)).await
        }
        Some((role @ ("miner" | "validator"), sub)) => {
            let config = load_config_with_overrides(sub)?;
            init_logging(&config)?;
            info!(
                version = NEURON_VERSION,
                commit = git_commit_hash(),
                role,
                "starting neuron"
            );
            let metrics = init_metrics(&config);
            let keypair = runtime::load_identity(&config.node.key_file)?;

            if role == "miner" {
                runtime::run_miner(config, keypair, metrics, shutdown_signal()).await
            } else {
                let once = sub.get_flag("once");
                runtime::run_validator(config, keypair, metrics, once, shutdown_signal()).await
            }
        }
        _ => Ok(()),
    }
}
