use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File as ConfigFile};
use neuron_network::MirrorConfig;
use neuron_rpc::{ClientConfig, CommandConfig, ServerConfig};
use neuron_scoring::{ContestConfig, ScoringConfig};
use neuron_security::SecurityConfig;
use neuron_types::{CheckpointSubmission, ContestId};
use serde::{Deserialize, Serialize};

pub const ENV_PREFIX: &str = "NEURON";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub node: NodeSection,
    pub ledger: LedgerSection,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub security: SecurityConfig,
    pub mirror: MirrorSection,
    pub validator: ValidatorSection,
    pub miner: MinerSection,
    pub logging: LoggingSection,
    pub metrics: MetricsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub key_file: PathBuf,
}

impl Default for NodeSection {
    fn default() -> Self {
        let base = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            key_file: base.join(".neuron").join("key.json"),
        }
    }
}

/// Where the registry lives. Without a URL the node runs against an
/// in-process ledger holding only itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSection {
    pub url: Option<String>,
    pub timeout_ms: u64,
    /// Index claimed in the in-process ledger.
    pub dev_index: u16,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: 5_000,
            dev_index: 0,
        }
    }
}

impl LedgerSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorSection {
    pub sync_interval_secs: u64,
    pub stale_after_secs: u64,
}

impl Default for MirrorSection {
    fn default() -> Self {
        let defaults = MirrorConfig::default();
        Self {
            sync_interval_secs: defaults.sync_interval.as_secs(),
            stale_after_secs: defaults.stale_after.as_secs(),
        }
    }
}

impl MirrorSection {
    pub fn to_mirror_config(&self) -> MirrorConfig {
        MirrorConfig {
            sync_interval: Duration::from_secs(self.sync_interval_secs.max(1)),
            stale_after: Duration::from_secs(self.stale_after_secs),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorSection {
    pub scoring: ScoringConfig,
    /// Reference checkpoint the rubric compares miners against.
    pub baseline: CommandConfig,
    /// When set, only miners with an eligible submission are challenged.
    pub contest: Option<ContestConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerSection {
    pub pipeline: CommandConfig,
    pub submission: Option<SubmissionSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionSection {
    pub repository: String,
    pub average_time: f32,
    #[serde(default)]
    pub contest: ContestId,
}

impl SubmissionSection {
    pub fn to_submission(&self) -> CheckpointSubmission {
        CheckpointSubmission::new(self.repository.clone(), self.average_time, self.contest)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    pub enabled: bool,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl AppConfig {
    /// Layer the optional file under `NEURON__SECTION__KEY` environment
    /// variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                bail!(
                    "Configuration file {} not found (specified via --config)",
                    path.display()
                );
            }
            builder = builder.add_source(ConfigFile::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("security.blacklist"),
        );

        let config: AppConfig = builder
            .build()?
            .try_deserialize()
            .context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.validator
            .scoring
            .validate()
            .map_err(|err| anyhow::anyhow!("validator.scoring: {err}"))?;

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            bail!("logging.format must be \"pretty\" or \"json\"");
        }
        if self.server.max_in_flight == 0 {
            bail!("server.max_in_flight must be positive");
        }
        if self.client.request_timeout_ms == 0 {
            bail!("client.request_timeout_ms must be positive");
        }
        if let Some(url) = &self.ledger.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                bail!("ledger.url must be an http(s) URL, got {url}");
            }
        }
        if let Some(contest) = &self.validator.contest {
            if contest.baseline_repository.trim().is_empty() {
                bail!("validator.contest.baseline_repository must not be empty");
            }
        }
        if let Some(submission) = &self.miner.submission {
            submission
                .to_submission()
                .to_bytes()
                .context("miner.submission does not fit the ledger commitment")?;
        }
        Ok(())
    }

    pub fn mirror_config(&self) -> MirrorConfig {
        self.mirror.to_mirror_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_validate() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert!(config.ledger.url.is_none());
        assert_eq!(config.server.listen_addr, "0.0.0.0:8091");
        assert_eq!(config.mirror_config().sync_interval, Duration::from_secs(12));
        assert!(config.node.key_file.ends_with("key.json"));
    }

    #[test]
    fn file_sections_override_defaults() {
        let file = write_config(
            r#"
[ledger]
url = "http://127.0.0.1:9000"

[server]
listen_addr = "127.0.0.1:7000"
max_in_flight = 8

[validator.scoring]
alpha = 0.25
epoch_interval_secs = 60

[validator.scoring.sampling]
mode = "random"
sample_size = 4

[validator.contest]
contest = 2
baseline_repository = "org/baseline"

[miner.submission]
repository = "org/fast-checkpoint"
average_time = 1.5

[logging]
format = "json"
"#,
        );
        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.ledger.url.as_deref(), Some("http://127.0.0.1:9000"));
        assert_eq!(config.server.listen_addr, "127.0.0.1:7000");
        assert_eq!(config.server.max_in_flight, 8);
        assert!((config.validator.scoring.alpha - 0.25).abs() < 1e-9);
        assert_eq!(config.logging.format, "json");
        let contest = config.validator.contest.unwrap();
        assert_eq!(contest.contest, 2);
        assert_eq!(contest.baseline_repository, "org/baseline");
        let submission = config.miner.submission.unwrap().to_submission();
        assert_eq!(submission.repository, "org/fast-checkpoint");
        assert_eq!(submission.contest, 0);
    }

    #[test]
    fn invalid_alpha_is_rejected() {
        let file = write_config("[validator.scoring]\nalpha = 1.5\n");
        assert!(AppConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(AppConfig::load(Some(Path::new("/nonexistent/neuron.toml"))).is_err());
    }

    #[test]
    fn contest_needs_a_baseline_repository() {
        let mut config = AppConfig::default();
        config.validator.contest = Some(ContestConfig {
            contest: 1,
            baseline_repository: " ".into(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        let mut config = AppConfig::default();
        config.logging.format = "xml".into();
        assert!(config.validate().is_err());
    }
}
