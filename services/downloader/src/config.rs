//! Workflow configuration.
//!
//! One YAML file describes the cycle to fetch, how hard to retry, where
//! outputs go afterwards and any extra model definitions.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use cycle_fetch::{ModelDefinition, PoolConfig, WaitPolicy};
use nwp_common::time::parse_cycle;
use nwp_common::{Locator, NwpError, Scheme};
use storage::ObjectStorageConfig;

/// Root of a workflow YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub download: DownloadSection,
    #[serde(default)]
    pub transfer: TransferSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<UploadSection>,
    /// Extra models; an id matching a built-in product replaces it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<ModelDefinition>,
    /// Delete local downloads once the workflow has finished.
    #[serde(default)]
    pub cleanup_downloads: bool,
    #[serde(default)]
    pub storage: ObjectStorageConfig,
}

/// Which cycle to fetch and where to put it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSection {
    pub product: String,
    pub resolution: String,
    /// ISO 8601 cycle time; usually supplied by `--cycle` or `$CYCLE` instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<String>,
    pub max_lead_time: u32,
    pub source_bucket: String,
    /// Mirror into this bucket; download locally when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_bucket: Option<String>,
    #[serde(default)]
    pub destination_prefix: String,
    #[serde(default = "default_local_download_dir")]
    pub local_download_dir: PathBuf,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default = "default_true")]
    pub validate_before_download: bool,
    /// Poll for a partially published cycle instead of failing at once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<WaitSection>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WaitSection {
    pub max_wait_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

/// Retry and concurrency settings for downloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSection {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_item_timeout_secs")]
    pub item_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub verify_after: bool,
    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            retry_backoff_secs: default_retry_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            item_timeout_secs: default_item_timeout_secs(),
            verify_after: true,
            probe_concurrency: default_probe_concurrency(),
        }
    }
}

/// Pushes a local output directory to a bucket after the download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSection {
    pub local_dir: PathBuf,
    pub destination: Locator,
    #[serde(default = "default_upload_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_item_timeout_secs")]
    pub item_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub verify: bool,
}

impl UploadSection {
    pub fn new(local_dir: PathBuf, destination: Locator) -> Self {
        Self {
            local_dir,
            destination,
            concurrency: default_upload_concurrency(),
            max_retries: default_max_retries(),
            item_timeout_secs: default_item_timeout_secs(),
            verify: true,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            concurrency: self.concurrency,
            max_retries: self.max_retries,
            item_timeout: Duration::from_secs(self.item_timeout_secs),
            skip_existing: false,
            verify_after: self.verify,
            ..Default::default()
        }
    }
}

fn default_local_download_dir() -> PathBuf {
    PathBuf::from("/tmp/nwp-data")
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_concurrency() -> usize {
    10
}

fn default_upload_concurrency() -> usize {
    16
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_secs() -> u64 {
    1
}

fn default_max_backoff_secs() -> u64 {
    60
}

fn default_item_timeout_secs() -> u64 {
    600
}

fn default_probe_concurrency() -> usize {
    32
}

impl WorkflowConfig {
    /// Load a workflow from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        info!(
            product = %config.download.product,
            max_lead_time = config.download.max_lead_time,
            path = %path.display(),
            "Loaded workflow config"
        );
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.check()?;
        Ok(config)
    }

    /// Sample workflow written by `init-config`.
    pub fn sample(product: &str, resolution: &str) -> Self {
        Self {
            download: DownloadSection {
                product: product.to_string(),
                resolution: resolution.to_string(),
                cycle: Some("2024-01-01T00:00:00Z".to_string()),
                max_lead_time: 120,
                source_bucket: format!("{}-archive", product),
                destination_bucket: Some("my-bucket".to_string()),
                destination_prefix: "nwp-data/".to_string(),
                local_download_dir: default_local_download_dir(),
                overwrite: false,
                validate_before_download: true,
                wait: None,
            },
            transfer: TransferSection::default(),
            upload: None,
            models: Vec::new(),
            cleanup_downloads: false,
            storage: ObjectStorageConfig::default(),
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config")
    }

    fn check(&self) -> Result<(), NwpError> {
        if self.download.max_lead_time == 0 {
            return Err(NwpError::InvalidConfig("max_lead_time must be > 0".into()));
        }
        if self.transfer.concurrency == 0 || self.transfer.probe_concurrency == 0 {
            return Err(NwpError::InvalidConfig("concurrency must be > 0".into()));
        }
        if self.transfer.max_retries == 0 {
            return Err(NwpError::InvalidConfig("max_retries must be > 0".into()));
        }
        Ok(())
    }

    /// The model for `download.product`, custom definitions first.
    pub fn model(&self) -> Result<ModelDefinition, NwpError> {
        ModelDefinition::lookup(&self.download.product, &self.models)
    }

    /// Pick the cycle: CLI flag, then environment, then the YAML value.
    pub fn resolve_cycle(
        &self,
        cli: Option<&str>,
        env: Option<&str>,
    ) -> Result<DateTime<Utc>, NwpError> {
        let (raw, source) = match (cli, env, self.download.cycle.as_deref()) {
            (Some(c), _, _) => (c, "cli"),
            (None, Some(c), _) => (c, "env"),
            (None, None, Some(c)) => (c, "config"),
            (None, None, None) => {
                return Err(NwpError::InvalidConfig(
                    "no cycle given: use --cycle, $CYCLE or download.cycle".into(),
                ))
            }
        };
        debug!(cycle = raw, source, "Resolved cycle");
        parse_cycle(raw)
    }

    /// Mirror bucket prefix when configured, else the local download directory.
    pub fn destination_root(&self) -> Locator {
        match &self.download.destination_bucket {
            Some(bucket) => Locator::remote(
                Scheme::Gcs,
                bucket.clone(),
                self.download.destination_prefix.trim_matches('/'),
            ),
            None => Locator::local(&self.download.local_download_dir),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        let t = &self.transfer;
        PoolConfig {
            concurrency: t.concurrency,
            max_retries: t.max_retries,
            retry_backoff: Duration::from_secs(t.retry_backoff_secs),
            max_backoff: Duration::from_secs(t.max_backoff_secs),
            item_timeout: Duration::from_secs(t.item_timeout_secs),
            skip_existing: !self.download.overwrite,
            verify_after: t.verify_after,
        }
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        match self.download.wait {
            Some(wait) => WaitPolicy::Poll {
                max_wait: Duration::from_secs(wait.max_wait_secs),
                poll_interval: Duration::from_secs(wait.poll_interval_secs),
            },
            None => WaitPolicy::FailFast,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
download:
  product: gfs
  resolution: 0p25
  max_lead_time: 120
  source_bucket: global-forecast-system
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = WorkflowConfig::from_yaml(MINIMAL).unwrap();

        assert_eq!(config.transfer.concurrency, 10);
        assert_eq!(config.transfer.max_retries, 3);
        assert_eq!(config.transfer.item_timeout_secs, 600);
        assert!(config.download.validate_before_download);
        assert!(!config.download.overwrite);
        assert!(!config.cleanup_downloads);
        assert!(config.upload.is_none());
        assert_eq!(config.destination_root(), Locator::local("/tmp/nwp-data"));
        assert!(matches!(config.wait_policy(), WaitPolicy::FailFast));

        let pool = config.pool_config();
        assert!(pool.skip_existing);
        assert_eq!(pool.retry_backoff, Duration::from_secs(1));
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
download:
  product: ecmwf-ens
  resolution: 0p4
  cycle: "2024-01-15T12:00:00Z"
  max_lead_time: 360
  source_bucket: ecmwf-open-data
  destination_bucket: mirror
  destination_prefix: nwp-data/
  overwrite: true
  wait:
    max_wait_secs: 1800
transfer:
  concurrency: 4
  max_backoff_secs: 30
upload:
  local_dir: /tmp/out
  destination: gs://outputs/zarr
cleanup_downloads: true
"#;
        let config = WorkflowConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.model().unwrap().max_horizon(), 360);
        assert_eq!(config.destination_root().to_string(), "gs://mirror/nwp-data");
        assert!(!config.pool_config().skip_existing);
        assert_eq!(config.pool_config().concurrency, 4);
        assert!(matches!(
            config.wait_policy(),
            WaitPolicy::Poll { max_wait, poll_interval }
                if max_wait == Duration::from_secs(1800) && poll_interval == Duration::from_secs(60)
        ));

        let upload = config.upload.as_ref().unwrap();
        assert_eq!(upload.concurrency, 16);
        assert_eq!(upload.destination.to_string(), "gs://outputs/zarr");
        assert!(upload.pool_config().verify_after);
    }

    #[test]
    fn test_rejects_zero_lead_time() {
        let yaml = MINIMAL.replace("max_lead_time: 120", "max_lead_time: 0");
        assert!(WorkflowConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_cycle_precedence() {
        let mut config = WorkflowConfig::from_yaml(MINIMAL).unwrap();
        assert!(matches!(
            config.resolve_cycle(None, None),
            Err(NwpError::InvalidConfig(_))
        ));

        config.download.cycle = Some("2024-01-15T00:00:00Z".into());
        let from_yaml = config.resolve_cycle(None, None).unwrap();
        let from_env = config.resolve_cycle(None, Some("2024-01-15T06:00:00Z")).unwrap();
        let from_cli = config
            .resolve_cycle(Some("2024-01-15T12:00:00Z"), Some("2024-01-15T06:00:00Z"))
            .unwrap();

        assert_eq!(from_yaml.to_rfc3339(), "2024-01-15T00:00:00+00:00");
        assert_eq!(from_env.to_rfc3339(), "2024-01-15T06:00:00+00:00");
        assert_eq!(from_cli.to_rfc3339(), "2024-01-15T12:00:00+00:00");
    }

    #[test]
    fn test_custom_model_shadows_builtin() {
        let yaml = format!(
            "{}{}",
            MINIMAL,
            r#"
models:
  - id: gfs
    cycles: [0]
    intervals:
      - { start: 0, end: 48, step: 6 }
    source_template: "gs://{bucket}/{date}/f{lead:03}"
    destination_template: "gfs/{date}/f{lead:03}"
"#
        );
        let config = WorkflowConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.model().unwrap().max_horizon(), 48);
    }

    #[test]
    fn test_sample_round_trips() {
        let sample = WorkflowConfig::sample("gfs", "0p25");
        let yaml = sample.to_yaml().unwrap();
        let parsed = WorkflowConfig::from_yaml(&yaml).unwrap();

        assert_eq!(parsed.download.max_lead_time, 120);
        assert_eq!(parsed.download.destination_prefix, "nwp-data/");
        assert!(parsed.model().is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        let err = WorkflowConfig::load(Path::new("/nonexistent/workflow.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
