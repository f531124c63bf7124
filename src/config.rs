//! Node configuration, loaded from TOML.
//!
//! ```toml
//! node_id = "node-1"
//! data_dir = "/var/lib/shopping-cart"
//! ask_timeout_ms = 5000
//!
//! [snapshot]
//! every = 100
//! keep = 3
//!
//! [restart]
//! min_backoff_ms = 200
//! max_backoff_ms = 5000
//! random_factor = 0.1
//! ```
//!
//! Every key is optional; missing keys take the defaults shown.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::directory::ShardDirectoryBuilder;
use crate::error::JournalError;
use crate::live::LiveConfig;
use crate::routing::DEFAULT_NUMBER_OF_SHARDS;
use crate::storage::{Persistence, StorageLayout};
use crate::supervision::RestartPolicy;

/// Errors loading or validating a [`CartConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CartConfig {
    /// This node's identity in the cluster.
    pub node_id: String,
    /// Root of the on-disk layout. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// How long a client call waits for an entity's reply.
    pub ask_timeout_ms: u64,
    /// Idle time after which an entity passivates.
    pub idle_timeout_secs: u64,
    /// Fixed for the lifetime of a cluster.
    pub number_of_shards: u32,
    /// Fixed for the lifetime of the event log.
    pub tag_slices: u32,
    pub mailbox_capacity: usize,
    pub snapshot: SnapshotSection,
    pub restart: RestartSection,
    pub projection: ProjectionSection,
}

impl Default for CartConfig {
    fn default() -> Self {
        Self {
            node_id: "local".into(),
            data_dir: None,
            ask_timeout_ms: 5_000,
            idle_timeout_secs: 300,
            number_of_shards: DEFAULT_NUMBER_OF_SHARDS,
            tag_slices: 5,
            mailbox_capacity: 32,
            snapshot: SnapshotSection::default(),
            restart: RestartSection::default(),
            projection: ProjectionSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSection {
    /// Snapshot after every `every` events; 0 disables snapshots.
    pub every: u64,
    /// Snapshots retained per entity.
    pub keep: usize,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        Self { every: 100, keep: 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartSection {
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub random_factor: f64,
    pub max_restarts: u32,
}

impl Default for RestartSection {
    fn default() -> Self {
        let policy = RestartPolicy::default();
        Self {
            min_backoff_ms: policy.min_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
            random_factor: policy.random_factor,
            max_restarts: policy.max_restarts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionSection {
    pub poll_interval_ms: u64,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub batch_size: usize,
}

impl Default for ProjectionSection {
    fn default() -> Self {
        let live = LiveConfig::default();
        Self {
            poll_interval_ms: live.poll_interval.as_millis() as u64,
            retry_base_delay_ms: live.retry_base_delay.as_millis() as u64,
            retry_max_delay_ms: live.retry_max_delay.as_millis() as u64,
            batch_size: live.batch_size,
        }
    }
}

impl CartConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] on malformed TOML, [`ConfigError::Invalid`]
    /// when a value is out of range.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_owned()));
        if self.node_id.is_empty() {
            return invalid("node_id must not be empty");
        }
        if self.ask_timeout_ms == 0 {
            return invalid("ask_timeout_ms must be positive");
        }
        if self.idle_timeout_secs == 0 {
            return invalid("idle_timeout_secs must be positive");
        }
        if self.number_of_shards == 0 {
            return invalid("number_of_shards must be positive");
        }
        if self.tag_slices == 0 {
            return invalid("tag_slices must be positive");
        }
        if self.mailbox_capacity == 0 {
            return invalid("mailbox_capacity must be positive");
        }
        if self.snapshot.keep == 0 {
            return invalid("snapshot.keep must be at least 1");
        }
        if self.restart.min_backoff_ms > self.restart.max_backoff_ms {
            return invalid("restart.min_backoff_ms exceeds restart.max_backoff_ms");
        }
        if !(0.0..=1.0).contains(&self.restart.random_factor) {
            return invalid("restart.random_factor must be within 0.0..=1.0");
        }
        if self.projection.batch_size == 0 {
            return invalid("projection.batch_size must be positive");
        }
        if self.projection.retry_base_delay_ms > self.projection.retry_max_delay_ms {
            return invalid("projection.retry_base_delay_ms exceeds projection.retry_max_delay_ms");
        }
        Ok(())
    }

    pub fn ask_timeout(&self) -> Duration {
        Duration::from_millis(self.ask_timeout_ms)
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            min_backoff: Duration::from_millis(self.restart.min_backoff_ms),
            max_backoff: Duration::from_millis(self.restart.max_backoff_ms),
            random_factor: self.restart.random_factor,
            max_restarts: self.restart.max_restarts,
        }
    }

    pub fn live_config(&self) -> LiveConfig {
        LiveConfig {
            poll_interval: Duration::from_millis(self.projection.poll_interval_ms),
            retry_base_delay: Duration::from_millis(self.projection.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(self.projection.retry_max_delay_ms),
            batch_size: self.projection.batch_size,
        }
    }

    /// On-disk layout, if a data directory is configured.
    pub fn storage_layout(&self) -> Option<StorageLayout> {
        self.data_dir.as_ref().map(StorageLayout::new)
    }

    /// Open the configured storage: files under `data_dir`, or memory.
    pub fn open_persistence(&self) -> Result<Persistence, JournalError> {
        match self.storage_layout() {
            Some(layout) => Persistence::open(&layout),
            None => Ok(Persistence::in_memory()),
        }
    }

    /// A directory builder with every runtime setting applied.
    pub fn directory_builder(&self, persistence: Persistence) -> ShardDirectoryBuilder {
        ShardDirectoryBuilder::new(persistence)
            .node_id(self.node_id.as_str())
            .number_of_shards(self.number_of_shards)
            .idle_timeout(Duration::from_secs(self.idle_timeout_secs))
            .snapshot_every(self.snapshot.every)
            .keep_snapshots(self.snapshot.keep)
            .restart_policy(self.restart_policy())
            .tag_slices(self.tag_slices)
            .mailbox_capacity(self.mailbox_capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = CartConfig::from_toml_str("").unwrap();
        assert_eq!(config, CartConfig::default());
        assert_eq!(config.ask_timeout(), Duration::from_secs(5));
        assert_eq!(config.restart_policy(), RestartPolicy::default());
        assert_eq!(config.snapshot, SnapshotSection { every: 100, keep: 3 });
        assert_eq!(config.tag_slices, 5);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = CartConfig::from_toml_str(
            r#"
            node_id = "node-2"
            ask_timeout_ms = 250

            [snapshot]
            every = 10

            [projection]
            batch_size = 16
            "#,
        )
        .unwrap();
        assert_eq!(config.node_id, "node-2");
        assert_eq!(config.ask_timeout(), Duration::from_millis(250));
        assert_eq!(config.snapshot.every, 10);
        assert_eq!(config.snapshot.keep, 3);
        assert_eq!(config.live_config().batch_size, 16);
        assert_eq!(config.live_config().retry_max_delay, Duration::from_secs(30));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for doc in [
            "tag_slices = 0",
            "node_id = \"\"",
            "[snapshot]\nkeep = 0",
            "[restart]\nrandom_factor = 1.5",
            "[restart]\nmin_backoff_ms = 10000",
        ] {
            let err = CartConfig::from_toml_str(doc).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{doc}: {err}");
        }
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = CartConfig::from_toml_str("ask_timeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn renders_and_reloads() {
        let config = CartConfig {
            node_id: "node-9".into(),
            data_dir: Some(PathBuf::from("/tmp/carts")),
            ..CartConfig::default()
        };
        let rendered = config.to_toml_string().unwrap();
        assert_eq!(CartConfig::from_toml_str(&rendered).unwrap(), config);
    }

    #[test]
    fn load_reports_missing_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = CartConfig::load(&tmp.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn file_backed_persistence_uses_data_dir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("node.toml");
        std::fs::write(
            &path,
            format!("data_dir = {:?}\n", tmp.path().join("data").display().to_string()),
        )
        .unwrap();
        let config = CartConfig::load(&path).unwrap();
        config.open_persistence().unwrap();
        assert!(tmp.path().join("data/journal/events.jsonl").exists());
    }
}
