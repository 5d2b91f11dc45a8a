//! Centralized configuration for Undertow.
//!
//! All tunable parameters are grouped here into sections. A configuration
//! is loaded through a [`ConfigSource`], may be overridden from the
//! environment, and is validated before any component sees it.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

const MIB: u64 = 1024 * 1024;

/// Central configuration for all Undertow components.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UndertowConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub buffer: BufferConfig,
    pub network: NetworkConfig,
    pub reaper: ReaperConfig,
    pub selection: SelectionConfig,
}

/// Process-level settings: bind addresses and metadata acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Address the HTTP surface listens on
    pub local_address: SocketAddr,
    /// Address of the host application's callback endpoint
    pub remote_address: SocketAddr,
    /// Block `add` until file selection completes
    pub wait_for_metadata: bool,
    /// Budget for obtaining metainfo, in seconds
    pub metadata_timeout_secs: u64,
    /// Interval between database backup rotations, in seconds
    pub backup_interval_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            local_address: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 65220)),
            remote_address: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 65221)),
            wait_for_metadata: false,
            metadata_timeout_secs: 180,
            backup_interval_secs: 3600,
        }
    }
}

impl ServiceConfig {
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup_interval_secs)
    }
}

/// Which piece store backs newly opened torrents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoragePolicyKind {
    Memory,
    File,
}

/// Piece store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub policy: StoragePolicyKind,
    /// Bytes of RAM a memory store may use; slot count is derived from it
    pub memory_budget: u64,
    /// File stores larger than this are swept down to their windows
    pub file_watermark: u64,
    /// Pieces kept on each side of the windows during a sweep
    pub padding_pieces: u32,
    /// Override for the payload directory (defaults to `<profile>/downloads`)
    pub downloads_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            policy: StoragePolicyKind::Memory,
            memory_budget: 100 * MIB,
            file_watermark: 8 * 1024 * MIB,
            padding_pieces: 8,
            downloads_dir: None,
        }
    }
}

/// Buffer controller tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Bytes ahead of the read offset covered by the head window
    pub buffer_size: u64,
    /// Host application's own cache size; overlays `buffer_size` when larger
    pub host_cache_size: u64,
    /// Bytes at the end of the playback file covered by the tail window (0 disables)
    pub tail_size: u64,
    /// Leading head-window pieces requested at `now` priority
    pub urgent_pieces: u32,
    /// Deadline increment per piece of distance from the read offset
    pub deadline_step_ms: u32,
    /// Consecutive hash failures before a piece is reported stalled
    pub hash_failure_threshold: u32,
    /// Hold the first read of a reader until head and tail are verified
    pub gate_reads_on_buffer: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            buffer_size: 20 * MIB,
            host_cache_size: 0,
            tail_size: 8 * MIB,
            urgent_pieces: 4,
            deadline_step_ms: 10,
            hash_failure_threshold: 3,
            gate_reads_on_buffer: true,
        }
    }
}

impl BufferConfig {
    /// Head window byte budget after applying the host cache overlay.
    pub fn effective_buffer_size(&self) -> u64 {
        self.buffer_size.max(self.host_cache_size)
    }
}

/// Stream encryption preference passed through to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionPolicy {
    Prefer,
    Require,
    Disable,
}

/// Swarm engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Port for inbound peer connections
    pub listen_port: u16,
    /// Interface the listener binds to
    pub listen_interface: Ipv4Addr,
    /// Maximum concurrent peer connections per torrent
    pub max_peers_per_torrent: usize,
    /// Download bandwidth limit in bytes per second (None = unlimited)
    pub download_limit: Option<u64>,
    /// Upload bandwidth limit in bytes per second (None = unlimited)
    pub upload_limit: Option<u64>,
    /// Tracker request timeout in seconds
    pub tracker_timeout_secs: u64,
    /// Peer connect timeout in seconds
    pub peer_connect_timeout_secs: u64,
    /// User agent for HTTP requests
    pub user_agent: String,
    pub enable_dht: bool,
    pub enable_pex: bool,
    pub enable_lsd: bool,
    pub enable_upnp: bool,
    pub encryption: EncryptionPolicy,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            listen_interface: Ipv4Addr::UNSPECIFIED,
            max_peers_per_torrent: 50,
            download_limit: None,
            upload_limit: None,
            tracker_timeout_secs: 15,
            peer_connect_timeout_secs: 3,
            user_agent: format!("undertow/{}", env!("CARGO_PKG_VERSION")),
            enable_dht: true,
            enable_pex: true,
            enable_lsd: true,
            enable_upnp: false,
            encryption: EncryptionPolicy::Prefer,
        }
    }
}

impl NetworkConfig {
    pub fn tracker_timeout(&self) -> Duration {
        Duration::from_secs(self.tracker_timeout_secs)
    }

    pub fn peer_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_connect_timeout_secs)
    }
}

/// Reaper policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Period of the maintenance tick in seconds
    pub tick_secs: u64,
    /// Seconds without an attached reader before a torrent is reaped
    pub idle_timeout_secs: u64,
    pub keep_finished: bool,
    pub keep_downloading: bool,
    /// Upload/download ratio that triggers reaping (0 disables)
    pub share_ratio_limit: f64,
    /// Seconds of seeding after finish that trigger reaping (0 disables)
    pub seed_time_limit_secs: u64,
    /// Whether removal deletes on-disk payload by default
    pub delete_files_on_remove: bool,
    /// Seconds a removed, unreferenced item is kept before it is deleted
    pub removed_retention_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            tick_secs: 30,
            idle_timeout_secs: 600,
            keep_finished: false,
            keep_downloading: false,
            share_ratio_limit: 0.0,
            seed_time_limit_secs: 0,
            delete_files_on_remove: true,
            removed_retention_secs: 3600,
        }
    }
}

impl ReaperConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn removed_retention(&self) -> Duration {
        Duration::from_secs(self.removed_retention_secs)
    }
}

/// Automatic playback file selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Smallest candidate considered for a movie
    pub min_movie_size: u64,
    /// Smallest candidate considered for a show episode
    pub min_show_size: u64,
    /// Extensions treated as video, lowercase without the dot
    pub video_extensions: Vec<String>,
    /// Ask the host to pick when several candidates qualify
    pub choose_manually: bool,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            min_movie_size: 100 * MIB,
            min_show_size: 30 * MIB,
            video_extensions: [
                "mkv", "mp4", "avi", "m4v", "mov", "wmv", "ts", "m2ts", "webm", "mpg", "mpeg",
                "flv", "ogm", "divx", "xvid",
            ]
            .iter()
            .map(|ext| ext.to_string())
            .collect(),
            choose_manually: false,
        }
    }
}

/// Errors raised while acquiring or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Failed to parse configuration at {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Configuration unreadable at {path}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Profile directory unusable: {path}")]
    Profile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    /// Fatal errors abort initialization; the rest fall back to defaults.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConfigError::Profile { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ConfigurationError
    }
}

impl UndertowConfig {
    /// Creates configuration with environment variable overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|name| std::env::var(name).ok());
        config
    }

    /// Creates a configuration tuned for fast, deterministic tests.
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.service.metadata_timeout_secs = 5;
        config.buffer.buffer_size = 256 * 1024;
        config.buffer.tail_size = 64 * 1024;
        config.storage.memory_budget = 4 * MIB;
        config.reaper.tick_secs = 1;
        config.reaper.idle_timeout_secs = 60;
        config.network.listen_port = 0;
        config
    }

    /// Applies `UNDERTOW_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse_u64 = |name: &str| lookup(name).and_then(|value| value.parse::<u64>().ok());
        let parse_bool = |name: &str| lookup(name).and_then(|value| value.parse::<bool>().ok());

        if let Some(policy) = lookup("UNDERTOW_STORAGE_POLICY") {
            match policy.to_lowercase().as_str() {
                "memory" => self.storage.policy = StoragePolicyKind::Memory,
                "file" => self.storage.policy = StoragePolicyKind::File,
                other => tracing::warn!("Ignoring unknown storage policy override: {other}"),
            }
        }
        if let Some(budget) = parse_u64("UNDERTOW_MEMORY_BUDGET") {
            self.storage.memory_budget = budget;
        }
        if let Some(size) = parse_u64("UNDERTOW_BUFFER_SIZE") {
            self.buffer.buffer_size = size;
        }
        if let Some(size) = parse_u64("UNDERTOW_TAIL_SIZE") {
            self.buffer.tail_size = size;
        }
        if let Some(port) = lookup("UNDERTOW_LISTEN_PORT").and_then(|p| p.parse::<u16>().ok()) {
            self.network.listen_port = port;
        }
        if let Some(peers) = parse_u64("UNDERTOW_MAX_PEERS") {
            self.network.max_peers_per_torrent = peers as usize;
        }
        if let Some(seconds) = parse_u64("UNDERTOW_TRACKER_TIMEOUT") {
            self.network.tracker_timeout_secs = seconds;
        }
        if let Some(seconds) = parse_u64("UNDERTOW_IDLE_TIMEOUT") {
            self.reaper.idle_timeout_secs = seconds;
        }
        if let Some(keep) = parse_bool("UNDERTOW_KEEP_DOWNLOADING") {
            self.reaper.keep_downloading = keep;
        }
        if let Some(keep) = parse_bool("UNDERTOW_KEEP_FINISHED") {
            self.reaper.keep_finished = keep;
        }
    }

    /// Rejects values no component can operate with.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Invalid` - A field is out of its usable range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.memory_budget == 0 {
            return Err(ConfigError::Invalid {
                field: "storage.memory_budget",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.buffer.effective_buffer_size() == 0 {
            return Err(ConfigError::Invalid {
                field: "buffer.buffer_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.reaper.tick_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "reaper.tick_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.service.metadata_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "service.metadata_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.reaper.share_ratio_limit < 0.0 || !self.reaper.share_ratio_limit.is_finite() {
            return Err(ConfigError::Invalid {
                field: "reaper.share_ratio_limit",
                reason: "must be a non-negative number".to_string(),
            });
        }
        Ok(())
    }
}

/// Where configuration comes from. Reloading re-invokes `load`.
pub trait ConfigSource: Send + Sync {
    /// # Errors
    ///
    /// - `ConfigError` - Source unreadable, malformed or invalid
    fn load(&self) -> Result<UndertowConfig, ConfigError>;
}

/// A fixed configuration; reloads return it unchanged.
impl ConfigSource for UndertowConfig {
    fn load(&self) -> Result<UndertowConfig, ConfigError> {
        self.validate()?;
        Ok(self.clone())
    }
}

/// Defaults plus `UNDERTOW_*` environment overrides.
#[derive(Debug, Default, Clone)]
pub struct EnvConfigSource;

impl ConfigSource for EnvConfigSource {
    fn load(&self) -> Result<UndertowConfig, ConfigError> {
        let config = UndertowConfig::from_env();
        config.validate()?;
        Ok(config)
    }
}

/// JSON file in the profile directory, then environment overrides.
///
/// A missing file is not an error; defaults apply.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Result<UndertowConfig, ConfigError> {
        let mut config = match std::fs::read(&self.path) {
            Ok(bytes) => {
                serde_json::from_slice::<UndertowConfig>(&bytes).map_err(|e| ConfigError::Parse {
                    path: self.path.clone(),
                    reason: e.to_string(),
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => UndertowConfig::default(),
            Err(source) => {
                return Err(ConfigError::Unreadable {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = UndertowConfig::default();
        assert_eq!(config.service.local_address.port(), 65220);
        assert_eq!(config.service.remote_address.port(), 65221);
        assert_eq!(config.service.metadata_timeout(), Duration::from_secs(180));
        assert_eq!(config.buffer.tail_size, 8 * MIB);
        assert_eq!(config.reaper.tick(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_host_cache_overlays_buffer_size() {
        let mut buffer = BufferConfig::default();
        assert_eq!(buffer.effective_buffer_size(), 20 * MIB);
        buffer.host_cache_size = 64 * MIB;
        assert_eq!(buffer.effective_buffer_size(), 64 * MIB);
    }

    #[test]
    fn test_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("UNDERTOW_STORAGE_POLICY", "file"),
            ("UNDERTOW_IDLE_TIMEOUT", "60"),
            ("UNDERTOW_KEEP_DOWNLOADING", "true"),
            ("UNDERTOW_MAX_PEERS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = UndertowConfig::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.storage.policy, StoragePolicyKind::File);
        assert_eq!(config.reaper.idle_timeout_secs, 60);
        assert!(config.reaper.keep_downloading);
        assert_eq!(config.network.max_peers_per_torrent, 50);
    }

    #[test]
    fn test_validate_rejects_zero_tick() {
        let mut config = UndertowConfig::default();
        config.reaper.tick_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "reaper.tick_secs",
                ..
            }
        ));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_file_source_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileConfigSource::new(dir.path().join("config.json"));
        let config = source.load().unwrap();
        assert_eq!(config.storage.memory_budget, StorageConfig::default().memory_budget);
    }

    #[test]
    fn test_file_source_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"buffer": {"tail_size": 0}, "reaper": {"keep_finished": true}}"#)
            .unwrap();

        let config = FileConfigSource::new(&path).load().unwrap();
        assert_eq!(config.buffer.tail_size, 0);
        assert_eq!(config.buffer.urgent_pieces, 4);
        assert!(config.reaper.keep_finished);
    }

    #[test]
    fn test_file_source_malformed_json_is_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = FileConfigSource::new(&path).load().unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(!err.is_fatal());
    }
}
