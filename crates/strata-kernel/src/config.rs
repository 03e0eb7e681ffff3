//! Configuration loaded from RON.
//!
//! Every section defaults independently, so a file only needs the keys it
//! changes:
//!
//! ```ron
//! (
//!     store: (container: "/var/lib/strata/origin.bin", mode: Hybrid, native_root: Some("/srv/mirror")),
//!     protocol: (call_timeout_ms: Some(5000)),
//! )
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::vfs::CompactionPolicy;

/// Error type for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Where the authoritative bytes live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum StorageMode {
    /// Everything in the container file.
    #[default]
    Vfs,
    /// Container file, mirrored into `native_root` in the background.
    Hybrid,
    /// Straight to `native_root`, no container.
    Native,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    pub store: StoreConfig,
    pub protocol: ProtocolConfig,
    pub coordinator: CoordinatorConfig,
    pub events: EventsConfig,
    pub sync: SyncConfig,
}

impl StrataConfig {
    /// Parse a RON document.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        let config: StrataConfig = ron::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a RON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_ron(&text)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.store.mode != StorageMode::Vfs && self.store.native_root.is_none() {
            return Err(ConfigError::Invalid(format!(
                "store.mode {} requires store.native_root",
                self.store.mode
            )));
        }
        if self.store.compaction_low_water > self.store.compaction_high_water {
            return Err(ConfigError::Invalid(
                "compaction_low_water exceeds compaction_high_water".into(),
            ));
        }
        if self.protocol.arena_capacity < MIN_ARENA_CAPACITY {
            return Err(ConfigError::Invalid(format!(
                "protocol.arena_capacity below {MIN_ARENA_CAPACITY} bytes"
            )));
        }
        Ok(())
    }
}

/// 1 GiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1 << 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// The container file.
    pub container: PathBuf,
    pub mode: StorageMode,
    /// Host directory for `Hybrid` mirroring or `Native` storage.
    pub native_root: Option<PathBuf>,
    pub flush_debounce_ms: u64,
    pub compaction_low_water: u64,
    pub compaction_high_water: u64,
    pub compaction_debounce_ms: u64,
    pub idle_window_ms: u64,
    pub idle_timeout_ms: u64,
    /// Header slack laid down after the index by compaction.
    pub index_reserve: u64,
    /// Largest size a write or truncate may grow a file to.
    pub max_file_size: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let policy = CompactionPolicy::default();
        Self {
            container: PathBuf::from("strata.bin"),
            mode: StorageMode::Vfs,
            native_root: None,
            flush_debounce_ms: 50,
            compaction_low_water: policy.low_water,
            compaction_high_water: policy.high_water,
            compaction_debounce_ms: policy.debounce.as_millis() as u64,
            idle_window_ms: policy.idle_window.as_millis() as u64,
            idle_timeout_ms: policy.idle_timeout.as_millis() as u64,
            index_reserve: policy.index_reserve,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl StoreConfig {
    /// Config for a container at `path`, everything else default.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            container: path.into(),
            ..Default::default()
        }
    }

    pub fn flush_debounce(&self) -> Duration {
        Duration::from_millis(self.flush_debounce_ms)
    }

    pub fn compaction_policy(&self) -> CompactionPolicy {
        CompactionPolicy {
            low_water: self.compaction_low_water,
            high_water: self.compaction_high_water,
            debounce: Duration::from_millis(self.compaction_debounce_ms),
            idle_window: Duration::from_millis(self.idle_window_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            index_reserve: self.index_reserve,
        }
    }
}

/// How a caller waits on the arena status word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitMode {
    #[default]
    Blocking,
    Spin,
}

/// Smallest arena that still holds an encoded error frame.
pub const MIN_ARENA_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Payload bytes per arena frame, raised to [`MIN_ARENA_CAPACITY`].
    ///
    /// Every request and reply must fit in one frame, so this is also the
    /// largest file a single `read` or `write` can move. Bigger transfers
    /// fail with `EINVAL` and a message naming the capacity; move them in
    /// ranges (`read_range`, `write_fd`) or raise this value.
    pub arena_capacity: usize,
    /// `None` waits forever.
    pub call_timeout_ms: Option<u64>,
    pub wait: WaitMode,
    pub executor_poll_ms: u64,
    /// Fire-and-forget slots before the oldest is dropped.
    pub background_capacity: usize,
    /// Cap on the diagnostic path dump.
    pub dump_limit: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            arena_capacity: 4 * 1024 * 1024,
            call_timeout_ms: Some(30_000),
            wait: WaitMode::Blocking,
            executor_poll_ms: 50,
            background_capacity: 256,
            dump_limit: 64 * 1024,
        }
    }
}

impl ProtocolConfig {
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    pub fn executor_poll(&self) -> Duration {
        Duration::from_millis(self.executor_poll_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Scope for advisory locks and the announcement channel.
    pub origin: String,
    /// How long a relay waits for a primary to appear.
    pub leader_timeout_ms: u64,
    pub channel_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            origin: "default".into(),
            leader_timeout_ms: 5000,
            channel_capacity: 64,
        }
    }
}

impl CoordinatorConfig {
    pub fn leader_timeout(&self) -> Duration {
        Duration::from_millis(self.leader_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub grace_ms: u64,
    pub stale_after_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            grace_ms: 500,
            stale_after_ms: 30_000,
        }
    }
}

impl EventsConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub debounce_ms: u64,
    pub max_delay_ms: u64,
    /// Batches waiting for the mirror worker before the oldest is dropped.
    pub queue_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            max_delay_ms: 1000,
            queue_capacity: 64,
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_all_defaults() {
        let config = StrataConfig::from_ron("()").unwrap();
        assert_eq!(config, StrataConfig::default());
        assert_eq!(config.store.flush_debounce_ms, 50);
        assert_eq!(config.protocol.call_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_partial_sections() {
        let config = StrataConfig::from_ron(
            r#"(
                store: (container: "/tmp/x.bin", index_reserve: 0),
                protocol: (call_timeout_ms: None, wait: Spin),
                sync: (debounce_ms: 5),
            )"#,
        )
        .unwrap();
        assert_eq!(config.store.container, PathBuf::from("/tmp/x.bin"));
        assert_eq!(config.store.index_reserve, 0);
        assert_eq!(config.store.compaction_high_water, 16 * 1024 * 1024);
        assert_eq!(config.protocol.call_timeout(), None);
        assert_eq!(config.protocol.wait, WaitMode::Spin);
        assert_eq!(config.sync.debounce_ms, 5);
        assert_eq!(config.sync.max_delay_ms, 1000);
    }

    #[test]
    fn test_hybrid_requires_native_root() {
        let err = StrataConfig::from_ron("(store: (mode: Hybrid))").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_bad_ron_is_reported() {
        assert!(matches!(
            StrataConfig::from_ron("(store: ("),
            Err(ConfigError::Ron(_))
        ));
    }
}
