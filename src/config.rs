//! Configuration for the persistence core.

use std::path::PathBuf;
use std::time::Duration;

/// A single automatic-save trigger: at least `min_changes` mutations and at
/// least `window_secs` seconds since the last successful save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveRule {
    /// Minimum seconds since the last successful save.
    pub window_secs: u32,

    /// Minimum number of mutations since the last successful save.
    pub min_changes: u32,
}

impl SaveRule {
    /// Create a new save rule.
    pub fn new(window_secs: u32, min_changes: u32) -> Self {
        Self {
            window_secs,
            min_changes,
        }
    }

    /// Whether this rule fires given the current counters.
    pub fn matches(&self, dirty: u64, secs_since_save: u64) -> bool {
        dirty >= u64::from(self.min_changes) && secs_since_save >= u64::from(self.window_secs)
    }
}

/// Configuration for snapshot persistence.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Master switch. When false the snapshotter and policy loop do nothing;
    /// SAVE becomes a successful no-op.
    pub rdb_enabled: bool,

    /// Snapshot file name within `data_dir`.
    pub rdb_filename: String,

    /// Directory containing the snapshot file. Created if absent.
    pub data_dir: PathBuf,

    /// Whether to gzip the snapshot payload.
    pub rdb_compression: bool,

    /// Whether to append a CRC32 trailer to the snapshot file.
    pub rdb_checksum: bool,

    /// Automatic-save rules, evaluated independently. Empty disables
    /// automatic saves.
    pub save_rules: Vec<SaveRule>,

    /// Cadence of the background policy loop.
    pub policy_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            rdb_enabled: true,
            rdb_filename: "dump.rdb".to_string(),
            data_dir: PathBuf::from("./data"),
            rdb_compression: true,
            rdb_checksum: true,
            save_rules: vec![
                SaveRule::new(900, 1),
                SaveRule::new(300, 10),
                SaveRule::new(60, 10_000),
            ],
            policy_interval: Duration::from_secs(1),
        }
    }
}

impl PersistenceConfig {
    /// Create a configuration rooted at the given data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Enable or disable persistence entirely.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.rdb_enabled = enabled;
        self
    }

    /// Set the snapshot file name.
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.rdb_filename = filename.into();
        self
    }

    /// Enable or disable payload compression.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.rdb_compression = compress;
        self
    }

    /// Enable or disable the CRC32 trailer.
    pub fn with_checksum(mut self, checksum: bool) -> Self {
        self.rdb_checksum = checksum;
        self
    }

    /// Replace the automatic-save rules.
    pub fn with_save_rules(mut self, rules: Vec<SaveRule>) -> Self {
        self.save_rules = rules;
        self
    }

    /// Set the policy loop cadence.
    pub fn with_policy_interval(mut self, interval: Duration) -> Self {
        self.policy_interval = interval;
        self
    }

    /// Full path of the snapshot file.
    pub fn rdb_path(&self) -> PathBuf {
        self.data_dir.join(&self.rdb_filename)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.rdb_filename.is_empty() {
            return Err("rdb filename cannot be empty".to_string());
        }
        if self.policy_interval.is_zero() {
            return Err("policy interval must be non-zero".to_string());
        }
        Ok(())
    }
}
