//! Persistence manager: mutation accounting, save policy, orchestration.
//!
//! The manager owns the counter triple (`dirty_count`, `last_save_time`,
//! the save gate) and everything that schedules saves: the SAVE / BGSAVE /
//! LASTSAVE command surface, the background policy loop, and the final save
//! on shutdown.
//!
//! At most one save runs at a time. BGSAVE try-acquires the gate and fails
//! fast when it is held; SAVE acquires it with blocking, so a SAVE issued
//! while a background save runs serializes behind it.

use crate::config::PersistenceConfig;
use crate::error::{Error, Result};
use crate::snapshot::codec::EncodeOptions;
use crate::snapshot::recovery::{RecoveryLoader, RecoveryOutcome};
use crate::snapshot::writer::{SaveError, SaveReport, Snapshotter};
use crate::store::Store;
use crate::types::now_secs;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Canonical BGSAVE acknowledgement, formatted by the command layer.
pub const BGSAVE_STARTED: &str = "Background RDB save started";

/// Manager lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    /// Constructed, policy loop not yet started.
    Created = 0,

    /// Accepting commands and evaluating save rules.
    Running = 1,

    /// Shutdown requested, waiting for in-flight work.
    Draining = 2,

    /// Final save done, manager inert.
    Stopped = 3,
}

impl Lifecycle {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Lifecycle::Created,
            1 => Lifecycle::Running,
            2 => Lifecycle::Draining,
            _ => Lifecycle::Stopped,
        }
    }
}

/// Metadata about the on-disk snapshot file.
#[derive(Debug, Clone)]
pub struct SnapshotFileInfo {
    /// Whether the file exists.
    pub exists: bool,

    /// File size in bytes, 0 when absent.
    pub size: u64,

    /// Last modification time, if available.
    pub modified: Option<SystemTime>,
}

/// Central coordinator for snapshot persistence.
pub struct PersistenceManager {
    config: PersistenceConfig,
    store: Arc<Store>,
    snapshotter: Snapshotter,

    /// Mutations since the last successful save, shared with the store.
    dirty: Arc<AtomicU64>,

    /// Unix seconds of the last durable save, 0 if never.
    last_save_secs: AtomicU64,

    /// At-most-one-save gate. Held for the whole duration of a save.
    save_gate: Arc<tokio::sync::Mutex<()>>,

    state: AtomicU8,
    policy_task: Mutex<Option<JoinHandle<()>>>,
    policy_shutdown: Mutex<Option<mpsc::Sender<()>>>,
    bg_task: Mutex<Option<JoinHandle<()>>>,

    /// Last background save failure, latched for inspection.
    last_bg_error: Mutex<Option<SaveError>>,
}

impl PersistenceManager {
    /// Create a manager for the given store.
    ///
    /// Creates the data directory (fatal on failure) and sweeps temp files
    /// left behind by interrupted saves.
    pub fn new(config: PersistenceConfig, store: Arc<Store>) -> Result<Self> {
        config.validate().map_err(Error::Config)?;

        if config.rdb_enabled {
            std::fs::create_dir_all(&config.data_dir)?;
            Self::cleanup_temp_files(&config);
        }

        let snapshotter = Snapshotter::new(
            config.rdb_path(),
            EncodeOptions::from_flags(config.rdb_compression, config.rdb_checksum),
        );
        let dirty = store.change_counter();

        Ok(Self {
            config,
            store,
            snapshotter,
            dirty,
            last_save_secs: AtomicU64::new(0),
            save_gate: Arc::new(tokio::sync::Mutex::new(())),
            state: AtomicU8::new(Lifecycle::Created as u8),
            policy_task: Mutex::new(None),
            policy_shutdown: Mutex::new(None),
            bg_task: Mutex::new(None),
            last_bg_error: Mutex::new(None),
        })
    }

    /// Remove orphaned temp files from a previous interrupted save.
    fn cleanup_temp_files(config: &PersistenceConfig) {
        let prefix = format!("{}.tmp.", config.rdb_filename);
        let entries = match std::fs::read_dir(&config.data_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %config.data_dir.display(), error = %e, "Failed to scan data dir");
                return;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) {
                debug!(file = %name, "Removing orphaned temp file");
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    warn!(file = %name, error = %e, "Failed to remove temp file");
                }
            }
        }
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Mutations since the last successful save.
    pub fn dirty_count(&self) -> u64 {
        self.dirty.load(Ordering::Relaxed)
    }

    /// Whether a save currently holds the gate.
    pub fn save_in_progress(&self) -> bool {
        self.save_gate.try_lock().is_err()
    }

    /// The configuration this manager runs with.
    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    /// Record one mutating command. Called by the command layer; store
    /// mutators reach the same counter through the shared handle.
    pub fn note_write(&self) {
        self.dirty.fetch_add(1, Ordering::Relaxed);
    }

    /// Restore store state from the snapshot file.
    ///
    /// Run once at startup before [`start`](Self::start); also serves DEBUG
    /// RELOAD on a live manager. Does nothing when persistence is disabled.
    pub fn recover(&self) -> RecoveryOutcome {
        if !self.config.rdb_enabled {
            return RecoveryOutcome::NoFile;
        }
        RecoveryLoader::new(self.config.rdb_path()).recover(&self.store)
    }

    /// Start the background policy loop and begin accepting commands.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                Lifecycle::Created as u8,
                Lifecycle::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        if !self.config.rdb_enabled || self.config.save_rules.is_empty() {
            info!("Automatic saves disabled");
            return;
        }

        let (tx, rx) = mpsc::channel(1);
        let manager = Arc::clone(self);
        let task = tokio::spawn(manager.run_policy_loop(rx));

        *self.policy_shutdown.lock() = Some(tx);
        *self.policy_task.lock() = Some(task);
        info!(rules = self.config.save_rules.len(), "Persistence manager started");
    }

    /// Evaluate save rules on a fixed cadence and launch background saves.
    async fn run_policy_loop(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.policy_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.should_save() {
                        match self.spawn_background_save() {
                            Ok(()) => debug!("Save policy triggered background save"),
                            Err(Error::AlreadyInProgress) => {}
                            Err(e) => error!(error = %e, "Failed to launch automatic save"),
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Persistence policy loop shutting down");
                    break;
                }
            }
        }
    }

    /// Whether any save rule currently fires.
    fn should_save(&self) -> bool {
        if self.save_in_progress() {
            return false;
        }
        let dirty = self.dirty.load(Ordering::Relaxed);
        let since = now_secs().saturating_sub(self.last_save_secs.load(Ordering::Relaxed));
        self.config
            .save_rules
            .iter()
            .any(|rule| rule.matches(dirty, since))
    }

    fn ensure_running(&self) -> Result<()> {
        match self.lifecycle() {
            Lifecycle::Running => Ok(()),
            _ => Err(Error::NotRunning),
        }
    }

    /// SAVE: synchronous snapshot on the calling task.
    ///
    /// Blocks until durable. Serializes behind any in-flight background
    /// save. A successful no-op when persistence is disabled.
    pub async fn save(&self) -> Result<SaveReport> {
        self.ensure_running()?;
        if !self.config.rdb_enabled {
            return Ok(SaveReport {
                entries: 0,
                file_size: 0,
                duration: std::time::Duration::ZERO,
            });
        }

        let gate = self.save_gate.clone().lock_owned().await;
        self.run_save(gate).await
    }

    /// BGSAVE: launch a background save worker.
    ///
    /// Returns immediately; fails with [`Error::AlreadyInProgress`] while a
    /// save holds the gate. On success the command layer replies with
    /// [`BGSAVE_STARTED`].
    pub fn bgsave(self: &Arc<Self>) -> Result<()> {
        self.ensure_running()?;
        if !self.config.rdb_enabled {
            return Ok(());
        }
        self.spawn_background_save()
    }

    fn spawn_background_save(self: &Arc<Self>) -> Result<()> {
        let gate = self
            .save_gate
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::AlreadyInProgress)?;

        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            match manager.run_save(gate).await {
                Ok(report) => info!(
                    entries = report.entries,
                    file_size = report.file_size,
                    "Background save completed"
                ),
                Err(Error::Save(e)) => {
                    error!(error = %e, "Background save failed");
                    *manager.last_bg_error.lock() = Some(e);
                }
                Err(e) => error!(error = %e, "Background save failed"),
            }
        });
        *self.bg_task.lock() = Some(task);
        Ok(())
    }

    /// Run one full save while holding the gate.
    ///
    /// The dirty baseline is read once the point-in-time view is captured
    /// and subtracted on success, so mutations racing with the save are not
    /// lost from the counter.
    async fn run_save(&self, _gate: OwnedMutexGuard<()>) -> Result<SaveReport> {
        let view = self.store.snapshot();
        let baseline = self.dirty.load(Ordering::Acquire);

        let snapshotter = self.snapshotter.clone();
        let report = tokio::task::spawn_blocking(move || snapshotter.save(&view))
            .await
            .map_err(|e| {
                SaveError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
            })?
            .map_err(Error::Save)?;

        self.dirty.fetch_sub(baseline, Ordering::AcqRel);
        self.last_save_secs.fetch_max(now_secs(), Ordering::AcqRel);

        info!(
            path = %self.snapshotter.target().display(),
            entries = report.entries,
            file_size = report.file_size,
            duration_ms = report.duration.as_millis() as u64,
            "Snapshot saved"
        );
        Ok(report)
    }

    /// LASTSAVE: Unix seconds of the last successful save, 0 if never.
    pub fn last_save(&self) -> u64 {
        self.last_save_secs.load(Ordering::Acquire)
    }

    /// Last latched background save failure, if any. Clears the latch.
    pub fn take_last_background_error(&self) -> Option<SaveError> {
        self.last_bg_error.lock().take()
    }

    /// Metadata about the snapshot file on disk.
    pub fn snapshot_file_info(&self) -> SnapshotFileInfo {
        match std::fs::metadata(self.config.rdb_path()) {
            Ok(meta) => SnapshotFileInfo {
                exists: true,
                size: meta.len(),
                modified: meta.modified().ok(),
            },
            Err(_) => SnapshotFileInfo {
                exists: false,
                size: 0,
                modified: None,
            },
        }
    }

    /// Drain in-flight work and perform the final save.
    ///
    /// Stops the policy loop, joins any background save, then runs one last
    /// synchronous save when persistence is enabled. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        let prev = self.state.swap(Lifecycle::Draining as u8, Ordering::AcqRel);
        if prev >= Lifecycle::Draining as u8 {
            self.state.store(prev, Ordering::Release);
            return Ok(());
        }

        let shutdown_tx = self.policy_shutdown.lock().take();
        if let Some(tx) = shutdown_tx {
            let _ = tx.send(()).await;
        }
        let policy_task = self.policy_task.lock().take();
        if let Some(task) = policy_task {
            let _ = task.await;
        }
        let bg_task = self.bg_task.lock().take();
        if let Some(task) = bg_task {
            let _ = task.await;
        }

        let result = if self.config.rdb_enabled {
            let gate = self.save_gate.clone().lock_owned().await;
            match self.run_save(gate).await {
                Ok(_) => Ok(()),
                Err(e) => {
                    error!(error = %e, "Final save on shutdown failed");
                    Err(e)
                }
            }
        } else {
            Ok(())
        };

        self.state.store(Lifecycle::Stopped as u8, Ordering::Release);
        info!("Persistence manager stopped");
        result
    }
}

impl std::fmt::Debug for PersistenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceManager")
            .field("lifecycle", &self.lifecycle())
            .field("dirty_count", &self.dirty_count())
            .field("last_save", &self.last_save())
            .field("enabled", &self.config.rdb_enabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SaveRule;
    use crate::types::Value;
    use std::time::Duration;
    use tempfile::tempdir;

    fn manager_with(
        dir: &std::path::Path,
        config: PersistenceConfig,
    ) -> (Arc<PersistenceManager>, Arc<Store>) {
        let config = PersistenceConfig {
            data_dir: dir.to_path_buf(),
            ..config
        };
        let store = Arc::new(Store::new());
        let manager = Arc::new(PersistenceManager::new(config, store.clone()).unwrap());
        (manager, store)
    }

    fn started(dir: &std::path::Path, config: PersistenceConfig) -> (Arc<PersistenceManager>, Arc<Store>) {
        let (manager, store) = manager_with(dir, config);
        manager.start();
        (manager, store)
    }

    #[tokio::test]
    async fn test_commands_require_running() {
        let dir = tempdir().unwrap();
        let (manager, _store) = manager_with(dir.path(), PersistenceConfig::default());

        assert!(matches!(manager.save().await, Err(Error::NotRunning)));
        assert!(matches!(manager.bgsave(), Err(Error::NotRunning)));
    }

    #[tokio::test]
    async fn test_save_resets_dirty_and_advances_lastsave() {
        let dir = tempdir().unwrap();
        let (manager, store) = started(dir.path(), PersistenceConfig::default());

        store.set("a", Value::from("1"));
        store.set("b", Value::from("2"));
        assert_eq!(manager.dirty_count(), 2);
        assert_eq!(manager.last_save(), 0);

        let report = manager.save().await.unwrap();

        assert_eq!(report.entries, 2);
        assert_eq!(manager.dirty_count(), 0);
        assert!(manager.last_save() > 0);
        assert!(manager.snapshot_file_info().exists);
    }

    #[tokio::test]
    async fn test_lastsave_is_monotonic() {
        let dir = tempdir().unwrap();
        let (manager, store) = started(dir.path(), PersistenceConfig::default());

        store.set("a", Value::from("1"));
        manager.save().await.unwrap();
        let first = manager.last_save();

        store.set("b", Value::from("2"));
        manager.save().await.unwrap();
        assert!(manager.last_save() >= first);
    }

    #[tokio::test]
    async fn test_disabled_save_is_noop() {
        let dir = tempdir().unwrap();
        let (manager, store) = started(
            dir.path(),
            PersistenceConfig::default().with_enabled(false),
        );

        store.set("a", Value::from("1"));
        let report = manager.save().await.unwrap();

        assert_eq!(report.entries, 0);
        assert!(!manager.snapshot_file_info().exists);
        manager.bgsave().unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_bgsave_rejected() {
        let dir = tempdir().unwrap();
        let (manager, store) = started(dir.path(), PersistenceConfig::default());
        for i in 0..100 {
            store.set(format!("key{}", i), Value::from("v"));
        }

        // The worker task cannot run before the first await point, so the
        // gate stays held for all following attempts.
        manager.bgsave().unwrap();
        let mut rejected = 0;
        for _ in 0..9 {
            match manager.bgsave() {
                Err(Error::AlreadyInProgress) => rejected += 1,
                other => panic!("expected AlreadyInProgress, got {:?}", other.err()),
            }
        }
        assert_eq!(rejected, 9);

        let task = manager.bg_task.lock().take().unwrap();
        task.await.unwrap();
        assert_eq!(manager.dirty_count(), 0);
        assert!(manager.snapshot_file_info().exists);
    }

    #[tokio::test]
    async fn test_save_serializes_behind_bgsave() {
        let dir = tempdir().unwrap();
        let (manager, store) = started(dir.path(), PersistenceConfig::default());
        for i in 0..1000 {
            store.set(format!("key{:04}", i), Value::from("value"));
        }

        manager.bgsave().unwrap();
        // SAVE must wait for the gate rather than fail.
        manager.save().await.unwrap();
        assert!(manager.snapshot_file_info().exists);
    }

    #[tokio::test]
    async fn test_writes_during_save_survive_in_counter() {
        let dir = tempdir().unwrap();
        let (manager, store) = started(dir.path(), PersistenceConfig::default());

        store.set("a", Value::from("1"));
        manager.bgsave().unwrap();
        // These land before the worker captures its baseline, so they are
        // part of it; either way the counter never goes negative and writes
        // after completion are retained.
        store.set("b", Value::from("2"));
        store.set("c", Value::from("3"));

        let task = manager.bg_task.lock().take().unwrap();
        task.await.unwrap();
        assert_eq!(manager.dirty_count(), 0);

        store.set("d", Value::from("4"));
        assert_eq!(manager.dirty_count(), 1);
    }

    #[tokio::test]
    async fn test_policy_loop_triggers_save() {
        let dir = tempdir().unwrap();
        let config = PersistenceConfig::default()
            .with_save_rules(vec![SaveRule::new(0, 3)])
            .with_policy_interval(Duration::from_millis(10));
        let (manager, store) = started(dir.path(), config);

        store.set("a", Value::from("1"));
        store.set("b", Value::from("2"));
        store.set("c", Value::from("3"));

        let mut saved = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if manager.last_save() > 0 && manager.dirty_count() == 0 {
                saved = true;
                break;
            }
        }
        assert!(saved, "policy loop never triggered a save");
        assert!(manager.snapshot_file_info().exists);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_policy_respects_min_changes() {
        let dir = tempdir().unwrap();
        let config = PersistenceConfig::default()
            .with_save_rules(vec![SaveRule::new(0, 100)])
            .with_policy_interval(Duration::from_millis(10));
        let (manager, store) = started(dir.path(), config);

        store.set("a", Value::from("1"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(manager.last_save(), 0);
        assert!(!manager.snapshot_file_info().exists);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_runs_final_save_and_stops_commands() {
        let dir = tempdir().unwrap();
        let (manager, store) = started(dir.path(), PersistenceConfig::default());

        store.set("a", Value::from("1"));
        manager.shutdown().await.unwrap();

        assert_eq!(manager.lifecycle(), Lifecycle::Stopped);
        assert!(manager.snapshot_file_info().exists);
        assert!(matches!(manager.save().await, Err(Error::NotRunning)));
        assert!(matches!(manager.bgsave(), Err(Error::NotRunning)));

        // Idempotent.
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_new_sweeps_orphaned_temp_files() {
        let dir = tempdir().unwrap();
        let orphan = dir.path().join("dump.rdb.tmp.12345.0");
        std::fs::write(&orphan, b"partial").unwrap();
        let unrelated = dir.path().join("other.txt");
        std::fs::write(&unrelated, b"keep").unwrap();

        let _ = manager_with(dir.path(), PersistenceConfig::default());

        assert!(!orphan.exists());
        assert!(unrelated.exists());
    }

    #[tokio::test]
    async fn test_recover_roundtrip_through_manager() {
        let dir = tempdir().unwrap();
        let (manager, store) = started(dir.path(), PersistenceConfig::default());
        store.set("a", Value::from("1"));
        manager.save().await.unwrap();

        let (manager2, store2) = manager_with(dir.path(), PersistenceConfig::default());
        let outcome = manager2.recover();
        assert!(matches!(outcome, RecoveryOutcome::Restored(1)));
        assert_eq!(store2.get(b"a"), Some(Value::from("1")));
    }
}
