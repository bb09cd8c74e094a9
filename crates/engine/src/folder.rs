//! Per-folder runner: scan and pull scheduling
//!
//! One task per running folder. It owns scanning and pulling for its
//! folder, driven by the rescan timer and by explicit triggers (incoming
//! index updates, watcher-style nudges). Pull triggers coalesce: any
//! number of nudges during a pull schedule exactly one follow-up.
//! Stopping cancels the task and joins it; a stopped runner leaves no
//! task behind.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use meshsync_core::{
    Event, EventSink, FolderActivity, FolderConfig, FolderType, IgnoreMatcher, ShortId,
};
use meshsync_db::FileSet;

use crate::fs::Filesystem;
use crate::names::IGNORE_FILE;
use crate::puller::{pull_once, PullConfig};
use crate::scanner::{scan_folder, ScanConfig};
use crate::versioner::Versioner;
use crate::view::ClusterView;

/// A pull that keeps failing is retried this many times per cycle before
/// waiting for the next trigger.
const MAX_PULL_ITERATIONS: usize = 3;

/// Everything a folder runner owns or borrows.
pub struct FolderDeps {
    pub config: FolderConfig,
    pub fileset: Arc<FileSet>,
    pub fs: Arc<dyn Filesystem>,
    pub versioner: Arc<dyn Versioner>,
    pub view: Arc<dyn ClusterView>,
    pub events: EventSink,
    pub short_id: ShortId,
}

/// Handle to a running folder task.
pub struct FolderRunner {
    folder_id: String,
    cancel: CancellationToken,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    scan_notify: Arc<Notify>,
    pull_notify: Arc<Notify>,
    activity: watch::Receiver<FolderActivity>,
    error: Arc<Mutex<Option<String>>>,
}

impl FolderRunner {
    /// Start the runner task for a folder.
    #[must_use]
    pub fn spawn(deps: FolderDeps) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let scan_notify = Arc::new(Notify::new());
        let pull_notify = Arc::new(Notify::new());
        let (activity_tx, activity_rx) = watch::channel(FolderActivity::Idle);
        let error = Arc::new(Mutex::new(None));

        let folder_id = deps.config.id.clone();
        info!(folder = %folder_id, "starting folder runner");

        let handle = tokio::spawn(run(
            deps,
            cancel.clone(),
            scan_notify.clone(),
            pull_notify.clone(),
            activity_tx,
            error.clone(),
        ));

        Arc::new(Self {
            folder_id,
            cancel,
            handle: tokio::sync::Mutex::new(Some(handle)),
            scan_notify,
            pull_notify,
            activity: activity_rx,
            error,
        })
    }

    #[must_use]
    pub fn folder_id(&self) -> &str {
        &self.folder_id
    }

    /// Ask for a scan soon.
    pub fn trigger_scan(&self) {
        self.scan_notify.notify_one();
    }

    /// Ask for a pull soon. Multiple triggers coalesce.
    pub fn trigger_pull(&self) {
        self.pull_notify.notify_one();
    }

    #[must_use]
    pub fn activity(&self) -> FolderActivity {
        *self.activity.borrow()
    }

    /// The folder's current health error, if any.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    /// Stop the runner and wait for its task to finish. Idempotent. The
    /// explicit join guarantees no two runner instances for the same
    /// folder overlap across a restart.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(folder = %self.folder_id, "runner task panicked: {e}");
            }
        }
        debug!(folder = %self.folder_id, "folder runner stopped");
    }
}

struct RunState {
    deps: FolderDeps,
    activity_tx: watch::Sender<FolderActivity>,
    error: Arc<Mutex<Option<String>>>,
    cancel: CancellationToken,
}

async fn run(
    deps: FolderDeps,
    cancel: CancellationToken,
    scan_notify: Arc<Notify>,
    pull_notify: Arc<Notify>,
    activity_tx: watch::Sender<FolderActivity>,
    error: Arc<Mutex<Option<String>>>,
) {
    let mut rescan = tokio::time::interval(Duration::from_secs(
        deps.config.rescan_interval_s.max(1),
    ));
    rescan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let state = RunState {
        deps,
        activity_tx,
        error,
        cancel: cancel.clone(),
    };

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            // The first tick fires immediately: the initial scan.
            _ = rescan.tick() => state.cycle(true).await,
            () = scan_notify.notified() => state.cycle(true).await,
            () = pull_notify.notified() => state.cycle(false).await,
        }
    }

    state.set_activity(FolderActivity::Stopped);
}

impl RunState {
    fn set_activity(&self, activity: FolderActivity) {
        let _ = self.activity_tx.send(activity);
        self.deps.events.publish(Event::FolderStateChanged {
            folder: self.deps.config.id.clone(),
            activity,
            error: self.error.lock().clone(),
        });
    }

    fn set_error(&self, error: Option<String>) {
        *self.error.lock() = error;
    }

    /// A folder is workable only when its path and marker exist.
    fn check_health(&self) -> bool {
        let root = self.deps.fs.root();
        if !root.is_dir() {
            self.set_error(Some("folder path missing".to_string()));
            self.set_activity(FolderActivity::Idle);
            return false;
        }
        if !self.deps.fs.exists(&self.deps.config.marker_name) {
            self.set_error(Some("folder marker missing".to_string()));
            self.set_activity(FolderActivity::Idle);
            return false;
        }
        true
    }

    async fn cycle(&self, scan: bool) {
        if !self.check_health() {
            return;
        }
        self.set_error(None);

        if scan {
            self.run_scan().await;
        }
        if self.deps.config.folder_type != FolderType::SendOnly {
            self.run_pull().await;
        }

        self.set_activity(FolderActivity::Idle);
    }

    async fn run_scan(&self) {
        self.set_activity(FolderActivity::Scanning);

        let fs = self.deps.fs.clone();
        let fileset = self.deps.fileset.clone();
        let config = ScanConfig {
            marker_name: self.deps.config.marker_name.clone(),
            mod_time_window_s: self.deps.config.mod_time_window_s,
            short_id: self.deps.short_id,
        };
        let cancel = self.cancel.clone();

        let result = tokio::task::spawn_blocking(move || {
            let ignore_path = fs.root().join(IGNORE_FILE);
            let ignores = IgnoreMatcher::load(&ignore_path)?;
            scan_folder(fs.as_ref(), &fileset, &ignores, &config, &cancel)
        })
        .await;

        match result {
            Ok(Ok(committed)) => {
                if !committed.is_empty() {
                    self.deps.events.publish(Event::LocalIndexUpdated {
                        folder: self.deps.config.id.clone(),
                        items: committed.len(),
                    });
                    self.deps
                        .view
                        .local_index_updated(&self.deps.config.id, committed)
                        .await;
                }
            }
            Ok(Err(e)) => {
                debug!(folder = %self.deps.config.id, "scan did not complete: {e}");
            }
            Err(e) => {
                warn!(folder = %self.deps.config.id, "scan task failed: {e}");
            }
        }
    }

    async fn run_pull(&self) {
        self.set_activity(FolderActivity::Pulling);

        let pull_config = PullConfig {
            folder_id: self.deps.config.id.clone(),
            short_id: self.deps.short_id,
            max_conflicts: self.deps.config.max_conflicts,
            copiers: self.deps.config.copiers,
            pullers: self.deps.config.pullers,
        };

        for _ in 0..MAX_PULL_ITERATIONS {
            if self.cancel.is_cancelled() {
                return;
            }
            let result = pull_once(
                self.deps.fileset.clone(),
                self.deps.fs.clone(),
                self.deps.versioner.clone(),
                self.deps.view.clone(),
                self.deps.events.clone(),
                pull_config.clone(),
                self.cancel.clone(),
            )
            .await;

            match result {
                Ok(summary) if summary.failed == 0 => return,
                Ok(summary) if !summary.made_progress() => {
                    // Stuck: every remaining item failed. Wait for new
                    // indexes or connections instead of spinning.
                    debug!(
                        folder = %self.deps.config.id,
                        failed = summary.failed,
                        "pull stalled, awaiting changes"
                    );
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    self.set_error(Some(format!("pull failed: {e}")));
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::RealFs;
    use crate::versioner::NoopVersioner;
    use crate::view::EmptyView;
    use meshsync_core::DeviceId;
    use meshsync_db::IndexDb;
    use tempfile::TempDir;

    fn deps_for(root: &TempDir, db_dir: &TempDir, folder_type: FolderType) -> FolderDeps {
        let db = Arc::new(IndexDb::open(db_dir.path()).unwrap());
        let fileset =
            Arc::new(FileSet::open("folder", DeviceId::from_raw([1u8; 32]), db).unwrap());
        let mut config = FolderConfig::new("folder", root.path());
        config.folder_type = folder_type;
        config.rescan_interval_s = 3600;
        FolderDeps {
            config,
            fileset,
            fs: Arc::new(RealFs::new(root.path())),
            versioner: Arc::new(NoopVersioner),
            view: Arc::new(EmptyView),
            events: EventSink::new(),
            short_id: ShortId(1),
        }
    }

    async fn wait_idle(runner: &FolderRunner) {
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if runner.activity() == FolderActivity::Idle {
                return;
            }
        }
        panic!("runner never became idle");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_initial_scan_indexes_files() {
        let root = TempDir::new().unwrap();
        let db_dir = TempDir::new().unwrap();
        std::fs::write(root.path().join(".stfolder"), "").unwrap();
        std::fs::write(root.path().join("hello.txt"), "hello").unwrap();

        let deps = deps_for(&root, &db_dir, FolderType::SendReceive);
        let fileset = deps.fileset.clone();
        let runner = FolderRunner::spawn(deps);

        wait_idle(&runner).await;
        assert!(fileset.local("hello.txt").is_some());
        assert!(runner.error().is_none());
        runner.stop().await;
        assert_eq!(runner.activity(), FolderActivity::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_marker_missing_suspends() {
        let root = TempDir::new().unwrap();
        let db_dir = TempDir::new().unwrap();
        std::fs::write(root.path().join("data.txt"), "x").unwrap();

        let deps = deps_for(&root, &db_dir, FolderType::SendReceive);
        let fileset = deps.fileset.clone();
        let runner = FolderRunner::spawn(deps);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runner.error().as_deref(), Some("folder marker missing"));
        assert!(fileset.local("data.txt").is_none());

        // Marker appears; the next scan trigger recovers.
        std::fs::write(root.path().join(".stfolder"), "").unwrap();
        runner.trigger_scan();
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if fileset.local("data.txt").is_some() {
                break;
            }
        }
        assert!(fileset.local("data.txt").is_some());
        assert!(runner.error().is_none());
        runner.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_joins_task() {
        let root = TempDir::new().unwrap();
        let db_dir = TempDir::new().unwrap();
        std::fs::write(root.path().join(".stfolder"), "").unwrap();

        let deps = deps_for(&root, &db_dir, FolderType::SendReceive);
        let runner = FolderRunner::spawn(deps);
        wait_idle(&runner).await;

        runner.stop().await;
        runner.stop().await; // idempotent
        assert_eq!(runner.activity(), FolderActivity::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_send_only_scans_but_never_pulls() {
        let root = TempDir::new().unwrap();
        let db_dir = TempDir::new().unwrap();
        std::fs::write(root.path().join(".stfolder"), "").unwrap();
        std::fs::write(root.path().join("ours.txt"), "ours").unwrap();

        let deps = deps_for(&root, &db_dir, FolderType::SendOnly);
        let fileset = deps.fileset.clone();
        let runner = FolderRunner::spawn(deps);
        wait_idle(&runner).await;

        assert!(fileset.local("ours.txt").is_some());

        // A needed remote file appears; a send-only folder leaves it be.
        let content = b"remote content";
        let bs = meshsync_core::block_size(content.len() as u64);
        let remote = meshsync_core::FileInfo {
            name: "theirs.txt".to_string(),
            file_type: meshsync_core::FileType::File,
            size: content.len() as u64,
            permissions: 0o644,
            modified_s: 1000,
            modified_ns: 0,
            version: {
                let mut v = meshsync_core::Vector::new();
                v.update(ShortId(2));
                v
            },
            sequence: 1,
            deleted: false,
            invalid: false,
            no_permissions: false,
            block_size: bs,
            blocks: meshsync_core::hash_blocks(&content[..], bs).unwrap(),
            symlink_target: String::new(),
        };
        fileset
            .replace_remote(DeviceId::from_raw([2u8; 32]), vec![remote])
            .unwrap();

        runner.trigger_pull();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!root.path().join("theirs.txt").exists());
        runner.stop().await;
    }
}
