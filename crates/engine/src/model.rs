//! The model: folder registry, peer registry, protocol dispatch
//!
//! One model per device. It owns the folder runners and their file sets,
//! tracks live connections, dispatches every inbound protocol message,
//! and reacts to configuration changes by reconciling the set of running
//! folders against the desired one. Connections call into the model via
//! the handler trait; runners see it only through the read-only cluster
//! view.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::eyre::bail;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use meshsync_core::device_id::short_id_collision;
use meshsync_core::paths::{check_name, sanitize_name};
use meshsync_core::{
    CommitResult, Committer, Config, ConfigStore, DeviceConfig, DeviceId, Event, EventSink,
    FileInfo, FolderActivity, FolderConfig, FolderDevice, BLOCK_SIZE_MAX,
};
use meshsync_db::{FileSet, IndexDb};
use meshsync_proto::{
    AuthenticatedStream, CcDevice, CcFolder, ClusterConfig, Connection, ConnectionConfig,
    ConnectionHandler, DownloadProgressUpdate, ErrorCode, Hello, Request,
};

use crate::folder::{FolderDeps, FolderRunner};
use crate::fs::{Filesystem, RealFs};
use crate::names::temp_name;
use crate::versioner::{NoopVersioner, TrashVersioner, Versioner};
use crate::view::ClusterView;

const CLIENT_NAME: &str = "meshsync";
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Records per index batch when (re)sending a folder's index.
const INDEX_BATCH: usize = 1000;

struct FolderEntry {
    config: FolderConfig,
    fileset: Arc<FileSet>,
    runner: Option<Arc<FolderRunner>>,
}

/// The coordinating object for one device.
pub struct Model {
    my_id: DeviceId,
    my_name: String,
    config: Arc<ConfigStore>,
    db: Arc<IndexDb>,
    events: EventSink,
    folders: RwLock<HashMap<String, FolderEntry>>,
    connections: RwLock<HashMap<DeviceId, Arc<Connection>>>,
    hellos: RwLock<HashMap<DeviceId, Hello>>,
    /// device -> (folder, name) -> temp block indexes the device holds
    downloads: RwLock<HashMap<DeviceId, HashMap<(String, String), HashSet<u32>>>>,
    /// Serializes runner start/stop against config churn.
    reconcile_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("my_id", &self.my_id)
            .field("my_name", &self.my_name)
            .finish_non_exhaustive()
    }
}

impl Model {
    /// Build the model: open every configured folder's file set and check
    /// identity invariants. Runners are not started yet.
    ///
    /// # Errors
    /// Returns an error on a short-id collision among configured devices
    /// (fatal by design: no folder must run with ambiguous clocks) or a
    /// database failure.
    pub fn new(
        my_id: DeviceId,
        my_name: impl Into<String>,
        config: Arc<ConfigStore>,
        db: Arc<IndexDb>,
        events: EventSink,
    ) -> color_eyre::Result<Arc<Self>> {
        let cfg = config.config();

        let mut ids: Vec<DeviceId> = cfg.devices.iter().map(|d| d.device_id).collect();
        ids.push(my_id);
        if let Some((a, b)) = short_id_collision(&ids) {
            bail!("short device id collision between {a} and {b}");
        }

        let mut folders = HashMap::new();
        for folder_cfg in &cfg.folders {
            let fileset = Arc::new(FileSet::open(folder_cfg.id.clone(), my_id, db.clone())?);
            folders.insert(
                folder_cfg.id.clone(),
                FolderEntry {
                    config: folder_cfg.clone(),
                    fileset,
                    runner: None,
                },
            );
        }

        Ok(Arc::new(Self {
            my_id,
            my_name: my_name.into(),
            config,
            db,
            events,
            folders: RwLock::new(folders),
            connections: RwLock::new(HashMap::new()),
            hellos: RwLock::new(HashMap::new()),
            downloads: RwLock::new(HashMap::new()),
            reconcile_lock: tokio::sync::Mutex::new(()),
        }))
    }

    /// Start folder runners and subscribe to configuration changes.
    pub async fn start(self: &Arc<Self>) {
        self.config
            .subscribe(Arc::new(ModelCommitter(Arc::downgrade(self))));
        self.reconcile().await;
    }

    /// Stop everything: runners joined, connections closed.
    pub async fn stop(self: &Arc<Self>) {
        let runners: Vec<Arc<FolderRunner>> = {
            let mut folders = self.folders.write();
            folders.values_mut().filter_map(|e| e.runner.take()).collect()
        };
        for runner in runners {
            runner.stop().await;
        }
        let conns: Vec<Arc<Connection>> = self.connections.read().values().cloned().collect();
        for conn in conns {
            conn.close("shutting down").await;
        }
    }

    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.my_id
    }

    #[must_use]
    pub fn fileset(&self, folder: &str) -> Option<Arc<FileSet>> {
        self.folders.read().get(folder).map(|e| e.fileset.clone())
    }

    fn runner(&self, folder: &str) -> Option<Arc<FolderRunner>> {
        self.folders.read().get(folder)?.runner.clone()
    }

    /// Number of folders with a live runner.
    #[must_use]
    pub fn folders_running(&self) -> usize {
        self.folders
            .read()
            .values()
            .filter(|e| {
                e.runner
                    .as_ref()
                    .is_some_and(|r| r.activity() != FolderActivity::Stopped)
            })
            .count()
    }

    #[must_use]
    pub fn folder_error(&self, folder: &str) -> Option<String> {
        self.runner(folder).and_then(|r| r.error())
    }

    /// Ask a folder to rescan soon. Returns false if it has no runner.
    pub fn rescan(&self, folder: &str) -> bool {
        match self.runner(folder) {
            Some(runner) => {
                runner.trigger_scan();
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn connection(&self, device: &DeviceId) -> Option<Arc<Connection>> {
        self.connections.read().get(device).cloned()
    }

    /// The Hello most recently received from a device.
    #[must_use]
    pub fn hello(&self, device: &DeviceId) -> Option<Hello> {
        self.hellos.read().get(device).cloned()
    }

    /// Adopt an established authenticated stream as a peer connection:
    /// exchange Hellos, register, and send our cluster view.
    ///
    /// # Errors
    /// Returns an error for unknown, paused, or ignored devices, and for
    /// handshake failures.
    pub async fn add_connection(
        self: &Arc<Self>,
        stream: AuthenticatedStream,
    ) -> color_eyre::Result<Arc<Connection>> {
        let remote = stream.remote;
        if remote == self.my_id {
            bail!("refusing connection to ourselves");
        }
        let cfg = self.config.config();
        let Some(device_cfg) = cfg.device(&remote).cloned() else {
            bail!("connection from unknown device {remote}");
        };
        if device_cfg.paused {
            bail!("device {remote} is paused");
        }
        if cfg.options.ignored_devices.contains(&remote) {
            bail!("device {remote} is ignored");
        }

        let conn_config = ConnectionConfig {
            compression: device_cfg.compression,
            max_request_kib: device_cfg.max_request_kib,
            ..ConnectionConfig::default()
        };
        let local_hello = Hello {
            device_name: self.my_name.clone(),
            client_name: CLIENT_NAME.to_string(),
            client_version: CLIENT_VERSION.to_string(),
        };
        let handler: Arc<dyn ConnectionHandler> = Arc::new(ModelHandler(Arc::downgrade(self)));
        let conn = Connection::establish(stream, local_hello, conn_config, handler).await?;

        self.apply_hello_name(&remote, conn.hello());

        if let Some(old) = self.connections.write().insert(remote, conn.clone()) {
            info!(%remote, "replacing existing connection");
            old.close("connection replaced").await;
        }
        self.hellos.write().insert(remote, conn.hello().clone());
        self.events.publish(Event::DeviceConnected { device: remote });

        conn.send_cluster_config(self.generate_cluster_config(&remote))
            .await?;
        Ok(conn)
    }

    /// First non-empty remote name wins; with `overwrite_remote_dev_names`
    /// the latest Hello always wins.
    fn apply_hello_name(&self, remote: &DeviceId, hello: &Hello) {
        if hello.device_name.is_empty() {
            return;
        }
        let cfg = self.config.config();
        let Some(device_cfg) = cfg.device(remote) else {
            return;
        };
        let adopt = device_cfg.name.is_empty() || cfg.options.overwrite_remote_dev_names;
        if adopt && device_cfg.name != hello.device_name {
            let mut updated = device_cfg.clone();
            updated.name = hello.device_name.clone();
            if self.config.set_device(updated).is_ok() {
                self.events.publish(Event::DeviceRenamed {
                    device: *remote,
                    name: hello.device_name.clone(),
                });
            }
        }
    }

    /// The token that makes our previously-sent index resumable for a
    /// folder. Minted on first use, reset only with the database.
    fn local_index_id(&self, folder: &str) -> u64 {
        let key = format!("indexid/{folder}");
        if let Ok(Some(bytes)) = self.db.misc_get(&key) {
            if let Ok(raw) = <[u8; 8]>::try_from(bytes.as_slice()) {
                return u64::from_be_bytes(raw);
            }
        }
        let mut hasher = Sha256::new();
        hasher.update(folder.as_bytes());
        hasher.update(self.my_id.as_bytes());
        hasher.update(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0)
                .to_be_bytes(),
        );
        let digest = hasher.finalize();
        let id = u64::from_be_bytes(digest[..8].try_into().unwrap_or([0u8; 8]));
        let _ = self.db.misc_put(&key, &id.to_be_bytes());
        id
    }

    /// Our cluster view as sent to one peer: every folder we share with
    /// it, with the full device roster per folder.
    fn generate_cluster_config(&self, remote: &DeviceId) -> ClusterConfig {
        let cfg = self.config.config();
        let mut folders = Vec::new();

        for folder_cfg in cfg.folders_for_device(remote) {
            let Some(fileset) = self.fileset(&folder_cfg.id) else {
                continue;
            };

            let mut devices = Vec::new();
            let member_ids = folder_cfg
                .devices
                .iter()
                .map(|d| d.device_id)
                .chain(std::iter::once(self.my_id));
            for member in member_ids {
                let member_cfg = cfg.device(&member);
                let (index_id, max_sequence) = if member == self.my_id {
                    (self.local_index_id(&folder_cfg.id), fileset.sequence())
                } else {
                    (
                        self.db
                            .delta_index_id(&folder_cfg.id, &member)
                            .ok()
                            .flatten()
                            .unwrap_or(0),
                        fileset.remote_sequence(&member),
                    )
                };
                devices.push(CcDevice {
                    id: member,
                    name: if member == self.my_id {
                        self.my_name.clone()
                    } else {
                        member_cfg.map(|d| d.name.clone()).unwrap_or_default()
                    },
                    introducer: member_cfg.is_some_and(|d| d.introducer),
                    skip_introduction_removals: member_cfg
                        .is_some_and(|d| d.skip_introduction_removals),
                    max_request_kib: member_cfg.map(|d| d.max_request_kib).unwrap_or(0),
                    index_id,
                    max_sequence,
                });
            }

            folders.push(CcFolder {
                id: folder_cfg.id.clone(),
                label: folder_cfg.label.clone(),
                devices,
            });
        }

        ClusterConfig { folders }
    }

    /// Bring running folders in line with the configuration: start new
    /// ones, stop removed or paused ones, restart those whose identity
    /// changed. Serialized, so storms of config changes converge on
    /// exactly one runner per folder.
    pub async fn reconcile(self: &Arc<Self>) {
        let _guard = self.reconcile_lock.lock().await;
        let cfg = self.config.config();

        // Folders gone from the configuration.
        let removed: Vec<String> = {
            let folders = self.folders.read();
            folders
                .keys()
                .filter(|id| cfg.folder(id).is_none())
                .cloned()
                .collect()
        };
        for id in removed {
            let entry = self.folders.write().remove(&id);
            if let Some(entry) = entry {
                if let Some(runner) = entry.runner {
                    runner.stop().await;
                }
                if let Err(e) = self.db.drop_folder(&id) {
                    warn!(folder = %id, "failed to drop folder index: {e}");
                }
                info!(folder = %id, "folder removed");
            }
        }

        for folder_cfg in &cfg.folders {
            if let Err(e) = self.reconcile_folder(folder_cfg).await {
                warn!(folder = %folder_cfg.id, "failed to reconcile folder: {e}");
            }
        }

        // Devices removed or paused lose their connections.
        let conns: Vec<Arc<Connection>> = self.connections.read().values().cloned().collect();
        for conn in conns {
            let keep = cfg.device(&conn.remote()).is_some_and(|d| !d.paused);
            if !keep {
                conn.close("device removed or paused").await;
            }
        }
    }

    async fn reconcile_folder(self: &Arc<Self>, folder_cfg: &FolderConfig) -> color_eyre::Result<()> {
        // Ensure the entry exists (new folder in config).
        {
            let mut folders = self.folders.write();
            if !folders.contains_key(&folder_cfg.id) {
                let fileset = Arc::new(FileSet::open(
                    folder_cfg.id.clone(),
                    self.my_id,
                    self.db.clone(),
                )?);
                folders.insert(
                    folder_cfg.id.clone(),
                    FolderEntry {
                        config: folder_cfg.clone(),
                        fileset,
                        runner: None,
                    },
                );
            }
        }

        let (to_stop, needs_start, fileset) = {
            let mut folders = self.folders.write();
            let Some(entry) = folders.get_mut(&folder_cfg.id) else {
                return Ok(());
            };
            let restart = entry.config.requires_restart_from(folder_cfg);
            let should_run = !folder_cfg.paused;
            let running = entry.runner.is_some();
            entry.config = folder_cfg.clone();

            let to_stop = if running && (!should_run || restart) {
                entry.runner.take()
            } else {
                None
            };
            let needs_start = should_run && (entry.runner.is_none());
            (to_stop, needs_start, entry.fileset.clone())
        };

        if let Some(runner) = to_stop {
            // Join before any successor starts: no overlapping runners.
            runner.stop().await;
        }

        if needs_start {
            let versioner: Arc<dyn Versioner> = if folder_cfg.trash_versioning {
                Arc::new(TrashVersioner)
            } else {
                Arc::new(NoopVersioner)
            };
            let runner = FolderRunner::spawn(FolderDeps {
                config: folder_cfg.clone(),
                fileset,
                fs: Arc::new(RealFs::new(&folder_cfg.path)),
                versioner,
                view: Arc::new(ModelView(Arc::downgrade(self))),
                events: self.events.clone(),
                short_id: self.my_id.short_id(),
            });
            let mut folders = self.folders.write();
            if let Some(entry) = folders.get_mut(&folder_cfg.id) {
                entry.runner = Some(runner);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Inbound dispatch
    // ========================================================================

    async fn handle_cluster_config(self: &Arc<Self>, remote: DeviceId, cc: ClusterConfig) {
        let cfg = self.config.config();
        let Some(device_cfg) = cfg.device(&remote).cloned() else {
            return;
        };

        // Folders we share with the peer that it stopped announcing: its
        // remote state is no longer meaningful.
        for folder_cfg in cfg.folders_for_device(&remote) {
            if cc.folder(&folder_cfg.id).is_none() {
                if let Some(fileset) = self.fileset(&folder_cfg.id) {
                    let _ = fileset.drop_remote(&remote);
                }
            }
        }

        let mut new_cfg = cfg.clone();
        let mut config_changed = false;

        for cc_folder in &cc.folders {
            match cfg.folder(&cc_folder.id) {
                Some(folder_cfg) if folder_cfg.shares_device(&remote) => {
                    if folder_cfg.paused {
                        continue;
                    }
                    self.exchange_indexes(remote, cc_folder, folder_cfg);
                }
                Some(_) => {
                    debug!(
                        %remote,
                        folder = %cc_folder.id,
                        "peer announced a folder it is not authorized for"
                    );
                }
                None => {
                    if device_cfg.auto_accept_folders {
                        if let Some(folder) = self.auto_accept_folder(remote, cc_folder, &new_cfg)
                        {
                            info!(folder = %folder.id, "auto-accepted folder from {remote}");
                            new_cfg.folders.push(folder);
                            config_changed = true;
                        }
                    } else {
                        debug!(
                            %remote,
                            folder = %cc_folder.id,
                            "peer offers unknown folder"
                        );
                    }
                }
            }
        }

        if device_cfg.introducer && self.apply_introductions(remote, &cc, &mut new_cfg) {
            config_changed = true;
        }

        if config_changed {
            if let Err(e) = self.config.replace(new_cfg) {
                warn!(%remote, "cluster config produced rejected change: {e}");
            }
        }
    }

    /// Delta index negotiation for one shared folder, then kick off the
    /// appropriate index send.
    fn exchange_indexes(
        self: &Arc<Self>,
        remote: DeviceId,
        cc_folder: &CcFolder,
        folder_cfg: &FolderConfig,
    ) {
        let Some(fileset) = self.fileset(&folder_cfg.id) else {
            return;
        };

        // The peer's announced id for its own index: if it does not match
        // what we recorded, our view of the peer is stale and a full
        // index is coming.
        if let Some(their_entry) = cc_folder.devices.iter().find(|d| d.id == remote) {
            let recorded = self.db.delta_index_id(&folder_cfg.id, &remote).ok().flatten();
            if recorded != Some(their_entry.index_id) {
                debug!(%remote, folder = %folder_cfg.id, "delta index id changed, dropping remote view");
                let _ = fileset.drop_remote(&remote);
                let _ = self
                    .db
                    .set_delta_index_id(&folder_cfg.id, &remote, their_entry.index_id);
            }
        }

        // What the peer knows about us decides full index vs. delta.
        let our_entry = cc_folder.devices.iter().find(|d| d.id == self.my_id);
        let (from_sequence, full) = match our_entry {
            Some(e)
                if e.index_id == self.local_index_id(&folder_cfg.id)
                    && e.max_sequence <= fileset.sequence() =>
            {
                (e.max_sequence, false)
            }
            _ => (0, true),
        };

        self.spawn_index_send(remote, folder_cfg.id.clone(), fileset, from_sequence, full);

        if let Some(runner) = self.runner(&folder_cfg.id) {
            runner.trigger_pull();
        }
    }

    fn spawn_index_send(
        self: &Arc<Self>,
        remote: DeviceId,
        folder: String,
        fileset: Arc<FileSet>,
        from_sequence: u64,
        full: bool,
    ) {
        let model = self.clone();
        tokio::spawn(async move {
            let Some(conn) = model.connection(&remote) else {
                return;
            };
            let mut sequence = from_sequence;
            let mut first = full;
            loop {
                let batch = match fileset.local_files_from(sequence, INDEX_BATCH) {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(%remote, folder, "index read failed: {e}");
                        return;
                    }
                };
                if batch.is_empty() && !first {
                    return;
                }
                sequence = batch.last().map_or(sequence, |f| f.sequence);
                let done = batch.len() < INDEX_BATCH;
                let result = if first {
                    // The initial full index resets the peer's view even
                    // when we have nothing.
                    conn.send_index(folder.clone(), batch).await
                } else {
                    conn.send_index_update(folder.clone(), batch).await
                };
                first = false;
                if result.is_err() || done {
                    return;
                }
            }
        });
    }

    /// Build the folder config for an unknown folder offered by a peer
    /// with auto-accept enabled. Prefers the sanitized label for the
    /// directory name, falling back to the id on conflict.
    fn auto_accept_folder(
        &self,
        remote: DeviceId,
        cc_folder: &CcFolder,
        cfg: &Config,
    ) -> Option<FolderConfig> {
        let base = &cfg.options.default_folder_path;

        let mut candidates = Vec::new();
        let label = sanitize_name(&cc_folder.label);
        if !label.is_empty() {
            candidates.push(label);
        }
        let id = sanitize_name(&cc_folder.id);
        if !id.is_empty() {
            candidates.push(id);
        }

        let path = candidates.into_iter().find_map(|name| {
            let path = base.join(&name);
            let in_use = cfg.folders.iter().any(|f| f.path == path);
            if in_use || path.exists() {
                None
            } else {
                Some(path)
            }
        })?;

        if let Err(e) = std::fs::create_dir_all(&path) {
            warn!(folder = %cc_folder.id, "cannot create auto-accepted folder: {e}");
            return None;
        }
        let mut folder = FolderConfig::new(cc_folder.id.clone(), path.clone());
        if let Err(e) = std::fs::write(path.join(&folder.marker_name), b"") {
            warn!(folder = %cc_folder.id, "cannot create folder marker: {e}");
            return None;
        }
        folder.label = cc_folder.label.clone();
        folder.devices.push(FolderDevice {
            device_id: remote,
            introduced_by: None,
        });
        Some(folder)
    }

    /// Apply an introducer's view: add devices it announces, remove those
    /// it (alone) introduced and no longer announces. Returns whether the
    /// configuration changed.
    fn apply_introductions(
        &self,
        remote: DeviceId,
        cc: &ClusterConfig,
        new_cfg: &mut Config,
    ) -> bool {
        let mut changed = false;
        let skip_removals = new_cfg
            .device(&remote)
            .is_some_and(|d| d.skip_introduction_removals);

        // Additions.
        for cc_folder in &cc.folders {
            let Some(folder) = new_cfg
                .folders
                .iter_mut()
                .find(|f| f.id == cc_folder.id && f.shares_device(&remote))
            else {
                continue;
            };
            for cc_dev in &cc_folder.devices {
                if cc_dev.id == self.my_id || cc_dev.id == remote {
                    continue;
                }
                if !folder.shares_device(&cc_dev.id) {
                    info!(
                        device = %cc_dev.id,
                        folder = %folder.id,
                        introducer = %remote,
                        "adding introduced device to folder"
                    );
                    folder.devices.push(FolderDevice {
                        device_id: cc_dev.id,
                        introduced_by: Some(remote),
                    });
                    changed = true;
                }
            }
            // Roster additions happen outside the folder borrow.
            let announced: Vec<&CcDevice> = cc_folder
                .devices
                .iter()
                .filter(|d| d.id != self.my_id && d.id != remote)
                .collect();
            for cc_dev in announced {
                if new_cfg.device(&cc_dev.id).is_none() {
                    let mut device = DeviceConfig::new(cc_dev.id);
                    device.name = cc_dev.name.clone();
                    device.introduced_by = Some(remote);
                    new_cfg.devices.push(device);
                    changed = true;
                }
            }
        }

        // Removals: devices this introducer brought into a folder and no
        // longer announces there.
        if !skip_removals {
            for folder in &mut new_cfg.folders {
                if !folder.shares_device(&remote) {
                    continue;
                }
                let announced: HashSet<DeviceId> = cc
                    .folder(&folder.id)
                    .map(|f| f.devices.iter().map(|d| d.id).collect())
                    .unwrap_or_default();
                let before = folder.devices.len();
                folder.devices.retain(|d| {
                    d.introduced_by != Some(remote) || announced.contains(&d.device_id)
                });
                if folder.devices.len() != before {
                    changed = true;
                }
            }

            // Devices introduced by this peer that now share nothing
            // leave the roster entirely.
            let orphans: Vec<DeviceId> = new_cfg
                .devices
                .iter()
                .filter(|d| {
                    d.introduced_by == Some(remote)
                        && !new_cfg.folders.iter().any(|f| f.shares_device(&d.device_id))
                })
                .map(|d| d.device_id)
                .collect();
            for orphan in orphans {
                info!(device = %orphan, "removing introduced device with no shared folders");
                new_cfg.devices.retain(|d| d.device_id != orphan);
                changed = true;
            }
        }

        changed
    }

    fn handle_index_batch(
        &self,
        remote: DeviceId,
        folder: &str,
        files: Vec<FileInfo>,
        full: bool,
    ) -> Result<(), String> {
        let cfg = self.config.config();
        let Some(folder_cfg) = cfg.folder(folder) else {
            return Err(format!("index for unknown folder {folder}"));
        };
        if !folder_cfg.shares_device(&remote) {
            return Err(format!("device not authorized for folder {folder}"));
        }
        if folder_cfg.paused {
            debug!(folder, "dropping index for paused folder");
            return Ok(());
        }
        for file in &files {
            check_name(&file.name).map_err(|e| format!("bad path {:?}: {e}", file.name))?;
        }

        let Some(fileset) = self.fileset(folder) else {
            return Err(format!("no file set for folder {folder}"));
        };
        let count = files.len();
        let result = if full {
            fileset.replace_remote(remote, files)
        } else {
            fileset.apply_remote(remote, files)
        };
        result.map_err(|e| e.to_string())?;

        self.events.publish(Event::RemoteIndexUpdated {
            device: remote,
            folder: folder.to_string(),
            items: count,
        });
        if let Some(runner) = self.runner(folder) {
            runner.trigger_pull();
        }
        Ok(())
    }

    async fn handle_request(&self, remote: DeviceId, request: Request) -> Result<Bytes, ErrorCode> {
        let cfg = self.config.config();
        let Some(folder_cfg) = cfg.folder(&request.folder) else {
            return Err(ErrorCode::Generic);
        };
        if !folder_cfg.shares_device(&remote) || folder_cfg.paused {
            return Err(ErrorCode::Generic);
        }
        if request.validate(BLOCK_SIZE_MAX).is_err() || check_name(&request.name).is_err() {
            return Err(ErrorCode::Generic);
        }

        if let Some(fileset) = self.fileset(&request.folder) {
            if let Some(local) = fileset.local(&request.name) {
                if local.invalid {
                    return Err(ErrorCode::InvalidFile);
                }
            }
        }

        // Reads come from our own disk, never relayed from another peer.
        let name = if request.from_temporary {
            temp_name(&request.name)
        } else {
            request.name.clone()
        };
        let fs = RealFs::new(&folder_cfg.path);
        let offset = request.offset as u64;
        let size = request.size as usize;

        let read = tokio::task::spawn_blocking(move || fs.read_range(&name, offset, size)).await;
        match read {
            Ok(Ok(data)) => Ok(Bytes::from(data)),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(ErrorCode::NoSuchFile),
            Ok(Err(_)) | Err(_) => Err(ErrorCode::Generic),
        }
    }

    fn handle_download_progress(
        &self,
        remote: DeviceId,
        folder: String,
        updates: Vec<DownloadProgressUpdate>,
    ) {
        let mut downloads = self.downloads.write();
        let per_device = downloads.entry(remote).or_default();
        for update in updates {
            let key = (folder.clone(), update.name);
            if update.block_indexes.is_empty() {
                per_device.remove(&key);
            } else {
                per_device.insert(key, update.block_indexes.into_iter().collect());
            }
        }
    }

    fn handle_closed(&self, remote: DeviceId, reason: &str) {
        let removed = {
            let mut connections = self.connections.write();
            match connections.get(&remote) {
                // Only forget the mapping if the closed connection is the
                // one we currently track; a replaced connection's late
                // close must not evict its successor.
                Some(current) if current.is_closed() => connections.remove(&remote).is_some(),
                _ => false,
            }
        };
        if removed {
            debug!(%remote, reason, "device disconnected");
            self.downloads.write().remove(&remote);
            self.events
                .publish(Event::DeviceDisconnected { device: remote });
        }
    }
}

/// Config subscriber: sanity-checks transitions and reconciles runners
/// after commits.
struct ModelCommitter(Weak<Model>);

impl Committer for ModelCommitter {
    fn name(&self) -> &str {
        "model"
    }

    fn verify_change(&self, _from: &Config, to: &Config) -> Result<(), String> {
        let Some(model) = self.0.upgrade() else {
            return Ok(());
        };
        let mut ids: Vec<DeviceId> = to.devices.iter().map(|d| d.device_id).collect();
        ids.push(model.my_id);
        if let Some((a, b)) = short_id_collision(&ids) {
            return Err(format!("short device id collision between {a} and {b}"));
        }
        for folder in &to.folders {
            if folder.id.is_empty() {
                return Err("folder with empty id".to_string());
            }
            if folder.path.as_os_str().is_empty() {
                return Err(format!("folder {} has no path", folder.id));
            }
        }
        Ok(())
    }

    fn commit_change(&self, _from: &Config, _to: &Config) -> CommitResult {
        if let Some(model) = self.0.upgrade() {
            tokio::spawn(async move {
                model.reconcile().await;
            });
        }
        CommitResult::Applied
    }
}

/// The connection-facing face of the model.
struct ModelHandler(Weak<Model>);

#[async_trait]
impl ConnectionHandler for ModelHandler {
    async fn cluster_config(&self, remote: DeviceId, config: ClusterConfig) {
        if let Some(model) = self.0.upgrade() {
            model.handle_cluster_config(remote, config).await;
        }
    }

    async fn index(
        &self,
        remote: DeviceId,
        folder: String,
        files: Vec<FileInfo>,
    ) -> Result<(), String> {
        match self.0.upgrade() {
            Some(model) => model.handle_index_batch(remote, &folder, files, true),
            None => Err("model gone".to_string()),
        }
    }

    async fn index_update(
        &self,
        remote: DeviceId,
        folder: String,
        files: Vec<FileInfo>,
    ) -> Result<(), String> {
        match self.0.upgrade() {
            Some(model) => model.handle_index_batch(remote, &folder, files, false),
            None => Err("model gone".to_string()),
        }
    }

    async fn request(&self, remote: DeviceId, request: Request) -> Result<Bytes, ErrorCode> {
        match self.0.upgrade() {
            Some(model) => model.handle_request(remote, request).await,
            None => Err(ErrorCode::Generic),
        }
    }

    async fn download_progress(
        &self,
        remote: DeviceId,
        folder: String,
        updates: Vec<DownloadProgressUpdate>,
    ) {
        if let Some(model) = self.0.upgrade() {
            model.handle_download_progress(remote, folder, updates);
        }
    }

    async fn closed(&self, remote: DeviceId, reason: String) {
        if let Some(model) = self.0.upgrade() {
            model.handle_closed(remote, &reason);
        }
    }
}

/// The runner-facing face of the model: read-only peer lookup plus index
/// announcements.
struct ModelView(Weak<Model>);

#[async_trait]
impl ClusterView for ModelView {
    fn connections_for(&self, folder: &str, devices: &[DeviceId]) -> Vec<Arc<Connection>> {
        let Some(model) = self.0.upgrade() else {
            return Vec::new();
        };
        let cfg = model.config.config();
        let Some(folder_cfg) = cfg.folder(folder) else {
            return Vec::new();
        };
        let connections = model.connections.read();
        devices
            .iter()
            .filter(|d| folder_cfg.shares_device(d))
            .filter_map(|d| connections.get(d).cloned())
            .filter(|c| !c.is_closed())
            .collect()
    }

    fn devices_with_temp_block(&self, folder: &str, name: &str, index: u32) -> Vec<DeviceId> {
        let Some(model) = self.0.upgrade() else {
            return Vec::new();
        };
        let downloads = model.downloads.read();
        let key = (folder.to_string(), name.to_string());
        downloads
            .iter()
            .filter(|(_, files)| files.get(&key).is_some_and(|blocks| blocks.contains(&index)))
            .map(|(device, _)| *device)
            .collect()
    }

    async fn local_index_updated(&self, folder: &str, files: Vec<FileInfo>) {
        let Some(model) = self.0.upgrade() else {
            return;
        };
        let cfg = model.config.config();
        let Some(folder_cfg) = cfg.folder(folder) else {
            return;
        };
        let conns: Vec<Arc<Connection>> = {
            let connections = model.connections.read();
            folder_cfg
                .devices
                .iter()
                .filter_map(|d| connections.get(&d.device_id).cloned())
                .collect()
        };
        for conn in conns {
            let folder = folder.to_string();
            let files = files.clone();
            tokio::spawn(async move {
                if let Err(e) = conn.send_index_update(folder, files).await {
                    debug!("index update not sent: {e}");
                }
            });
        }
    }

    async fn broadcast_download_progress(&self, folder: &str, updates: Vec<DownloadProgressUpdate>) {
        let Some(model) = self.0.upgrade() else {
            return;
        };
        let cfg = model.config.config();
        let Some(folder_cfg) = cfg.folder(folder) else {
            return;
        };
        let conns: Vec<Arc<Connection>> = {
            let connections = model.connections.read();
            folder_cfg
                .devices
                .iter()
                .filter_map(|d| connections.get(&d.device_id).cloned())
                .collect()
        };
        for conn in conns {
            let folder = folder.to_string();
            let updates = updates.clone();
            tokio::spawn(async move {
                let _ = conn.send_download_progress(folder, updates).await;
            });
        }
    }
}
