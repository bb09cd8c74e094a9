//! Cluster configuration: folders, devices, options
//!
//! The store keeps a live configuration and notifies subscribers through a
//! verify-then-commit protocol: every subscriber may veto a transition
//! before any of them observes it. Commits that need a process restart to
//! take effect latch a flag the control surface can read.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::device_id::DeviceId;

/// Synchronization direction for a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FolderType {
    #[default]
    SendReceive,
    SendOnly,
    ReceiveOnly,
}

/// Wire compression policy towards a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Compression {
    Never,
    #[default]
    Metadata,
    Always,
}

/// A device's membership in a folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderDevice {
    pub device_id: DeviceId,
    /// The introducer that added this device to the folder, if any
    #[serde(default)]
    pub introduced_by: Option<DeviceId>,
}

fn default_marker_name() -> String {
    ".stfolder".to_string()
}

fn default_rescan_interval() -> u64 {
    3600
}

fn default_max_conflicts() -> i32 {
    10
}

fn default_copiers() -> usize {
    2
}

fn default_pullers() -> usize {
    16
}

/// Configuration for one synchronized folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderConfig {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub path: PathBuf,
    #[serde(default)]
    pub folder_type: FolderType,
    #[serde(default)]
    pub devices: Vec<FolderDevice>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default = "default_marker_name")]
    pub marker_name: String,
    #[serde(default = "default_rescan_interval")]
    pub rescan_interval_s: u64,
    #[serde(default)]
    pub mod_time_window_s: u64,
    /// Cap on conflict copies kept per file; negative means unlimited
    #[serde(default = "default_max_conflicts")]
    pub max_conflicts: i32,
    #[serde(default = "default_copiers")]
    pub copiers: usize,
    #[serde(default = "default_pullers")]
    pub pullers: usize,
    /// Keep displaced files under `.stversions` instead of deleting
    #[serde(default)]
    pub trash_versioning: bool,
}

impl FolderConfig {
    #[must_use]
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            label: String::new(),
            path: path.into(),
            folder_type: FolderType::default(),
            devices: Vec::new(),
            paused: false,
            marker_name: default_marker_name(),
            rescan_interval_s: default_rescan_interval(),
            mod_time_window_s: 0,
            max_conflicts: default_max_conflicts(),
            copiers: default_copiers(),
            pullers: default_pullers(),
            trash_versioning: false,
        }
    }

    /// The label if set, the id otherwise; what humans see.
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.label.is_empty() {
            &self.id
        } else {
            &self.label
        }
    }

    #[must_use]
    pub fn shares_device(&self, device: &DeviceId) -> bool {
        self.devices.iter().any(|d| d.device_id == *device)
    }

    /// Changes to any of these fields require tearing the folder runner
    /// down and starting a fresh one.
    #[must_use]
    pub fn requires_restart_from(&self, other: &Self) -> bool {
        self.path != other.path
            || self.folder_type != other.folder_type
            || self.marker_name != other.marker_name
    }
}

/// Configuration for one known device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_id: DeviceId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub compression: Compression,
    /// May add and remove devices from shared folders via its cluster view
    #[serde(default)]
    pub introducer: bool,
    /// Never remove devices this one introduced, even if it drops them
    #[serde(default)]
    pub skip_introduction_removals: bool,
    #[serde(default)]
    pub introduced_by: Option<DeviceId>,
    /// Unknown folders announced by this device are created locally
    #[serde(default)]
    pub auto_accept_folders: bool,
    /// Outstanding request budget towards this device, in KiB; 0 = default
    #[serde(default)]
    pub max_request_kib: u64,
    #[serde(default)]
    pub paused: bool,
}

impl DeviceConfig {
    #[must_use]
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            name: String::new(),
            compression: Compression::default(),
            introducer: false,
            skip_introduction_removals: false,
            introduced_by: None,
            auto_accept_folders: false,
            max_request_kib: 0,
            paused: false,
        }
    }
}

fn default_folder_base() -> PathBuf {
    PathBuf::from(".")
}

/// Cluster-wide options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Options {
    /// Adopt the latest name a device announces for itself instead of
    /// keeping the first one seen
    #[serde(default)]
    pub overwrite_remote_dev_names: bool,
    #[serde(default)]
    pub ignored_devices: Vec<DeviceId>,
    /// Where auto-accepted folders are created
    #[serde(default = "default_folder_base")]
    pub default_folder_path: PathBuf,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            overwrite_remote_dev_names: false,
            ignored_devices: Vec::new(),
            default_folder_path: default_folder_base(),
        }
    }
}

/// The complete configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub folders: Vec<FolderConfig>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub options: Options,
}

impl Config {
    #[must_use]
    pub fn folder(&self, id: &str) -> Option<&FolderConfig> {
        self.folders.iter().find(|f| f.id == id)
    }

    #[must_use]
    pub fn device(&self, id: &DeviceId) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.device_id == *id)
    }

    /// Folders shared with the given device.
    #[must_use]
    pub fn folders_for_device(&self, device: &DeviceId) -> Vec<&FolderConfig> {
        self.folders
            .iter()
            .filter(|f| f.shares_device(device))
            .collect()
    }
}

/// What a commit asks of the process afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitResult {
    Applied,
    RequiresRestart,
}

/// A configuration change observer. `verify_change` may veto the
/// transition; once every subscriber has verified, `commit_change` runs on
/// each and must not fail.
pub trait Committer: Send + Sync {
    fn name(&self) -> &str;

    /// Inspect the proposed transition. An `Err` aborts it.
    fn verify_change(&self, from: &Config, to: &Config) -> Result<(), String>;

    fn commit_change(&self, from: &Config, to: &Config) -> CommitResult;
}

/// Live configuration store with subscriptions and TOML persistence.
pub struct ConfigStore {
    current: Mutex<Config>,
    subscribers: Mutex<Vec<Arc<dyn Committer>>>,
    requires_restart: AtomicBool,
    path: Option<PathBuf>,
}

impl ConfigStore {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            current: Mutex::new(config),
            subscribers: Mutex::new(Vec::new()),
            requires_restart: AtomicBool::new(false),
            path: None,
        }
    }

    /// Load from a TOML file; a missing file yields the default config.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load(path: &Path) -> color_eyre::Result<Self> {
        let config = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            toml::from_str(&text)?
        } else {
            Config::default()
        };
        Ok(Self {
            current: Mutex::new(config),
            subscribers: Mutex::new(Vec::new()),
            requires_restart: AtomicBool::new(false),
            path: Some(path.to_path_buf()),
        })
    }

    /// Persist the current configuration, when backed by a file.
    ///
    /// # Errors
    /// Returns an error if serialization or the write fails.
    pub fn save(&self) -> color_eyre::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let text = toml::to_string_pretty(&*self.current.lock())?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn subscribe(&self, committer: Arc<dyn Committer>) {
        self.subscribers.lock().push(committer);
    }

    pub fn unsubscribe(&self, name: &str) {
        self.subscribers.lock().retain(|c| c.name() != name);
    }

    /// A clone of the current configuration.
    #[must_use]
    pub fn config(&self) -> Config {
        self.current.lock().clone()
    }

    #[must_use]
    pub fn folder(&self, id: &str) -> Option<FolderConfig> {
        self.current.lock().folder(id).cloned()
    }

    #[must_use]
    pub fn device(&self, id: &DeviceId) -> Option<DeviceConfig> {
        self.current.lock().device(id).cloned()
    }

    #[must_use]
    pub fn requires_restart(&self) -> bool {
        self.requires_restart.load(AtomicOrdering::SeqCst)
    }

    /// Replace the whole configuration, running the verify-then-commit
    /// protocol. On any veto the store is left unchanged.
    ///
    /// # Errors
    /// Returns the vetoing subscriber's reason.
    pub fn replace(&self, to: Config) -> color_eyre::Result<()> {
        let subscribers: Vec<_> = self.subscribers.lock().clone();

        let mut current = self.current.lock();
        let from = current.clone();

        for sub in &subscribers {
            if let Err(reason) = sub.verify_change(&from, &to) {
                return Err(color_eyre::eyre::eyre!(
                    "config change rejected by {}: {reason}",
                    sub.name()
                ));
            }
        }

        *current = to.clone();
        drop(current);

        for sub in &subscribers {
            if sub.commit_change(&from, &to) == CommitResult::RequiresRestart {
                self.requires_restart.store(true, AtomicOrdering::SeqCst);
            }
        }

        if let Err(e) = self.save() {
            warn!("failed to persist configuration: {e}");
        }
        Ok(())
    }

    /// Insert or update a folder.
    ///
    /// # Errors
    /// Propagates a subscriber veto.
    pub fn set_folder(&self, folder: FolderConfig) -> color_eyre::Result<()> {
        let mut cfg = self.config();
        match cfg.folders.iter_mut().find(|f| f.id == folder.id) {
            Some(existing) => *existing = folder,
            None => cfg.folders.push(folder),
        }
        self.replace(cfg)
    }

    /// Insert or update a device.
    ///
    /// # Errors
    /// Propagates a subscriber veto.
    pub fn set_device(&self, device: DeviceConfig) -> color_eyre::Result<()> {
        let mut cfg = self.config();
        match cfg
            .devices
            .iter_mut()
            .find(|d| d.device_id == device.device_id)
        {
            Some(existing) => *existing = device,
            None => cfg.devices.push(device),
        }
        self.replace(cfg)
    }

    /// Remove a device from the roster and from all folder memberships.
    ///
    /// # Errors
    /// Propagates a subscriber veto.
    pub fn remove_device(&self, id: &DeviceId) -> color_eyre::Result<()> {
        let mut cfg = self.config();
        cfg.devices.retain(|d| d.device_id != *id);
        for folder in &mut cfg.folders {
            folder.devices.retain(|d| d.device_id != *id);
        }
        self.replace(cfg)
    }
}
