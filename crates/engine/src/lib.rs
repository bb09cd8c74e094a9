//! meshsync-engine: folder runners, the puller, and the model
//!
//! The synchronization engine proper. The model owns per-folder runners
//! and per-peer connections, dispatches inbound protocol messages, and
//! keeps the running state reconciled with the configuration. Runners
//! scan their root and pull needed files from peers, block by block.
//!
//! What is deliberately absent: transport dialing and TLS (connections
//! arrive as authenticated streams), discovery, any control surface, and
//! the filesystem watcher. Those are external collaborators.

pub mod folder;
pub mod fs;
pub mod model;
pub mod names;
pub mod puller;
pub mod scanner;
pub mod versioner;
pub mod view;

pub use folder::{FolderDeps, FolderRunner};
pub use fs::{EntryMeta, Filesystem, RealFs};
pub use model::Model;
pub use puller::{PullConfig, PullSummary};
pub use scanner::{scan_folder, ScanConfig};
pub use versioner::{NoopVersioner, TrashVersioner, Versioner, VERSIONS_DIR};
pub use view::{ClusterView, EmptyView};
