//! meshsync-core: identities, versions, and file metadata
//!
//! The leaf types of the synchronization engine: device identities and
//! their short forms, version vectors, file records with content blocks,
//! ignore patterns, path validation, and the live configuration store.

pub mod blocks;
pub mod config;
pub mod device_id;
pub mod events;
pub mod fileinfo;
pub mod ignore;
pub mod paths;
pub mod vector;

pub use blocks::{block_size, hash_blocks, BlockInfo, BLOCK_SIZE_MAX, BLOCK_SIZE_MIN};
pub use config::{
    CommitResult, Committer, Compression, Config, ConfigStore, DeviceConfig, FolderConfig,
    FolderDevice, FolderType, Options,
};
pub use device_id::{DeviceId, ShortId};
pub use events::{Event, EventSink, FolderActivity};
pub use fileinfo::{FileInfo, FileType};
pub use ignore::IgnoreMatcher;
pub use vector::{Counter, Ordering, Vector};
