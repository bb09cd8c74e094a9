//! File metadata records: the unit of synchronization

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::blocks::BlockInfo;
use crate::device_id::DeviceId;
use crate::vector::{Ordering, Vector};

/// Kind of filesystem entry a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Directory,
    Symlink,
}

impl FileType {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::File => 0,
            Self::Directory => 1,
            Self::Symlink => 2,
        }
    }

    #[must_use]
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::File),
            1 => Some(Self::Directory),
            2 => Some(Self::Symlink),
            _ => None,
        }
    }
}

/// Metadata for one synchronized entry, as stored in the index and
/// exchanged between devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Folder-relative path, forward slashes, normalized
    pub name: String,
    pub file_type: FileType,
    /// Size in bytes (zero for directories and symlinks)
    pub size: u64,
    /// Unix permission bits
    pub permissions: u32,
    /// Modification time, seconds since the epoch
    pub modified_s: i64,
    /// Nanosecond remainder of the modification time
    pub modified_ns: i32,
    /// Version vector; the authority on which record is newer
    pub version: Vector,
    /// Per-device sequence number assigned when the record was committed
    pub sequence: u64,
    pub deleted: bool,
    /// Record is unusable (scan error, out-of-policy); never a sync source
    pub invalid: bool,
    /// Permission bits are not meaningful on the origin filesystem
    pub no_permissions: bool,
    /// Block size used to cut this file, so peers agree on boundaries
    pub block_size: u32,
    /// Content blocks; empty for deleted records and non-files
    pub blocks: Vec<BlockInfo>,
    /// Target path for symlinks, empty otherwise
    pub symlink_target: String,
}

impl FileInfo {
    #[must_use]
    pub fn is_file(&self) -> bool {
        self.file_type == FileType::File
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.file_type == FileType::Directory
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }

    /// Usable as a sync source: present and not flagged invalid.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        !self.invalid
    }

    #[must_use]
    pub fn modified(&self) -> SystemTime {
        if self.modified_s >= 0 {
            UNIX_EPOCH
                + Duration::from_secs(self.modified_s as u64)
                + Duration::from_nanos(self.modified_ns.max(0) as u64)
        } else {
            UNIX_EPOCH - Duration::from_secs(self.modified_s.unsigned_abs())
        }
    }

    /// Set the modification time from a `SystemTime`.
    pub fn set_modified(&mut self, t: SystemTime) {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => {
                self.modified_s = d.as_secs() as i64;
                self.modified_ns = d.subsec_nanos() as i32;
            }
            Err(e) => {
                self.modified_s = -(e.duration().as_secs() as i64);
                self.modified_ns = 0;
            }
        }
    }

    /// Whether two records describe equivalent content and metadata,
    /// ignoring bookkeeping fields (sequence, version).
    #[must_use]
    pub fn is_equivalent(&self, other: &Self) -> bool {
        self.name == other.name
            && self.file_type == other.file_type
            && self.deleted == other.deleted
            && self.size == other.size
            && self.blocks == other.blocks
            && self.symlink_target == other.symlink_target
    }

    /// Decide the winner between two records for the same path whose
    /// versions do not order each other.
    ///
    /// The chain: a present entry beats a deleted one; then the newer
    /// modification time; then the greater device id. `self_dev` and
    /// `other_dev` are the devices whose index each record came from, which
    /// makes the result independent of iteration order.
    #[must_use]
    pub fn wins_conflict(&self, other: &Self, self_dev: &DeviceId, other_dev: &DeviceId) -> bool {
        match self.version.compare(&other.version) {
            Ordering::Greater => return true,
            Ordering::Lesser => return false,
            Ordering::Equal | Ordering::Concurrent => {}
        }
        if self.deleted != other.deleted {
            return !self.deleted;
        }
        let self_mtime = (self.modified_s, self.modified_ns);
        let other_mtime = (other.modified_s, other.modified_ns);
        if self_mtime != other_mtime {
            return self_mtime > other_mtime;
        }
        self_dev > other_dev
    }
}

/// A deletion record superseding `prev`, authored by `short` via the
/// caller-updated version vector.
#[must_use]
pub fn tombstone_of(prev: &FileInfo, version: Vector) -> FileInfo {
    FileInfo {
        name: prev.name.clone(),
        file_type: prev.file_type,
        size: 0,
        permissions: 0,
        modified_s: prev.modified_s,
        modified_ns: prev.modified_ns,
        version,
        sequence: 0,
        deleted: true,
        invalid: false,
        no_permissions: prev.no_permissions,
        block_size: 0,
        blocks: Vec::new(),
        symlink_target: String::new(),
    }
}
