//! Per-folder view over the index: local, remote, global
//!
//! The file set mirrors one folder's database content in memory and
//! answers the questions the engine keeps asking: what do we have, what
//! does each peer have, which record wins per path, and what do we still
//! need. All mutation goes through here so the memory image and the
//! database never diverge.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use meshsync_core::vector::Ordering as VecOrdering;
use meshsync_core::{DeviceId, FileInfo};

use crate::error::DbError;
use crate::index::IndexDb;

struct Inner {
    local: BTreeMap<String, FileInfo>,
    remote: HashMap<DeviceId, BTreeMap<String, FileInfo>>,
    sequence: u64,
    remote_sequence: HashMap<DeviceId, u64>,
}

/// A folder's synchronized state across all devices.
pub struct FileSet {
    folder: String,
    local_device: DeviceId,
    db: Arc<IndexDb>,
    inner: RwLock<Inner>,
}

impl FileSet {
    /// Open a folder's file set, rebuilding the in-memory views from the
    /// database.
    ///
    /// # Errors
    /// Returns an error if the database cannot be read.
    pub fn open(
        folder: impl Into<String>,
        local_device: DeviceId,
        db: Arc<IndexDb>,
    ) -> Result<Self, DbError> {
        let folder = folder.into();

        let mut local = BTreeMap::new();
        let mut sequence = 0;
        for file in db.all_files(&folder, &local_device)? {
            sequence = sequence.max(file.sequence);
            local.insert(file.name.clone(), file);
        }

        let mut remote = HashMap::new();
        let mut remote_sequence = HashMap::new();
        for device in db.devices(&folder)? {
            if device == local_device {
                continue;
            }
            let mut view = BTreeMap::new();
            let mut max_seq = 0;
            for file in db.all_files(&folder, &device)? {
                max_seq = max_seq.max(file.sequence);
                view.insert(file.name.clone(), file);
            }
            remote.insert(device, view);
            remote_sequence.insert(device, max_seq);
        }

        Ok(Self {
            folder,
            local_device,
            db,
            inner: RwLock::new(Inner {
                local,
                remote,
                sequence,
                remote_sequence,
            }),
        })
    }

    #[must_use]
    pub fn folder(&self) -> &str {
        &self.folder
    }

    #[must_use]
    pub fn local_device(&self) -> DeviceId {
        self.local_device
    }

    /// Highest local sequence committed so far.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.inner.read().sequence
    }

    /// Highest sequence seen from a remote device.
    #[must_use]
    pub fn remote_sequence(&self, device: &DeviceId) -> u64 {
        self.inner
            .read()
            .remote_sequence
            .get(device)
            .copied()
            .unwrap_or(0)
    }

    /// Commit local records, assigning each the next sequence number.
    /// Returns the records as committed (with sequences filled in).
    ///
    /// # Errors
    /// Returns an error if the database write fails.
    pub fn update_local(&self, mut files: Vec<FileInfo>) -> Result<Vec<FileInfo>, DbError> {
        let mut inner = self.inner.write();
        for file in &mut files {
            inner.sequence += 1;
            file.sequence = inner.sequence;
        }
        self.db
            .put_files(&self.folder, &self.local_device, &files, true)?;
        for file in &files {
            inner.local.insert(file.name.clone(), file.clone());
        }
        Ok(files)
    }

    /// Replace a remote device's entire view (a full `Index`).
    ///
    /// # Errors
    /// Returns an error if sequences regress within the batch or the
    /// database write fails.
    pub fn replace_remote(&self, device: DeviceId, files: Vec<FileInfo>) -> Result<(), DbError> {
        check_ascending(&device, 0, &files)?;
        let mut inner = self.inner.write();
        self.db.drop_device(&self.folder, &device)?;
        self.db.put_files(&self.folder, &device, &files, false)?;

        let mut view = BTreeMap::new();
        let mut max_seq = 0;
        for file in files {
            max_seq = max_seq.max(file.sequence);
            view.insert(file.name.clone(), file);
        }
        inner.remote.insert(device, view);
        inner.remote_sequence.insert(device, max_seq);
        Ok(())
    }

    /// Apply an incremental update from a remote device (`IndexUpdate`).
    /// Records at or below the highest sequence already seen are dropped
    /// (redelivered data, e.g. a delta overlapping the initial index).
    ///
    /// # Errors
    /// Returns [`DbError::OutOfOrderSequence`] if sequences regress
    /// within the batch itself.
    pub fn apply_remote(&self, device: DeviceId, files: Vec<FileInfo>) -> Result<(), DbError> {
        let mut inner = self.inner.write();
        let have = inner.remote_sequence.get(&device).copied().unwrap_or(0);
        check_ascending(&device, 0, &files)?;
        let fresh: Vec<FileInfo> = files.into_iter().filter(|f| f.sequence > have).collect();
        if fresh.is_empty() {
            return Ok(());
        }

        self.db.put_files(&self.folder, &device, &fresh, false)?;

        let view = inner.remote.entry(device).or_default();
        let mut max_seq = have;
        for file in fresh {
            max_seq = max_seq.max(file.sequence);
            view.insert(file.name.clone(), file);
        }
        inner.remote_sequence.insert(device, max_seq);
        Ok(())
    }

    /// Forget a remote device's view entirely (folder no longer shared).
    ///
    /// # Errors
    /// Returns an error if the database write fails.
    pub fn drop_remote(&self, device: &DeviceId) -> Result<(), DbError> {
        let mut inner = self.inner.write();
        self.db.drop_device(&self.folder, device)?;
        inner.remote.remove(device);
        inner.remote_sequence.remove(device);
        Ok(())
    }

    #[must_use]
    pub fn local(&self, name: &str) -> Option<FileInfo> {
        self.inner.read().local.get(name).cloned()
    }

    #[must_use]
    pub fn remote(&self, device: &DeviceId, name: &str) -> Option<FileInfo> {
        self.inner.read().remote.get(device)?.get(name).cloned()
    }

    /// All local records, in name order.
    #[must_use]
    pub fn local_files(&self) -> Vec<FileInfo> {
        self.inner.read().local.values().cloned().collect()
    }

    /// The winning record for a path across all devices, and the device it
    /// came from (`None` for our own).
    #[must_use]
    pub fn global(&self, name: &str) -> Option<(FileInfo, Option<DeviceId>)> {
        let inner = self.inner.read();
        Self::global_locked(&inner, &self.local_device, name)
    }

    fn global_locked(
        inner: &Inner,
        local_device: &DeviceId,
        name: &str,
    ) -> Option<(FileInfo, Option<DeviceId>)> {
        let mut winner: Option<(&FileInfo, Option<DeviceId>)> = None;

        if let Some(local) = inner.local.get(name) {
            winner = Some((local, None));
        }
        for (device, view) in &inner.remote {
            let Some(candidate) = view.get(name) else {
                continue;
            };
            if !candidate.is_usable() {
                continue;
            }
            winner = match winner {
                None => Some((candidate, Some(*device))),
                Some((best, best_dev)) => {
                    let best_id = best_dev.as_ref().unwrap_or(local_device);
                    if candidate.wins_conflict(best, device, best_id) {
                        Some((candidate, Some(*device)))
                    } else {
                        Some((best, best_dev))
                    }
                }
            };
        }

        winner.map(|(f, d)| (f.clone(), d))
    }

    /// Paths whose global record is strictly newer than our local one,
    /// with the winning record. Deletions for paths we never had are
    /// excluded.
    #[must_use]
    pub fn needed(&self) -> Vec<(FileInfo, Option<DeviceId>)> {
        let inner = self.inner.read();

        let mut names: BTreeSet<&String> = inner.local.keys().collect();
        for view in inner.remote.values() {
            names.extend(view.keys());
        }

        let mut needed = Vec::new();
        for name in names {
            let Some((global, source)) = Self::global_locked(&inner, &self.local_device, name)
            else {
                continue;
            };
            // Our own record winning means nothing to pull.
            if source.is_none() {
                continue;
            }
            match inner.local.get(name) {
                // A remote entry won either by dominating our version or
                // by the concurrent tiebreak; both mean we pull, unless
                // the records describe the same content anyway.
                Some(local) => {
                    if local.version.compare(&global.version) != VecOrdering::Equal
                        && !local.is_equivalent(&global)
                    {
                        needed.push((global, source));
                    }
                }
                None => {
                    if !global.deleted {
                        needed.push((global, source));
                    }
                }
            }
        }
        needed
    }

    /// Remote devices currently advertising the winning version of a path.
    #[must_use]
    pub fn availability(&self, name: &str) -> Vec<DeviceId> {
        let inner = self.inner.read();
        let Some((global, _)) = Self::global_locked(&inner, &self.local_device, name) else {
            return Vec::new();
        };
        let mut devices: Vec<DeviceId> = inner
            .remote
            .iter()
            .filter(|(_, view)| {
                view.get(name).is_some_and(|f| {
                    !f.deleted
                        && f.is_usable()
                        && f.version.compare(&global.version) == VecOrdering::Equal
                })
            })
            .map(|(device, _)| *device)
            .collect();
        devices.sort();
        devices
    }

    /// Local files containing a block with this hash.
    ///
    /// # Errors
    /// Returns an error if the database read fails.
    pub fn local_blocks_with_hash(&self, hash: &[u8; 32]) -> Result<Vec<(String, u32)>, DbError> {
        self.db.blocks_with_hash(&self.folder, hash)
    }

    /// Local records committed after `sequence`, for incremental index
    /// sending.
    ///
    /// # Errors
    /// Returns an error if the database read fails.
    pub fn local_files_from(&self, sequence: u64, limit: usize) -> Result<Vec<FileInfo>, DbError> {
        self.db
            .files_from_sequence(&self.folder, &self.local_device, sequence, limit)
    }
}

fn check_ascending(device: &DeviceId, have: u64, files: &[FileInfo]) -> Result<(), DbError> {
    let mut prev = have;
    for file in files {
        if file.sequence <= prev {
            return Err(DbError::OutOfOrderSequence {
                device: device.to_string(),
                got: file.sequence,
                have: prev,
            });
        }
        prev = file.sequence;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshsync_core::blocks::hash_block;
    use meshsync_core::device_id::ShortId;
    use meshsync_core::{FileType, Vector};

    fn dev(n: u8) -> DeviceId {
        DeviceId::from_raw([n; 32])
    }

    fn open_set(dir: &std::path::Path, local: DeviceId) -> FileSet {
        let db = Arc::new(IndexDb::open(dir).unwrap());
        FileSet::open("folder", local, db).unwrap()
    }

    fn file(name: &str, version: &[(u64, u64)], sequence: u64) -> FileInfo {
        FileInfo {
            name: name.to_string(),
            file_type: FileType::File,
            size: 5,
            permissions: 0o644,
            modified_s: 1000,
            modified_ns: 0,
            version: Vector::from_counters(
                version
                    .iter()
                    .map(|&(id, value)| meshsync_core::Counter {
                        id: ShortId(id),
                        value,
                    })
                    .collect(),
            ),
            sequence,
            deleted: false,
            invalid: false,
            no_permissions: false,
            block_size: meshsync_core::BLOCK_SIZE_MIN,
            blocks: vec![hash_block(b"hello")],
            symlink_target: String::new(),
        }
    }

    #[test]
    fn test_local_sequence_assignment() {
        let dir = tempfile::tempdir().unwrap();
        let set = open_set(dir.path(), dev(1));

        let committed = set
            .update_local(vec![file("a", &[(1, 1)], 0), file("b", &[(1, 1)], 0)])
            .unwrap();
        assert_eq!(committed[0].sequence, 1);
        assert_eq!(committed[1].sequence, 2);
        assert_eq!(set.sequence(), 2);

        let committed = set.update_local(vec![file("a", &[(1, 2)], 0)]).unwrap();
        assert_eq!(committed[0].sequence, 3);
    }

    #[test]
    fn test_remote_view_and_global_winner() {
        let dir = tempfile::tempdir().unwrap();
        let set = open_set(dir.path(), dev(1));

        set.update_local(vec![file("f", &[(1, 1)], 0)]).unwrap();
        set.replace_remote(dev(2), vec![file("f", &[(1, 1), (2, 1)], 1)])
            .unwrap();

        let (global, source) = set.global("f").unwrap();
        assert_eq!(source, Some(dev(2)));
        assert_eq!(global.version.counter(ShortId(2)), 1);

        let needed = set.needed();
        assert_eq!(needed.len(), 1);
        assert_eq!(needed[0].0.name, "f");
    }

    #[test]
    fn test_local_up_to_date_not_needed() {
        let dir = tempfile::tempdir().unwrap();
        let set = open_set(dir.path(), dev(1));

        set.update_local(vec![file("f", &[(1, 2)], 0)]).unwrap();
        set.replace_remote(dev(2), vec![file("f", &[(1, 1)], 1)])
            .unwrap();

        assert!(set.needed().is_empty());
        let (_, source) = set.global("f").unwrap();
        assert_eq!(source, None);
    }

    #[test]
    fn test_concurrent_losing_local_is_needed() {
        let dir = tempfile::tempdir().unwrap();
        let set = open_set(dir.path(), dev(1));

        set.update_local(vec![file("f", &[(1, 1)], 0)]).unwrap();
        // Concurrent remote edit with a newer mtime: it wins the tiebreak.
        let mut remote = file("f", &[(2, 1)], 1);
        remote.modified_s = 5000;
        remote.blocks = vec![hash_block(b"other")];
        set.replace_remote(dev(2), vec![remote]).unwrap();

        let needed = set.needed();
        assert_eq!(needed.len(), 1);
        assert_eq!(needed[0].1, Some(dev(2)));
    }

    #[test]
    fn test_remote_deletion_of_unknown_path_not_needed() {
        let dir = tempfile::tempdir().unwrap();
        let set = open_set(dir.path(), dev(1));

        let mut tombstone = file("ghost", &[(2, 1)], 1);
        tombstone.deleted = true;
        tombstone.blocks.clear();
        set.replace_remote(dev(2), vec![tombstone]).unwrap();

        assert!(set.needed().is_empty());
    }

    #[test]
    fn test_regressing_batch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let set = open_set(dir.path(), dev(1));

        let err = set
            .apply_remote(
                dev(2),
                vec![file("a", &[(2, 1)], 5), file("b", &[(2, 1)], 4)],
            )
            .unwrap_err();
        assert!(matches!(err, DbError::OutOfOrderSequence { .. }));
        assert_eq!(set.remote_sequence(&dev(2)), 0);
    }

    #[test]
    fn test_stale_redelivery_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let set = open_set(dir.path(), dev(1));

        set.apply_remote(dev(2), vec![file("a", &[(2, 1)], 5)])
            .unwrap();
        // The same (or an older) record delivered again changes nothing.
        set.apply_remote(dev(2), vec![file("a", &[(2, 9)], 5)])
            .unwrap();
        assert_eq!(set.remote_sequence(&dev(2)), 5);
        assert_eq!(
            set.remote(&dev(2), "a").unwrap().version.counter(ShortId(2)),
            1
        );
    }

    #[test]
    fn test_full_index_then_empty_update_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let set = open_set(dir.path(), dev(1));

        set.replace_remote(dev(2), vec![file("a", &[(2, 1)], 1)])
            .unwrap();
        let before = set.remote(&dev(2), "a").unwrap();

        set.apply_remote(dev(2), Vec::new()).unwrap();
        let after = set.remote(&dev(2), "a").unwrap();
        assert_eq!(before, after);
        assert_eq!(set.remote_sequence(&dev(2)), 1);
    }

    #[test]
    fn test_availability_tracks_winning_version() {
        let dir = tempfile::tempdir().unwrap();
        let set = open_set(dir.path(), dev(1));

        set.replace_remote(dev(2), vec![file("f", &[(2, 2)], 1)])
            .unwrap();
        set.replace_remote(dev(3), vec![file("f", &[(2, 1)], 1)])
            .unwrap();

        // Only the device with the winning version is a source.
        assert_eq!(set.availability("f"), vec![dev(2)]);
    }

    #[test]
    fn test_winner_deterministic_across_insert_order() {
        let a = file("f", &[(2, 1)], 1);
        let b = file("f", &[(3, 1)], 1);

        let dir1 = tempfile::tempdir().unwrap();
        let set1 = open_set(dir1.path(), dev(1));
        set1.replace_remote(dev(2), vec![a.clone()]).unwrap();
        set1.replace_remote(dev(3), vec![b.clone()]).unwrap();

        let dir2 = tempfile::tempdir().unwrap();
        let set2 = open_set(dir2.path(), dev(1));
        set2.replace_remote(dev(3), vec![b]).unwrap();
        set2.replace_remote(dev(2), vec![a]).unwrap();

        let (w1, s1) = set1.global("f").unwrap();
        let (w2, s2) = set2.global("f").unwrap();
        assert_eq!(s1, s2);
        assert_eq!(w1.version, w2.version);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(IndexDb::open(dir.path()).unwrap());
        {
            let set = FileSet::open("folder", dev(1), db.clone()).unwrap();
            set.update_local(vec![file("a", &[(1, 1)], 0)]).unwrap();
            set.replace_remote(dev(2), vec![file("a", &[(1, 1), (2, 1)], 3)])
                .unwrap();
        }

        let set = FileSet::open("folder", dev(1), db).unwrap();
        assert_eq!(set.sequence(), 1);
        assert_eq!(set.remote_sequence(&dev(2)), 3);
        assert_eq!(set.needed().len(), 1);
    }

    #[test]
    fn test_writing_then_reading_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let set = open_set(dir.path(), dev(1));

        let committed = set.update_local(vec![file("x", &[(1, 3)], 0)]).unwrap();
        let read_back = set.local("x").unwrap();
        assert_eq!(committed[0], read_back);
    }
}
