//! Persistent index store over LMDB
//!
//! One environment holds every folder's index in a single keyspace with
//! byte-prefixed keys:
//!
//! ```text
//! 0x01 | folder | 0x00 | device (32B) | name          -> archived FileInfo
//! 0x02 | folder | 0x00 | device (32B) | be64(seq)     -> name
//! 0x03 | folder | 0x00 | blockhash (32B)              -> archived block refs
//! 0x04 | key                                          -> misc bytes
//! ```
//!
//! The sequence index keeps per-device records in commit order, which is
//! what incremental index sending iterates. The block index records local
//! files only and powers cross-file block reuse.

use std::path::Path;

use heed::types::Bytes as HeedBytes;
use heed::{Database, Env, EnvOpenOptions};
use tracing::{debug, info};

use meshsync_core::{DeviceId, FileInfo};

use crate::error::DbError;
use crate::values::{
    decode_block_list, decode_file, encode_block_list, encode_file, DbBlockList, DbBlockRef,
};

/// Bumped whenever the stored layout changes incompatibly.
pub const SCHEMA_VERSION: u64 = 1;

const KEY_FILE: u8 = 0x01;
const KEY_SEQUENCE: u8 = 0x02;
const KEY_BLOCK: u8 = 0x03;
const KEY_MISC: u8 = 0x04;

const MISC_SCHEMA_VERSION: &str = "schema-version";

fn file_prefix(folder: &str, device: &DeviceId) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + folder.len() + 32);
    key.push(KEY_FILE);
    key.extend_from_slice(folder.as_bytes());
    key.push(0);
    key.extend_from_slice(device.as_bytes());
    key
}

fn file_key(folder: &str, device: &DeviceId, name: &str) -> Vec<u8> {
    let mut key = file_prefix(folder, device);
    key.extend_from_slice(name.as_bytes());
    key
}

fn seq_prefix(folder: &str, device: &DeviceId) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + folder.len() + 32);
    key.push(KEY_SEQUENCE);
    key.extend_from_slice(folder.as_bytes());
    key.push(0);
    key.extend_from_slice(device.as_bytes());
    key
}

fn seq_key(folder: &str, device: &DeviceId, sequence: u64) -> Vec<u8> {
    let mut key = seq_prefix(folder, device);
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

fn block_key(folder: &str, hash: &[u8; 32]) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + folder.len() + 32);
    key.push(KEY_BLOCK);
    key.extend_from_slice(folder.as_bytes());
    key.push(0);
    key.extend_from_slice(hash);
    key
}

fn misc_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(KEY_MISC);
    key.extend_from_slice(name.as_bytes());
    key
}

fn kind_folder_prefix(kind: u8, folder: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + folder.len());
    key.push(kind);
    key.extend_from_slice(folder.as_bytes());
    key.push(0);
    key
}

/// The shared on-disk index.
pub struct IndexDb {
    env: Env,
    db: Database<HeedBytes, HeedBytes>,
}

impl IndexDb {
    /// Open or create the index at `path`.
    ///
    /// A schema version mismatch archives the existing database directory
    /// aside and starts fresh; folder rescans rebuild the content.
    ///
    /// # Errors
    /// Returns an error if the environment cannot be opened.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        std::fs::create_dir_all(path)?;
        let db = Self::open_env(path)?;

        match db.schema_version()? {
            None => {
                db.misc_put(MISC_SCHEMA_VERSION, &SCHEMA_VERSION.to_be_bytes())?;
                Ok(db)
            }
            Some(v) if v == SCHEMA_VERSION => Ok(db),
            Some(v) => {
                info!("index schema {v} is not {SCHEMA_VERSION}, archiving old database");
                drop(db);
                let mut backup = path.as_os_str().to_owned();
                backup.push(".migration-backup");
                let backup = std::path::PathBuf::from(backup);
                if backup.exists() {
                    std::fs::remove_dir_all(&backup)?;
                }
                std::fs::rename(path, &backup)?;
                std::fs::create_dir_all(path)?;
                let fresh = Self::open_env(path)?;
                fresh.misc_put(MISC_SCHEMA_VERSION, &SCHEMA_VERSION.to_be_bytes())?;
                Ok(fresh)
            }
        }
    }

    fn open_env(path: &Path) -> Result<Self, DbError> {
        // SAFETY: standard LMDB memory-mapped I/O; the directory is ours
        // alone while the Env is open.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(4 * 1024 * 1024 * 1024)
                .max_dbs(1)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let db: Database<HeedBytes, HeedBytes> = env
            .database_options()
            .types::<HeedBytes, HeedBytes>()
            .name("index")
            .create(&mut wtxn)?;
        wtxn.commit()?;

        Ok(Self { env, db })
    }

    fn schema_version(&self) -> Result<Option<u64>, DbError> {
        Ok(self.misc_get(MISC_SCHEMA_VERSION)?.and_then(|v| {
            let bytes: [u8; 8] = v.try_into().ok()?;
            Some(u64::from_be_bytes(bytes))
        }))
    }

    /// Commit a batch of records for one device in one write transaction.
    ///
    /// Replaces prior records per path, maintains the sequence index, and,
    /// for the local device, the block availability index.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub fn put_files(
        &self,
        folder: &str,
        device: &DeviceId,
        files: &[FileInfo],
        local: bool,
    ) -> Result<(), DbError> {
        let mut wtxn = self.env.write_txn()?;

        for file in files {
            let key = file_key(folder, device, &file.name);

            if let Some(old_bytes) = self.db.get(&wtxn, &key)? {
                let old = decode_file(old_bytes)?;
                self.db
                    .delete(&mut wtxn, &seq_key(folder, device, old.sequence))?;
                if local {
                    for block in &old.blocks {
                        let bkey = block_key(folder, &block.hash);
                        if let Some(bytes) = self.db.get(&wtxn, &bkey)? {
                            let mut list = decode_block_list(bytes)?;
                            list.entries.retain(|e| e.name != old.name);
                            if list.entries.is_empty() {
                                self.db.delete(&mut wtxn, &bkey)?;
                            } else {
                                self.db.put(&mut wtxn, &bkey, &encode_block_list(&list)?)?;
                            }
                        }
                    }
                }
            }

            self.db.put(&mut wtxn, &key, &encode_file(file)?)?;
            self.db.put(
                &mut wtxn,
                &seq_key(folder, device, file.sequence),
                file.name.as_bytes(),
            )?;

            if local && file.is_file() && !file.deleted && !file.invalid {
                for (index, block) in file.blocks.iter().enumerate() {
                    let bkey = block_key(folder, &block.hash);
                    let mut list = match self.db.get(&wtxn, &bkey)? {
                        Some(bytes) => decode_block_list(bytes)?,
                        None => DbBlockList::default(),
                    };
                    let entry = DbBlockRef {
                        name: file.name.clone(),
                        index: index as u32,
                    };
                    if !list.entries.contains(&entry) {
                        list.entries.push(entry);
                    }
                    self.db.put(&mut wtxn, &bkey, &encode_block_list(&list)?)?;
                }
            }
        }

        wtxn.commit()?;
        debug!(folder, count = files.len(), "committed index batch");
        Ok(())
    }

    /// Fetch one record.
    ///
    /// # Errors
    /// Returns an error on a failed read or a corrupt entry.
    pub fn get_file(
        &self,
        folder: &str,
        device: &DeviceId,
        name: &str,
    ) -> Result<Option<FileInfo>, DbError> {
        let rtxn = self.env.read_txn()?;
        match self.db.get(&rtxn, &file_key(folder, device, name))? {
            Some(bytes) => Ok(Some(decode_file(bytes)?)),
            None => Ok(None),
        }
    }

    /// All records for a device in a folder, in name order.
    ///
    /// # Errors
    /// Returns an error on a failed read or a corrupt entry.
    pub fn all_files(&self, folder: &str, device: &DeviceId) -> Result<Vec<FileInfo>, DbError> {
        let rtxn = self.env.read_txn()?;
        let prefix = file_prefix(folder, device);
        let mut files = Vec::new();
        for entry in self.db.prefix_iter(&rtxn, &prefix)? {
            let (_, bytes) = entry?;
            files.push(decode_file(bytes)?);
        }
        Ok(files)
    }

    /// Devices with any record in a folder.
    ///
    /// # Errors
    /// Returns an error on a failed read.
    pub fn devices(&self, folder: &str) -> Result<Vec<DeviceId>, DbError> {
        let rtxn = self.env.read_txn()?;
        let prefix = kind_folder_prefix(KEY_FILE, folder);
        let mut devices: Vec<DeviceId> = Vec::new();
        for entry in self.db.prefix_iter(&rtxn, &prefix)? {
            let (key, _) = entry?;
            let rest = &key[prefix.len()..];
            if rest.len() < 32 {
                return Err(DbError::Corrupt("file key shorter than device id".into()));
            }
            let mut id = [0u8; 32];
            id.copy_from_slice(&rest[..32]);
            let device = DeviceId::from_raw(id);
            if !devices.contains(&device) {
                devices.push(device);
            }
        }
        Ok(devices)
    }

    /// Records for a device with `sequence > from`, in sequence order.
    ///
    /// # Errors
    /// Returns an error on a failed read or a corrupt entry.
    pub fn files_from_sequence(
        &self,
        folder: &str,
        device: &DeviceId,
        from: u64,
        limit: usize,
    ) -> Result<Vec<FileInfo>, DbError> {
        let rtxn = self.env.read_txn()?;
        let prefix = seq_prefix(folder, device);
        let mut files = Vec::new();
        for entry in self.db.prefix_iter(&rtxn, &prefix)? {
            let (key, name_bytes) = entry?;
            let seq_bytes: [u8; 8] = key[prefix.len()..]
                .try_into()
                .map_err(|_| DbError::Corrupt("bad sequence key".into()))?;
            let sequence = u64::from_be_bytes(seq_bytes);
            if sequence <= from {
                continue;
            }
            let name = std::str::from_utf8(name_bytes)
                .map_err(|_| DbError::Corrupt("non-utf8 name in sequence index".into()))?;
            match self.db.get(&rtxn, &file_key(folder, device, name))? {
                // The primary record may have been superseded; only return
                // it while the sequence index entry is still current.
                Some(bytes) => {
                    let file = decode_file(bytes)?;
                    if file.sequence == sequence {
                        files.push(file);
                    }
                }
                None => continue,
            }
            if files.len() >= limit {
                break;
            }
        }
        Ok(files)
    }

    /// Local files holding a block with this hash, as `(name, block index)`.
    ///
    /// # Errors
    /// Returns an error on a failed read or a corrupt entry.
    pub fn blocks_with_hash(
        &self,
        folder: &str,
        hash: &[u8; 32],
    ) -> Result<Vec<(String, u32)>, DbError> {
        let rtxn = self.env.read_txn()?;
        match self.db.get(&rtxn, &block_key(folder, hash))? {
            Some(bytes) => {
                let list = decode_block_list(bytes)?;
                Ok(list
                    .entries
                    .into_iter()
                    .map(|e| (e.name, e.index))
                    .collect())
            }
            None => Ok(Vec::new()),
        }
    }

    /// Drop every record a device has in a folder.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub fn drop_device(&self, folder: &str, device: &DeviceId) -> Result<(), DbError> {
        let mut wtxn = self.env.write_txn()?;
        for prefix in [file_prefix(folder, device), seq_prefix(folder, device)] {
            let keys: Vec<Vec<u8>> = {
                let mut keys = Vec::new();
                for entry in self.db.prefix_iter(&wtxn, &prefix)? {
                    let (key, _) = entry?;
                    keys.push(key.to_vec());
                }
                keys
            };
            for key in keys {
                self.db.delete(&mut wtxn, &key)?;
            }
        }
        wtxn.commit()?;
        Ok(())
    }

    /// Drop an entire folder: every device's records, the block index, and
    /// folder-scoped misc entries.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub fn drop_folder(&self, folder: &str) -> Result<(), DbError> {
        let mut wtxn = self.env.write_txn()?;
        for kind in [KEY_FILE, KEY_SEQUENCE, KEY_BLOCK] {
            let prefix = kind_folder_prefix(kind, folder);
            let keys: Vec<Vec<u8>> = {
                let mut keys = Vec::new();
                for entry in self.db.prefix_iter(&wtxn, &prefix)? {
                    let (key, _) = entry?;
                    keys.push(key.to_vec());
                }
                keys
            };
            for key in keys {
                self.db.delete(&mut wtxn, &key)?;
            }
        }
        wtxn.commit()?;
        Ok(())
    }

    /// Read a misc entry.
    ///
    /// # Errors
    /// Returns an error on a failed read.
    pub fn misc_get(&self, name: &str) -> Result<Option<Vec<u8>>, DbError> {
        let rtxn = self.env.read_txn()?;
        Ok(self.db.get(&rtxn, &misc_key(name))?.map(<[u8]>::to_vec))
    }

    /// Write a misc entry.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub fn misc_put(&self, name: &str, value: &[u8]) -> Result<(), DbError> {
        let mut wtxn = self.env.write_txn()?;
        self.db.put(&mut wtxn, &misc_key(name), value)?;
        wtxn.commit()?;
        Ok(())
    }

    /// The delta index id we recorded for a (folder, device) pair: the
    /// token that makes a previous full index resumable.
    ///
    /// # Errors
    /// Returns an error on a failed read.
    pub fn delta_index_id(
        &self,
        folder: &str,
        device: &DeviceId,
    ) -> Result<Option<u64>, DbError> {
        let key = format!("delta/{folder}/{}", device.to_hex());
        Ok(self.misc_get(&key)?.and_then(|v| {
            let bytes: [u8; 8] = v.try_into().ok()?;
            Some(u64::from_be_bytes(bytes))
        }))
    }

    /// Record the delta index id for a (folder, device) pair.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub fn set_delta_index_id(
        &self,
        folder: &str,
        device: &DeviceId,
        id: u64,
    ) -> Result<(), DbError> {
        let key = format!("delta/{folder}/{}", device.to_hex());
        self.misc_put(&key, &id.to_be_bytes())
    }
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

    fn file(name: &str, sequence: u64, content: &[u8]) -> FileInfo {
        let mut version = Vector::new();
        version.update(ShortId(1));
        let mut block = hash_block(content);
        block.offset = 0;
        FileInfo {
            name: name.to_string(),
            file_type: FileType::File,
            size: content.len() as u64,
            permissions: 0o644,
            modified_s: 1000,
            modified_ns: 0,
            version,
            sequence,
            deleted: false,
            invalid: false,
            no_permissions: false,
            block_size: meshsync_core::BLOCK_SIZE_MIN,
            blocks: vec![block],
            symlink_target: String::new(),
        }
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let db = IndexDb::open(dir.path()).unwrap();

        let f = file("a.txt", 1, b"hello");
        db.put_files("folder", &dev(1), &[f.clone()], true).unwrap();

        let got = db.get_file("folder", &dev(1), "a.txt").unwrap().unwrap();
        assert_eq!(f, got);
        assert!(db.get_file("folder", &dev(2), "a.txt").unwrap().is_none());
    }

    #[test]
    fn test_sequence_iteration_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let db = IndexDb::open(dir.path()).unwrap();

        let files = vec![
            file("b.txt", 1, b"one"),
            file("a.txt", 2, b"two"),
            file("c.txt", 3, b"three"),
        ];
        db.put_files("folder", &dev(1), &files, true).unwrap();

        let from_zero = db.files_from_sequence("folder", &dev(1), 0, 100).unwrap();
        assert_eq!(
            from_zero.iter().map(|f| f.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let from_two = db.files_from_sequence("folder", &dev(1), 2, 100).unwrap();
        assert_eq!(from_two.len(), 1);
        assert_eq!(from_two[0].name, "c.txt");
    }

    #[test]
    fn test_superseded_sequence_entries_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let db = IndexDb::open(dir.path()).unwrap();

        db.put_files("folder", &dev(1), &[file("a.txt", 1, b"v1")], true)
            .unwrap();
        db.put_files("folder", &dev(1), &[file("a.txt", 2, b"v2")], true)
            .unwrap();

        let all = db.files_from_sequence("folder", &dev(1), 0, 100).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].sequence, 2);
    }

    #[test]
    fn test_block_index_local_only() {
        let dir = tempfile::tempdir().unwrap();
        let db = IndexDb::open(dir.path()).unwrap();

        let f = file("a.txt", 1, b"shared content");
        let hash = f.blocks[0].hash;

        db.put_files("folder", &dev(1), &[f.clone()], true).unwrap();
        db.put_files("folder", &dev(2), &[file("b.txt", 1, b"shared content")], false)
            .unwrap();

        let refs = db.blocks_with_hash("folder", &hash).unwrap();
        assert_eq!(refs, vec![("a.txt".to_string(), 0)]);
    }

    #[test]
    fn test_block_index_updated_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let db = IndexDb::open(dir.path()).unwrap();

        let old = file("a.txt", 1, b"old content");
        let old_hash = old.blocks[0].hash;
        db.put_files("folder", &dev(1), &[old], true).unwrap();

        let new = file("a.txt", 2, b"new content");
        let new_hash = new.blocks[0].hash;
        db.put_files("folder", &dev(1), &[new], true).unwrap();

        assert!(db.blocks_with_hash("folder", &old_hash).unwrap().is_empty());
        assert_eq!(
            db.blocks_with_hash("folder", &new_hash).unwrap(),
            vec![("a.txt".to_string(), 0)]
        );
    }

    #[test]
    fn test_drop_device() {
        let dir = tempfile::tempdir().unwrap();
        let db = IndexDb::open(dir.path()).unwrap();

        db.put_files("folder", &dev(1), &[file("a.txt", 1, b"x")], false)
            .unwrap();
        db.put_files("folder", &dev(2), &[file("b.txt", 1, b"y")], false)
            .unwrap();

        db.drop_device("folder", &dev(1)).unwrap();
        assert!(db.all_files("folder", &dev(1)).unwrap().is_empty());
        assert_eq!(db.all_files("folder", &dev(2)).unwrap().len(), 1);
        assert_eq!(db.devices("folder").unwrap(), vec![dev(2)]);
    }

    #[test]
    fn test_misc_and_delta_ids() {
        let dir = tempfile::tempdir().unwrap();
        let db = IndexDb::open(dir.path()).unwrap();

        assert!(db.delta_index_id("f", &dev(1)).unwrap().is_none());
        db.set_delta_index_id("f", &dev(1), 12345).unwrap();
        assert_eq!(db.delta_index_id("f", &dev(1)).unwrap(), Some(12345));
    }

    #[test]
    fn test_schema_version_persisted() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = IndexDb::open(dir.path()).unwrap();
            db.put_files("folder", &dev(1), &[file("a.txt", 1, b"x")], true)
                .unwrap();
        }
        // Reopen with the same schema: data survives.
        let db = IndexDb::open(dir.path()).unwrap();
        assert_eq!(db.all_files("folder", &dev(1)).unwrap().len(), 1);
    }
}
