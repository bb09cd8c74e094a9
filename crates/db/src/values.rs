//! Archived forms of index records
//!
//! Database values are rkyv-serialized mirrors of the in-memory types,
//! with explicit conversions in both directions so the stored layout can
//! evolve independently of the working structs.

use rkyv::rancor::Error as RkyvError;
use rkyv::{Archive, Deserialize, Serialize};

use meshsync_core::device_id::ShortId;
use meshsync_core::vector::Counter;
use meshsync_core::{BlockInfo, FileInfo, FileType, Vector};

use crate::error::DbError;

#[derive(Archive, Serialize, Deserialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub(crate) struct DbCounter {
    pub id: u64,
    pub value: u64,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub(crate) struct DbBlock {
    pub offset: u64,
    pub size: u32,
    pub hash: [u8; 32],
    pub weak_hash: u32,
}

/// Stored mirror of a [`FileInfo`].
#[derive(Archive, Serialize, Deserialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub(crate) struct DbFile {
    pub name: String,
    pub file_type: u8,
    pub size: u64,
    pub permissions: u32,
    pub modified_s: i64,
    pub modified_ns: i32,
    pub version: Vec<DbCounter>,
    pub sequence: u64,
    pub deleted: bool,
    pub invalid: bool,
    pub no_permissions: bool,
    pub block_size: u32,
    pub blocks: Vec<DbBlock>,
    pub symlink_target: String,
}

impl From<&FileInfo> for DbFile {
    fn from(f: &FileInfo) -> Self {
        Self {
            name: f.name.clone(),
            file_type: f.file_type.as_u8(),
            size: f.size,
            permissions: f.permissions,
            modified_s: f.modified_s,
            modified_ns: f.modified_ns,
            version: f
                .version
                .counters()
                .iter()
                .map(|c| DbCounter {
                    id: c.id.as_u64(),
                    value: c.value,
                })
                .collect(),
            sequence: f.sequence,
            deleted: f.deleted,
            invalid: f.invalid,
            no_permissions: f.no_permissions,
            block_size: f.block_size,
            blocks: f
                .blocks
                .iter()
                .map(|b| DbBlock {
                    offset: b.offset,
                    size: b.size,
                    hash: b.hash,
                    weak_hash: b.weak_hash,
                })
                .collect(),
            symlink_target: f.symlink_target.clone(),
        }
    }
}

impl TryFrom<&DbFile> for FileInfo {
    type Error = DbError;

    fn try_from(f: &DbFile) -> Result<Self, DbError> {
        let file_type = FileType::from_u8(f.file_type)
            .ok_or_else(|| DbError::Corrupt(format!("unknown file type {}", f.file_type)))?;
        Ok(Self {
            name: f.name.clone(),
            file_type,
            size: f.size,
            permissions: f.permissions,
            modified_s: f.modified_s,
            modified_ns: f.modified_ns,
            version: Vector::from_counters(
                f.version
                    .iter()
                    .map(|c| Counter {
                        id: ShortId(c.id),
                        value: c.value,
                    })
                    .collect(),
            ),
            sequence: f.sequence,
            deleted: f.deleted,
            invalid: f.invalid,
            no_permissions: f.no_permissions,
            block_size: f.block_size,
            blocks: f
                .blocks
                .iter()
                .map(|b| BlockInfo {
                    offset: b.offset,
                    size: b.size,
                    hash: b.hash,
                    weak_hash: b.weak_hash,
                })
                .collect(),
            symlink_target: f.symlink_target.clone(),
        })
    }
}

/// One occurrence of a block hash in a local file.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub(crate) struct DbBlockRef {
    pub name: String,
    pub index: u32,
}

/// Value of a block-availability entry: every local file location holding
/// a given block.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Default)]
#[rkyv(derive(Debug))]
pub(crate) struct DbBlockList {
    pub entries: Vec<DbBlockRef>,
}

pub(crate) fn encode_file(f: &FileInfo) -> Result<Vec<u8>, DbError> {
    let db_file = DbFile::from(f);
    let bytes = rkyv::to_bytes::<RkyvError>(&db_file)
        .map_err(|e| DbError::Serialize(e.to_string()))?;
    Ok(bytes.to_vec())
}

pub(crate) fn decode_file(bytes: &[u8]) -> Result<FileInfo, DbError> {
    let archived = rkyv::access::<ArchivedDbFile, RkyvError>(bytes)
        .map_err(|e| DbError::Corrupt(e.to_string()))?;
    let db_file: DbFile = rkyv::deserialize::<DbFile, RkyvError>(archived)
        .map_err(|e| DbError::Corrupt(e.to_string()))?;
    FileInfo::try_from(&db_file)
}

pub(crate) fn encode_block_list(list: &DbBlockList) -> Result<Vec<u8>, DbError> {
    let bytes =
        rkyv::to_bytes::<RkyvError>(list).map_err(|e| DbError::Serialize(e.to_string()))?;
    Ok(bytes.to_vec())
}

pub(crate) fn decode_block_list(bytes: &[u8]) -> Result<DbBlockList, DbError> {
    let archived = rkyv::access::<ArchivedDbBlockList, RkyvError>(bytes)
        .map_err(|e| DbError::Corrupt(e.to_string()))?;
    rkyv::deserialize::<DbBlockList, RkyvError>(archived)
        .map_err(|e| DbError::Corrupt(e.to_string()))
}
