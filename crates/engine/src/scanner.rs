//! Folder scanning: turning disk state into index records
//!
//! One pass over the folder root, comparing each entry against the stored
//! local record. Unchanged entries (same type, size, permissions, and a
//! modification time inside the configured window) are skipped without
//! hashing. Changes and deletions are committed as one batch at the end;
//! an interrupted scan commits nothing.

use std::collections::HashSet;
use std::time::SystemTime;

use color_eyre::eyre::bail;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use meshsync_core::fileinfo::tombstone_of;
use meshsync_core::{block_size, hash_blocks, FileInfo, FileType, IgnoreMatcher, ShortId, Vector};
use meshsync_db::FileSet;

use crate::fs::{EntryMeta, Filesystem};
use crate::names::is_internal;

/// Everything a scan needs besides the filesystem and file set.
pub struct ScanConfig {
    pub marker_name: String,
    pub mod_time_window_s: u64,
    pub short_id: ShortId,
}

/// Whether two timestamps are equal within the configured tolerance.
/// A zero window demands exact equality.
fn within_window(a: SystemTime, b: SystemTime, window_s: u64) -> bool {
    let diff = match a.duration_since(b) {
        Ok(d) => d,
        Err(e) => e.duration(),
    };
    diff.is_zero() || (window_s > 0 && diff.as_secs() < window_s)
}

fn unchanged(
    fs: &dyn Filesystem,
    prev: &FileInfo,
    name: &str,
    meta: &EntryMeta,
    window_s: u64,
) -> bool {
    if prev.deleted || prev.invalid || prev.file_type != meta.file_type {
        return false;
    }
    match meta.file_type {
        FileType::File => {
            prev.size == meta.size
                && (prev.no_permissions || prev.permissions == meta.permissions)
                && within_window(meta.modified, prev.modified(), window_s)
        }
        FileType::Directory => prev.no_permissions || prev.permissions == meta.permissions,
        FileType::Symlink => match fs.read_link(name) {
            Ok(target) => prev.symlink_target == target,
            Err(_) => false,
        },
    }
}

fn scan_entry(
    fs: &dyn Filesystem,
    name: &str,
    meta: &EntryMeta,
    prev: Option<&FileInfo>,
    short_id: ShortId,
) -> color_eyre::Result<FileInfo> {
    let mut version = prev.map(|p| p.version.clone()).unwrap_or_else(Vector::new);
    version.update(short_id);

    let mut info = FileInfo {
        name: name.to_string(),
        file_type: meta.file_type,
        size: 0,
        permissions: meta.permissions,
        modified_s: 0,
        modified_ns: 0,
        version,
        sequence: 0,
        deleted: false,
        invalid: false,
        no_permissions: false,
        block_size: 0,
        blocks: Vec::new(),
        symlink_target: String::new(),
    };
    info.set_modified(meta.modified);

    match meta.file_type {
        FileType::File => {
            let bs = block_size(meta.size);
            let reader = fs.open_read(name)?;
            let blocks = hash_blocks(reader, bs)?;
            info.size = blocks.iter().map(|b| u64::from(b.size)).sum();
            info.block_size = bs;
            info.blocks = blocks;
        }
        FileType::Directory => {}
        FileType::Symlink => {
            info.symlink_target = fs.read_link(name)?;
            info.no_permissions = true;
            info.permissions = 0;
        }
    }
    Ok(info)
}

/// Scan the folder and commit detected changes. Returns the committed
/// records (with sequences assigned) for index broadcasting.
///
/// # Errors
/// Returns an error if the walk fails or the scan was interrupted; in
/// both cases nothing was committed.
pub fn scan_folder(
    fs: &dyn Filesystem,
    fileset: &FileSet,
    ignores: &IgnoreMatcher,
    config: &ScanConfig,
    cancel: &CancellationToken,
) -> color_eyre::Result<Vec<FileInfo>> {
    let entries = fs.walk()?;

    let mut seen: HashSet<String> = HashSet::with_capacity(entries.len());
    let mut changes: Vec<FileInfo> = Vec::new();

    for (name, meta) in entries {
        if cancel.is_cancelled() {
            bail!("scan interrupted");
        }
        if is_internal(&name, &config.marker_name) || ignores.is_ignored(&name) {
            continue;
        }
        seen.insert(name.clone());

        let prev = fileset.local(&name);
        if let Some(prev) = &prev {
            if unchanged(fs, prev, &name, &meta, config.mod_time_window_s) {
                continue;
            }
        }

        match scan_entry(fs, &name, &meta, prev.as_ref(), config.short_id) {
            Ok(info) => {
                trace!(name = %info.name, "scanned change");
                changes.push(info);
            }
            // The entry may have vanished mid-scan; the next pass sees the
            // deletion.
            Err(e) => warn!(name = %name, "failed to scan entry: {e}"),
        }
    }

    // Entries we used to have that the walk no longer found.
    for local in fileset.local_files() {
        if cancel.is_cancelled() {
            bail!("scan interrupted");
        }
        if local.deleted
            || seen.contains(&local.name)
            || is_internal(&local.name, &config.marker_name)
            || ignores.is_ignored(&local.name)
        {
            continue;
        }
        let mut version = local.version.clone();
        version.update(config.short_id);
        changes.push(tombstone_of(&local, version));
    }

    if changes.is_empty() {
        return Ok(Vec::new());
    }

    let committed = fileset.update_local(changes)?;
    debug!(
        folder = fileset.folder(),
        count = committed.len(),
        "scan committed changes"
    );
    Ok(committed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::RealFs;
    use meshsync_core::DeviceId;
    use meshsync_db::IndexDb;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (RealFs, FileSet, ScanConfig, TempDir) {
        let fs = RealFs::new(dir.path());
        let db_dir = TempDir::new().unwrap();
        let db = Arc::new(IndexDb::open(db_dir.path()).unwrap());
        let fileset = FileSet::open("folder", DeviceId::from_raw([1u8; 32]), db).unwrap();
        let config = ScanConfig {
            marker_name: ".stfolder".to_string(),
            mod_time_window_s: 0,
            short_id: ShortId(1),
        };
        (fs, fileset, config, db_dir)
    }

    #[test]
    fn test_scan_new_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hello").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/nested.txt"), "nested").unwrap();

        let (fs, fileset, config, _db_dir) = setup(&dir);
        let committed = scan_folder(
            &fs,
            &fileset,
            &IgnoreMatcher::empty(),
            &config,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(committed.len(), 3);
        let hello = fileset.local("hello.txt").unwrap();
        assert_eq!(hello.size, 5);
        assert_eq!(hello.blocks.len(), 1);
        assert_eq!(hello.version.counter(ShortId(1)), 1);
        assert!(fileset.local("sub").unwrap().is_directory());
    }

    #[test]
    fn test_rescan_skips_unchanged() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("stable.txt"), "content").unwrap();

        let (fs, fileset, config, _db_dir) = setup(&dir);
        let ignores = IgnoreMatcher::empty();
        let cancel = CancellationToken::new();

        let first = scan_folder(&fs, &fileset, &ignores, &config, &cancel).unwrap();
        assert_eq!(first.len(), 1);

        let second = scan_folder(&fs, &fileset, &ignores, &config, &cancel).unwrap();
        assert!(second.is_empty());
        // Version untouched by the no-op rescan.
        assert_eq!(
            fileset.local("stable.txt").unwrap().version.counter(ShortId(1)),
            1
        );
    }

    #[test]
    fn test_modification_bumps_version() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f.txt"), "one").unwrap();

        let (fs, fileset, config, _db_dir) = setup(&dir);
        let ignores = IgnoreMatcher::empty();
        let cancel = CancellationToken::new();

        scan_folder(&fs, &fileset, &ignores, &config, &cancel).unwrap();
        std::fs::write(dir.path().join("f.txt"), "two!").unwrap();
        let changes = scan_folder(&fs, &fileset, &ignores, &config, &cancel).unwrap();

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].version.counter(ShortId(1)), 2);
        assert_eq!(changes[0].size, 4);
    }

    #[test]
    fn test_mod_time_window_suppresses_rescan() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "same size").unwrap();

        let (fs, fileset, mut config, _db_dir) = setup(&dir);
        config.mod_time_window_s = 2;
        let ignores = IgnoreMatcher::empty();
        let cancel = CancellationToken::new();

        scan_folder(&fs, &fileset, &ignores, &config, &cancel).unwrap();
        let base = fileset.local("f.txt").unwrap().modified();

        // +1s: inside the window, no new version.
        filetime::set_file_mtime(
            &path,
            filetime::FileTime::from_system_time(base + std::time::Duration::from_secs(1)),
        )
        .unwrap();
        let changes = scan_folder(&fs, &fileset, &ignores, &config, &cancel).unwrap();
        assert!(changes.is_empty());

        // +2s: outside the window, version bump.
        filetime::set_file_mtime(
            &path,
            filetime::FileTime::from_system_time(base + std::time::Duration::from_secs(2)),
        )
        .unwrap();
        let changes = scan_folder(&fs, &fileset, &ignores, &config, &cancel).unwrap();
        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn test_deletion_produces_tombstone() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("gone.txt"), "data").unwrap();

        let (fs, fileset, config, _db_dir) = setup(&dir);
        let ignores = IgnoreMatcher::empty();
        let cancel = CancellationToken::new();

        scan_folder(&fs, &fileset, &ignores, &config, &cancel).unwrap();
        std::fs::remove_file(dir.path().join("gone.txt")).unwrap();
        let changes = scan_folder(&fs, &fileset, &ignores, &config, &cancel).unwrap();

        assert_eq!(changes.len(), 1);
        assert!(changes[0].deleted);
        assert!(changes[0].blocks.is_empty());
        assert_eq!(changes[0].version.counter(ShortId(1)), 2);
    }

    #[test]
    fn test_internal_and_ignored_skipped() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".stfolder"), "").unwrap();
        std::fs::write(dir.path().join(".stignore"), "*.log\n").unwrap();
        std::fs::write(dir.path().join(".syncthing.partial.tmp"), "temp").unwrap();
        std::fs::write(dir.path().join("noise.log"), "log").unwrap();
        std::fs::write(dir.path().join("keep.txt"), "keep").unwrap();

        let (fs, fileset, config, _db_dir) = setup(&dir);
        let ignores = IgnoreMatcher::parse("*.log\n").unwrap();
        let committed = scan_folder(
            &fs,
            &fileset,
            &ignores,
            &config,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].name, "keep.txt");
    }

    #[test]
    fn test_interrupted_scan_commits_nothing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();

        let (fs, fileset, config, _db_dir) = setup(&dir);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = scan_folder(&fs, &fileset, &IgnoreMatcher::empty(), &config, &cancel);
        assert!(result.is_err());
        assert!(fileset.local("a.txt").is_none());
        assert_eq!(fileset.sequence(), 0);
    }
}
