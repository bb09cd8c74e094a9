//! The filesystem capability
//!
//! Folder runners never touch paths directly; they go through a
//! [`Filesystem`] scoped to the folder root. Every name is validated at
//! the boundary, so nothing above this layer can escape the root.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use ignore::WalkBuilder;

use meshsync_core::paths::check_name;
use meshsync_core::FileType;

/// What a folder runner needs to know about an entry on disk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryMeta {
    pub file_type: FileType,
    pub size: u64,
    pub modified: SystemTime,
    pub permissions: u32,
}

/// Path-scoped I/O for one folder root. All names are folder-relative
/// with forward slashes; unsafe names fail at intake.
pub trait Filesystem: Send + Sync {
    fn root(&self) -> &Path;

    /// Entry metadata without following symlinks.
    fn metadata(&self, name: &str) -> io::Result<EntryMeta>;

    fn exists(&self, name: &str) -> bool;

    /// Recursively list all entries below the root (the root itself
    /// excluded), in unspecified order.
    fn walk(&self) -> io::Result<Vec<(String, EntryMeta)>>;

    /// Immediate children of a directory, as folder-relative names.
    fn list_dir(&self, name: &str) -> io::Result<Vec<String>>;

    fn open_read(&self, name: &str) -> io::Result<Box<dyn Read + Send>>;

    /// Read exactly `size` bytes at `offset`; shorter reads are errors.
    fn read_range(&self, name: &str, offset: u64, size: usize) -> io::Result<Vec<u8>>;

    /// Write `data` at `offset`, creating the file if needed.
    fn write_range(&self, name: &str, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Create the file if needed and set its length.
    fn truncate(&self, name: &str, size: u64) -> io::Result<()>;

    fn rename(&self, from: &str, to: &str) -> io::Result<()>;

    fn remove_file(&self, name: &str) -> io::Result<()>;

    /// Remove an empty directory; fails on non-empty ones.
    fn remove_dir(&self, name: &str) -> io::Result<()>;

    fn mkdir_all(&self, name: &str) -> io::Result<()>;

    fn read_link(&self, name: &str) -> io::Result<String>;

    fn symlink(&self, target: &str, name: &str) -> io::Result<()>;

    fn set_permissions(&self, name: &str, permissions: u32) -> io::Result<()>;

    fn set_modified(&self, name: &str, modified: SystemTime) -> io::Result<()>;
}

fn meta_from_std(meta: &std::fs::Metadata) -> EntryMeta {
    let file_type = if meta.file_type().is_symlink() {
        FileType::Symlink
    } else if meta.is_dir() {
        FileType::Directory
    } else {
        FileType::File
    };

    #[cfg(unix)]
    let permissions = {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o7777
    };
    #[cfg(not(unix))]
    let permissions = if meta.permissions().readonly() {
        0o444
    } else {
        0o666
    };

    EntryMeta {
        file_type,
        size: meta.len(),
        modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        permissions,
    }
}

/// The production filesystem, rooted at the folder path.
pub struct RealFs {
    root: PathBuf,
}

impl RealFs {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        check_name(name)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        Ok(self.root.join(name))
    }
}

impl Filesystem for RealFs {
    fn root(&self) -> &Path {
        &self.root
    }

    fn metadata(&self, name: &str) -> io::Result<EntryMeta> {
        let meta = std::fs::symlink_metadata(self.resolve(name)?)?;
        Ok(meta_from_std(&meta))
    }

    fn exists(&self, name: &str) -> bool {
        self.resolve(name)
            .map(|p| p.symlink_metadata().is_ok())
            .unwrap_or(false)
    }

    fn walk(&self) -> io::Result<Vec<(String, EntryMeta)>> {
        let mut entries = Vec::new();
        let walker = WalkBuilder::new(&self.root)
            .hidden(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .require_git(false)
            .follow_links(false)
            .build();

        for result in walker {
            let entry = result.map_err(|e| io::Error::other(e.to_string()))?;
            if entry.path() == self.root {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|e| io::Error::other(e.to_string()))?;
            let name = relative.to_string_lossy().replace('\\', "/");
            let meta = std::fs::symlink_metadata(entry.path())?;
            entries.push((name, meta_from_std(&meta)));
        }
        Ok(entries)
    }

    fn list_dir(&self, name: &str) -> io::Result<Vec<String>> {
        let dir = if name.is_empty() {
            self.root.clone()
        } else {
            self.resolve(name)?
        };
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let base = entry.file_name().to_string_lossy().to_string();
            if name.is_empty() {
                names.push(base);
            } else {
                names.push(format!("{name}/{base}"));
            }
        }
        Ok(names)
    }

    fn open_read(&self, name: &str) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(std::fs::File::open(self.resolve(name)?)?))
    }

    fn read_range(&self, name: &str, offset: u64, size: usize) -> io::Result<Vec<u8>> {
        let mut file = std::fs::File::open(self.resolve(name)?)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; size];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_range(&self, name: &str, offset: u64, data: &[u8]) -> io::Result<()> {
        let path = self.resolve(name)?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn truncate(&self, name: &str, size: u64) -> io::Result<()> {
        let path = self.resolve(name)?;
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(size)?;
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        std::fs::rename(self.resolve(from)?, self.resolve(to)?)
    }

    fn remove_file(&self, name: &str) -> io::Result<()> {
        std::fs::remove_file(self.resolve(name)?)
    }

    fn remove_dir(&self, name: &str) -> io::Result<()> {
        std::fs::remove_dir(self.resolve(name)?)
    }

    fn mkdir_all(&self, name: &str) -> io::Result<()> {
        std::fs::create_dir_all(self.resolve(name)?)
    }

    fn read_link(&self, name: &str) -> io::Result<String> {
        let target = std::fs::read_link(self.resolve(name)?)?;
        Ok(target.to_string_lossy().replace('\\', "/"))
    }

    fn symlink(&self, target: &str, name: &str) -> io::Result<()> {
        let path = self.resolve(name)?;
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(target, path)
        }
        #[cfg(not(unix))]
        {
            let _ = (target, path);
            Err(io::Error::other("symlinks not supported on this platform"))
        }
    }

    fn set_permissions(&self, name: &str, permissions: u32) -> io::Result<()> {
        let path = self.resolve(name)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(permissions))
        }
        #[cfg(not(unix))]
        {
            let _ = (path, permissions);
            Ok(())
        }
    }

    fn set_modified(&self, name: &str, modified: SystemTime) -> io::Result<()> {
        let path = self.resolve(name)?;
        filetime::set_file_mtime(&path, filetime::FileTime::from_system_time(modified))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rejects_unsafe_names() {
        let dir = TempDir::new().unwrap();
        let fs = RealFs::new(dir.path());

        assert!(fs.metadata("../outside").is_err());
        assert!(fs.read_range("/etc/passwd", 0, 1).is_err());
        assert!(fs.write_range("a/../../b", 0, b"x").is_err());
        assert!(!fs.exists("../outside"));
    }

    #[test]
    fn test_write_read_range() {
        let dir = TempDir::new().unwrap();
        let fs = RealFs::new(dir.path());

        fs.write_range("f.bin", 0, b"hello ").unwrap();
        fs.write_range("f.bin", 6, b"world").unwrap();

        let data = fs.read_range("f.bin", 0, 11).unwrap();
        assert_eq!(&data, b"hello world");
        let tail = fs.read_range("f.bin", 6, 5).unwrap();
        assert_eq!(&tail, b"world");

        // Reading past the end is an error, not a short read.
        assert!(fs.read_range("f.bin", 6, 100).is_err());
    }

    #[test]
    fn test_walk_relative_names() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/inner")).unwrap();
        std::fs::write(dir.path().join("top.txt"), "x").unwrap();
        std::fs::write(dir.path().join("sub/inner/deep.txt"), "y").unwrap();

        let fs = RealFs::new(dir.path());
        let mut names: Vec<String> = fs.walk().unwrap().into_iter().map(|(n, _)| n).collect();
        names.sort();
        assert_eq!(names, vec!["sub", "sub/inner", "sub/inner/deep.txt", "top.txt"]);
    }

    #[test]
    fn test_truncate_creates_empty() {
        let dir = TempDir::new().unwrap();
        let fs = RealFs::new(dir.path());

        fs.truncate("empty.bin", 0).unwrap();
        let meta = fs.metadata("empty.bin").unwrap();
        assert_eq!(meta.size, 0);
        assert_eq!(meta.file_type, FileType::File);
    }

    #[cfg(unix)]
    #[test]
    fn test_permissions_roundtrip() {
        let dir = TempDir::new().unwrap();
        let fs = RealFs::new(dir.path());

        fs.write_range("x", 0, b"data").unwrap();
        fs.set_permissions("x", 0o600).unwrap();
        assert_eq!(fs.metadata("x").unwrap().permissions, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_roundtrip() {
        let dir = TempDir::new().unwrap();
        let fs = RealFs::new(dir.path());

        fs.symlink("target/path", "link").unwrap();
        assert_eq!(fs.metadata("link").unwrap().file_type, FileType::Symlink);
        assert_eq!(fs.read_link("link").unwrap(), "target/path");
    }
}
