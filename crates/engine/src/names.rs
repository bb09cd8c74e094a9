//! On-disk naming conventions inside a synchronized folder

use meshsync_core::ShortId;

use crate::versioner::VERSIONS_DIR;

/// Prefix of in-progress download files. The scanner never indexes these.
pub const TEMP_PREFIX: &str = ".syncthing.";

/// Suffix of in-progress download files.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Name of the ignore pattern file inside a folder root.
pub const IGNORE_FILE: &str = ".stignore";

/// The hidden sibling a file is assembled under before the final rename.
#[must_use]
pub fn temp_name(name: &str) -> String {
    match name.rsplit_once('/') {
        Some((dir, base)) => format!("{dir}/{TEMP_PREFIX}{base}{TEMP_SUFFIX}"),
        None => format!("{TEMP_PREFIX}{name}{TEMP_SUFFIX}"),
    }
}

/// Whether a basename marks an in-progress download.
#[must_use]
pub fn is_temp_name(name: &str) -> bool {
    let base = name.rsplit_once('/').map_or(name, |(_, b)| b);
    base.starts_with(TEMP_PREFIX)
}

/// Whether a name is engine-internal and excluded from indexing: the
/// marker, the ignore file, the version archive, and temporaries.
#[must_use]
pub fn is_internal(name: &str, marker_name: &str) -> bool {
    if name == marker_name || name.starts_with(&format!("{marker_name}/")) {
        return true;
    }
    if name == IGNORE_FILE {
        return true;
    }
    if name == VERSIONS_DIR || name.starts_with(&format!("{VERSIONS_DIR}/")) {
        return true;
    }
    is_temp_name(name)
}

/// The name a losing local file is moved to before being replaced:
/// `<stem>.sync-conflict-YYYYMMDD-HHMMSS-<shortid><ext>`.
#[must_use]
pub fn conflict_name(name: &str, short_id: ShortId, when: chrono::DateTime<chrono::Local>) -> String {
    let (dir, base) = match name.rsplit_once('/') {
        Some((dir, base)) => (Some(dir), base),
        None => (None, base_of(name)),
    };
    let (stem, ext) = match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{ext}")),
        _ => (base, String::new()),
    };
    let tag = when.format("%Y%m%d-%H%M%S");
    let conflicted = format!("{stem}.sync-conflict-{tag}-{short_id}{ext}");
    match dir {
        Some(dir) => format!("{dir}/{conflicted}"),
        None => conflicted,
    }
}

fn base_of(name: &str) -> &str {
    name.rsplit_once('/').map_or(name, |(_, b)| b)
}

/// Whether `candidate` is a conflict copy of `name` (same directory, same
/// stem and extension).
#[must_use]
pub fn is_conflict_copy(candidate: &str, name: &str) -> bool {
    let base = base_of(name);
    let cand_base = base_of(candidate);
    let (stem, ext) = match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{ext}")),
        _ => (base, String::new()),
    };
    cand_base.starts_with(&format!("{stem}.sync-conflict-")) && cand_base.ends_with(&ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_name() {
        assert_eq!(temp_name("foo"), ".syncthing.foo.tmp");
        assert_eq!(temp_name("a/b/c.txt"), "a/b/.syncthing.c.txt.tmp");
        assert!(is_temp_name(".syncthing.foo.tmp"));
        assert!(is_temp_name("a/b/.syncthing.c.txt.tmp"));
        assert!(!is_temp_name("a/b/c.txt"));
    }

    #[test]
    fn test_internal_names() {
        assert!(is_internal(".stfolder", ".stfolder"));
        assert!(is_internal(".stignore", ".stfolder"));
        assert!(is_internal(".stversions/x/y~1", ".stfolder"));
        assert!(is_internal("dir/.syncthing.f.tmp", ".stfolder"));
        assert!(!is_internal("regular.txt", ".stfolder"));
        // A custom marker protects its own name, not the default.
        assert!(is_internal("my-marker", "my-marker"));
        assert!(!is_internal(".stfolder", "my-marker"));
    }

    #[test]
    fn test_conflict_name_shape() {
        let when = chrono::Local::now();
        let name = conflict_name("docs/report.txt", ShortId(0xabcd), when);
        assert!(name.starts_with("docs/report.sync-conflict-"));
        assert!(name.ends_with(".txt"));
        assert!(is_conflict_copy(&name, "docs/report.txt"));

        let bare = conflict_name("README", ShortId(1), when);
        assert!(bare.starts_with("README.sync-conflict-"));
        assert!(is_conflict_copy(&bare, "README"));
        assert!(!is_conflict_copy("docs/other.sync-conflict-x.txt", "docs/report.txt"));
    }
}
