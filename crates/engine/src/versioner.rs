//! File versioning before destructive writes
//!
//! Before the puller overwrites or deletes a local file, the folder's
//! versioner gets a chance to move it out of the way. The archive layout
//! under `.stversions` is this implementation's own; peers never see it.

use tracing::debug;

use crate::fs::Filesystem;

/// Directory that holds archived file versions inside the folder root.
pub const VERSIONS_DIR: &str = ".stversions";

/// Invoked with the folder-relative name of a file about to be replaced
/// or deleted. After a successful call the file must no longer exist
/// under its original name.
pub trait Versioner: Send + Sync {
    fn archive(&self, fs: &dyn Filesystem, name: &str) -> color_eyre::Result<()>;
}

/// No versioning: the file is simply removed.
pub struct NoopVersioner;

impl Versioner for NoopVersioner {
    fn archive(&self, fs: &dyn Filesystem, name: &str) -> color_eyre::Result<()> {
        fs.remove_file(name)?;
        Ok(())
    }
}

/// Moves displaced files into `.stversions`, tagged with the time of
/// displacement.
pub struct TrashVersioner;

impl Versioner for TrashVersioner {
    fn archive(&self, fs: &dyn Filesystem, name: &str) -> color_eyre::Result<()> {
        let tag = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let archived = format!("{VERSIONS_DIR}/{name}~{tag}");
        if let Some(slash) = archived.rfind('/') {
            fs.mkdir_all(&archived[..slash])?;
        }
        fs.rename(name, &archived)?;
        debug!(name, "archived displaced file");
        Ok(())
    }
}
