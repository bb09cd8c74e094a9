//! Reconstructing needed files from local and remote blocks
//!
//! For every needed path the puller plans an action: directories are
//! created, symlinks re-pointed, deletions applied last, and files built
//! block by block into a hidden temporary. Blocks come from three sources
//! in order of preference: the current local copy of the same file, other
//! local files holding an identical block, and finally peers advertising
//! the winning version. A completed file is fully re-verified, the
//! displaced target archived, and the temporary renamed into place.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use color_eyre::eyre::{bail, eyre};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use meshsync_core::blocks::verify_block;
use meshsync_core::vector::Ordering as VecOrdering;
use meshsync_core::{BlockInfo, DeviceId, EventSink, FileInfo, FileType, ShortId};
use meshsync_db::FileSet;
use meshsync_proto::DownloadProgressUpdate;

use crate::fs::Filesystem;
use crate::names::{conflict_name, is_conflict_copy, temp_name};
use crate::versioner::Versioner;
use crate::view::ClusterView;

/// Per-folder pulling knobs.
#[derive(Debug, Clone)]
pub struct PullConfig {
    pub folder_id: String,
    pub short_id: ShortId,
    /// Conflict copies kept per file; negative is unlimited, zero disables
    /// conflict copies entirely
    pub max_conflicts: i32,
    /// Concurrent local block copies
    pub copiers: usize,
    /// Concurrent network block requests
    pub pullers: usize,
}

/// What one pull iteration accomplished.
#[derive(Debug, Default, Clone, Copy)]
pub struct PullSummary {
    pub completed: usize,
    pub failed: usize,
}

impl PullSummary {
    #[must_use]
    pub fn made_progress(&self) -> bool {
        self.completed > 0
    }
}

struct PullContext {
    fileset: Arc<FileSet>,
    fs: Arc<dyn Filesystem>,
    versioner: Arc<dyn Versioner>,
    view: Arc<dyn ClusterView>,
    events: EventSink,
    config: PullConfig,
    cancel: CancellationToken,
    copy_sem: Arc<Semaphore>,
    fetch_sem: Arc<Semaphore>,
}

/// Run one pull iteration over the current needed set.
///
/// # Errors
/// Returns an error only for folder-level failures; per-item failures are
/// counted in the summary and retried on the next iteration.
#[allow(clippy::too_many_arguments)]
pub async fn pull_once(
    fileset: Arc<FileSet>,
    fs: Arc<dyn Filesystem>,
    versioner: Arc<dyn Versioner>,
    view: Arc<dyn ClusterView>,
    events: EventSink,
    config: PullConfig,
    cancel: CancellationToken,
) -> color_eyre::Result<PullSummary> {
    let ctx = PullContext {
        copy_sem: Arc::new(Semaphore::new(config.copiers.max(1))),
        fetch_sem: Arc::new(Semaphore::new(config.pullers.max(1))),
        fileset,
        fs,
        versioner,
        view,
        events,
        config,
        cancel,
    };

    let needed = ctx.fileset.needed();
    if needed.is_empty() {
        return Ok(PullSummary::default());
    }
    debug!(
        folder = %ctx.config.folder_id,
        count = needed.len(),
        "pull iteration starting"
    );

    let mut dirs = Vec::new();
    let mut links = Vec::new();
    let mut files = Vec::new();
    let mut file_deletes = Vec::new();
    let mut dir_deletes = Vec::new();
    for (info, _) in needed {
        if info.deleted {
            if info.is_directory() {
                dir_deletes.push(info);
            } else {
                file_deletes.push(info);
            }
        } else {
            match info.file_type {
                FileType::Directory => dirs.push(info),
                FileType::Symlink => links.push(info),
                FileType::File => files.push(info),
            }
        }
    }

    // Parents sort before children, so plain name order creates
    // directories top-down; deletions go deepest-first.
    dirs.sort_by(|a, b| a.name.cmp(&b.name));
    dir_deletes.sort_by(|a, b| {
        let depth = |f: &FileInfo| f.name.matches('/').count();
        depth(b).cmp(&depth(a)).then_with(|| b.name.cmp(&a.name))
    });

    let mut summary = PullSummary::default();
    let mut committed = Vec::new();

    for info in dirs {
        ctx.finish_item(&info, pull_directory(&ctx, &info), &mut summary, &mut committed);
    }
    for info in links {
        ctx.finish_item(&info, pull_symlink(&ctx, &info), &mut summary, &mut committed);
    }
    for info in files {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let result = pull_file(&ctx, &info).await;
        ctx.finish_item(&info, result, &mut summary, &mut committed);
    }
    for info in file_deletes {
        ctx.finish_item(&info, delete_file(&ctx, &info), &mut summary, &mut committed);
    }
    for info in dir_deletes {
        match delete_directory(&ctx, &info) {
            Ok(Some(record)) => {
                summary.completed += 1;
                committed.push(record);
            }
            // Deferred: the directory still has content this round.
            Ok(None) => {}
            Err(e) => {
                summary.failed += 1;
                ctx.events.publish(meshsync_core::Event::ItemFinished {
                    folder: ctx.config.folder_id.clone(),
                    item: info.name.clone(),
                    error: Some(e.to_string()),
                });
            }
        }
    }

    if !committed.is_empty() {
        ctx.view
            .local_index_updated(&ctx.config.folder_id, committed)
            .await;
    }

    debug!(
        folder = %ctx.config.folder_id,
        completed = summary.completed,
        failed = summary.failed,
        "pull iteration finished"
    );
    Ok(summary)
}

impl PullContext {
    fn finish_item(
        &self,
        info: &FileInfo,
        result: color_eyre::Result<FileInfo>,
        summary: &mut PullSummary,
        committed: &mut Vec<FileInfo>,
    ) {
        match result {
            Ok(record) => {
                summary.completed += 1;
                committed.push(record);
                self.events.publish(meshsync_core::Event::ItemFinished {
                    folder: self.config.folder_id.clone(),
                    item: info.name.clone(),
                    error: None,
                });
            }
            Err(e) => {
                summary.failed += 1;
                warn!(name = %info.name, "pull item failed: {e}");
                self.events.publish(meshsync_core::Event::ItemFinished {
                    folder: self.config.folder_id.clone(),
                    item: info.name.clone(),
                    error: Some(e.to_string()),
                });
            }
        }
    }

    /// Commit the winner as our new local record, its version merged with
    /// whatever we had so the result equals or dominates the winner.
    fn commit_pulled(&self, winner: &FileInfo) -> color_eyre::Result<FileInfo> {
        let mut record = winner.clone();
        if let Some(local) = self.fileset.local(&winner.name) {
            record.version = winner.version.merge(&local.version);
        }
        record.sequence = 0;
        let mut committed = self.fileset.update_local(vec![record])?;
        Ok(committed.remove(0))
    }
}

fn pull_directory(ctx: &PullContext, info: &FileInfo) -> color_eyre::Result<FileInfo> {
    ctx.fs.mkdir_all(&info.name)?;
    if !info.no_permissions {
        ctx.fs.set_permissions(&info.name, info.permissions)?;
    }
    ctx.fs.set_modified(&info.name, info.modified())?;
    ctx.commit_pulled(info)
}

fn pull_symlink(ctx: &PullContext, info: &FileInfo) -> color_eyre::Result<FileInfo> {
    if let Some((dir, _)) = info.name.rsplit_once('/') {
        ctx.fs.mkdir_all(dir)?;
    }
    if ctx.fs.exists(&info.name) {
        ctx.fs.remove_file(&info.name)?;
    }
    ctx.fs.symlink(&info.symlink_target, &info.name)?;
    ctx.commit_pulled(info)
}

fn delete_file(ctx: &PullContext, info: &FileInfo) -> color_eyre::Result<FileInfo> {
    if ctx.fs.exists(&info.name) {
        // A deletion is destructive: the versioner decides what happens
        // to the current content.
        ctx.versioner.archive(ctx.fs.as_ref(), &info.name)?;
    }
    ctx.commit_pulled(info)
}

/// Directories are only removed once empty; a still-populated directory
/// is deferred to a later iteration (its children's deletions come
/// first). Returns `None` when deferred.
fn delete_directory(ctx: &PullContext, info: &FileInfo) -> color_eyre::Result<Option<FileInfo>> {
    match ctx.fs.remove_dir(&info.name) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(_) if !ctx.fs.list_dir(&info.name).map_or(true, |c| c.is_empty()) => {
            trace!(name = %info.name, "deferring non-empty directory deletion");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    }
    Ok(Some(ctx.commit_pulled(info)?))
}

enum BlockSource {
    /// Copy from a local file at a known offset
    Copy { name: String, offset: u64 },
    /// Fetch from peers
    Network,
}

fn plan_blocks(ctx: &PullContext, info: &FileInfo) -> Vec<(usize, BlockInfo, BlockSource)> {
    // Index the current local version of this file by block hash.
    let local = ctx.fileset.local(&info.name);
    let mut local_by_hash: HashMap<[u8; 32], u64> = HashMap::new();
    if let Some(local) = &local {
        if local.is_file() && !local.deleted {
            for block in &local.blocks {
                local_by_hash.entry(block.hash).or_insert(block.offset);
            }
        }
    }

    let mut plan = Vec::with_capacity(info.blocks.len());
    for (index, block) in info.blocks.iter().enumerate() {
        // Same file first: same index, then any offset with the hash.
        let same_index = local
            .as_ref()
            .and_then(|l| l.blocks.get(index))
            .filter(|b| b.hash == block.hash)
            .map(|b| b.offset);
        if let Some(offset) = same_index.or_else(|| local_by_hash.get(&block.hash).copied()) {
            plan.push((
                index,
                *block,
                BlockSource::Copy {
                    name: info.name.clone(),
                    offset,
                },
            ));
            continue;
        }

        // Cross-file reuse via the block availability index.
        let mut found = None;
        if let Ok(refs) = ctx.fileset.local_blocks_with_hash(&block.hash) {
            for (other_name, other_index) in refs {
                if other_name == info.name {
                    continue;
                }
                let Some(other) = ctx.fileset.local(&other_name) else {
                    continue;
                };
                if let Some(other_block) = other.blocks.get(other_index as usize) {
                    if other_block.hash == block.hash {
                        found = Some(BlockSource::Copy {
                            name: other_name,
                            offset: other_block.offset,
                        });
                        break;
                    }
                }
            }
        }

        plan.push((index, *block, found.unwrap_or(BlockSource::Network)));
    }
    plan
}

async fn pull_file(ctx: &PullContext, info: &FileInfo) -> color_eyre::Result<FileInfo> {
    let name = info.name.clone();
    let planned_local = ctx.fileset.local(&name);
    let temp = temp_name(&name);

    if let Some((dir, _)) = name.rsplit_once('/') {
        ctx.fs.mkdir_all(dir)?;
    }
    ctx.fs.truncate(&temp, 0)?;

    let result = assemble_file(ctx, info, &temp).await;
    let fetched = match result {
        Ok(fetched) => fetched,
        Err(e) => {
            let _ = ctx.fs.remove_file(&temp);
            return Err(e);
        }
    };

    // Full re-verification of the assembled temporary.
    for block in &info.blocks {
        let data = ctx
            .fs
            .read_range(&temp, block.offset, block.size as usize)
            .map_err(|e| {
                let _ = ctx.fs.remove_file(&temp);
                eyre!("verification read failed: {e}")
            })?;
        if !verify_block(&data, &block.hash) {
            let _ = ctx.fs.remove_file(&temp);
            bail!("block at offset {} failed verification", block.offset);
        }
    }

    // Re-read local state: a scan may have committed a newer version
    // while we were assembling. Never clobber it.
    let current_local = ctx.fileset.local(&name);
    let planned_version = planned_local.as_ref().map(|f| &f.version);
    if current_local.as_ref().map(|f| &f.version) != planned_version {
        let _ = ctx.fs.remove_file(&temp);
        bail!("local file changed during pull");
    }

    displace_target(ctx, info, current_local.as_ref())?;

    ctx.fs.rename(&temp, &name)?;
    if !info.no_permissions {
        ctx.fs.set_permissions(&name, info.permissions)?;
    }
    ctx.fs.set_modified(&name, info.modified())?;

    // Retract any in-progress advertisement now that the file is whole.
    if !fetched.is_empty() {
        ctx.view
            .broadcast_download_progress(
                &ctx.config.folder_id,
                vec![DownloadProgressUpdate {
                    name: name.clone(),
                    version: info.version.clone(),
                    block_indexes: Vec::new(),
                }],
            )
            .await;
    }

    ctx.commit_pulled(info)
}

/// Build the temporary from planned sources. Returns the indexes fetched
/// over the network.
async fn assemble_file(
    ctx: &PullContext,
    info: &FileInfo,
    temp: &str,
) -> color_eyre::Result<Vec<u32>> {
    let plan = plan_blocks(ctx, info);

    let mut tasks: JoinSet<Result<(usize, bool), String>> = JoinSet::new();
    for (index, block, source) in plan {
        let fs = ctx.fs.clone();
        let fileset = ctx.fileset.clone();
        let view = ctx.view.clone();
        let folder = ctx.config.folder_id.clone();
        let file_name = info.name.clone();
        let temp = temp.to_string();
        let cancel = ctx.cancel.clone();
        let copy_sem = ctx.copy_sem.clone();
        let fetch_sem = ctx.fetch_sem.clone();

        tasks.spawn(async move {
            if cancel.is_cancelled() {
                return Err("canceled".to_string());
            }
            let (data, fetched) = match source {
                BlockSource::Copy { name, offset } => {
                    let _permit = copy_sem.acquire().await.map_err(|e| e.to_string())?;
                    match copy_block(&*fs, &name, offset, &block) {
                        Ok(data) => (data, false),
                        // A stale local copy falls back to the network.
                        Err(_) => (
                            fetch_block(&*view, &fileset, &folder, &file_name, index, &block, &fetch_sem)
                                .await?,
                            true,
                        ),
                    }
                }
                BlockSource::Network => (
                    fetch_block(&*view, &fileset, &folder, &file_name, index, &block, &fetch_sem)
                        .await?,
                    true,
                ),
            };
            fs.write_range(&temp, block.offset, &data)
                .map_err(|e| e.to_string())?;
            Ok((index, fetched))
        });
    }

    let mut fetched_indexes = Vec::new();
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok((index, true))) => fetched_indexes.push(index as u32),
            Ok(Ok((_, false))) => {}
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            }
            Err(e) => {
                first_error.get_or_insert(e.to_string());
            }
        }
    }
    if let Some(e) = first_error {
        bail!("assembling {}: {e}", info.name);
    }

    // Advertise what we fetched while the temporary still exists; peers
    // may pull these blocks from us before we finish.
    if !fetched_indexes.is_empty() {
        fetched_indexes.sort_unstable();
        ctx.view
            .broadcast_download_progress(
                &ctx.config.folder_id,
                vec![DownloadProgressUpdate {
                    name: info.name.clone(),
                    version: info.version.clone(),
                    block_indexes: fetched_indexes.clone(),
                }],
            )
            .await;
    }

    Ok(fetched_indexes)
}

fn copy_block(
    fs: &dyn Filesystem,
    name: &str,
    offset: u64,
    block: &BlockInfo,
) -> Result<Bytes, String> {
    let data = fs
        .read_range(name, offset, block.size as usize)
        .map_err(|e| e.to_string())?;
    if !verify_block(&data, &block.hash) {
        return Err(format!("local copy of block in {name} is stale"));
    }
    Ok(Bytes::from(data))
}

async fn fetch_block(
    view: &dyn ClusterView,
    fileset: &FileSet,
    folder: &str,
    name: &str,
    index: usize,
    block: &BlockInfo,
    fetch_sem: &Semaphore,
) -> Result<Bytes, String> {
    let _permit = fetch_sem.acquire().await.map_err(|e| e.to_string())?;

    // Peers with the whole winning version, plus peers advertising this
    // block in a temporary. Rotate the starting point so parallel blocks
    // spread across peers.
    let full_holders = fileset.availability(name);
    let temp_holders: Vec<DeviceId> = view
        .devices_with_temp_block(folder, name, index as u32)
        .into_iter()
        .filter(|d| !full_holders.contains(d))
        .collect();

    let mut candidates: Vec<(Arc<meshsync_proto::Connection>, bool)> = Vec::new();
    for conn in view.connections_for(folder, &full_holders) {
        candidates.push((conn, false));
    }
    for conn in view.connections_for(folder, &temp_holders) {
        candidates.push((conn, true));
    }
    if candidates.is_empty() {
        return Err(format!("no connected peer has block {index} of {name}"));
    }

    let start = index % candidates.len();
    let mut last_error = String::new();
    for i in 0..candidates.len() {
        let (conn, from_temp) = &candidates[(start + i) % candidates.len()];
        match conn
            .request(
                folder,
                name,
                block.offset as i64,
                block.size as i32,
                block.hash,
                block.weak_hash,
                *from_temp,
            )
            .await
        {
            Ok(data) => {
                if verify_block(&data, &block.hash) {
                    return Ok(data);
                }
                last_error = format!("bad data from {}", conn.remote());
            }
            Err(e) => last_error = format!("{}: {e}", conn.remote()),
        }
    }
    Err(format!("block {index} of {name} unavailable: {last_error}"))
}

/// Get the existing target out of the way: a conflict copy if our local
/// version genuinely conflicts with the winner, the versioner otherwise.
fn displace_target(
    ctx: &PullContext,
    winner: &FileInfo,
    local: Option<&FileInfo>,
) -> color_eyre::Result<()> {
    if !ctx.fs.exists(&winner.name) {
        return Ok(());
    }

    let conflicts = local.is_some_and(|l| {
        !l.deleted && l.version.compare(&winner.version) == VecOrdering::Concurrent
    });

    if conflicts && ctx.config.max_conflicts != 0 {
        let cname = conflict_name(&winner.name, ctx.config.short_id, chrono::Local::now());
        debug!(name = %winner.name, conflict = %cname, "creating conflict copy");
        ctx.fs.rename(&winner.name, &cname)?;
        trim_conflicts(ctx, &winner.name)?;
    } else {
        ctx.versioner.archive(ctx.fs.as_ref(), &winner.name)?;
    }
    Ok(())
}

fn trim_conflicts(ctx: &PullContext, name: &str) -> color_eyre::Result<()> {
    if ctx.config.max_conflicts < 0 {
        return Ok(());
    }
    let dir = name.rsplit_once('/').map_or("", |(d, _)| d);
    let mut copies: Vec<String> = ctx
        .fs
        .list_dir(dir)?
        .into_iter()
        .filter(|c| is_conflict_copy(c, name))
        .collect();
    if copies.len() <= ctx.config.max_conflicts as usize {
        return Ok(());
    }
    // Timestamps in the name sort lexicographically; oldest first.
    copies.sort();
    let excess = copies.len() - ctx.config.max_conflicts as usize;
    for stale in copies.into_iter().take(excess) {
        let _ = ctx.fs.remove_file(&stale);
    }
    Ok(())
}
