//! Read-only cluster view for folder runners
//!
//! Runners need to reach peers (to request blocks and announce index
//! updates) without holding a mutating reference to the model. The model
//! hands them this narrow view instead, which keeps the model ↔ runner
//! dependency one-directional.

use std::sync::Arc;

use async_trait::async_trait;

use meshsync_core::{DeviceId, FileInfo};
use meshsync_proto::{Connection, DownloadProgressUpdate};

/// What a folder runner may ask of the rest of the cluster.
#[async_trait]
pub trait ClusterView: Send + Sync {
    /// Live connections to the given devices that share `folder`.
    fn connections_for(&self, folder: &str, devices: &[DeviceId]) -> Vec<Arc<Connection>>;

    /// Devices that advertised holding block `index` of `name` in a
    /// temporary file.
    fn devices_with_temp_block(&self, folder: &str, name: &str, index: u32) -> Vec<DeviceId>;

    /// Announce freshly committed local records to connected peers.
    async fn local_index_updated(&self, folder: &str, files: Vec<FileInfo>);

    /// Advertise (or retract) our own temporary-file progress.
    async fn broadcast_download_progress(&self, folder: &str, updates: Vec<DownloadProgressUpdate>);
}

/// A view onto nothing: no peers, no progress. Used by tests and by
/// send-only folders that never pull.
pub struct EmptyView;

#[async_trait]
impl ClusterView for EmptyView {
    fn connections_for(&self, _folder: &str, _devices: &[DeviceId]) -> Vec<Arc<Connection>> {
        Vec::new()
    }

    fn devices_with_temp_block(&self, _folder: &str, _name: &str, _index: u32) -> Vec<DeviceId> {
        Vec::new()
    }

    async fn local_index_updated(&self, _folder: &str, _files: Vec<FileInfo>) {}

    async fn broadcast_download_progress(
        &self,
        _folder: &str,
        _updates: Vec<DownloadProgressUpdate>,
    ) {
    }
}
