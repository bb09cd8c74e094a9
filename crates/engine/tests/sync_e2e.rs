//! End-to-end synchronization between two in-process devices
//!
//! Each device is a full model with its own root, index database, and
//! configuration; the pair is wired together with an in-memory duplex
//! standing in for the TLS transport.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use meshsync_core::{
    Config, ConfigStore, DeviceConfig, DeviceId, EventSink, FolderConfig, FolderDevice, Options,
};
use meshsync_db::IndexDb;
use meshsync_engine::Model;
use meshsync_proto::memory_pair;

const FOLDER: &str = "shared";

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string()))
        .with_target(false)
        .try_init();
}

struct Device {
    id: DeviceId,
    model: Arc<Model>,
    root: TempDir,
    _db_dir: TempDir,
}

impl Device {
    async fn start(n: u8, peers: &[u8]) -> Self {
        init_logging();
        let id = DeviceId::from_raw([n; 32]);
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join(".stfolder"), b"").unwrap();

        let mut folder = FolderConfig::new(FOLDER, root.path());
        folder.rescan_interval_s = 3600;
        let mut devices = Vec::new();
        for &peer in peers {
            let peer_id = DeviceId::from_raw([peer; 32]);
            folder.devices.push(FolderDevice {
                device_id: peer_id,
                introduced_by: None,
            });
            devices.push(DeviceConfig::new(peer_id));
        }

        let config = Config {
            folders: vec![folder],
            devices,
            options: Options::default(),
        };

        let db_dir = TempDir::new().unwrap();
        let db = Arc::new(IndexDb::open(db_dir.path()).unwrap());
        let store = Arc::new(ConfigStore::new(config));
        let model = Model::new(id, format!("device-{n}"), store, db, EventSink::new()).unwrap();
        model.start().await;

        Self {
            id,
            model,
            root,
            _db_dir: db_dir,
        }
    }

    fn write(&self, name: &str, content: &str) {
        std::fs::write(self.root.path().join(name), content).unwrap();
    }

    fn read(&self, name: &str) -> Option<String> {
        std::fs::read_to_string(self.root.path().join(name)).ok()
    }

    async fn rescan_and_settle(&self) {
        assert!(self.model.rescan(FOLDER));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn connect(a: &Device, b: &Device) {
    let (stream_a, stream_b) = memory_pair(a.id, b.id);
    let (conn_a, conn_b) = tokio::join!(
        a.model.add_connection(stream_a),
        b.model.add_connection(stream_b),
    );
    conn_a.unwrap();
    conn_b.unwrap();
}

async fn disconnect(a: &Device, b: &Device) {
    if let Some(conn) = a.model.connection(&b.id) {
        conn.close("test disconnect").await;
    }
    wait_for(|| a.model.connection(&b.id).is_none() && b.model.connection(&a.id).is_none()).await;
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached within deadline");
}

#[tokio::test(flavor = "multi_thread")]
async fn single_file_syncs_between_devices() {
    let a = Device::start(1, &[2]).await;
    let b = Device::start(2, &[1]).await;

    a.write("foo", "hello");
    a.rescan_and_settle().await;

    connect(&a, &b).await;

    wait_for(|| b.read("foo").as_deref() == Some("hello")).await;

    // The pulled record carries exactly the sender's version.
    let local = b.model.fileset(FOLDER).unwrap().local("foo").unwrap();
    assert_eq!(local.version.counter(a.id.short_id()), 1);
    assert_eq!(local.version.counter(b.id.short_id()), 0);
    assert_eq!(local.size, 5);

    a.model.stop().await;
    b.model.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn later_changes_flow_as_updates() {
    let a = Device::start(1, &[2]).await;
    let b = Device::start(2, &[1]).await;

    connect(&a, &b).await;

    a.write("first.txt", "one");
    a.rescan_and_settle().await;
    wait_for(|| b.read("first.txt").as_deref() == Some("one")).await;

    // A second file after the initial exchange arrives incrementally.
    a.write("second.txt", "two");
    a.rescan_and_settle().await;
    wait_for(|| b.read("second.txt").as_deref() == Some("two")).await;

    // And a content change to the first.
    a.write("first.txt", "one, revised");
    a.rescan_and_settle().await;
    wait_for(|| b.read("first.txt").as_deref() == Some("one, revised")).await;

    a.model.stop().await;
    b.model.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn deletion_propagates() {
    let a = Device::start(1, &[2]).await;
    let b = Device::start(2, &[1]).await;

    connect(&a, &b).await;

    a.write("doomed.txt", "soon gone");
    a.rescan_and_settle().await;
    wait_for(|| b.read("doomed.txt").is_some()).await;

    std::fs::remove_file(a.root.path().join("doomed.txt")).unwrap();
    a.rescan_and_settle().await;

    wait_for(|| b.read("doomed.txt").is_none()).await;
    let record = b.model.fileset(FOLDER).unwrap().local("doomed.txt").unwrap();
    assert!(record.deleted);

    a.model.stop().await;
    b.model.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_edits_produce_conflict_copy() {
    let a = Device::start(1, &[2]).await;
    let b = Device::start(2, &[1]).await;

    connect(&a, &b).await;

    a.write("f", "base");
    a.rescan_and_settle().await;
    wait_for(|| b.read("f").as_deref() == Some("base")).await;

    disconnect(&a, &b).await;

    // Offline, both edit. A's edit gets the later mtime, so A's version
    // wins the concurrent tiebreak and B keeps a conflict copy.
    let now = std::time::SystemTime::now();
    b.write("f", "b's edit");
    filetime::set_file_mtime(
        b.root.path().join("f"),
        filetime::FileTime::from_system_time(now - Duration::from_secs(60)),
    )
    .unwrap();
    b.rescan_and_settle().await;

    a.write("f", "a's edit");
    filetime::set_file_mtime(
        a.root.path().join("f"),
        filetime::FileTime::from_system_time(now + Duration::from_secs(60)),
    )
    .unwrap();
    a.rescan_and_settle().await;

    // Sanity: genuinely concurrent versions.
    let a_version = a.model.fileset(FOLDER).unwrap().local("f").unwrap().version;
    let b_version = b.model.fileset(FOLDER).unwrap().local("f").unwrap().version;
    assert_eq!(
        a_version.compare(&b_version),
        meshsync_core::Ordering::Concurrent
    );

    connect(&a, &b).await;

    wait_for(|| b.read("f").as_deref() == Some("a's edit")).await;

    // The losing side keeps its contents under a conflict name.
    let conflict: Vec<String> = std::fs::read_dir(b.root.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .filter(|n| n.contains(".sync-conflict-"))
        .collect();
    assert_eq!(conflict.len(), 1, "expected one conflict copy: {conflict:?}");
    assert!(
        conflict[0].contains(&b.id.short_id().to_string()),
        "conflict name carries the local short id: {conflict:?}"
    );
    assert_eq!(
        b.read(&conflict[0]).as_deref(),
        Some("b's edit"),
        "conflict copy holds the pre-pull contents"
    );

    // The winner never sees a conflict copy.
    let a_conflicts = std::fs::read_dir(a.root.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .filter(|n| n.contains(".sync-conflict-"))
        .count();
    assert_eq!(a_conflicts, 0);
    assert_eq!(a.read("f").as_deref(), Some("a's edit"));

    a.model.stop().await;
    b.model.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnect_resumes_with_deltas() {
    let a = Device::start(1, &[2]).await;
    let b = Device::start(2, &[1]).await;

    connect(&a, &b).await;
    a.write("keep.txt", "stays");
    a.rescan_and_settle().await;
    wait_for(|| b.read("keep.txt").is_some()).await;

    disconnect(&a, &b).await;

    // Offline change on A; on reconnect the recorded delta index ids
    // still match, so only the new records flow.
    a.write("later.txt", "after reconnect");
    a.rescan_and_settle().await;

    connect(&a, &b).await;
    wait_for(|| b.read("later.txt").as_deref() == Some("after reconnect")).await;

    // Untouched records survived the reconnect untouched.
    let keep = b.model.fileset(FOLDER).unwrap().local("keep.txt").unwrap();
    assert_eq!(keep.version.counter(a.id.short_id()), 1);

    a.model.stop().await;
    b.model.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_from_unknown_device_rejected() {
    let a = Device::start(1, &[2]).await;
    let stranger = DeviceId::from_raw([9u8; 32]);

    let (stream_a, _stream_b) = memory_pair(a.id, stranger);
    let result = a.model.add_connection(stream_a).await;
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("unknown device"));

    a.model.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn local_version_never_exceeds_global() {
    let a = Device::start(1, &[2]).await;
    let b = Device::start(2, &[1]).await;

    connect(&a, &b).await;
    a.write("x.txt", "one");
    b.write("y.txt", "two");
    a.rescan_and_settle().await;
    b.rescan_and_settle().await;

    wait_for(|| a.read("y.txt").is_some() && b.read("x.txt").is_some()).await;

    // On both devices, for every path: the local record never orders
    // above the global winner.
    for device in [&a, &b] {
        let fileset = device.model.fileset(FOLDER).unwrap();
        for local in fileset.local_files() {
            let (global, _) = fileset.global(&local.name).unwrap();
            assert_ne!(
                local.version.compare(&global.version),
                meshsync_core::Ordering::Greater,
                "{} outran the global version on {}",
                local.name,
                device.id
            );
        }
    }

    a.model.stop().await;
    b.model.stop().await;
}
