//! One peer connection: framed messages, request multiplexing, close
//!
//! A connection runs one reader task and one writer task over an
//! authenticated stream. `Hello` must be the first message in each
//! direction. Outbound requests are correlated by id and bounded by a
//! per-peer byte budget; responses complete out of order. Closing fails
//! every outstanding request with a cancellation error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use meshsync_core::{Compression, DeviceId, FileInfo};

use crate::error::{ProtocolError, RequestError};
use crate::messages::{
    ClusterConfig, DownloadProgressUpdate, ErrorCode, Hello, Message, Request, Response,
};
use crate::transport::{AuthenticatedStream, Stream};
use crate::wire::{read_message, write_message};

/// Default outstanding-request budget towards a peer, in KiB.
pub const DEFAULT_MAX_REQUEST_KIB: u64 = 32 * 1024;

/// Tuning for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Negotiated compression towards this peer
    pub compression: Compression,
    /// Outstanding request budget in KiB; 0 uses the default
    pub max_request_kib: u64,
    pub ping_interval: Duration,
    pub receive_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            compression: Compression::Metadata,
            max_request_kib: 0,
            ping_interval: Duration::from_secs(60),
            receive_timeout: Duration::from_secs(120),
        }
    }
}

/// Inbound message sink, implemented by the model. Keeps the
/// connection/model dependency one-directional.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn cluster_config(&self, remote: DeviceId, config: ClusterConfig);

    /// Full index replacement. An error is a protocol violation and closes
    /// the connection.
    async fn index(
        &self,
        remote: DeviceId,
        folder: String,
        files: Vec<FileInfo>,
    ) -> Result<(), String>;

    /// Incremental index delta. Same error contract as `index`.
    async fn index_update(
        &self,
        remote: DeviceId,
        folder: String,
        files: Vec<FileInfo>,
    ) -> Result<(), String>;

    /// Serve a block read. The returned data or code goes back as the
    /// response.
    async fn request(&self, remote: DeviceId, request: Request) -> Result<Bytes, ErrorCode>;

    async fn download_progress(
        &self,
        remote: DeviceId,
        folder: String,
        updates: Vec<DownloadProgressUpdate>,
    );

    /// The connection is gone, gracefully or not. Called exactly once.
    async fn closed(&self, remote: DeviceId, reason: String);
}

type PendingMap = Mutex<HashMap<u32, oneshot::Sender<Result<Response, RequestError>>>>;

/// A live connection to one peer.
#[derive(Debug)]
pub struct Connection {
    remote: DeviceId,
    remote_hello: Hello,
    writer_tx: mpsc::Sender<Message>,
    pending: PendingMap,
    next_id: AtomicU32,
    budget: Arc<Semaphore>,
    budget_total: usize,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Connection {
    /// Perform the Hello exchange and start the reader and writer tasks.
    ///
    /// # Errors
    /// Returns an error if the peer's first message is not `Hello` or the
    /// exchange fails.
    pub async fn establish(
        stream: AuthenticatedStream,
        local_hello: Hello,
        config: ConnectionConfig,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Arc<Self>, ProtocolError> {
        let AuthenticatedStream { remote, stream } = stream;
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        // Hello goes out uncompressed, before any negotiation applies.
        write_message(
            &mut write_half,
            &Message::Hello(local_hello),
            Compression::Never,
        )
        .await?;

        let first = tokio::time::timeout(config.receive_timeout, read_message(&mut read_half))
            .await
            .map_err(|_| {
                ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "timed out waiting for Hello",
                ))
            })??;
        let Message::Hello(remote_hello) = first else {
            return Err(ProtocolError::MissingHello);
        };
        debug!(
            %remote,
            name = %remote_hello.device_name,
            client = %remote_hello.client_name,
            "peer connected"
        );

        let kib = if config.max_request_kib == 0 {
            DEFAULT_MAX_REQUEST_KIB
        } else {
            config.max_request_kib
        };
        let budget_total = (kib as usize) * 1024;

        let (writer_tx, writer_rx) = mpsc::channel(128);
        let cancel = CancellationToken::new();

        let conn = Arc::new(Self {
            remote,
            remote_hello,
            writer_tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            budget: Arc::new(Semaphore::new(budget_total)),
            budget_total,
            cancel,
            closed: AtomicBool::new(false),
        });

        tokio::spawn(writer_loop(
            write_half,
            writer_rx,
            config.compression,
            config.ping_interval,
            conn.cancel.clone(),
        ));
        tokio::spawn(reader_loop(
            conn.clone(),
            read_half,
            handler,
            config.receive_timeout,
        ));

        Ok(conn)
    }

    #[must_use]
    pub fn remote(&self) -> DeviceId {
        self.remote
    }

    /// The Hello the peer sent during the handshake.
    #[must_use]
    pub fn hello(&self) -> &Hello {
        &self.remote_hello
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::SeqCst)
    }

    async fn send(&self, msg: Message) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::Closed);
        }
        self.writer_tx
            .send(msg)
            .await
            .map_err(|_| ProtocolError::Closed)
    }

    /// Send our cluster view.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Closed`] after close.
    pub async fn send_cluster_config(&self, config: ClusterConfig) -> Result<(), ProtocolError> {
        self.send(Message::ClusterConfig(config)).await
    }

    /// Send a full index for a folder.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Closed`] after close.
    pub async fn send_index(
        &self,
        folder: String,
        files: Vec<FileInfo>,
    ) -> Result<(), ProtocolError> {
        self.send(Message::Index { folder, files }).await
    }

    /// Send an incremental index delta for a folder.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Closed`] after close.
    pub async fn send_index_update(
        &self,
        folder: String,
        files: Vec<FileInfo>,
    ) -> Result<(), ProtocolError> {
        self.send(Message::IndexUpdate { folder, files }).await
    }

    /// Advertise temporary-file progress.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Closed`] after close.
    pub async fn send_download_progress(
        &self,
        folder: String,
        updates: Vec<DownloadProgressUpdate>,
    ) -> Result<(), ProtocolError> {
        self.send(Message::DownloadProgress { folder, updates })
            .await
    }

    /// Request a byte range from the peer. Holds `size` bytes of the
    /// per-peer budget until the response (or cancellation) arrives, so
    /// callers naturally throttle to `max_request_kib`.
    ///
    /// # Errors
    /// Returns the peer's error code or a cancellation.
    #[allow(clippy::too_many_arguments)]
    pub async fn request(
        &self,
        folder: &str,
        name: &str,
        offset: i64,
        size: i32,
        hash: [u8; 32],
        weak_hash: u32,
        from_temporary: bool,
    ) -> Result<Bytes, RequestError> {
        if self.is_closed() {
            return Err(RequestError::Canceled);
        }

        let want = (size.max(0) as usize).min(self.budget_total).max(1) as u32;
        let _permit = tokio::select! {
            permit = self.budget.clone().acquire_many_owned(want) => {
                permit.map_err(|_| RequestError::Canceled)?
            }
            () = self.cancel.cancelled() => return Err(RequestError::Canceled),
        };

        let id = self.next_id.fetch_add(1, AtomicOrdering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let sent = self
            .send(Message::Request(Request {
                id,
                folder: folder.to_string(),
                name: name.to_string(),
                offset,
                size,
                hash,
                weak_hash,
                from_temporary,
            }))
            .await;
        if sent.is_err() {
            self.pending.lock().remove(&id);
            return Err(RequestError::Canceled);
        }

        let response = rx.await.map_err(|_| RequestError::Canceled)??;
        match response.code {
            ErrorCode::NoError => Ok(response.data),
            ErrorCode::Generic => Err(RequestError::Generic),
            ErrorCode::NoSuchFile => Err(RequestError::NoSuchFile),
            ErrorCode::InvalidFile => Err(RequestError::InvalidFile),
        }
    }

    /// Close gracefully: tell the peer why, stop both tasks, cancel
    /// outstanding requests.
    pub async fn close(&self, reason: &str) {
        if self.closed.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        let _ = self
            .writer_tx
            .send(Message::Close {
                reason: reason.to_string(),
            })
            .await;
        self.cancel.cancel();
        self.fail_pending();
    }

    fn fail_pending(&self) {
        let mut pending = self.pending.lock();
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(RequestError::Canceled));
        }
    }

    fn complete_request(&self, response: Response) {
        match self.pending.lock().remove(&response.id) {
            Some(tx) => {
                let _ = tx.send(Ok(response));
            }
            // Late response for a locally-canceled request.
            None => trace!(id = response.id, "dropping unmatched response"),
        }
    }
}

async fn reader_loop(
    conn: Arc<Connection>,
    mut reader: ReadHalf<Box<dyn Stream>>,
    handler: Arc<dyn ConnectionHandler>,
    receive_timeout: Duration,
) {
    let remote = conn.remote();
    let reason = loop {
        let msg = tokio::select! {
            () = conn.cancel.cancelled() => break "closed locally".to_string(),
            read = tokio::time::timeout(receive_timeout, read_message(&mut reader)) => {
                match read {
                    Err(_) => break "receive timeout".to_string(),
                    Ok(Err(e)) => break e.to_string(),
                    Ok(Ok(msg)) => msg,
                }
            }
        };

        trace!(%remote, msg = msg.type_name(), "received");
        match msg {
            Message::Hello(_) => break "unexpected Hello after handshake".to_string(),
            Message::ClusterConfig(cc) => handler.cluster_config(remote, cc).await,
            Message::Index { folder, files } => {
                if let Err(e) = handler.index(remote, folder, files).await {
                    break format!("index rejected: {e}");
                }
            }
            Message::IndexUpdate { folder, files } => {
                if let Err(e) = handler.index_update(remote, folder, files).await {
                    break format!("index update rejected: {e}");
                }
            }
            Message::Request(request) => {
                let handler = handler.clone();
                let writer_tx = conn.writer_tx.clone();
                tokio::spawn(async move {
                    let id = request.id;
                    let (data, code) = match handler.request(remote, request).await {
                        Ok(data) => (data, ErrorCode::NoError),
                        Err(code) => (Bytes::new(), code),
                    };
                    let _ = writer_tx
                        .send(Message::Response(Response { id, data, code }))
                        .await;
                });
            }
            Message::Response(response) => conn.complete_request(response),
            Message::DownloadProgress { folder, updates } => {
                handler.download_progress(remote, folder, updates).await;
            }
            Message::Ping => {}
            Message::Close { reason } => break format!("closed by peer: {reason}"),
        }
    };

    debug!(%remote, %reason, "connection finished");
    conn.closed.store(true, AtomicOrdering::SeqCst);
    conn.cancel.cancel();
    conn.fail_pending();
    handler.closed(remote, reason).await;
}

async fn writer_loop(
    mut writer: WriteHalf<Box<dyn Stream>>,
    mut rx: mpsc::Receiver<Message>,
    compression: Compression,
    ping_interval: Duration,
    cancel: CancellationToken,
) {
    let mut last_write = Instant::now();
    let mut ticker = tokio::time::interval(ping_interval / 2);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                // Flush what was queued before the cancel; a graceful
                // close's final message goes out this way.
                while let Ok(msg) = rx.try_recv() {
                    if write_message(&mut writer, &msg, compression).await.is_err() {
                        break;
                    }
                }
                break;
            }
            maybe = rx.recv() => {
                let Some(msg) = maybe else { break };
                let is_close = matches!(msg, Message::Close { .. });
                if let Err(e) = write_message(&mut writer, &msg, compression).await {
                    warn!("write failed: {e}");
                    cancel.cancel();
                    break;
                }
                last_write = Instant::now();
                if is_close {
                    break;
                }
            }
            _ = ticker.tick() => {
                if last_write.elapsed() >= ping_interval {
                    if write_message(&mut writer, &Message::Ping, compression).await.is_err() {
                        cancel.cancel();
                        break;
                    }
                    last_write = Instant::now();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory_pair;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn dev(n: u8) -> DeviceId {
        DeviceId::from_raw([n; 32])
    }

    fn hello(name: &str) -> Hello {
        Hello {
            device_name: name.to_string(),
            client_name: "meshsync".to_string(),
            client_version: "0.1.0".to_string(),
        }
    }

    /// Handler that serves every request with fixed data after an optional
    /// gate, and records what it saw.
    struct TestHandler {
        data: Bytes,
        served: AtomicUsize,
        gate: Option<Arc<Notify>>,
        closed_reason: Mutex<Option<String>>,
    }

    impl TestHandler {
        fn new(data: &'static [u8]) -> Arc<Self> {
            Arc::new(Self {
                data: Bytes::from_static(data),
                served: AtomicUsize::new(0),
                gate: None,
                closed_reason: Mutex::new(None),
            })
        }

        fn gated(data: &'static [u8], gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                data: Bytes::from_static(data),
                served: AtomicUsize::new(0),
                gate: Some(gate),
                closed_reason: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl ConnectionHandler for TestHandler {
        async fn cluster_config(&self, _remote: DeviceId, _config: ClusterConfig) {}
        async fn index(
            &self,
            _remote: DeviceId,
            _folder: String,
            _files: Vec<FileInfo>,
        ) -> Result<(), String> {
            Ok(())
        }
        async fn index_update(
            &self,
            _remote: DeviceId,
            _folder: String,
            _files: Vec<FileInfo>,
        ) -> Result<(), String> {
            Ok(())
        }
        async fn request(&self, _remote: DeviceId, _request: Request) -> Result<Bytes, ErrorCode> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.served.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(self.data.clone())
        }
        async fn download_progress(
            &self,
            _remote: DeviceId,
            _folder: String,
            _updates: Vec<DownloadProgressUpdate>,
        ) {
        }
        async fn closed(&self, _remote: DeviceId, reason: String) {
            *self.closed_reason.lock() = Some(reason);
        }
    }

    async fn connected_pair(
        a_handler: Arc<TestHandler>,
        b_handler: Arc<TestHandler>,
        a_config: ConnectionConfig,
    ) -> (Arc<Connection>, Arc<Connection>) {
        let (a_stream, b_stream) = memory_pair(dev(1), dev(2));
        let (a_conn, b_conn) = tokio::join!(
            Connection::establish(a_stream, hello("a"), a_config, a_handler),
            Connection::establish(
                b_stream,
                hello("b"),
                ConnectionConfig::default(),
                b_handler
            ),
        );
        (a_conn.unwrap(), b_conn.unwrap())
    }

    #[tokio::test]
    async fn test_hello_exchange() {
        let (a, b) = connected_pair(
            TestHandler::new(b""),
            TestHandler::new(b""),
            ConnectionConfig::default(),
        )
        .await;
        assert_eq!(a.hello().device_name, "b");
        assert_eq!(b.hello().device_name, "a");
        assert_eq!(a.remote(), dev(2));
        assert_eq!(b.remote(), dev(1));
    }

    #[tokio::test]
    async fn test_request_response() {
        let (a, _b) = connected_pair(
            TestHandler::new(b"block data"),
            TestHandler::new(b"block data"),
            ConnectionConfig::default(),
        )
        .await;

        let data = a
            .request("folder", "file", 0, 1024, [0u8; 32], 0, false)
            .await
            .unwrap();
        assert_eq!(&data[..], b"block data");
    }

    #[tokio::test]
    async fn test_close_cancels_outstanding() {
        let gate = Arc::new(Notify::new());
        let (a, _b) = connected_pair(
            TestHandler::new(b""),
            TestHandler::gated(b"never", gate),
            ConnectionConfig::default(),
        )
        .await;

        let a2 = a.clone();
        let pending =
            tokio::spawn(
                async move { a2.request("f", "x", 0, 1024, [0u8; 32], 0, false).await },
            );
        tokio::task::yield_now().await;

        a.close("test over").await;
        let result = pending.await.unwrap();
        assert_eq!(result.unwrap_err(), RequestError::Canceled);
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn test_request_budget_serializes() {
        // Budget of 1 KiB; two 2000-byte requests cannot be in flight at
        // once, so the second completes strictly after the first releases.
        let gate = Arc::new(Notify::new());
        let handler_b = TestHandler::gated(b"response!", gate.clone());
        let config = ConnectionConfig {
            max_request_kib: 1,
            ..ConnectionConfig::default()
        };
        let (a, _b) = connected_pair(TestHandler::new(b""), handler_b.clone(), config).await;

        let a1 = a.clone();
        let first =
            tokio::spawn(async move { a1.request("f", "x", 0, 2000, [0u8; 32], 0, false).await });
        let a2 = a.clone();
        let second =
            tokio::spawn(async move { a2.request("f", "y", 0, 2000, [0u8; 32], 0, false).await });

        // Let both tasks run; only one request can hold the budget.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler_b.served.load(AtomicOrdering::SeqCst), 0);

        // Release one request at a time.
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler_b.served.load(AtomicOrdering::SeqCst), 1);

        gate.notify_one();
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(handler_b.served.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_peer_close_notifies_handler() {
        let handler_b = TestHandler::new(b"");
        let (a, _b) = connected_pair(
            TestHandler::new(b""),
            handler_b.clone(),
            ConnectionConfig::default(),
        )
        .await;

        a.close("done here").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reason = handler_b.closed_reason.lock().clone().unwrap();
        assert!(reason.contains("done here"), "reason: {reason}");
    }

    #[tokio::test]
    async fn test_non_hello_first_is_fatal() {
        let (a_stream, b_stream) = memory_pair(dev(1), dev(2));

        // A well-behaved side...
        let handler: Arc<dyn ConnectionHandler> = TestHandler::new(b"");
        let a_task = tokio::spawn(Connection::establish(
            a_stream,
            hello("a"),
            ConnectionConfig::default(),
            handler,
        ));

        // ...against one that leads with Ping.
        let AuthenticatedStream { mut stream, .. } = b_stream;
        write_message(&mut stream, &Message::Ping, Compression::Never)
            .await
            .unwrap();

        let result = a_task.await.unwrap();
        assert!(matches!(result, Err(ProtocolError::MissingHello)));
    }
}
