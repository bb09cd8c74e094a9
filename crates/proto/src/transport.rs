//! The transport capability boundary
//!
//! Dialing, listening, and TLS session setup live outside the engine.
//! Whatever does them hands over an [`AuthenticatedStream`]: a bidirectional
//! byte stream plus the remote identity the transport verified (the
//! certificate digest must equal the claimed device id; mismatches never
//! reach the engine).

use meshsync_core::DeviceId;

/// Object-safe alias for the byte streams the engine runs over.
pub trait Stream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}

impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin> Stream for T {}

/// An established, mutually-authenticated byte stream to a peer.
pub struct AuthenticatedStream {
    pub remote: DeviceId,
    pub stream: Box<dyn Stream>,
}

impl AuthenticatedStream {
    #[must_use]
    pub fn new(remote: DeviceId, stream: impl Stream + 'static) -> Self {
        Self {
            remote,
            stream: Box::new(stream),
        }
    }
}

/// An in-memory stream pair posing as two ends of an authenticated
/// connection. The workhorse of integration tests.
#[must_use]
pub fn memory_pair(a: DeviceId, b: DeviceId) -> (AuthenticatedStream, AuthenticatedStream) {
    let (a_stream, b_stream) = tokio::io::duplex(1 << 20);
    (
        AuthenticatedStream::new(b, a_stream), // a's end sees b as remote
        AuthenticatedStream::new(a, b_stream),
    )
}
