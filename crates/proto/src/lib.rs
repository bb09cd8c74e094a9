//! meshsync-proto: the block exchange protocol
//!
//! Message types, the framed binary codec, and the per-peer connection
//! with request multiplexing. Transport setup (dialing, TLS) happens
//! elsewhere; this crate starts from an authenticated byte stream.

pub mod connection;
pub mod error;
pub mod messages;
pub mod transport;
pub mod wire;

pub use connection::{Connection, ConnectionConfig, ConnectionHandler, DEFAULT_MAX_REQUEST_KIB};
pub use error::{ProtocolError, RequestError};
pub use messages::{
    CcDevice, CcFolder, ClusterConfig, DownloadProgressUpdate, ErrorCode, Hello, Message, Request,
    Response,
};
pub use transport::{memory_pair, AuthenticatedStream, Stream};
