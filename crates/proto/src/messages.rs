//! Block exchange protocol messages

use bytes::Bytes;

use meshsync_core::{DeviceId, FileInfo, Vector};

/// Per-request outcome codes carried in [`Response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NoError,
    Generic,
    NoSuchFile,
    InvalidFile,
}

impl ErrorCode {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::NoError => 0,
            Self::Generic => 1,
            Self::NoSuchFile => 2,
            Self::InvalidFile => 3,
        }
    }

    #[must_use]
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::NoError),
            1 => Some(Self::Generic),
            2 => Some(Self::NoSuchFile),
            3 => Some(Self::InvalidFile),
            _ => None,
        }
    }
}

/// First message in each direction, identifying the peer's software.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Hello {
    pub device_name: String,
    pub client_name: String,
    pub client_version: String,
}

/// A device entry within a cluster config folder.
#[derive(Debug, Clone, PartialEq)]
pub struct CcDevice {
    pub id: DeviceId,
    pub name: String,
    pub introducer: bool,
    pub skip_introduction_removals: bool,
    pub max_request_kib: u64,
    /// Token asserting the sender's previous index for this device is
    /// still a valid base for incremental updates
    pub index_id: u64,
    /// Highest sequence the sender has seen from this device
    pub max_sequence: u64,
}

/// A folder entry within a cluster config.
#[derive(Debug, Clone, PartialEq)]
pub struct CcFolder {
    pub id: String,
    pub label: String,
    pub devices: Vec<CcDevice>,
}

/// The sender's view of which folders it shares with us and who else
/// participates. Resendable; replaces the previous view.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClusterConfig {
    pub folders: Vec<CcFolder>,
}

impl ClusterConfig {
    #[must_use]
    pub fn folder(&self, id: &str) -> Option<&CcFolder> {
        self.folders.iter().find(|f| f.id == id)
    }
}

/// A request for a byte range of a file.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: u32,
    pub folder: String,
    pub name: String,
    pub offset: i64,
    pub size: i32,
    pub hash: [u8; 32],
    pub weak_hash: u32,
    /// Read from the peer's temporary copy rather than the final file
    pub from_temporary: bool,
}

impl Request {
    /// Bounds-check a request against the largest block we serve.
    ///
    /// # Errors
    /// Returns a description of the violation.
    pub fn validate(&self, max_block_size: u32) -> Result<(), String> {
        if self.offset < 0 {
            return Err(format!("negative offset {}", self.offset));
        }
        if self.size <= 0 {
            return Err(format!("non-positive size {}", self.size));
        }
        if self.size as u32 > max_block_size {
            return Err(format!("size {} exceeds max block size", self.size));
        }
        Ok(())
    }
}

/// Reply to a [`Request`], correlated by id.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u32,
    pub data: Bytes,
    pub code: ErrorCode,
}

/// One partially-downloaded file advertisement.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadProgressUpdate {
    pub name: String,
    pub version: Vector,
    /// Block indexes present in the sender's temporary file; empty
    /// retracts the advertisement
    pub block_indexes: Vec<u32>,
}

/// All protocol messages, tagged with their stable wire ids.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello(Hello),
    ClusterConfig(ClusterConfig),
    Index {
        folder: String,
        files: Vec<FileInfo>,
    },
    IndexUpdate {
        folder: String,
        files: Vec<FileInfo>,
    },
    Request(Request),
    Response(Response),
    DownloadProgress {
        folder: String,
        updates: Vec<DownloadProgressUpdate>,
    },
    Ping,
    Close {
        reason: String,
    },
}

impl Message {
    #[must_use]
    pub fn type_id(&self) -> u8 {
        match self {
            Self::Hello(_) => 0x00,
            Self::ClusterConfig(_) => 0x01,
            Self::Index { .. } => 0x02,
            Self::IndexUpdate { .. } => 0x03,
            Self::Request(_) => 0x04,
            Self::Response(_) => 0x05,
            Self::DownloadProgress { .. } => 0x06,
            Self::Ping => 0x07,
            Self::Close { .. } => 0x08,
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Hello(_) => "Hello",
            Self::ClusterConfig(_) => "ClusterConfig",
            Self::Index { .. } => "Index",
            Self::IndexUpdate { .. } => "IndexUpdate",
            Self::Request(_) => "Request",
            Self::Response(_) => "Response",
            Self::DownloadProgress { .. } => "DownloadProgress",
            Self::Ping => "Ping",
            Self::Close { .. } => "Close",
        }
    }
}
