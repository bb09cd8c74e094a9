//! Device identities derived from certificate digests

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A device identity: the SHA-256 digest of the device's leaf certificate DER.
///
/// Device ids are compared byte-wise; the lexicographic order over the raw
/// digest is what breaks otherwise-unresolvable conflicts, so `Ord` here is
/// load-bearing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId([u8; 32]);

impl DeviceId {
    /// Derive a device id from a certificate in DER form.
    #[must_use]
    pub fn from_der(der: &[u8]) -> Self {
        let digest = Sha256::digest(der);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Construct from a raw 32-byte digest.
    #[must_use]
    pub fn from_raw(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The compact form used as a vector clock key: the first eight bytes
    /// of the digest as a big-endian integer.
    #[must_use]
    pub fn short_id(&self) -> ShortId {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.0[..8]);
        ShortId(u64::from_be_bytes(prefix))
    }

    /// Convert to hex string
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a hex string.
    ///
    /// # Errors
    /// Returns an error if the input is not 64 hex characters.
    pub fn from_hex(s: &str) -> color_eyre::Result<Self> {
        let decoded = hex::decode(s.trim())?;
        let bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|_| color_eyre::eyre::eyre!("device id must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "DeviceId({})", hex.get(..14).unwrap_or(&hex))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "{}", hex.get(..14).unwrap_or(&hex))
    }
}

impl TryFrom<String> for DeviceId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s).map_err(|e| e.to_string())
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.to_hex()
    }
}

/// The first 64 bits of a device id, used as a compact vector clock key.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct ShortId(pub u64);

impl ShortId {
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShortId({:016x})", self.0)
    }
}

impl fmt::Display for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Find a short-id collision among a set of device ids, if any.
///
/// Short ids key vector clocks, so two member devices mapping to the same
/// short id would make version history ambiguous. Returns the first
/// colliding pair.
#[must_use]
pub fn short_id_collision(devices: &[DeviceId]) -> Option<(DeviceId, DeviceId)> {
    let mut seen: std::collections::HashMap<ShortId, DeviceId> = std::collections::HashMap::new();
    for dev in devices {
        if let Some(prev) = seen.insert(dev.short_id(), *dev) {
            if prev != *dev {
                return Some((prev, *dev));
            }
        }
    }
    None
}
