//! meshsync-db: the persistent index and per-folder file sets
//!
//! LMDB-backed storage of every device's file records per folder, plus the
//! in-memory façade the engine queries for winners and needed files.

pub mod error;
pub mod fileset;
pub mod index;
mod values;

pub use error::DbError;
pub use fileset::FileSet;
pub use index::{IndexDb, SCHEMA_VERSION};
