//! Persistent storage implementation using RocksDB.
//!
//! Ports, patches and artifacts live in separate column families; id
//! counters are kept in a metadata family.
//!
//! This module is only available when the `rocksdb-storage` feature is enabled.

#[cfg(feature = "rocksdb-storage")]
pub mod rocks_ports;

#[cfg(feature = "rocksdb-storage")]
pub use rocks_ports::RocksPortStore;

#[cfg(feature = "rocksdb-storage")]
use rocksdb::{Options, DB};
#[cfg(feature = "rocksdb-storage")]
use std::path::Path;
#[cfg(feature = "rocksdb-storage")]
use std::sync::Arc;

#[cfg(feature = "rocksdb-storage")]
use crate::error::{PortdError, PortdResult};

/// Column family names
#[cfg(feature = "rocksdb-storage")]
pub const CF_PORTS: &str = "ports";
#[cfg(feature = "rocksdb-storage")]
pub const CF_PORT_NAMES: &str = "port_names";
#[cfg(feature = "rocksdb-storage")]
pub const CF_PATCHES: &str = "patches";
#[cfg(feature = "rocksdb-storage")]
pub const CF_ARTIFACTS: &str = "artifacts";
#[cfg(feature = "rocksdb-storage")]
pub const CF_META: &str = "meta";

/// Opens a RocksDB instance with all required column families.
#[cfg(feature = "rocksdb-storage")]
pub fn open_db<P: AsRef<Path>>(path: P) -> PortdResult<Arc<DB>> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);

    let column_families = vec![CF_PORTS, CF_PORT_NAMES, CF_PATCHES, CF_ARTIFACTS, CF_META];

    let db = DB::open_cf(&opts, path, &column_families)
        .map_err(|e| PortdError::Internal(format!("Failed to open RocksDB: {}", e)))?;

    Ok(Arc::new(db))
}
