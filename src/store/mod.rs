pub mod memory;
pub mod persistent;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::PortdResult;
use crate::model::patch::{Patch, PatchId};
use crate::model::port::{Port, PortId, Source};

pub use memory::InMemoryPortStore;

#[cfg(feature = "rocksdb-storage")]
pub use persistent::RocksPortStore;

// ---------------------------------------------------------------------------
// PortStore trait: persistence interface for ports, patches and artifacts
// ---------------------------------------------------------------------------

/// Storage backend for the registry. Implementations only persist records;
/// workflow rules live in the registry.
#[async_trait]
pub trait PortStore: Send + Sync {
    /// Insert a new port, assigning its id.
    async fn insert_port(&self, port: Port) -> PortdResult<Port>;

    async fn get_port(&self, id: PortId) -> PortdResult<Option<Port>>;

    /// Look a port up by its unique `(source, name)` key.
    async fn find_port(&self, source: Source, name: &str) -> PortdResult<Option<Port>>;

    /// Replace an existing port.
    async fn update_port(&self, port: Port) -> PortdResult<()>;

    async fn remove_port(&self, id: PortId) -> PortdResult<()>;

    /// All ports ordered by id.
    async fn list_ports(&self) -> PortdResult<Vec<Port>>;

    /// Insert a new patch, assigning its id.
    async fn insert_patch(&self, patch: Patch) -> PortdResult<Patch>;

    async fn get_patch(&self, id: PatchId) -> PortdResult<Option<Patch>>;

    /// Replace an existing patch.
    async fn update_patch(&self, patch: Patch) -> PortdResult<()>;

    /// All patches ordered by id.
    async fn list_patches(&self) -> PortdResult<Vec<Patch>>;

    /// Store a text artifact (diff, build log) under a key.
    async fn put_artifact(&self, key: &str, content: String) -> PortdResult<()>;

    async fn get_artifact(&self, key: &str) -> PortdResult<Option<String>>;
}

/// Open the store selected by the configuration.
pub fn open_store(config: &StorageConfig) -> PortdResult<Arc<dyn PortStore>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(InMemoryPortStore::new())),
        #[cfg(feature = "rocksdb-storage")]
        StorageBackend::Rocksdb => Ok(Arc::new(RocksPortStore::open(&config.path)?)),
        #[cfg(not(feature = "rocksdb-storage"))]
        StorageBackend::Rocksdb => Err(crate::error::PortdError::Config(format!(
            "storage backend 'rocksdb' at {} requires the rocksdb-storage feature",
            config.path.display()
        ))),
    }
}
