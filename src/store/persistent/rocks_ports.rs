//! RocksDB-backed port store implementation.

use async_trait::async_trait;
use rocksdb::{BoundColumnFamily, IteratorMode, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{PortdError, PortdResult};
use crate::model::patch::{Patch, PatchId};
use crate::model::port::{Port, PortId, Source};
use crate::store::PortStore;

use super::{open_db, CF_ARTIFACTS, CF_META, CF_PATCHES, CF_PORTS, CF_PORT_NAMES};

const NEXT_PORT_ID: &[u8] = b"next_port_id";
const NEXT_PATCH_ID: &[u8] = b"next_patch_id";

/// RocksDB-backed store with persistent ports, patches and artifacts.
#[derive(Clone)]
pub struct RocksPortStore {
    db: Arc<DB>,
    /// Serializes id allocation and name-index maintenance.
    write_lock: Arc<Mutex<()>>,
}

impl RocksPortStore {
    pub fn new(db: Arc<DB>) -> Self {
        Self {
            db,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> PortdResult<Self> {
        Ok(Self::new(open_db(path)?))
    }

    fn cf(&self, name: &str) -> PortdResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PortdError::Internal(format!("Missing {} column family", name)))
    }

    fn serialize<T: Serialize>(&self, value: &T) -> PortdResult<Vec<u8>> {
        bincode::serialize(value)
            .map_err(|e| PortdError::Internal(format!("Failed to serialize record: {}", e)))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> PortdResult<T> {
        bincode::deserialize(bytes)
            .map_err(|e| PortdError::Internal(format!("Failed to deserialize record: {}", e)))
    }

    fn name_key(source: Source, name: &str) -> Vec<u8> {
        format!("{}/{}", source, name).into_bytes()
    }

    fn lock(&self) -> PortdResult<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| PortdError::Internal("RocksDB write lock poisoned".to_string()))
    }

    fn next_id(&self, key: &[u8]) -> PortdResult<u64> {
        let cf = self.cf(CF_META)?;
        let current = self
            .db
            .get_cf(&cf, key)
            .map_err(|e| PortdError::Internal(format!("Failed to read id counter: {}", e)))?;
        Ok(match current {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    PortdError::Internal("Corrupt id counter".to_string())
                })?;
                u64::from_be_bytes(raw)
            }
            None => 1,
        })
    }

    fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> PortdResult<Option<T>> {
        let cf = self.cf(cf_name)?;
        match self
            .db
            .get_cf(&cf, key)
            .map_err(|e| PortdError::Internal(format!("Failed to read {}: {}", cf_name, e)))?
        {
            Some(bytes) => Ok(Some(self.deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, cf_name: &str) -> PortdResult<Vec<T>> {
        let cf = self.cf(cf_name)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| {
                PortdError::Internal(format!("Failed to iterate {}: {}", cf_name, e))
            })?;
            records.push(self.deserialize(&value)?);
        }
        Ok(records)
    }

    fn write(&self, batch: WriteBatch) -> PortdResult<()> {
        self.db
            .write(batch)
            .map_err(|e| PortdError::Internal(format!("Failed to write batch: {}", e)))
    }
}

#[async_trait]
impl PortStore for RocksPortStore {
    async fn insert_port(&self, mut port: Port) -> PortdResult<Port> {
        let _guard = self.lock()?;
        let names = self.cf(CF_PORT_NAMES)?;
        let name_key = Self::name_key(port.source, &port.name);

        let taken = self
            .db
            .get_cf(&names, &name_key)
            .map_err(|e| PortdError::Internal(format!("Failed to read name index: {}", e)))?;
        if taken.is_some() {
            return Err(PortdError::AlreadyExists {
                ecosystem: port.source.to_string(),
                name: port.name,
            });
        }

        port.id = self.next_id(NEXT_PORT_ID)?;
        let key = port.id.to_be_bytes();

        let mut batch = WriteBatch::default();
        batch.put_cf(&self.cf(CF_PORTS)?, key, self.serialize(&port)?);
        batch.put_cf(&names, &name_key, key);
        batch.put_cf(&self.cf(CF_META)?, NEXT_PORT_ID, (port.id + 1).to_be_bytes());
        self.write(batch)?;

        Ok(port)
    }

    async fn get_port(&self, id: PortId) -> PortdResult<Option<Port>> {
        self.get(CF_PORTS, &id.to_be_bytes())
    }

    async fn find_port(&self, source: Source, name: &str) -> PortdResult<Option<Port>> {
        let names = self.cf(CF_PORT_NAMES)?;
        let id = self
            .db
            .get_cf(&names, Self::name_key(source, name))
            .map_err(|e| PortdError::Internal(format!("Failed to read name index: {}", e)))?;
        match id {
            Some(key) => self.get(CF_PORTS, &key),
            None => Ok(None),
        }
    }

    async fn update_port(&self, port: Port) -> PortdResult<()> {
        let _guard = self.lock()?;
        let existing: Port = self
            .get(CF_PORTS, &port.id.to_be_bytes())?
            .ok_or(PortdError::PortNotFound(port.id))?;
        if existing.source != port.source || existing.name != port.name {
            return Err(PortdError::Internal(format!(
                "port {} cannot change its source or name",
                port.id
            )));
        }

        let cf = self.cf(CF_PORTS)?;
        self.db
            .put_cf(&cf, port.id.to_be_bytes(), self.serialize(&port)?)
            .map_err(|e| PortdError::Internal(format!("Failed to update port: {}", e)))
    }

    async fn remove_port(&self, id: PortId) -> PortdResult<()> {
        let _guard = self.lock()?;
        let port: Port = self
            .get(CF_PORTS, &id.to_be_bytes())?
            .ok_or(PortdError::PortNotFound(id))?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf(CF_PORTS)?, id.to_be_bytes());
        batch.delete_cf(
            &self.cf(CF_PORT_NAMES)?,
            Self::name_key(port.source, &port.name),
        );
        self.write(batch)
    }

    async fn list_ports(&self) -> PortdResult<Vec<Port>> {
        self.scan(CF_PORTS)
    }

    async fn insert_patch(&self, mut patch: Patch) -> PortdResult<Patch> {
        let _guard = self.lock()?;
        patch.id = self.next_id(NEXT_PATCH_ID)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &self.cf(CF_PATCHES)?,
            patch.id.to_be_bytes(),
            self.serialize(&patch)?,
        );
        batch.put_cf(&self.cf(CF_META)?, NEXT_PATCH_ID, (patch.id + 1).to_be_bytes());
        self.write(batch)?;

        Ok(patch)
    }

    async fn get_patch(&self, id: PatchId) -> PortdResult<Option<Patch>> {
        self.get(CF_PATCHES, &id.to_be_bytes())
    }

    async fn update_patch(&self, patch: Patch) -> PortdResult<()> {
        let _guard = self.lock()?;
        let cf = self.cf(CF_PATCHES)?;
        let exists = self
            .db
            .get_pinned_cf(&cf, patch.id.to_be_bytes())
            .map_err(|e| PortdError::Internal(format!("Failed to read patch: {}", e)))?
            .is_some();
        if !exists {
            return Err(PortdError::PatchNotFound(patch.id));
        }
        self.db
            .put_cf(&cf, patch.id.to_be_bytes(), self.serialize(&patch)?)
            .map_err(|e| PortdError::Internal(format!("Failed to update patch: {}", e)))
    }

    async fn list_patches(&self) -> PortdResult<Vec<Patch>> {
        self.scan(CF_PATCHES)
    }

    async fn put_artifact(&self, key: &str, content: String) -> PortdResult<()> {
        let cf = self.cf(CF_ARTIFACTS)?;
        self.db
            .put_cf(&cf, key.as_bytes(), content.as_bytes())
            .map_err(|e| PortdError::Internal(format!("Failed to store artifact: {}", e)))
    }

    async fn get_artifact(&self, key: &str) -> PortdResult<Option<String>> {
        let cf = self.cf(CF_ARTIFACTS)?;
        let bytes = self
            .db
            .get_cf(&cf, key.as_bytes())
            .map_err(|e| PortdError::Internal(format!("Failed to read artifact: {}", e)))?;
        bytes
            .map(|bytes| {
                String::from_utf8(bytes)
                    .map_err(|_| PortdError::Internal(format!("Artifact {} is not utf8", key)))
            })
            .transpose()
    }
}
