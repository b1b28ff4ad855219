use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::error::{PortdError, PortdResult};
use crate::model::patch::{Patch, PatchId};
use crate::model::port::{Port, PortId, Source};
use crate::store::PortStore;

// ---------------------------------------------------------------------------
// InMemoryPortStore: for testing and the default daemon configuration
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Tables {
    ports: BTreeMap<PortId, Port>,
    by_name: HashMap<(Source, String), PortId>,
    patches: BTreeMap<PatchId, Patch>,
    next_port_id: PortId,
    next_patch_id: PatchId,
}

/// In-memory store. A single lock covers every table so the name index
/// never disagrees with the port table.
pub struct InMemoryPortStore {
    tables: RwLock<Tables>,
    artifacts: RwLock<HashMap<String, String>>,
}

impl InMemoryPortStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables {
                next_port_id: 1,
                next_patch_id: 1,
                ..Default::default()
            }),
            artifacts: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryPortStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PortStore for InMemoryPortStore {
    async fn insert_port(&self, mut port: Port) -> PortdResult<Port> {
        let mut tables = self.tables.write().await;

        let key = (port.source, port.name.clone());
        if tables.by_name.contains_key(&key) {
            return Err(PortdError::AlreadyExists {
                ecosystem: port.source.to_string(),
                name: port.name,
            });
        }

        port.id = tables.next_port_id;
        tables.next_port_id += 1;
        tables.by_name.insert(key, port.id);
        tables.ports.insert(port.id, port.clone());
        Ok(port)
    }

    async fn get_port(&self, id: PortId) -> PortdResult<Option<Port>> {
        let tables = self.tables.read().await;
        Ok(tables.ports.get(&id).cloned())
    }

    async fn find_port(&self, source: Source, name: &str) -> PortdResult<Option<Port>> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_name
            .get(&(source, name.to_string()))
            .and_then(|id| tables.ports.get(id))
            .cloned())
    }

    async fn update_port(&self, port: Port) -> PortdResult<()> {
        let mut tables = self.tables.write().await;
        match tables.ports.get_mut(&port.id) {
            Some(existing) => {
                if existing.source != port.source || existing.name != port.name {
                    return Err(PortdError::Internal(format!(
                        "port {} cannot change its source or name",
                        port.id
                    )));
                }
                *existing = port;
                Ok(())
            }
            None => Err(PortdError::PortNotFound(port.id)),
        }
    }

    async fn remove_port(&self, id: PortId) -> PortdResult<()> {
        let mut tables = self.tables.write().await;
        let port = tables
            .ports
            .remove(&id)
            .ok_or(PortdError::PortNotFound(id))?;
        tables.by_name.remove(&(port.source, port.name));
        Ok(())
    }

    async fn list_ports(&self) -> PortdResult<Vec<Port>> {
        let tables = self.tables.read().await;
        Ok(tables.ports.values().cloned().collect())
    }

    async fn insert_patch(&self, mut patch: Patch) -> PortdResult<Patch> {
        let mut tables = self.tables.write().await;
        patch.id = tables.next_patch_id;
        tables.next_patch_id += 1;
        tables.patches.insert(patch.id, patch.clone());
        Ok(patch)
    }

    async fn get_patch(&self, id: PatchId) -> PortdResult<Option<Patch>> {
        let tables = self.tables.read().await;
        Ok(tables.patches.get(&id).cloned())
    }

    async fn update_patch(&self, patch: Patch) -> PortdResult<()> {
        let mut tables = self.tables.write().await;
        match tables.patches.get_mut(&patch.id) {
            Some(existing) => {
                *existing = patch;
                Ok(())
            }
            None => Err(PortdError::PatchNotFound(patch.id)),
        }
    }

    async fn list_patches(&self) -> PortdResult<Vec<Patch>> {
        let tables = self.tables.read().await;
        Ok(tables.patches.values().cloned().collect())
    }

    async fn put_artifact(&self, key: &str, content: String) -> PortdResult<()> {
        let mut artifacts = self.artifacts.write().await;
        artifacts.insert(key.to_string(), content);
        Ok(())
    }

    async fn get_artifact(&self, key: &str) -> PortdResult<Option<String>> {
        let artifacts = self.artifacts.read().await;
        Ok(artifacts.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::patch::{Action, PatchChange};

    #[tokio::test]
    async fn test_port_ids_and_name_index() {
        let store = InMemoryPortStore::new();
        let dplyr = store.insert_port(Port::new(Source::Cran, "dplyr")).await.unwrap();
        let six = store.insert_port(Port::new(Source::Pip, "six")).await.unwrap();
        assert_eq!(dplyr.id, 1);
        assert_eq!(six.id, 2);

        let found = store.find_port(Source::Cran, "dplyr").await.unwrap().unwrap();
        assert_eq!(found.id, dplyr.id);
        assert!(store.find_port(Source::Pip, "dplyr").await.unwrap().is_none());

        // same name under another source is a different port
        let other = store.insert_port(Port::new(Source::Pip, "dplyr")).await.unwrap();
        assert_eq!(other.id, 3);
    }

    #[tokio::test]
    async fn test_duplicate_port_rejected() {
        let store = InMemoryPortStore::new();
        store.insert_port(Port::new(Source::Cran, "dplyr")).await.unwrap();
        let result = store.insert_port(Port::new(Source::Cran, "dplyr")).await;
        assert!(matches!(result, Err(PortdError::AlreadyExists { .. })));
        assert_eq!(store.list_ports().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_port_frees_name() {
        let store = InMemoryPortStore::new();
        let port = store.insert_port(Port::new(Source::Cran, "dplyr")).await.unwrap();
        store.remove_port(port.id).await.unwrap();
        assert!(store.get_port(port.id).await.unwrap().is_none());
        assert!(store.find_port(Source::Cran, "dplyr").await.unwrap().is_none());
        assert!(matches!(
            store.remove_port(port.id).await,
            Err(PortdError::PortNotFound(_))
        ));
        store.insert_port(Port::new(Source::Cran, "dplyr")).await.unwrap();
    }

    #[tokio::test]
    async fn test_patches_and_artifacts() {
        let store = InMemoryPortStore::new();
        let mut patch = store
            .insert_patch(Patch::new(1, Action::Create, PatchChange::default()))
            .await
            .unwrap();
        assert_eq!(patch.id, 1);

        patch.log = "new port".to_string();
        store.update_patch(patch.clone()).await.unwrap();
        assert_eq!(store.get_patch(1).await.unwrap().unwrap().log, "new port");

        let mut missing = patch.clone();
        missing.id = 99;
        assert!(matches!(
            store.update_patch(missing).await,
            Err(PortdError::PatchNotFound(99))
        ));

        store.put_artifact("diff:1", "--- a\n+++ b\n".to_string()).await.unwrap();
        assert_eq!(
            store.get_artifact("diff:1").await.unwrap().as_deref(),
            Some("--- a\n+++ b\n")
        );
        assert!(store.get_artifact("diff:2").await.unwrap().is_none());
    }
}
