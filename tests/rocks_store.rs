//! Durability of the RocksDB store across reopen.

#![cfg(feature = "rocksdb-storage")]

use std::sync::Arc;
use tempfile::TempDir;

use portd::error::PortdError;
use portd::model::{Action, BuildTarget, Patch, PatchChange, PatchStatus, Port, Source};
use portd::store::{PortStore, RocksPortStore};

#[tokio::test]
async fn test_records_survive_reopen() {
    let dir = TempDir::new().unwrap();

    let (port_id, patch_id) = {
        let store = RocksPortStore::open(dir.path()).unwrap();
        let port = store
            .insert_port(Port::new(Source::Cran, "dplyr").with_latest_version(Some("1.1.4".to_string())))
            .await
            .unwrap();
        let mut patch = store
            .insert_patch(
                Patch::new(port.id, Action::Create, PatchChange::default())
                    .with_log("math/R-cran-dplyr: New port"),
            )
            .await
            .unwrap();
        patch.advance(PatchStatus::Lint).unwrap();
        patch.record_build("4f1c", BuildTarget::new("amd64", "14.0"));
        store.update_patch(patch.clone()).await.unwrap();
        store
            .put_artifact("log:4f1c", "=>> Cleaning up".to_string())
            .await
            .unwrap();
        (port.id, patch.id)
    };

    let store = RocksPortStore::open(dir.path()).unwrap();
    let port = store.find_port(Source::Cran, "dplyr").await.unwrap().unwrap();
    assert_eq!(port.id, port_id);
    assert_eq!(port.latest_version.as_deref(), Some("1.1.4"));

    let patch = store.get_patch(patch_id).await.unwrap().unwrap();
    assert_eq!(patch.status, PatchStatus::Lint);
    assert_eq!(
        patch.poudriere.get("4f1c"),
        Some(&BuildTarget::new("amd64", "14.0"))
    );
    assert_eq!(
        store.get_artifact("log:4f1c").await.unwrap().as_deref(),
        Some("=>> Cleaning up")
    );

    // counters continue after reopen
    let next = store.insert_port(Port::new(Source::Pip, "six")).await.unwrap();
    assert!(next.id > port_id);
}

#[tokio::test]
async fn test_name_index() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn PortStore> = Arc::new(RocksPortStore::open(dir.path()).unwrap());

    let port = store.insert_port(Port::new(Source::Pip, "six")).await.unwrap();
    assert!(matches!(
        store.insert_port(Port::new(Source::Pip, "six")).await,
        Err(PortdError::AlreadyExists { .. })
    ));
    // same name, other source
    store.insert_port(Port::new(Source::Cran, "six")).await.unwrap();

    store.remove_port(port.id).await.unwrap();
    assert!(store.find_port(Source::Pip, "six").await.unwrap().is_none());
    assert!(store.get_port(port.id).await.unwrap().is_none());
    store.insert_port(Port::new(Source::Pip, "six")).await.unwrap();
    assert_eq!(store.list_ports().await.unwrap().len(), 2);
}
