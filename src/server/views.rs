//! JSON representations served by the API. Identifiers are rendered as URIs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::model::patch::{Action, BuildTarget, Patch, PatchId, PatchStatus};
use crate::model::port::{Port, PortId, Source};

pub fn port_uri(id: PortId) -> String {
    format!("/api/ports/{}", id)
}

pub fn patch_uri(id: PatchId) -> String {
    format!("/api/patches/{}", id)
}

pub fn log_uri(log: &str) -> String {
    format!("/api/logs/{}", log)
}

#[derive(Debug, Serialize)]
pub struct PortView {
    pub uri: String,
    pub name: String,
    pub version: Option<String>,
    pub maintainer: String,
    pub source: Source,
    pub latest_version: Option<String>,
    pub origin: String,
    pub patch: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Port> for PortView {
    fn from(port: Port) -> Self {
        Self {
            uri: port_uri(port.id),
            name: port.name,
            version: port.version,
            maintainer: port.maintainer,
            source: port.source,
            latest_version: port.latest_version,
            origin: port.origin,
            patch: port.patch.map(patch_uri),
            created_at: port.created_at,
            updated_at: port.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PatchView {
    pub uri: String,
    pub port: String,
    pub action: Action,
    pub log: String,
    pub status: PatchStatus,
    pub error: Option<String>,
    pub diff: Option<String>,
    pub poudriere: BTreeMap<String, BuildTarget>,
    pub dependencies: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Patch> for PatchView {
    fn from(patch: Patch) -> Self {
        Self {
            uri: patch_uri(patch.id),
            port: port_uri(patch.port),
            action: patch.action,
            log: patch.log,
            status: patch.status,
            error: patch.error,
            diff: patch
                .diff
                .as_ref()
                .map(|_| format!("{}/diff", patch_uri(patch.id))),
            poudriere: patch
                .poudriere
                .into_iter()
                .map(|(log, target)| (log_uri(&log), target))
                .collect(),
            dependencies: patch.dependencies.into_iter().map(patch_uri).collect(),
            created_at: patch.created_at,
            updated_at: patch.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::patch::PatchChange;

    #[test]
    fn test_patch_view_uses_uris() {
        let mut patch = Patch::new(3, Action::Create, PatchChange::default()).with_dependencies(vec![1, 2]);
        patch.id = 4;
        patch.diff = Some("diff:4".to_string());
        patch.record_build("5d3f", BuildTarget::new("amd64", "14.0"));

        let view = PatchView::from(patch);
        assert_eq!(view.uri, "/api/patches/4");
        assert_eq!(view.port, "/api/ports/3");
        assert_eq!(view.diff.as_deref(), Some("/api/patches/4/diff"));
        assert_eq!(view.dependencies, vec!["/api/patches/1", "/api/patches/2"]);
        assert!(view.poudriere.contains_key("/api/logs/5d3f"));
    }
}
