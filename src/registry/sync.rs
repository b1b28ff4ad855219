//! Reconciling the registry with a ports-tree INDEX.

use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

use super::Registry;
use crate::error::{PortdError, PortdResult};
use crate::model::port::{Port, Source};

/// A port as listed in the ports tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub source: Source,
    pub name: String,
    pub version: String,
    pub maintainer: String,
    pub origin: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

/// Upstream versions keyed by source, then package name.
pub type LatestVersions = BTreeMap<String, BTreeMap<String, String>>;

const INDEX_MIN_FIELDS: usize = 6;

/// Parse a FreeBSD `INDEX` file, keeping ports of a known source.
///
/// Fields are `pkgname|path|prefix|comment|descr|maintainer|...`; the
/// version is reported without PORTREVISION or PORTEPOCH.
pub fn parse_index(text: &str) -> PortdResult<Vec<IndexEntry>> {
    let mut entries = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() < INDEX_MIN_FIELDS {
            return Err(PortdError::Validation(format!(
                "INDEX line {}: expected at least {} fields, found {}",
                lineno + 1,
                INDEX_MIN_FIELDS,
                fields.len()
            )));
        }

        let Some((pkgname, version)) = fields[0].rsplit_once('-') else {
            return Err(PortdError::Validation(format!(
                "INDEX line {}: malformed package name '{}'",
                lineno + 1,
                fields[0]
            )));
        };
        let Some((source, name)) = Source::from_pkgname(pkgname) else {
            continue;
        };

        let origin: Vec<&str> = fields[1].trim_end_matches('/').rsplitn(3, '/').collect();
        if origin.len() < 2 {
            return Err(PortdError::Validation(format!(
                "INDEX line {}: malformed port path '{}'",
                lineno + 1,
                fields[1]
            )));
        }

        entries.push(IndexEntry {
            source,
            name: name.to_string(),
            version: upstream_version(version).to_string(),
            maintainer: fields[5].to_string(),
            origin: format!("{}/{}", origin[1], origin[0]),
        });
    }
    Ok(entries)
}

fn upstream_version(version: &str) -> &str {
    let version = version.split(',').next().unwrap_or(version);
    version.split('_').next().unwrap_or(version)
}

impl Registry {
    /// Make the registry mirror `entries`.
    ///
    /// Ports with an open patch are left alone; their patch decides what
    /// they become. Ports that were never committed are not removed.
    pub async fn sync_index(&self, entries: &[IndexEntry]) -> PortdResult<SyncReport> {
        let mut report = SyncReport::default();
        let mut listed = HashSet::new();

        for entry in entries {
            listed.insert((entry.source, entry.name.clone()));
            let _guard = self.locks.lock(entry.source, &entry.name).await;

            match self.store.find_port(entry.source, &entry.name).await? {
                None => {
                    let port = Port::new(entry.source, entry.name.clone())
                        .with_version(entry.version.clone())
                        .with_maintainer(entry.maintainer.clone())
                        .with_origin(entry.origin.clone());
                    self.store.insert_port(port).await?;
                    report.added += 1;
                }
                Some(port) if port.patch.is_some() => {
                    debug!(origin = %port.origin, "open patch; not syncing");
                }
                Some(mut port) => {
                    let changed = port.version.as_deref() != Some(entry.version.as_str())
                        || port.maintainer != entry.maintainer
                        || port.origin != entry.origin;
                    if changed {
                        port.version = Some(entry.version.clone());
                        port.maintainer = entry.maintainer.clone();
                        port.origin = entry.origin.clone();
                        port.touch();
                        self.store.update_port(port).await?;
                        report.updated += 1;
                    }
                }
            }
        }

        for port in self.store.list_ports().await? {
            if listed.contains(&(port.source, port.name.clone()))
                || port.patch.is_some()
                || port.version.is_none()
            {
                continue;
            }
            let _guard = self.locks.lock(port.source, &port.name).await;
            if let Some(current) = self.store.get_port(port.id).await? {
                if current.patch.is_none() {
                    self.store.remove_port(port.id).await?;
                    report.removed += 1;
                }
            }
        }

        info!(
            added = report.added,
            updated = report.updated,
            removed = report.removed,
            "synced ports tree"
        );
        Ok(report)
    }

    /// Record upstream versions from a `{"cran": {"dplyr": "1.1.4"}}` map.
    pub async fn apply_latest(&self, latest: &LatestVersions) -> PortdResult<usize> {
        let mut refreshed = 0;
        for (source, versions) in latest {
            let source: Source = match source.parse() {
                Ok(source) => source,
                Err(_) => {
                    warn!(%source, "skipping versions of unsupported source");
                    continue;
                }
            };
            for (name, version) in versions {
                let Some(port) = self.store.find_port(source, name).await? else {
                    continue;
                };
                if port.latest_version.as_deref() != Some(version.as_str()) {
                    self.refresh_latest(port.id, Some(version.clone())).await?;
                    refreshed += 1;
                }
            }
        }
        Ok(refreshed)
    }
}
