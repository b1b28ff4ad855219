//! The port registry and patch tracker.
//!
//! Every mutation of a port, or of the patch open against it, runs under
//! that port's lock, so "check for an open patch" and "create a patch" are
//! one atomic step.

pub mod sync;

use async_recursion::async_recursion;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{PortdError, PortdResult};
use crate::model::patch::{Action, BuildTarget, Patch, PatchChange, PatchId, PatchStatus};
use crate::model::port::{
    check_maintainer_transition, is_default_maintainer, Port, PortId, PortUpdate, Source,
};
use crate::stages::{BuildReport, Toolchain};
use crate::store::{open_store, PortStore};

pub use sync::{parse_index, IndexEntry, SyncReport};

/// Artifact key of a patch's generated diff.
pub fn diff_key(patch: PatchId) -> String {
    format!("diff:{}", patch)
}

/// Artifact key of a build log.
pub fn log_key(log: &str) -> String {
    format!("log:{}", log)
}

/// Changes a client may make to a patch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchUpdate {
    pub log: Option<String>,
    pub status: Option<PatchStatus>,
}

// ---------------------------------------------------------------------------
// Per-port locks
// ---------------------------------------------------------------------------

type PortKey = (Source, String);

#[derive(Default)]
struct PortLocks {
    locks: Mutex<HashMap<PortKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl PortLocks {
    fn table(&self) -> MutexGuard<'_, HashMap<PortKey, Arc<tokio::sync::Mutex<()>>>> {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn lock(&self, source: Source, name: &str) -> PortGuard<'_> {
        let key = (source, name.to_string());
        let lock = self.table().entry(key.clone()).or_default().clone();
        let guard = lock.lock_owned().await;
        PortGuard {
            locks: self,
            key,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table().len()
    }
}

/// Holds one port's lock; the table entry goes away with its last user.
struct PortGuard<'a> {
    locks: &'a PortLocks,
    key: PortKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PortGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut table = self.locks.table();
        if table
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            table.remove(&self.key);
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct Registry {
    store: Arc<dyn PortStore>,
    toolchain: Arc<Toolchain>,
    locks: PortLocks,
    queue: Option<mpsc::UnboundedSender<PatchId>>,
}

impl Registry {
    pub fn new(store: Arc<dyn PortStore>, toolchain: Arc<Toolchain>) -> Self {
        Self {
            store,
            toolchain,
            locks: PortLocks::default(),
            queue: None,
        }
    }

    /// Registry over the configured store, running the configured commands.
    pub fn open(config: &AppConfig) -> PortdResult<Self> {
        let store = open_store(&config.storage)?;
        let toolchain = Toolchain::from_config(&config.pipeline);
        Ok(Self::new(store, Arc::new(toolchain)))
    }

    /// Send the id of every patch entering `generate` to `queue`.
    pub fn with_queue(mut self, queue: mpsc::UnboundedSender<PatchId>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn toolchain(&self) -> &Arc<Toolchain> {
        &self.toolchain
    }

    fn enqueue(&self, patch: PatchId) {
        if let Some(queue) = &self.queue {
            if queue.send(patch).is_err() {
                warn!(patch, "pipeline is not running; patch stays in generate");
            }
        }
    }

    // -- reads --------------------------------------------------------------

    pub async fn list_ports(&self) -> PortdResult<Vec<Port>> {
        self.store.list_ports().await
    }

    pub async fn get_port(&self, id: PortId) -> PortdResult<Port> {
        self.store
            .get_port(id)
            .await?
            .ok_or(PortdError::PortNotFound(id))
    }

    pub async fn list_patches(&self) -> PortdResult<Vec<Patch>> {
        self.store.list_patches().await
    }

    pub async fn get_patch(&self, id: PatchId) -> PortdResult<Patch> {
        self.store
            .get_patch(id)
            .await?
            .ok_or(PortdError::PatchNotFound(id))
    }

    pub async fn artifact(&self, key: &str) -> PortdResult<String> {
        self.store
            .get_artifact(key)
            .await?
            .ok_or_else(|| PortdError::ArtifactNotFound(key.to_string()))
    }

    /// Lock the port a patch targets and return fresh copies of both.
    async fn lock_patch(&self, id: PatchId) -> PortdResult<(PortGuard<'_>, Patch, Port)> {
        let patch = self.get_patch(id).await?;
        let port = match self.store.get_port(patch.port).await? {
            Some(port) => port,
            None => {
                return Err(PortdError::Validation(format!(
                    "patch {} is {} and its port no longer exists",
                    id, patch.status
                )))
            }
        };

        let guard = self.locks.lock(port.source, &port.name).await;
        let patch = self.get_patch(id).await?;
        let port = self.get_port(patch.port).await?;
        Ok((guard, patch, port))
    }

    /// Persist a patch and, when it left the workflow, release its port.
    async fn save(&self, patch: &Patch, mut port: Port) -> PortdResult<()> {
        self.store.update_patch(patch.clone()).await?;
        if !patch.is_open() && port.patch == Some(patch.id) {
            port.patch = None;
            port.touch();
            self.store.update_port(port).await?;
        }
        Ok(())
    }

    /// Drop a port left behind by an abandoned create. Returns whether it
    /// was dropped.
    async fn reclaim(&self, port: &Port) -> PortdResult<bool> {
        let _guard = self.locks.lock(port.source, &port.name).await;
        match self.store.get_port(port.id).await? {
            Some(current) if is_abandoned(&current) => {
                self.store.remove_port(current.id).await?;
                info!(origin = %current.origin, "reclaimed abandoned port");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // -- port operations ----------------------------------------------------

    /// Register a new port, creating missing upstream dependencies first.
    pub async fn create_port(&self, source: &str, name: &str) -> PortdResult<(Port, Patch)> {
        let source: Source = source.parse()?;
        let name = validate_name(name)?;
        let mut visiting = HashSet::new();
        self.create_with_dependencies(source, name, &mut visiting)
            .await
    }

    #[async_recursion]
    async fn create_with_dependencies(
        &self,
        source: Source,
        name: &str,
        visiting: &mut HashSet<String>,
    ) -> PortdResult<(Port, Patch)> {
        visiting.insert(name.to_string());

        if let Some(existing) = self.store.find_port(source, name).await? {
            if !is_abandoned(&existing) || !self.reclaim(&existing).await? {
                return Err(PortdError::AlreadyExists {
                    ecosystem: source.to_string(),
                    name: name.to_string(),
                });
            }
        }

        let (upstream_dependencies, latest_version) = match self.toolchain.generator(source) {
            Ok(generator) => {
                let dependencies = generator
                    .dependencies(name)
                    .await
                    .map_err(|err| PortdError::Upstream(err.to_string()))?;
                let latest = generator
                    .latest_version(name)
                    .await
                    .map_err(|err| PortdError::Upstream(err.to_string()))?;
                (dependencies, latest)
            }
            Err(_) => {
                debug!(%source, name, "no generator; skipping dependency lookup");
                (Vec::new(), None)
            }
        };

        let mut dependencies = Vec::new();
        for dependency in upstream_dependencies {
            if visiting.contains(&dependency) {
                continue;
            }
            let existing = self
                .store
                .find_port(source, &dependency)
                .await?
                .filter(|port| !is_abandoned(port));
            let open_patch = match existing {
                Some(port) => port.patch,
                None => {
                    match self
                        .create_with_dependencies(source, &dependency, visiting)
                        .await
                    {
                        Ok((_, patch)) => Some(patch.id),
                        // created concurrently by another request
                        Err(PortdError::AlreadyExists { .. }) => self
                            .store
                            .find_port(source, &dependency)
                            .await?
                            .and_then(|port| port.patch),
                        Err(err) => return Err(err),
                    }
                }
            };
            if let Some(patch) = open_patch {
                if !dependencies.contains(&patch) {
                    dependencies.push(patch);
                }
            }
        }

        let _guard = self.locks.lock(source, name).await;

        let port = Port::new(source, name).with_latest_version(latest_version.clone());
        let mut port = self.store.insert_port(port).await?;

        let patch = Patch::new(
            port.id,
            Action::Create,
            PatchChange {
                version: latest_version,
                maintainer: None,
            },
        )
        .with_log(format!("{}: New port", port.origin))
        .with_dependencies(dependencies);
        let patch = self.store.insert_patch(patch).await?;

        port.patch = Some(patch.id);
        self.store.update_port(port.clone()).await?;

        info!(
            port = port.id,
            patch = patch.id,
            origin = %port.origin,
            dependencies = ?patch.dependencies,
            "created port"
        );
        self.enqueue(patch.id);
        Ok((port, patch))
    }

    /// Request a version and/or maintainer change.
    pub async fn update_port(&self, id: PortId, update: PortUpdate) -> PortdResult<Patch> {
        if update.is_empty() {
            return Err(PortdError::Validation(
                "update must name a version or a maintainer".to_string(),
            ));
        }

        let port = self.get_port(id).await?;
        let _guard = self.locks.lock(port.source, &port.name).await;
        let mut port = self.get_port(id).await?;

        if let Some(patch) = port.patch {
            return Err(PortdError::PatchInProgress { port: id, patch });
        }
        if port.version.is_none() {
            return Err(PortdError::Validation(format!(
                "{} has not been created yet",
                port.origin
            )));
        }

        let mut change = PatchChange::default();
        let mut summary = Vec::new();
        if let Some(target) = &update.version {
            let version = port.resolve_target(target)?;
            summary.push(format!("Update to {}", version));
            change.version = Some(version);
        }
        if let Some(maintainer) = &update.maintainer {
            check_maintainer_transition(&port.maintainer, maintainer)?;
            summary.push(if is_default_maintainer(maintainer) {
                "Reset maintainership".to_string()
            } else {
                format!("Assign maintainership to {}", maintainer)
            });
            change.maintainer = Some(maintainer.clone());
        }

        let patch = Patch::new(port.id, Action::Update, change)
            .with_log(format!("{}: {}", port.origin, summary.join("; ")));
        let patch = self.store.insert_patch(patch).await?;

        port.patch = Some(patch.id);
        port.touch();
        self.store.update_port(port.clone()).await?;

        info!(port = port.id, patch = patch.id, origin = %port.origin, "update requested");
        self.enqueue(patch.id);
        Ok(patch)
    }

    /// Request removal; the port stays registered until the patch commits.
    pub async fn remove_port(&self, id: PortId) -> PortdResult<Patch> {
        let port = self.get_port(id).await?;
        let _guard = self.locks.lock(port.source, &port.name).await;
        let mut port = self.get_port(id).await?;

        if let Some(patch) = port.patch {
            return Err(PortdError::PatchInProgress { port: id, patch });
        }
        if port.version.is_none() {
            return Err(PortdError::Validation(format!(
                "{} has not been created yet",
                port.origin
            )));
        }

        let patch = Patch::new(port.id, Action::Remove, PatchChange::default())
            .with_log(format!("{}: Remove port", port.origin));
        let patch = self.store.insert_patch(patch).await?;

        port.patch = Some(patch.id);
        port.touch();
        self.store.update_port(port.clone()).await?;

        info!(port = port.id, patch = patch.id, origin = %port.origin, "removal requested");
        self.enqueue(patch.id);
        Ok(patch)
    }

    /// Record the version last observed upstream. Does not open a patch.
    pub async fn refresh_latest(&self, id: PortId, version: Option<String>) -> PortdResult<Port> {
        let port = self.get_port(id).await?;
        let _guard = self.locks.lock(port.source, &port.name).await;
        let mut port = self.get_port(id).await?;

        if port.latest_version != version {
            debug!(port = id, from = ?port.latest_version, to = ?version, "latest version changed");
            port.latest_version = version;
            port.touch();
            self.store.update_port(port.clone()).await?;
        }
        Ok(port)
    }

    /// Ask every source's generator for the latest version of its ports.
    pub async fn refresh_upstream(&self) -> PortdResult<usize> {
        let mut refreshed = 0;
        for port in self.list_ports().await? {
            if !self.toolchain.has_generator(port.source) {
                continue;
            }
            let latest = match self
                .toolchain
                .generator(port.source)?
                .latest_version(&port.name)
                .await
            {
                Ok(latest) => latest,
                Err(err) => {
                    warn!(origin = %port.origin, error = %err, "upstream lookup failed");
                    continue;
                }
            };
            if latest.is_some() && latest != port.latest_version {
                self.refresh_latest(port.id, latest).await?;
                refreshed += 1;
            }
        }
        Ok(refreshed)
    }

    // -- patch operations ---------------------------------------------------

    /// Apply a client update: `log` while open, `status` only `wait -> commit`.
    pub async fn update_patch(&self, id: PatchId, update: PatchUpdate) -> PortdResult<Patch> {
        if update.log.is_none() && update.status.is_none() {
            return Err(PortdError::Validation(
                "update must name a log or a status".to_string(),
            ));
        }

        let (_guard, mut patch, port) = self.lock_patch(id).await?;

        if let Some(status) = update.status {
            if !(patch.status == PatchStatus::Wait && status == PatchStatus::Commit) {
                return Err(PortdError::InvalidTransition {
                    from: patch.status,
                    to: status,
                });
            }
            let pending = self.unresolved_dependencies(&patch).await?;
            if !pending.is_empty() {
                return Err(PortdError::DependencyUnresolved {
                    patch: id,
                    pending,
                });
            }
        }

        if let Some(log) = update.log {
            patch.set_log(log)?;
        }

        if update.status.is_some() {
            self.commit(&mut patch, port).await?;
        } else {
            self.store.update_patch(patch.clone()).await?;
        }
        Ok(patch)
    }

    async fn unresolved_dependencies(&self, patch: &Patch) -> PortdResult<Vec<PatchId>> {
        let mut pending = Vec::new();
        for dependency in &patch.dependencies {
            let resolved = matches!(
                self.store.get_patch(*dependency).await?,
                Some(dep) if dep.status == PatchStatus::Commit
            );
            if !resolved {
                pending.push(*dependency);
            }
        }
        Ok(pending)
    }

    /// Apply the patch's action to its port.
    async fn commit(&self, patch: &mut Patch, mut port: Port) -> PortdResult<()> {
        if patch.action == Action::Create && patch.change.version.is_none() {
            return Err(PortdError::Validation(format!(
                "create patch {} has no version to commit",
                patch.id
            )));
        }
        patch.advance(PatchStatus::Commit)?;
        self.store.update_patch(patch.clone()).await?;

        match patch.action {
            Action::Remove => {
                self.store.remove_port(port.id).await?;
            }
            Action::Create | Action::Update => {
                if let Some(version) = &patch.change.version {
                    port.version = Some(version.clone());
                }
                if let Some(maintainer) = &patch.change.maintainer {
                    port.maintainer = maintainer.clone();
                }
                if port.patch == Some(patch.id) {
                    port.patch = None;
                }
                port.touch();
                self.store.update_port(port.clone()).await?;
            }
        }

        info!(
            patch = patch.id,
            action = %patch.action,
            origin = %port.origin,
            "patch committed"
        );
        Ok(())
    }

    /// Re-enter `generate` after an error.
    pub async fn retry_patch(&self, id: PatchId) -> PortdResult<Patch> {
        let (_guard, mut patch, mut port) = self.lock_patch(id).await?;

        patch.retry()?;
        match port.patch {
            Some(open) if open != id => {
                return Err(PortdError::PatchInProgress {
                    port: port.id,
                    patch: open,
                })
            }
            _ => {}
        }

        self.store.update_patch(patch.clone()).await?;
        port.patch = Some(id);
        port.touch();
        self.store.update_port(port).await?;

        info!(patch = id, "patch retried");
        self.enqueue(id);
        Ok(patch)
    }

    // -- pipeline operations ------------------------------------------------

    /// Current port and patch, for stage work outside the lock.
    pub async fn snapshot(&self, id: PatchId) -> PortdResult<(Port, Patch)> {
        let patch = self.get_patch(id).await?;
        let port = self.get_port(patch.port).await?;
        Ok((port, patch))
    }

    fn expect_status(patch: &Patch, expected: PatchStatus, next: PatchStatus) -> PortdResult<()> {
        if patch.status != expected {
            return Err(PortdError::InvalidTransition {
                from: patch.status,
                to: next,
            });
        }
        Ok(())
    }

    /// Store the generated diff and move the patch to `lint`.
    pub async fn store_diff(&self, id: PatchId, diff: String) -> PortdResult<Patch> {
        let (_guard, mut patch, port) = self.lock_patch(id).await?;
        Self::expect_status(&patch, PatchStatus::Generate, PatchStatus::Lint)?;

        let key = diff_key(id);
        self.store.put_artifact(&key, diff).await?;
        patch.diff = Some(key);
        patch.advance(PatchStatus::Lint)?;
        self.save(&patch, port).await?;
        Ok(patch)
    }

    /// Move a patch from `from` to `to`.
    pub async fn advance(&self, id: PatchId, from: PatchStatus, to: PatchStatus) -> PortdResult<Patch> {
        let (_guard, mut patch, port) = self.lock_patch(id).await?;
        Self::expect_status(&patch, from, to)?;

        patch.advance(to)?;
        if to == PatchStatus::Reject && patch.action == Action::Create {
            // the port never reached the tree
            self.store.update_patch(patch.clone()).await?;
            self.store.remove_port(port.id).await?;
            info!(patch = id, origin = %port.origin, "create rejected; port dropped");
        } else {
            self.save(&patch, port).await?;
        }
        debug!(patch = id, %from, %to, "patch advanced");
        Ok(patch)
    }

    /// Fix the version a create patch generates, when none was known at
    /// creation time.
    pub async fn pin_version(&self, id: PatchId, version: String) -> PortdResult<Patch> {
        let (_guard, mut patch, mut port) = self.lock_patch(id).await?;
        Self::expect_status(&patch, PatchStatus::Generate, PatchStatus::Generate)?;
        if patch.action != Action::Create {
            return Err(PortdError::Validation(format!(
                "patch {} is a {} patch; only create patches take a version",
                id, patch.action
            )));
        }

        patch.change.version = Some(version.clone());
        self.store.update_patch(patch.clone()).await?;
        if port.latest_version.is_none() {
            port.latest_version = Some(version);
            port.touch();
            self.store.update_port(port).await?;
        }
        Ok(patch)
    }

    /// Record a failure of the stage the patch is in.
    pub async fn fail(&self, id: PatchId, stage: PatchStatus, message: &str) -> PortdResult<Patch> {
        let (_guard, mut patch, port) = self.lock_patch(id).await?;
        Self::expect_status(&patch, stage, PatchStatus::Error)?;

        patch.fail(message)?;
        self.save(&patch, port).await?;
        warn!(patch = id, %stage, error = message, "patch failed");
        Ok(patch)
    }

    /// Record one completed build and return its log id.
    pub async fn record_build(
        &self,
        id: PatchId,
        target: &BuildTarget,
        report: &BuildReport,
    ) -> PortdResult<String> {
        let (_guard, mut patch, port) = self.lock_patch(id).await?;
        Self::expect_status(&patch, PatchStatus::Build, PatchStatus::Build)?;

        let log_id = Uuid::new_v4().to_string();
        self.store
            .put_artifact(&log_key(&log_id), report.log.clone())
            .await?;
        patch.record_build(log_id.clone(), target.clone());
        self.save(&patch, port).await?;

        debug!(patch = id, %target, success = report.success, log = %log_id, "build finished");
        Ok(log_id)
    }

    /// Restart patches interrupted mid-pipeline and queue them again.
    pub async fn resume_pending(&self) -> PortdResult<Vec<PatchId>> {
        let mut resumed = Vec::new();
        for patch in self.list_patches().await? {
            if !patch.status.is_automated() {
                continue;
            }
            let (_guard, mut patch, port) = self.lock_patch(patch.id).await?;
            if patch.status.is_automated() {
                if patch.status != PatchStatus::Generate {
                    patch.restart()?;
                    self.save(&patch, port).await?;
                }
                resumed.push(patch.id);
            }
        }

        for id in &resumed {
            self.enqueue(*id);
        }
        if !resumed.is_empty() {
            info!(count = resumed.len(), "resumed interrupted patches");
        }
        Ok(resumed)
    }
}

/// A port whose create patch was abandoned: never committed, nothing open.
fn is_abandoned(port: &Port) -> bool {
    port.version.is_none() && port.patch.is_none()
}

fn validate_name(name: &str) -> PortdResult<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(PortdError::Validation("port name must not be empty".to_string()));
    }
    if name.contains(|c: char| c.is_whitespace() || c == '/' || c == '|') {
        return Err(PortdError::Validation(format!(
            "invalid port name '{}'",
            name
        )));
    }
    Ok(name)
}
