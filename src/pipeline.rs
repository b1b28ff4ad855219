//! Drives patches through the automated stages.
//!
//! Patch ids arrive on a queue. Each one is processed by its own task:
//! generate, lint, then one build per configured target. Stage results are
//! written back through the [`Registry`], which re-checks the patch status
//! under the port lock, so a patch that moved on in the meantime is left
//! untouched.

use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::{PortdError, PortdResult};
use crate::model::patch::{Action, BuildTarget, Patch, PatchId, PatchStatus};
use crate::registry::Registry;
use crate::stages::{LintOutcome, Toolchain};

pub struct Pipeline {
    registry: Arc<Registry>,
    toolchain: Arc<Toolchain>,
    targets: Vec<BuildTarget>,
    stage_timeout: Duration,
}

impl Pipeline {
    pub fn new(registry: Arc<Registry>, targets: Vec<BuildTarget>, stage_timeout: Duration) -> Self {
        let toolchain = registry.toolchain().clone();
        Self {
            registry,
            toolchain,
            targets,
            stage_timeout,
        }
    }

    /// Consume the queue until every sender is dropped.
    pub fn spawn(self: Arc<Self>, mut queue: mpsc::UnboundedReceiver<PatchId>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(id) = queue.recv().await {
                let pipeline = self.clone();
                tokio::spawn(async move {
                    match pipeline.run_patch(id).await {
                        Ok(patch) => debug!(patch = id, status = %patch.status, "pipeline finished"),
                        Err(err) => error!(patch = id, error = %err, "pipeline aborted"),
                    }
                });
            }
            info!("pipeline queue closed");
        })
    }

    /// Run every automated stage of one patch. Returns the patch as left by
    /// the last stage.
    pub async fn run_patch(&self, id: PatchId) -> PortdResult<Patch> {
        let (port, patch) = self.registry.snapshot(id).await?;
        if patch.status != PatchStatus::Generate {
            debug!(patch = id, status = %patch.status, "not in generate; skipping");
            return Ok(patch);
        }

        // generate
        let generator = match self.toolchain.generator(port.source) {
            Ok(generator) => generator,
            Err(err) => {
                return self
                    .registry
                    .fail(id, PatchStatus::Generate, &stage_message(err))
                    .await
            }
        };

        let mut patch = patch;
        if patch.action == Action::Create && patch.change.version.is_none() {
            match self.stage(generator.latest_version(&port.name)).await {
                Ok(Some(version)) => patch = self.registry.pin_version(id, version).await?,
                Ok(None) => {
                    let message = format!("no upstream version known for {}", port.origin);
                    return self.registry.fail(id, PatchStatus::Generate, &message).await;
                }
                Err(message) => return self.registry.fail(id, PatchStatus::Generate, &message).await,
            }
        }

        let diff = match self.stage(generator.generate(&port, &patch)).await {
            Ok(diff) => diff,
            Err(message) => return self.registry.fail(id, PatchStatus::Generate, &message).await,
        };
        self.registry.store_diff(id, diff.clone()).await?;

        // lint
        match self.stage(self.toolchain.linter.lint(&port, &diff)).await {
            Ok(LintOutcome::Pass) => {
                self.registry
                    .advance(id, PatchStatus::Lint, PatchStatus::Build)
                    .await?;
            }
            Ok(LintOutcome::Reject(reason)) => {
                info!(patch = id, %reason, "patch rejected");
                return self
                    .registry
                    .advance(id, PatchStatus::Lint, PatchStatus::Reject)
                    .await;
            }
            Ok(LintOutcome::Fail(message)) | Err(message) => {
                return self.registry.fail(id, PatchStatus::Lint, &message).await;
            }
        }

        // build
        let farm = &self.toolchain.farm;
        let mut builds: FuturesUnordered<_> = self
            .targets
            .iter()
            .map(|target| {
                let (port, diff) = (&port, &diff);
                async move { (target, self.stage(farm.build(port, diff, target)).await) }
            })
            .collect();

        while let Some((target, result)) = builds.next().await {
            match result {
                Ok(report) => {
                    self.registry.record_build(id, target, &report).await?;
                    if !report.success {
                        warn!(patch = id, %target, "build failed");
                        return self
                            .registry
                            .fail(id, PatchStatus::Build, &format!("build failed on {}", target))
                            .await;
                    }
                }
                Err(message) => {
                    return self
                        .registry
                        .fail(
                            id,
                            PatchStatus::Build,
                            &format!("build on {} failed: {}", target, message),
                        )
                        .await;
                }
            }
        }

        self.registry
            .advance(id, PatchStatus::Build, PatchStatus::Wait)
            .await
    }

    async fn stage<T, F>(&self, work: F) -> Result<T, String>
    where
        F: Future<Output = PortdResult<T>>,
    {
        match timeout(self.stage_timeout, work).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(stage_message(err)),
            Err(_) => Err(format!(
                "stage timed out after {}s",
                self.stage_timeout.as_secs()
            )),
        }
    }
}

/// Diagnostic stored on a failed patch.
fn stage_message(err: PortdError) -> String {
    match err {
        PortdError::Internal(message) | PortdError::Upstream(message) => message,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::port::{Port, Source};
    use crate::registry::log_key;
    use crate::stages::{BuildFarm, BuildReport, Generator, Linter};
    use crate::store::InMemoryPortStore;
    use async_trait::async_trait;

    struct DiffGenerator {
        fail: bool,
        delay: Duration,
        latest: Option<&'static str>,
    }

    #[async_trait]
    impl Generator for DiffGenerator {
        async fn dependencies(&self, _name: &str) -> PortdResult<Vec<String>> {
            Ok(Vec::new())
        }

        async fn latest_version(&self, _name: &str) -> PortdResult<Option<String>> {
            Ok(self.latest.map(str::to_string))
        }

        async fn generate(&self, port: &Port, patch: &Patch) -> PortdResult<String> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(PortdError::Internal("CRAN: package not found".to_string()));
            }
            let version = patch.change.version.as_deref().unwrap_or("");
            Ok(format!("+++ {}/Makefile {}\n", port.origin, version))
        }
    }

    struct FixedLinter(LintOutcome);

    #[async_trait]
    impl Linter for FixedLinter {
        async fn lint(&self, _port: &Port, _diff: &str) -> PortdResult<LintOutcome> {
            Ok(self.0.clone())
        }
    }

    /// Fails the build for one architecture.
    struct Farm {
        broken_arch: Option<&'static str>,
    }

    #[async_trait]
    impl BuildFarm for Farm {
        async fn build(&self, port: &Port, _diff: &str, target: &BuildTarget) -> PortdResult<BuildReport> {
            let success = self.broken_arch != Some(target.arch.as_str());
            Ok(BuildReport {
                success,
                log: format!("building {} in {}", port.origin, target.jail()),
            })
        }
    }

    fn pipeline(generator: DiffGenerator, lint: LintOutcome, broken_arch: Option<&'static str>) -> Pipeline {
        let toolchain = Toolchain::new(Arc::new(FixedLinter(lint)), Arc::new(Farm { broken_arch }))
            .with_generator(Source::Cran, Arc::new(generator));
        let registry = Registry::new(Arc::new(InMemoryPortStore::new()), Arc::new(toolchain));
        Pipeline::new(
            Arc::new(registry),
            vec![BuildTarget::new("amd64", "14.0"), BuildTarget::new("i386", "13.2")],
            Duration::from_secs(5),
        )
    }

    fn ok_generator() -> DiffGenerator {
        DiffGenerator {
            fail: false,
            delay: Duration::ZERO,
            latest: Some("1.0"),
        }
    }

    #[tokio::test]
    async fn test_patch_reaches_wait() {
        let pipeline = pipeline(ok_generator(), LintOutcome::Pass, None);
        let (port, patch) = pipeline.registry.create_port("cran", "dplyr").await.unwrap();

        let patch = pipeline.run_patch(patch.id).await.unwrap();
        assert_eq!(patch.status, PatchStatus::Wait);
        assert!(patch.error.is_none());
        assert_eq!(patch.poudriere.len(), 2);

        let diff = pipeline.registry.artifact(patch.diff.as_deref().unwrap()).await.unwrap();
        assert_eq!(diff, "+++ math/R-cran-dplyr/Makefile 1.0\n");

        let (log_id, target) = patch.poudriere.iter().next().unwrap();
        let log = pipeline.registry.artifact(&log_key(log_id)).await.unwrap();
        assert!(log.contains(&target.jail()));

        // the port stays locked until the patch is committed
        let port = pipeline.registry.get_port(port.id).await.unwrap();
        assert_eq!(port.patch, Some(patch.id));
    }

    #[tokio::test]
    async fn test_generate_failure() {
        let generator = DiffGenerator {
            fail: true,
            ..ok_generator()
        };
        let pipeline = pipeline(generator, LintOutcome::Pass, None);
        let (port, patch) = pipeline.registry.create_port("cran", "dplyr").await.unwrap();

        let patch = pipeline.run_patch(patch.id).await.unwrap();
        assert_eq!(patch.status, PatchStatus::Error);
        assert_eq!(patch.error.as_deref(), Some("CRAN: package not found"));
        assert!(pipeline.registry.get_port(port.id).await.unwrap().patch.is_none());
    }

    /// Generator whose upstream version becomes known after the port was
    /// created.
    struct LateGenerator {
        latest: std::sync::Mutex<Option<&'static str>>,
    }

    #[async_trait]
    impl Generator for LateGenerator {
        async fn dependencies(&self, _name: &str) -> PortdResult<Vec<String>> {
            Ok(Vec::new())
        }

        async fn latest_version(&self, _name: &str) -> PortdResult<Option<String>> {
            Ok(self.latest.lock().unwrap().map(str::to_string))
        }

        async fn generate(&self, _port: &Port, patch: &Patch) -> PortdResult<String> {
            Ok(format!("version {:?}\n", patch.change.version))
        }
    }

    #[tokio::test]
    async fn test_create_without_upstream_version_fails_generate() {
        let generator = DiffGenerator {
            latest: None,
            ..ok_generator()
        };
        let pipeline = pipeline(generator, LintOutcome::Pass, None);
        let (port, patch) = pipeline.registry.create_port("cran", "dplyr").await.unwrap();
        assert!(patch.change.version.is_none());

        let patch = pipeline.run_patch(patch.id).await.unwrap();
        assert_eq!(patch.status, PatchStatus::Error);
        assert_eq!(
            patch.error.as_deref(),
            Some("no upstream version known for math/R-cran-dplyr")
        );
        assert!(patch.diff.is_none());
        assert!(pipeline.registry.get_port(port.id).await.unwrap().version.is_none());
    }

    #[tokio::test]
    async fn test_create_version_resolved_at_generate() {
        let generator = Arc::new(LateGenerator {
            latest: std::sync::Mutex::new(None),
        });
        let toolchain = Toolchain::new(Arc::new(FixedLinter(LintOutcome::Pass)), Arc::new(Farm { broken_arch: None }))
            .with_generator(Source::Cran, generator.clone());
        let registry = Arc::new(Registry::new(Arc::new(InMemoryPortStore::new()), Arc::new(toolchain)));
        let pipeline = Pipeline::new(registry.clone(), Vec::new(), Duration::from_secs(5));

        let (port, patch) = registry.create_port("cran", "dplyr").await.unwrap();
        assert!(patch.change.version.is_none());
        *generator.latest.lock().unwrap() = Some("1.1.4");

        let patch = pipeline.run_patch(patch.id).await.unwrap();
        assert_eq!(patch.status, PatchStatus::Wait);
        assert_eq!(patch.change.version.as_deref(), Some("1.1.4"));
        let diff = registry.artifact(patch.diff.as_deref().unwrap()).await.unwrap();
        assert_eq!(diff, "version Some(\"1.1.4\")\n");

        registry
            .update_patch(
                patch.id,
                crate::registry::PatchUpdate {
                    log: None,
                    status: Some(PatchStatus::Commit),
                },
            )
            .await
            .unwrap();
        let port = registry.get_port(port.id).await.unwrap();
        assert_eq!(port.version.as_deref(), Some("1.1.4"));
        assert_eq!(port.latest_version.as_deref(), Some("1.1.4"));
        assert!(port.patch.is_none());
    }

    #[tokio::test]
    async fn test_lint_outcomes() {
        let pipeline = pipeline(ok_generator(), LintOutcome::Fail("portlint: 1 FATAL".to_string()), None);
        let (_, patch) = pipeline.registry.create_port("cran", "dplyr").await.unwrap();
        let patch = pipeline.run_patch(patch.id).await.unwrap();
        assert_eq!(patch.status, PatchStatus::Error);
        assert_eq!(patch.error.as_deref(), Some("portlint: 1 FATAL"));

        let pipeline = pipeline_with_reject();
        let (_, patch) = pipeline.registry.create_port("cran", "dplyr").await.unwrap();
        let patch = pipeline.run_patch(patch.id).await.unwrap();
        assert_eq!(patch.status, PatchStatus::Reject);
        assert!(patch.poudriere.is_empty());
    }

    fn pipeline_with_reject() -> Pipeline {
        pipeline(ok_generator(), LintOutcome::Reject("declined".to_string()), None)
    }

    #[tokio::test]
    async fn test_build_failure_on_one_target() {
        let pipeline = pipeline(ok_generator(), LintOutcome::Pass, Some("i386"));
        let (_, patch) = pipeline.registry.create_port("cran", "dplyr").await.unwrap();

        let patch = pipeline.run_patch(patch.id).await.unwrap();
        assert_eq!(patch.status, PatchStatus::Error);
        assert_eq!(patch.error.as_deref(), Some("build failed on i386/13.2"));
        assert!(patch
            .poudriere
            .values()
            .any(|target| target.arch == "i386"));
    }

    #[tokio::test]
    async fn test_stage_timeout() {
        let generator = DiffGenerator {
            delay: Duration::from_secs(60),
            ..ok_generator()
        };
        let mut pipeline = pipeline(generator, LintOutcome::Pass, None);
        pipeline.stage_timeout = Duration::from_millis(20);
        let (_, patch) = pipeline.registry.create_port("cran", "dplyr").await.unwrap();

        let patch = pipeline.run_patch(patch.id).await.unwrap();
        assert_eq!(patch.status, PatchStatus::Error);
        assert!(patch.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_missing_generator_fails_patch() {
        let pipeline = pipeline(ok_generator(), LintOutcome::Pass, None);
        let (_, patch) = pipeline.registry.create_port("pip", "six").await.unwrap();

        let patch = pipeline.run_patch(patch.id).await.unwrap();
        assert_eq!(patch.status, PatchStatus::Error);
        assert!(patch.error.as_deref().unwrap().contains("pip"));
    }

    #[tokio::test]
    async fn test_spawned_pipeline_drains_queue() {
        let (tx, rx) = mpsc::unbounded_channel();
        let toolchain = Toolchain::new(Arc::new(FixedLinter(LintOutcome::Pass)), Arc::new(Farm { broken_arch: None }))
            .with_generator(Source::Cran, Arc::new(ok_generator()));
        let registry = Arc::new(
            Registry::new(Arc::new(InMemoryPortStore::new()), Arc::new(toolchain)).with_queue(tx),
        );
        let pipeline = Arc::new(Pipeline::new(
            registry.clone(),
            vec![BuildTarget::new("amd64", "14.0")],
            Duration::from_secs(5),
        ));
        let _worker = pipeline.spawn(rx);

        let (_, patch) = registry.create_port("cran", "dplyr").await.unwrap();
        let mut status = PatchStatus::Generate;
        for _ in 0..100 {
            status = registry.get_patch(patch.id).await.unwrap().status;
            if status == PatchStatus::Wait {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, PatchStatus::Wait);
    }
}
