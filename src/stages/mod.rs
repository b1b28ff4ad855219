//! Collaborators that do the actual work of each automated patch stage.
//!
//! Package metadata, port generation, linting and poudriere builds are
//! opaque to portd; it only needs the narrow interfaces below. Generators
//! are dispatched per [`Source`] through [`Toolchain`].

pub mod command;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::error::{PortdError, PortdResult};
use crate::model::patch::{BuildTarget, Patch};
use crate::model::port::{Port, Source};

pub use command::{CommandBuildFarm, CommandGenerator, CommandLinter, CommandSpec};

/// Produces port diffs from an upstream package ecosystem.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Upstream packages `name` depends on, by upstream name.
    async fn dependencies(&self, name: &str) -> PortdResult<Vec<String>>;

    /// Latest upstream version of `name`, if known.
    async fn latest_version(&self, name: &str) -> PortdResult<Option<String>>;

    /// Generate the diff implementing `patch` against `port`.
    async fn generate(&self, port: &Port, patch: &Patch) -> PortdResult<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LintOutcome {
    Pass,
    /// Static validation failed.
    Fail(String),
    /// A reviewer declined the patch.
    Reject(String),
}

/// Validates a generated diff against ports-tree conventions.
#[async_trait]
pub trait Linter: Send + Sync {
    async fn lint(&self, port: &Port, diff: &str) -> PortdResult<LintOutcome>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub success: bool,
    pub log: String,
}

/// Builds a patched port for one target.
#[async_trait]
pub trait BuildFarm: Send + Sync {
    async fn build(&self, port: &Port, diff: &str, target: &BuildTarget)
        -> PortdResult<BuildReport>;
}

/// Dispatch table of stage collaborators.
#[derive(Clone)]
pub struct Toolchain {
    generators: HashMap<Source, Arc<dyn Generator>>,
    pub linter: Arc<dyn Linter>,
    pub farm: Arc<dyn BuildFarm>,
}

impl Toolchain {
    pub fn new(linter: Arc<dyn Linter>, farm: Arc<dyn BuildFarm>) -> Self {
        Self {
            generators: HashMap::new(),
            linter,
            farm,
        }
    }

    pub fn with_generator(mut self, source: Source, generator: Arc<dyn Generator>) -> Self {
        self.generators.insert(source, generator);
        self
    }

    pub fn generator(&self, source: Source) -> PortdResult<&Arc<dyn Generator>> {
        self.generators.get(&source).ok_or_else(|| {
            PortdError::Config(format!("no generator configured for source '{}'", source))
        })
    }

    pub fn has_generator(&self, source: Source) -> bool {
        self.generators.contains_key(&source)
    }

    /// Toolchain running the external commands named in the configuration.
    /// Each source gets its own generator, which substitutes `{source}`.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let linter = Arc::new(CommandLinter::new(
            config.lint_command.clone().map(CommandSpec::new),
        ));
        let farm = Arc::new(CommandBuildFarm::new(
            config.build_command.clone().map(CommandSpec::new),
        ));

        Source::ALL
            .iter()
            .fold(Toolchain::new(linter, farm), |toolchain, source| {
                let generator = CommandGenerator::new(
                    *source,
                    config.generate_command.clone().map(CommandSpec::new),
                    config.dependencies_command.clone().map(CommandSpec::new),
                    config.version_command.clone().map(CommandSpec::new),
                );
                toolchain.with_generator(*source, Arc::new(generator))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_configured_generators_know_their_source() {
        let config = PipelineConfig {
            stage_timeout_secs: 5,
            targets: Vec::new(),
            generate_command: None,
            dependencies_command: None,
            version_command: Some(vec!["echo".to_string(), "{source}/{name}".to_string()]),
            lint_command: None,
            build_command: None,
        };
        let toolchain = Toolchain::from_config(&config);

        for source in Source::ALL.iter() {
            let version = toolchain
                .generator(*source)
                .unwrap()
                .latest_version("six")
                .await
                .unwrap();
            assert_eq!(version, Some(format!("{}/six", source)));
        }
    }
}
