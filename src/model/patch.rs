use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{PortdError, PortdResult};
use crate::model::port::PortId;

/// Store-assigned patch identifier.
pub type PatchId = u64;

// ---------------------------------------------------------------------------
// Action and status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Remove,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Remove => "remove",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Lifecycle of a patch.
///
/// ```text
/// generate -> lint -> build -> wait -> commit
///                \-> reject
/// any non-terminal -> error
/// error -> generate (retry)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchStatus {
    Generate,
    Lint,
    Build,
    Wait,
    Commit,
    Reject,
    Error,
}

impl PatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchStatus::Generate => "generate",
            PatchStatus::Lint => "lint",
            PatchStatus::Build => "build",
            PatchStatus::Wait => "wait",
            PatchStatus::Commit => "commit",
            PatchStatus::Reject => "reject",
            PatchStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PatchStatus::Commit | PatchStatus::Reject | PatchStatus::Error
        )
    }

    /// States driven by the pipeline rather than by a person.
    pub fn is_automated(&self) -> bool {
        matches!(
            self,
            PatchStatus::Generate | PatchStatus::Lint | PatchStatus::Build
        )
    }

    /// Forward transitions of the workflow. Failures go through
    /// [`Patch::fail`] and retries through [`Patch::retry`].
    pub fn can_advance_to(&self, next: PatchStatus) -> bool {
        matches!(
            (self, next),
            (PatchStatus::Generate, PatchStatus::Lint)
                | (PatchStatus::Lint, PatchStatus::Build)
                | (PatchStatus::Lint, PatchStatus::Reject)
                | (PatchStatus::Build, PatchStatus::Wait)
                | (PatchStatus::Wait, PatchStatus::Commit)
        )
    }
}

impl fmt::Display for PatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for PatchStatus {
    type Err = PortdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generate" => Ok(PatchStatus::Generate),
            "lint" => Ok(PatchStatus::Lint),
            "build" => Ok(PatchStatus::Build),
            "wait" => Ok(PatchStatus::Wait),
            "commit" => Ok(PatchStatus::Commit),
            "reject" => Ok(PatchStatus::Reject),
            "error" => Ok(PatchStatus::Error),
            other => Err(PortdError::Validation(format!(
                "unknown patch status '{}'",
                other
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Build targets and results
// ---------------------------------------------------------------------------

/// An architecture / FreeBSD version pair a patch is built for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildTarget {
    pub arch: String,
    pub version: String,
}

impl BuildTarget {
    pub fn new(arch: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            arch: arch.into(),
            version: version.into(),
        }
    }

    /// Poudriere jail name for this target, e.g. `132amd64`.
    pub fn jail(&self) -> String {
        format!("{}{}", self.version.replace('.', ""), self.arch)
    }
}

impl fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.arch, self.version)
    }
}

/// The port mutation a patch applies when it commits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchChange {
    pub version: Option<String>,
    pub maintainer: Option<String>,
}

// ---------------------------------------------------------------------------
// Patch
// ---------------------------------------------------------------------------

/// A tracked change against a port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub id: PatchId,
    pub port: PortId,
    pub action: Action,
    /// Commit message.
    pub log: String,
    pub status: PatchStatus,
    /// Diagnostic, present iff `status` is `Error`.
    pub error: Option<String>,
    /// Artifact key of the generated diff.
    pub diff: Option<String>,
    /// Build-log id to the target it was built for.
    pub poudriere: BTreeMap<String, BuildTarget>,
    /// Patches that must commit before this one may.
    pub dependencies: Vec<PatchId>,
    pub change: PatchChange,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Patch {
    /// A patch entering `generate`. The id is assigned by the store.
    pub fn new(port: PortId, action: Action, change: PatchChange) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            port,
            action,
            log: String::new(),
            status: PatchStatus::Generate,
            error: None,
            diff: None,
            poudriere: BTreeMap::new(),
            dependencies: Vec::new(),
            change,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = log.into();
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<PatchId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Move along the workflow.
    pub fn advance(&mut self, next: PatchStatus) -> PortdResult<()> {
        if !self.status.can_advance_to(next) {
            return Err(PortdError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.error = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a stage failure.
    pub fn fail(&mut self, message: impl Into<String>) -> PortdResult<()> {
        if self.status.is_terminal() {
            return Err(PortdError::InvalidTransition {
                from: self.status,
                to: PatchStatus::Error,
            });
        }
        let message = message.into();
        self.status = PatchStatus::Error;
        self.error = Some(if message.trim().is_empty() {
            "unknown error".to_string()
        } else {
            message
        });
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Re-enter `generate` after an error, discarding generated artifacts.
    pub fn retry(&mut self) -> PortdResult<()> {
        if self.status != PatchStatus::Error {
            return Err(PortdError::InvalidTransition {
                from: self.status,
                to: PatchStatus::Generate,
            });
        }
        self.status = PatchStatus::Generate;
        self.error = None;
        self.diff = None;
        self.poudriere.clear();
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Send a patch interrupted mid-pipeline back to `generate`.
    pub fn restart(&mut self) -> PortdResult<()> {
        if !self.status.is_automated() {
            return Err(PortdError::InvalidTransition {
                from: self.status,
                to: PatchStatus::Generate,
            });
        }
        self.status = PatchStatus::Generate;
        self.diff = None;
        self.poudriere.clear();
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn set_log(&mut self, log: impl Into<String>) -> PortdResult<()> {
        if !self.is_open() {
            return Err(PortdError::Validation(format!(
                "patch {} is {} and can no longer be edited",
                self.id, self.status
            )));
        }
        self.log = log.into();
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn record_build(&mut self, log_id: impl Into<String>, target: BuildTarget) {
        self.poudriere.insert(log_id.into(), target);
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch() -> Patch {
        Patch::new(1, Action::Create, PatchChange::default())
    }

    #[test]
    fn test_success_path() {
        let mut p = patch();
        assert_eq!(p.status, PatchStatus::Generate);
        for next in [
            PatchStatus::Lint,
            PatchStatus::Build,
            PatchStatus::Wait,
            PatchStatus::Commit,
        ] {
            p.advance(next).unwrap();
        }
        assert!(!p.is_open());
        assert!(p.error.is_none());
    }

    #[test]
    fn test_skipping_stages_is_rejected() {
        let mut p = patch();
        assert!(matches!(
            p.advance(PatchStatus::Wait),
            Err(PortdError::InvalidTransition {
                from: PatchStatus::Generate,
                to: PatchStatus::Wait
            })
        ));
        p.advance(PatchStatus::Lint).unwrap();
        p.advance(PatchStatus::Build).unwrap();
        assert!(p.advance(PatchStatus::Reject).is_err());
    }

    #[test]
    fn test_error_field_tracks_status() {
        let mut p = patch();
        p.advance(PatchStatus::Lint).unwrap();
        p.fail("portlint: FATAL: Makefile").unwrap();
        assert_eq!(p.status, PatchStatus::Error);
        assert_eq!(p.error.as_deref(), Some("portlint: FATAL: Makefile"));

        // terminal patches cannot fail again
        assert!(p.fail("again").is_err());

        p.retry().unwrap();
        assert_eq!(p.status, PatchStatus::Generate);
        assert!(p.error.is_none());
    }

    #[test]
    fn test_empty_failure_message_still_sets_error() {
        let mut p = patch();
        p.fail("  ").unwrap();
        assert!(p.error.as_deref().is_some_and(|e| !e.is_empty()));
    }

    #[test]
    fn test_retry_clears_artifacts() {
        let mut p = patch();
        p.diff = Some("diff:1".to_string());
        p.record_build("log-1", BuildTarget::new("amd64", "13.2"));
        p.fail("build failed").unwrap();
        p.retry().unwrap();
        assert!(p.diff.is_none());
        assert!(p.poudriere.is_empty());
        assert!(p.retry().is_err());
    }

    #[test]
    fn test_log_only_editable_while_open() {
        let mut p = patch();
        p.set_log("math/R-cran-dplyr: new port").unwrap();
        p.fail("boom").unwrap();
        assert!(p.set_log("too late").is_err());
        assert_eq!(p.log, "math/R-cran-dplyr: new port");
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("wait".parse::<PatchStatus>().unwrap(), PatchStatus::Wait);
        assert!("merged".parse::<PatchStatus>().is_err());
        assert_eq!(BuildTarget::new("amd64", "13.2").jail(), "132amd64");
    }
}
