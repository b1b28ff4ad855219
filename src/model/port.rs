use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{PortdError, PortdResult};
use crate::model::patch::PatchId;

/// Store-assigned port identifier.
pub type PortId = u64;

/// Maintainer of every port nobody has adopted.
pub const DEFAULT_MAINTAINER: &str = "ports@FreeBSD.org";

// ---------------------------------------------------------------------------
// Source: the upstream ecosystem a port is generated from
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Cran,
    Pip,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::Cran, Source::Pip];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Cran => "cran",
            Source::Pip => "pip",
        }
    }

    /// PKGNAMEPREFIX the ports tree uses for packages of this source.
    pub fn pkgname_prefix(&self) -> &'static str {
        match self {
            Source::Cran => "R-cran-",
            Source::Pip => "py-",
        }
    }

    /// Category new ports of this source are created in.
    pub fn default_category(&self) -> &'static str {
        match self {
            Source::Cran => "math",
            Source::Pip => "devel",
        }
    }

    /// Ports-tree origin for a freshly generated port.
    pub fn default_origin(&self, name: &str) -> String {
        format!(
            "{}/{}{}",
            self.default_category(),
            self.pkgname_prefix(),
            name
        )
    }

    /// Split a ports-tree package name into its source and upstream name.
    /// Python packages carry their flavour in the prefix: `py311-six`.
    pub fn from_pkgname(pkgname: &str) -> Option<(Source, &str)> {
        let (source, name) = match pkgname.strip_prefix(Source::Cran.pkgname_prefix()) {
            Some(name) => (Source::Cran, name),
            None => {
                let name = pkgname
                    .strip_prefix("py")?
                    .trim_start_matches(|c: char| c.is_ascii_digit())
                    .strip_prefix('-')?;
                (Source::Pip, name)
            }
        };
        (!name.is_empty()).then_some((source, name))
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Source {
    type Err = PortdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cran" => Ok(Source::Cran),
            "pip" => Ok(Source::Pip),
            other => Err(PortdError::UnsupportedSource(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Port: a package definition in the ports tree
// ---------------------------------------------------------------------------

/// A FreeBSD port generated from an upstream package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub id: PortId,
    /// Upstream package name, unique within `source`.
    pub name: String,
    /// Version in the ports tree; `None` until the create patch commits.
    pub version: Option<String>,
    pub maintainer: String,
    pub source: Source,
    /// Version last observed upstream.
    pub latest_version: Option<String>,
    /// Ports-tree directory (`category/portname`).
    pub origin: String,
    /// The open patch against this port, if any.
    pub patch: Option<PatchId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Port {
    /// A port that does not exist in the ports tree yet. The id is assigned
    /// by the store on insert.
    pub fn new(source: Source, name: impl Into<String>) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            id: 0,
            origin: source.default_origin(&name),
            name,
            version: None,
            maintainer: DEFAULT_MAINTAINER.to_string(),
            source,
            latest_version: None,
            patch: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_maintainer(mut self, maintainer: impl Into<String>) -> Self {
        self.maintainer = maintainer.into();
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn with_latest_version(mut self, version: Option<String>) -> Self {
        self.latest_version = version;
        self
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Resolve a requested version target against this port.
    pub fn resolve_target(&self, target: &VersionTarget) -> PortdResult<String> {
        let version = match target {
            VersionTarget::Latest => self.latest_version.clone().ok_or_else(|| {
                PortdError::Validation(format!(
                    "no upstream version known for {}/{}",
                    self.source, self.name
                ))
            })?,
            VersionTarget::Exact(version) => version.clone(),
        };
        if self.version.as_deref() == Some(version.as_str()) {
            return Err(PortdError::Validation(format!(
                "{}/{} is already at version {}",
                self.source, self.name, version
            )));
        }
        Ok(version)
    }
}

// ---------------------------------------------------------------------------
// Update requests
// ---------------------------------------------------------------------------

/// Version an update should move a port to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionTarget {
    Latest,
    Exact(String),
}

impl FromStr for VersionTarget {
    type Err = PortdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err(PortdError::Validation("empty version".to_string())),
            "latest" => Ok(VersionTarget::Latest),
            version => Ok(VersionTarget::Exact(version.to_string())),
        }
    }
}

/// The subset of port fields a client may change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortUpdate {
    pub version: Option<VersionTarget>,
    pub maintainer: Option<String>,
}

impl PortUpdate {
    pub fn is_empty(&self) -> bool {
        self.version.is_none() && self.maintainer.is_none()
    }
}

pub fn is_default_maintainer(maintainer: &str) -> bool {
    maintainer.eq_ignore_ascii_case(DEFAULT_MAINTAINER)
}

/// Maintainership may only be adopted from, or handed back to, the default.
pub fn check_maintainer_transition(current: &str, requested: &str) -> PortdResult<()> {
    if !requested.contains('@') {
        return Err(PortdError::Validation(format!(
            "maintainer '{}' is not an email address",
            requested
        )));
    }
    if current.eq_ignore_ascii_case(requested) {
        return Err(PortdError::Validation(format!(
            "maintainer is already {}",
            current
        )));
    }
    if is_default_maintainer(current) || is_default_maintainer(requested) {
        Ok(())
    } else {
        Err(PortdError::InvalidMaintainerTransition {
            from: current.to_string(),
            to: requested.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_parsing() {
        assert_eq!("cran".parse::<Source>().unwrap(), Source::Cran);
        assert_eq!("pip".parse::<Source>().unwrap(), Source::Pip);
        assert!(matches!(
            "npm".parse::<Source>(),
            Err(PortdError::UnsupportedSource(s)) if s == "npm"
        ));
    }

    #[test]
    fn test_default_origin() {
        let port = Port::new(Source::Cran, "dplyr");
        assert_eq!(port.origin, "math/R-cran-dplyr");
        assert_eq!(port.maintainer, DEFAULT_MAINTAINER);
        assert!(port.version.is_none());
        assert_eq!(Source::Pip.default_origin("requests"), "devel/py-requests");
    }

    #[test]
    fn test_from_pkgname() {
        assert_eq!(
            Source::from_pkgname("R-cran-dplyr"),
            Some((Source::Cran, "dplyr"))
        );
        assert_eq!(Source::from_pkgname("py-six"), Some((Source::Pip, "six")));
        assert_eq!(Source::from_pkgname("py311-six"), Some((Source::Pip, "six")));
        assert_eq!(
            Source::from_pkgname("py39-python-dateutil"),
            Some((Source::Pip, "python-dateutil"))
        );
        assert_eq!(Source::from_pkgname("R-cran-"), None);
        assert_eq!(Source::from_pkgname("py311-"), None);
        assert_eq!(Source::from_pkgname("python-mode.el"), None);
        assert_eq!(Source::from_pkgname("vim"), None);
    }

    #[test]
    fn test_maintainer_transitions() {
        assert!(check_maintainer_transition(DEFAULT_MAINTAINER, "alice@example.org").is_ok());
        assert!(check_maintainer_transition("alice@example.org", DEFAULT_MAINTAINER).is_ok());
        assert!(matches!(
            check_maintainer_transition("alice@example.org", "bob@example.org"),
            Err(PortdError::InvalidMaintainerTransition { .. })
        ));
        assert!(matches!(
            check_maintainer_transition(DEFAULT_MAINTAINER, "nobody"),
            Err(PortdError::Validation(_))
        ));
    }

    #[test]
    fn test_resolve_target() {
        let port = Port::new(Source::Cran, "dplyr")
            .with_version("1.1.3")
            .with_latest_version(Some("1.1.4".to_string()));
        assert_eq!(port.resolve_target(&VersionTarget::Latest).unwrap(), "1.1.4");
        assert_eq!(
            port.resolve_target(&"1.2.0".parse().unwrap()).unwrap(),
            "1.2.0"
        );
        assert!(port
            .resolve_target(&VersionTarget::Exact("1.1.3".to_string()))
            .is_err());

        let unknown = Port::new(Source::Pip, "six");
        assert!(unknown.resolve_target(&VersionTarget::Latest).is_err());
    }
}
