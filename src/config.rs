use crate::error::{PortdError, PortdResult};
use crate::model::patch::BuildTarget;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub ports: PortsTreeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Rocksdb,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub path: PathBuf,
}

/// Commands are argument vectors; `{name}`, `{origin}`, `{source}`,
/// `{maintainer}`, `{action}`, `{version}`, `{arch}`, `{osversion}` and
/// `{jail}` are substituted before running them. Lint and build commands
/// read the diff on stdin.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub stage_timeout_secs: u64,
    pub targets: Vec<BuildTarget>,
    #[serde(default)]
    pub generate_command: Option<Vec<String>>,
    #[serde(default)]
    pub dependencies_command: Option<Vec<String>>,
    #[serde(default)]
    pub version_command: Option<Vec<String>>,
    #[serde(default)]
    pub lint_command: Option<Vec<String>>,
    #[serde(default)]
    pub build_command: Option<Vec<String>>,
}

impl PipelineConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub filter: String,
    pub json: bool,
}

/// Ports tree to reconcile with at start-up.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PortsTreeConfig {
    pub index: Option<PathBuf>,
}

pub fn load_config(path: Option<&Path>) -> PortdResult<AppConfig> {
    let mut builder = Config::builder()
        .set_default("server.host", "127.0.0.1")
        .and_then(|b| b.set_default("server.port", 8080))
        .and_then(|b| b.set_default("storage.backend", "memory"))
        .and_then(|b| b.set_default("storage.path", "/var/db/portd"))
        .and_then(|b| b.set_default("pipeline.stage_timeout_secs", 3600))
        .and_then(|b| b.set_default("pipeline.targets", Vec::<String>::new()))
        .and_then(|b| b.set_default("logging.filter", "info"))
        .and_then(|b| b.set_default("logging.json", false))
        .map_err(|err| PortdError::Config(err.to_string()))?
        .add_source(File::with_name("portd").required(false))
        .add_source(Environment::with_prefix("PORTD").separator("__"));

    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(true));
    }

    let config = builder
        .build()
        .map_err(|err| PortdError::Config(err.to_string()))?;

    let parsed: AppConfig = config
        .try_deserialize()
        .map_err(|err| PortdError::Config(err.to_string()))?;

    if parsed.pipeline.stage_timeout_secs == 0 {
        return Err(PortdError::Config(
            "pipeline.stage_timeout_secs must be greater than zero".to_string(),
        ));
    }

    for (key, command) in [
        ("generate_command", &parsed.pipeline.generate_command),
        ("dependencies_command", &parsed.pipeline.dependencies_command),
        ("version_command", &parsed.pipeline.version_command),
        ("lint_command", &parsed.pipeline.lint_command),
        ("build_command", &parsed.pipeline.build_command),
    ] {
        if matches!(command, Some(argv) if argv.is_empty()) {
            return Err(PortdError::Config(format!(
                "pipeline.{} must not be empty",
                key
            )));
        }
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert!(config.pipeline.targets.is_empty());
        assert_eq!(config.pipeline.stage_timeout(), Duration::from_secs(3600));
        assert!(config.ports.index.is_none());
    }

    #[test]
    fn test_file_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9000

[pipeline]
stage_timeout_secs = 60
generate_command = ["portcran", "{{action}}", "{{name}}"]
targets = [{{ arch = "amd64", version = "13.2" }}, {{ arch = "i386", version = "13.2" }}]

[ports]
index = "/usr/ports/INDEX-14"
"#
        )
        .unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.pipeline.targets.len(), 2);
        assert_eq!(config.pipeline.targets[1], BuildTarget::new("i386", "13.2"));
        assert_eq!(
            config.pipeline.generate_command.as_deref(),
            Some(&["portcran".to_string(), "{action}".to_string(), "{name}".to_string()][..])
        );
        assert_eq!(
            config.ports.index.as_deref(),
            Some(Path::new("/usr/ports/INDEX-14"))
        );
    }

    #[test]
    fn test_rejects_empty_command() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[pipeline]\nlint_command = []").unwrap();
        assert!(matches!(
            load_config(Some(file.path())),
            Err(PortdError::Config(_))
        ));
    }
}
