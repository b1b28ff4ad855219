//! Stage collaborators backed by external commands.
//!
//! Each command is an argument vector whose `{placeholder}` arguments are
//! substituted before it runs. Diffs are passed on stdin.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{PortdError, PortdResult};
use crate::model::patch::{BuildTarget, Patch};
use crate::model::port::{Port, Source};
use crate::stages::{BuildFarm, BuildReport, Generator, LintOutcome, Linter};

/// Exit status a lint command uses to report that a reviewer declined the
/// patch rather than that validation failed.
pub const REJECT_EXIT_CODE: i32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    argv: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout and stderr, for logs and diagnostics.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

impl CommandSpec {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    /// Substitute `{key}` occurrences in every argument.
    pub fn expand(&self, vars: &[(&str, &str)]) -> Vec<String> {
        self.argv
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |arg, (key, value)| {
                    arg.replace(&format!("{{{}}}", key), value)
                })
            })
            .collect()
    }

    pub async fn run(&self, vars: &[(&str, &str)], stdin: Option<&str>) -> PortdResult<CommandOutput> {
        let argv = self.expand(vars);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| PortdError::Config("empty command".to_string()))?;

        debug!(command = %argv.join(" "), "running stage command");

        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| PortdError::Internal(format!("failed to run {}: {}", program, err)))?;

        // stdin is fed while stdout and stderr drain
        let pipe = child.stdin.take();
        let write = async move {
            if let (Some(input), Some(mut pipe)) = (stdin, pipe) {
                match pipe.write_all(input.as_bytes()).await {
                    // the command may exit without reading its input
                    Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {}
                    other => other?,
                }
                // closing stdin lets the command see EOF
                drop(pipe);
            }
            Ok::<_, std::io::Error>(())
        };

        let (written, output) = tokio::join!(write, child.wait_with_output());
        written?;
        let output = output?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

fn port_vars<'a>(port: &'a Port) -> Vec<(&'static str, &'a str)> {
    vec![
        ("name", port.name.as_str()),
        ("origin", port.origin.as_str()),
        ("source", port.source.as_str()),
        ("maintainer", port.maintainer.as_str()),
    ]
}

fn failure_message(what: &str, output: &CommandOutput) -> String {
    let detail = output.combined();
    let detail = detail.trim();
    match output.code {
        Some(code) if detail.is_empty() => format!("{} exited with status {}", what, code),
        Some(code) => format!("{} exited with status {}: {}", what, code, detail),
        None => format!("{} was terminated by a signal", what),
    }
}

fn failure(what: &str, output: &CommandOutput) -> PortdError {
    PortdError::Internal(failure_message(what, output))
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// Runs the configured commands for the ports of one source.
pub struct CommandGenerator {
    source: Source,
    generate: Option<CommandSpec>,
    dependencies: Option<CommandSpec>,
    version: Option<CommandSpec>,
}

impl CommandGenerator {
    pub fn new(
        source: Source,
        generate: Option<CommandSpec>,
        dependencies: Option<CommandSpec>,
        version: Option<CommandSpec>,
    ) -> Self {
        Self {
            source,
            generate,
            dependencies,
            version,
        }
    }

    fn lookup_vars<'a>(&self, name: &'a str) -> [(&'static str, &'a str); 2] {
        [("name", name), ("source", self.source.as_str())]
    }
}

#[async_trait]
impl Generator for CommandGenerator {
    async fn dependencies(&self, name: &str) -> PortdResult<Vec<String>> {
        let Some(command) = &self.dependencies else {
            return Ok(Vec::new());
        };
        let output = command.run(&self.lookup_vars(name), None).await?;
        if !output.success() {
            return Err(failure("dependencies command", &output));
        }
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn latest_version(&self, name: &str) -> PortdResult<Option<String>> {
        let Some(command) = &self.version else {
            return Ok(None);
        };
        let output = command.run(&self.lookup_vars(name), None).await?;
        if !output.success() {
            return Err(failure("version command", &output));
        }
        let version = output.stdout.trim();
        Ok((!version.is_empty()).then(|| version.to_string()))
    }

    async fn generate(&self, port: &Port, patch: &Patch) -> PortdResult<String> {
        let command = self
            .generate
            .as_ref()
            .ok_or_else(|| PortdError::Config("no generate_command configured".to_string()))?;

        let mut vars = port_vars(port);
        vars.push(("action", patch.action.as_str()));
        vars.push(("version", patch.change.version.as_deref().unwrap_or("")));
        if let Some(maintainer) = patch.change.maintainer.as_deref() {
            vars.retain(|(key, _)| *key != "maintainer");
            vars.push(("maintainer", maintainer));
        }

        let output = command.run(&vars, None).await?;
        if !output.success() {
            return Err(failure("generate command", &output));
        }
        if output.stdout.trim().is_empty() {
            return Err(PortdError::Internal(
                "generate command produced an empty diff".to_string(),
            ));
        }
        Ok(output.stdout)
    }
}

// ---------------------------------------------------------------------------
// Linter
// ---------------------------------------------------------------------------

pub struct CommandLinter {
    command: Option<CommandSpec>,
}

impl CommandLinter {
    pub fn new(command: Option<CommandSpec>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Linter for CommandLinter {
    async fn lint(&self, port: &Port, diff: &str) -> PortdResult<LintOutcome> {
        let Some(command) = &self.command else {
            debug!(port = %port.origin, "no lint_command configured, passing");
            return Ok(LintOutcome::Pass);
        };
        let output = command.run(&port_vars(port), Some(diff)).await?;
        Ok(match output.code {
            Some(0) => LintOutcome::Pass,
            Some(REJECT_EXIT_CODE) => LintOutcome::Reject(output.combined().trim().to_string()),
            _ => LintOutcome::Fail(failure_message("lint command", &output)),
        })
    }
}

// ---------------------------------------------------------------------------
// Build farm
// ---------------------------------------------------------------------------

pub struct CommandBuildFarm {
    command: Option<CommandSpec>,
}

impl CommandBuildFarm {
    pub fn new(command: Option<CommandSpec>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl BuildFarm for CommandBuildFarm {
    async fn build(
        &self,
        port: &Port,
        diff: &str,
        target: &BuildTarget,
    ) -> PortdResult<BuildReport> {
        let command = self
            .command
            .as_ref()
            .ok_or_else(|| PortdError::Config("no build_command configured".to_string()))?;

        let jail = target.jail();
        let mut vars = port_vars(port);
        vars.push(("arch", target.arch.as_str()));
        vars.push(("osversion", target.version.as_str()));
        vars.push(("jail", jail.as_str()));

        let output = command.run(&vars, Some(diff)).await?;
        Ok(BuildReport {
            success: output.success(),
            log: output.combined(),
        })
    }
}
