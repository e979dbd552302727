//! Narrow interfaces to the world outside the file core: change
//! notification and lifecycle control of the managed process.

use crate::backup::ChangeSummary;
use crate::config::{Config, ProjectConfig};
use crate::utils::errors::{AgentError, Result};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What kind of mutation produced a change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    Upload,
    Merge,
    Remote,
    Delete,
    DeleteAll,
    BatchDelete,
    Rename,
    Create,
    Write,
    Restore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChangeEvent {
    pub project_id: String,
    pub kind: ChangeKind,
    pub subdir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl FileChangeEvent {
    pub fn new(project_id: &str, kind: ChangeKind, subdir: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            kind,
            subdir: subdir.to_string(),
            file_name: None,
            url: None,
        }
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// Receives change notifications. Implementations must not block.
pub trait ChangeNotifier: Send + Sync {
    /// A mutation finished successfully.
    fn file_changed(&self, event: &FileChangeEvent);

    /// A backup closed with a non-empty diff, on success or failure.
    fn backup_diff(&self, summary: &ChangeSummary);
}

/// Lifecycle control of a project's managed process.
pub trait ProcessControl: Send + Sync {
    fn is_running(&self, project_id: &str) -> Result<bool>;
    fn stop(&self, project_id: &str) -> Result<()>;
    fn restart(&self, project_id: &str) -> Result<()>;
}

/// Process control driven by the commands and PID file in each project's config.
pub struct CommandProcessControl {
    config: Arc<Config>,
}

impl CommandProcessControl {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    fn project(&self, project_id: &str) -> Result<&ProjectConfig> {
        self.config.project(project_id)
    }
}

impl ProcessControl for CommandProcessControl {
    fn is_running(&self, project_id: &str) -> Result<bool> {
        let project = self.project(project_id)?;

        if let Some(pid_file) = &project.pid_file {
            let raw = match std::fs::read_to_string(pid_file) {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
                Err(e) => return Err(e.into()),
            };
            let pid: i32 = raw.trim().parse().map_err(|_| {
                AgentError::Process(format!("invalid pid in {}: {:?}", pid_file.display(), raw.trim()))
            })?;
            // Signal 0 only checks for existence
            return Ok(kill(Pid::from_raw(pid), None).is_ok());
        }

        if let Some(command) = &project.status_command {
            let status = Command::new("sh")
                .arg("-c")
                .arg(command)
                .status()
                .map_err(|e| AgentError::Process(format!("status command failed to start: {}", e)))?;
            return Ok(status.success());
        }

        debug!(project = %project_id, "No pid file or status command, assuming stopped");
        Ok(false)
    }

    fn stop(&self, project_id: &str) -> Result<()> {
        let project = self.project(project_id)?;
        let command = project.stop_command.as_deref().ok_or_else(|| {
            AgentError::PreconditionFailed(format!("project {} has no stop command", project_id))
        })?;
        run_command(project_id, "stop", command)
    }

    fn restart(&self, project_id: &str) -> Result<()> {
        let project = self.project(project_id)?;
        let command = project.restart_command.as_deref().ok_or_else(|| {
            AgentError::PreconditionFailed(format!("project {} has no restart command", project_id))
        })?;
        run_command(project_id, "restart", command)
    }
}

fn run_command(project_id: &str, action: &str, command: &str) -> Result<()> {
    info!(project = %project_id, "Running {} command: {}", action, command);
    match Command::new("sh").arg("-c").arg(command).status() {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => {
            warn!(project = %project_id, "{} command exited with: {}", action, status);
            Err(AgentError::Process(format!("{} command exited with {}", action, status)))
        }
        Err(e) => Err(AgentError::Process(format!("{} command failed to start: {}", action, e))),
    }
}
