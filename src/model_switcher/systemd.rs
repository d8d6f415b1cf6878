//! systemd implementation of [`ProcessSupervisor`]
//!
//! Each backend is a systemd unit (usually a user unit wrapping `llama-server`). Units are driven
//! through `systemctl`:
//! - `systemctl --user start <unit>`
//! - `systemctl --user stop <unit>`
//! - `systemctl --user is-active <unit>` (stdout `active` when running)

use super::supervisor::{ProcessSupervisor, SupervisorError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SystemdSupervisor {
    /// Path to the systemctl binary
    systemctl: PathBuf,
    /// Pass `--user` to talk to the per-user manager
    user: bool,
}

impl Default for SystemdSupervisor {
    fn default() -> Self {
        Self::new("/usr/bin/systemctl", true)
    }
}

impl SystemdSupervisor {
    pub fn new(systemctl: impl Into<PathBuf>, user: bool) -> Self {
        Self {
            systemctl: systemctl.into(),
            user,
        }
    }

    fn args<'a>(&self, action: &'a str, unit: &'a str) -> Vec<&'a str> {
        let mut args = Vec::with_capacity(3);
        if self.user {
            args.push("--user");
        }
        args.push(action);
        args.push(unit);
        args
    }

    async fn run(&self, action: &'static str, unit: &str) -> Result<Output, SupervisorError> {
        let args = self.args(action, unit);
        debug!(systemctl = %self.systemctl.display(), args = ?args, "Running systemctl");

        Command::new(&self.systemctl)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // the switcher drops this future when its per-call timeout fires
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| SupervisorError::Spawn {
                action,
                unit: unit.to_string(),
                source,
            })
    }

    async fn run_checked(&self, action: &'static str, unit: &str) -> Result<(), SupervisorError> {
        let output = self.run(action, unit).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(SupervisorError::CommandFailed {
            action,
            unit: unit.to_string(),
            reason: format!("{} ({})", stderr.trim(), output.status),
        })
    }
}

#[async_trait]
impl ProcessSupervisor for SystemdSupervisor {
    async fn start(&self, unit: &str) -> Result<(), SupervisorError> {
        self.run_checked("start", unit).await
    }

    async fn stop(&self, unit: &str) -> Result<(), SupervisorError> {
        self.run_checked("stop", unit).await
    }

    async fn is_active(&self, unit: &str) -> Result<bool, SupervisorError> {
        // is-active exits non-zero for inactive units, so only stdout matters here
        let output = self.run("is-active", unit).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim() == "active")
    }
}
