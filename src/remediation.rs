//! Network remediation.
//!
//! When the database stays unreachable the agent restarts the host's network
//! stack. Remediation is fire-and-forget: `remediate` returns immediately and
//! the caller never learns whether the restart worked.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Best-effort recovery of a dead network interface.
///
/// Implementations must be safe to call repeatedly in quick succession; the
/// connection manager and the loop may both trigger it in one iteration.
pub trait NetworkRemediation {
    fn remediate(&self);
}

/// Upper bound for a single remediation command.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Restarts the network through systemd.
///
/// Runs `sudo -n systemctl daemon-reload` followed by
/// `sudo -n systemctl restart <service>` on a background task. A trigger that
/// arrives while a restart is still running is skipped. Each command is
/// killed after the command timeout, so a stuck restart never blocks later
/// triggers.
#[derive(Debug, Clone)]
pub struct SystemdRemediation {
    commands: Vec<Vec<String>>,
    command_timeout: Duration,
    running: Arc<AtomicBool>,
}

impl SystemdRemediation {
    /// Remediation that restarts the given network service.
    pub fn new(network_service: impl Into<String>) -> Self {
        let service = network_service.into();
        Self::with_commands(vec![
            vec![
                "sudo".to_string(),
                "-n".to_string(),
                "systemctl".to_string(),
                "daemon-reload".to_string(),
            ],
            vec![
                "sudo".to_string(),
                "-n".to_string(),
                "systemctl".to_string(),
                "restart".to_string(),
                service,
            ],
        ])
    }

    /// Remediation that runs an arbitrary command sequence.
    pub fn with_commands(commands: Vec<Vec<String>>) -> Self {
        Self {
            commands,
            command_timeout: COMMAND_TIMEOUT,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set the time after which a command is killed.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Commands run, in order, on every remediation.
    pub fn commands(&self) -> &[Vec<String>] {
        &self.commands
    }

    /// Whether a restart is currently in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl NetworkRemediation for SystemdRemediation {
    fn remediate(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("Network restart already in progress, skipping");
            return;
        }

        warn!("Restarting network");

        let commands = self.commands.clone();
        let timeout = self.command_timeout;
        let guard = RunningGuard(self.running.clone());

        tokio::spawn(async move {
            let _guard = guard;
            for command in &commands {
                run_command(command, timeout).await;
            }
        });
    }
}

/// Clears the in-progress flag when the restart task ends, however it ends.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Run one command to completion or until `timeout`, logging its outcome.
async fn run_command(command: &[String], timeout: Duration) {
    let Some((program, args)) = command.split_first() else {
        return;
    };

    debug!(command = %command.join(" "), "Running remediation command");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let status = match tokio::time::timeout(timeout, cmd.status()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(
                command = %command.join(" "),
                timeout_secs = timeout.as_secs_f64(),
                "Remediation command timed out, killed"
            );
            return;
        }
    };

    match status {
        Ok(status) if status.success() => {
            info!(command = %command.join(" "), "Remediation command finished");
        }
        Ok(status) => {
            warn!(
                command = %command.join(" "),
                status = %status,
                "Remediation command failed"
            );
        }
        Err(e) => {
            error!(
                command = %command.join(" "),
                error = %e,
                "Failed to run remediation command"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_until_idle(remediation: &SystemdRemediation) {
        for _ in 0..200 {
            if !remediation.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Remediation did not finish");
    }

    #[test]
    fn test_default_commands() {
        let remediation = SystemdRemediation::new("NetworkManager");
        let commands = remediation.commands();

        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].join(" "), "sudo -n systemctl daemon-reload");
        assert_eq!(commands[1].join(" "), "sudo -n systemctl restart NetworkManager");
    }

    #[tokio::test]
    async fn test_remediate_runs_commands_in_background() {
        let marker = std::env::temp_dir().join(format!(
            "thlogger-remediation-{}",
            std::process::id()
        ));
        std::fs::remove_file(&marker).ok();

        let remediation = SystemdRemediation::with_commands(vec![
            vec!["true".to_string()],
            vec!["touch".to_string(), marker.display().to_string()],
        ]);

        remediation.remediate();
        assert!(remediation.is_running());

        wait_until_idle(&remediation).await;
        assert!(marker.exists());
        std::fs::remove_file(&marker).ok();
    }

    #[tokio::test]
    async fn test_repeated_triggers_are_coalesced() {
        let remediation = SystemdRemediation::with_commands(vec![vec![
            "sleep".to_string(),
            "0.2".to_string(),
        ]]);

        remediation.remediate();
        remediation.remediate();
        remediation.remediate();
        assert!(remediation.is_running());

        wait_until_idle(&remediation).await;

        // Can be triggered again once the previous restart finished
        remediation.remediate();
        assert!(remediation.is_running());
        wait_until_idle(&remediation).await;
    }

    #[tokio::test]
    async fn test_missing_program_is_not_fatal() {
        let remediation = SystemdRemediation::with_commands(vec![vec![
            "/nonexistent/thlogger-restart".to_string(),
        ]]);

        remediation.remediate();
        wait_until_idle(&remediation).await;
    }

    #[tokio::test]
    async fn test_hanging_command_does_not_block_later_triggers() {
        let marker = std::env::temp_dir().join(format!(
            "thlogger-remediation-hang-{}",
            std::process::id()
        ));
        std::fs::remove_file(&marker).ok();

        let remediation = SystemdRemediation::with_commands(vec![
            vec!["sleep".to_string(), "3600".to_string()],
            vec!["touch".to_string(), marker.display().to_string()],
        ])
        .with_command_timeout(Duration::from_millis(200));

        remediation.remediate();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Skipped while the first restart is still stuck
        remediation.remediate();
        assert!(remediation.is_running());

        wait_until_idle(&remediation).await;
        // The command after the killed one still ran
        assert!(marker.exists());
        std::fs::remove_file(&marker).ok();

        // A later trigger runs again
        remediation.remediate();
        assert!(remediation.is_running());
        wait_until_idle(&remediation).await;
        assert!(marker.exists());
        std::fs::remove_file(&marker).ok();
    }
}
