//! Remote command execution over SSH
//!
//! Shells out to the system `ssh` client, optionally through `sshpass` so a
//! password can be supplied via the environment instead of a prompt. The whole
//! round trip (connect + command) is bounded by a single deadline.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

use crate::probe::{ProbeError, ProbeTarget};

/// Exit code the OpenSSH client reserves for its own failures
const SSH_CLIENT_FAILURE: i32 = 255;
/// sshpass exit codes 1..=6 describe argument, auth or host-key problems.
/// sshpass also passes the remote exit status through, so a remote command
/// exiting in this range is reported as a connection error too.
const SSHPASS_FAILURES: std::ops::RangeInclusive<i32> = 1..=6;

/// Decrypted login for one probe; dropped as soon as the probe returns
#[derive(Clone, PartialEq, Eq)]
pub struct SshCredentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for SshCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Builds and runs `ssh` invocations
#[derive(Debug, Clone)]
pub struct SshRunner {
    /// ssh client binary
    pub ssh_program: String,
    /// Wrapper feeding the password from `SSHPASS`; `None` means key-based auth
    pub password_helper: Option<String>,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for SshRunner {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            password_helper: Some("sshpass".to_string()),
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(20),
        }
    }
}

impl SshRunner {
    /// Program and argument vector for running `remote_command` on `target`
    pub fn argv(
        &self,
        target: &ProbeTarget,
        credentials: &SshCredentials,
        remote_command: &str,
    ) -> (String, Vec<String>) {
        let mut args = Vec::new();
        let program = match &self.password_helper {
            Some(helper) => {
                args.push("-e".to_string());
                args.push(self.ssh_program.clone());
                helper.clone()
            }
            None => self.ssh_program.clone(),
        };

        args.extend([
            "-p".to_string(),
            target.ssh_port().to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "NumberOfPasswordPrompts=1".to_string(),
            format!("{}@{}", credentials.user, target.ip),
            remote_command.to_string(),
        ]);

        (program, args)
    }

    /// Run `remote_command` and return its first non-empty stdout line
    pub async fn run(
        &self,
        target: &ProbeTarget,
        credentials: &SshCredentials,
        remote_command: &str,
    ) -> Result<String, ProbeError> {
        let (program, args) = self.argv(target, credentials, remote_command);
        let deadline = self.connect_timeout + self.command_timeout;
        debug!(node = %target.name, %program, "Executing remote heartbeat command");

        let mut cmd = AsyncCommand::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.password_helper.is_some() {
            cmd.env("SSHPASS", &credentials.password);
        }

        let output = tokio::time::timeout(deadline, cmd.output())
            .await
            .map_err(|_| ProbeError::Timeout(deadline))?
            .map_err(|e| ProbeError::SshConnection(format!("failed to launch {program}: {e}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(0) => {}
            Some(code) if code == SSH_CLIENT_FAILURE => {
                return Err(ProbeError::SshConnection(stderr));
            }
            Some(code) if self.password_helper.is_some() && SSHPASS_FAILURES.contains(&code) => {
                return Err(ProbeError::SshConnection(format!("sshpass (or remote command) exit {code}: {stderr}")));
            }
            Some(code) => {
                return Err(ProbeError::SshCommand(format!("exit {code}: {stderr}")));
            }
            None => {
                return Err(ProbeError::SshCommand("terminated by signal".to_string()));
            }
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ProbeError::SshCommand("empty output".to_string()))
    }
}
