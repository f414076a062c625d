//! Per-job SSH agent: loads the repo's private key into a freshly spawned
//! `ssh-agent` so step commands can authenticate against the remote without
//! ever seeing the key material themselves.

use std::fs;
use std::path::Path;
use std::process::Command;

use runner_core::{Error, Result};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// A running per-job agent. `socket_path`/`pid` are registered as
/// `SSH_AUTH_SOCK`/`SSH_AGENT_PID` globals for every step.
pub struct SshAgentHandle {
    pub socket_path: String,
    pub pid: u32,
}

impl SshAgentHandle {
    /// Writes `key_pem` to `staging_dir` (mode 0600), starts an agent, loads
    /// the key, then deletes the key file from disk.
    pub fn spawn(staging_dir: &Path, key_pem: &str) -> Result<Self> {
        let key_path = staging_dir.join("id_job_ssh_key");
        fs::write(&key_path, key_pem)
            .map_err(|e| Error::Internal(format!("failed to write ssh key: {e}")))?;

        #[cfg(unix)]
        fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::Internal(format!("failed to chmod ssh key: {e}")))?;

        let agent_output = Command::new("ssh-agent")
            .arg("-s")
            .output()
            .map_err(|e| Error::Internal(format!("failed to start ssh-agent: {e}")))?;
        if !agent_output.status.success() {
            let _ = fs::remove_file(&key_path);
            return Err(Error::Internal("ssh-agent exited with failure".into()));
        }
        let stdout = String::from_utf8_lossy(&agent_output.stdout);
        let socket_path = parse_assignment(&stdout, "SSH_AUTH_SOCK").ok_or_else(|| {
            Error::Internal("ssh-agent output missing SSH_AUTH_SOCK".into())
        })?;
        let pid: u32 = parse_assignment(&stdout, "SSH_AGENT_PID")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Internal("ssh-agent output missing SSH_AGENT_PID".into()))?;

        let add_status = Command::new("ssh-add")
            .arg(&key_path)
            .env("SSH_AUTH_SOCK", &socket_path)
            .status();
        let _ = fs::remove_file(&key_path);

        match add_status {
            Ok(status) if status.success() => Ok(Self { socket_path, pid }),
            Ok(_) => {
                kill(pid);
                Err(Error::Internal("ssh-add failed to load job key".into()))
            }
            Err(e) => {
                kill(pid);
                Err(Error::Internal(format!("failed to run ssh-add: {e}")))
            }
        }
    }

    pub fn shutdown(&self) {
        kill(self.pid);
    }
}

fn kill(pid: u32) {
    let _ = Command::new("kill").arg("-9").arg(pid.to_string()).status();
}

/// Extracts `NAME=value` from `ssh-agent -s` output, which looks like:
/// `SSH_AUTH_SOCK=/tmp/ssh-xxx/agent.123; export SSH_AUTH_SOCK;`
fn parse_assignment(output: &str, name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    output.lines().find_map(|line| {
        let line = line.trim();
        line.strip_prefix(&prefix)
            .and_then(|rest| rest.split(';').next())
            .map(|v| v.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sock_and_pid_from_agent_output() {
        let output = "SSH_AUTH_SOCK=/tmp/ssh-abc/agent.42; export SSH_AUTH_SOCK;\nSSH_AGENT_PID=42; export SSH_AGENT_PID;\necho Agent pid 42;\n";
        assert_eq!(parse_assignment(output, "SSH_AUTH_SOCK").as_deref(), Some("/tmp/ssh-abc/agent.42"));
        assert_eq!(parse_assignment(output, "SSH_AGENT_PID").as_deref(), Some("42"));
    }

    #[test]
    fn missing_assignment_returns_none() {
        assert_eq!(parse_assignment("nothing here", "SSH_AUTH_SOCK"), None);
    }
}
