//! Execution of host networking tools (`ip`, `iptables`, `sysctl`)
//!
//! Every OS mutation the portal performs goes through a [`CommandRunner`], so
//! the full command history can be observed (and scripted) in tests with
//! [`RecordingRunner`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::process::Command;

/// Captured result of an external command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Whether the process exited with status 0
    pub success: bool,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given stderr
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Runs an external program and captures its output
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`. An `Err` means the program could not be
    /// spawned at all; a non-zero exit is reported through [`CommandOutput`].
    async fn output(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput>;
}

/// Run a command and turn spawn failures and non-zero exits into an error
/// message suitable for logging.
pub(crate) async fn run_checked(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[&str],
) -> std::result::Result<CommandOutput, String> {
    let output = runner
        .output(program, args)
        .await
        .map_err(|e| format!("failed to run {}: {}", program, e))?;

    if !output.success {
        return Err(format!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            output.stderr.trim()
        ));
    }

    Ok(output)
}

/// Runs commands on the host via `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn output(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput> {
        let output = Command::new(program).args(args).output().await?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Command runner that records every invocation instead of executing it.
///
/// Commands succeed with empty output unless a response was scripted with
/// [`RecordingRunner::respond`]. Responses match on the full command line
/// (`"ip route show default"`) or on any prefix of it (`"iptables -A"`); the
/// longest matching prefix wins.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<String>>,
    responses: Mutex<HashMap<String, CommandOutput>>,
}

impl RecordingRunner {
    /// Create a runner where every command succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the output returned for commands starting with `prefix`
    pub fn respond(&self, prefix: &str, output: CommandOutput) -> &Self {
        if let Ok(mut responses) = self.responses.lock() {
            responses.insert(prefix.to_string(), output);
        }
        self
    }

    /// All command lines executed so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Command lines starting with `prefix`
    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    /// Forget recorded calls (scripted responses are kept)
    pub fn clear(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn output(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput> {
        let line = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");

        if let Ok(mut calls) = self.calls.lock() {
            calls.push(line.clone());
        }

        let responses = self
            .responses
            .lock()
            .map_err(|_| std::io::Error::other("response table poisoned"))?;

        let scripted = responses
            .iter()
            .filter(|(prefix, _)| line.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, output)| output.clone());

        Ok(scripted.unwrap_or_else(|| CommandOutput::ok("")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_runner_defaults_to_success() {
        let runner = RecordingRunner::new();
        let out = runner.output("ip", &["link", "set", "up"]).await.unwrap();

        assert!(out.success);
        assert_eq!(runner.calls(), vec!["ip link set up".to_string()]);
    }

    #[tokio::test]
    async fn test_recording_runner_longest_prefix_wins() {
        let runner = RecordingRunner::new();
        runner
            .respond("iptables", CommandOutput::ok("generic"))
            .respond("iptables -t nat", CommandOutput::failed("no nat"));

        let nat = runner
            .output("iptables", &["-t", "nat", "-A", "POSTROUTING"])
            .await
            .unwrap();
        let filter = runner
            .output("iptables", &["-A", "FORWARD"])
            .await
            .unwrap();

        assert!(!nat.success);
        assert_eq!(nat.stderr, "no nat");
        assert_eq!(filter.stdout, "generic");
    }

    #[tokio::test]
    async fn test_run_checked_reports_stderr() {
        let runner = RecordingRunner::new();
        runner.respond("sysctl", CommandOutput::failed("permission denied\n"));

        let err = run_checked(&runner, "sysctl", &["-w", "net.ipv4.ip_forward=1"])
            .await
            .unwrap_err();

        assert!(err.contains("sysctl -w net.ipv4.ip_forward=1 failed"));
        assert!(err.ends_with("permission denied"));
    }
}
