//! The command-execution capability: run one external OS command, optionally
//! capturing stdout.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::cmd::Cmd;

/// Capability to execute a single external OS command.
pub trait CommandRunner: Send + Sync + 'static {
    /// Execute expecting success; a non-zero exit is an error.
    fn run(&self, cmd: &Cmd) -> impl Future<Output = Result<()>> + Send;

    /// Execute and return trimmed stdout; a non-zero exit is an error.
    fn capture(&self, cmd: &Cmd) -> impl Future<Output = Result<String>> + Send;
}

/// Runs commands on the host via `tokio::process`.
///
/// Each command gets a per-invocation timeout so a hung `iptables`/`ip`
/// cannot stall its branch of the activation forever.
#[derive(Debug, Clone)]
pub struct HostRunner {
    timeout: Duration,
}

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

impl HostRunner {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn output(&self, cmd: &Cmd) -> Result<std::process::Output> {
        debug!(command = %cmd, "Executing");
        let fut = tokio::process::Command::new(cmd.program)
            .args(&cmd.args)
            .output();
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.with_context(|| format!("Failed to run: {}", cmd)),
            Err(_) => bail!("Command timed out after {:?}: {}", self.timeout, cmd),
        }
    }
}

impl Default for HostRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for HostRunner {
    async fn run(&self, cmd: &Cmd) -> Result<()> {
        let output = self.output(cmd).await?;
        if !output.status.success() {
            bail!(
                "Command failed (exit {}): {} — {}",
                output.status.code().unwrap_or(-1),
                cmd,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn capture(&self, cmd: &Cmd) -> Result<String> {
        let output = self.output(cmd).await?;
        if !output.status.success() {
            bail!(
                "Command failed (exit {}): {}",
                output.status.code().unwrap_or(-1),
                cmd
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Records every issued command instead of executing it.
///
/// Test double for the orchestrator and coordinator, and a dry-run runner:
/// `capture` responses are scripted per command substring, and individual
/// commands can be made to fail the same way.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    log: Mutex<Vec<Cmd>>,
    captures: Mutex<Vec<(String, String)>>,
    failures: Mutex<Vec<String>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the stdout served to `capture` calls whose rendered command
    /// contains `needle`.
    pub fn script_capture(&self, needle: &str, stdout: &str) {
        self.captures
            .lock()
            .unwrap()
            .push((needle.to_string(), stdout.to_string()));
    }

    /// Make every command whose rendered form contains `needle` fail.
    pub fn fail_matching(&self, needle: &str) {
        self.failures.lock().unwrap().push(needle.to_string());
    }

    /// Every command issued so far, in order.
    pub fn commands(&self) -> Vec<Cmd> {
        self.log.lock().unwrap().clone()
    }

    /// Rendered forms of every command issued so far, in order.
    pub fn rendered(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(Cmd::to_string).collect()
    }

    fn record(&self, cmd: &Cmd) -> Result<String> {
        let rendered = cmd.to_string();
        self.log.lock().unwrap().push(cmd.clone());
        if self
            .failures
            .lock()
            .unwrap()
            .iter()
            .any(|needle| rendered.contains(needle.as_str()))
        {
            bail!("scripted failure for: {}", rendered);
        }
        Ok(rendered)
    }
}

impl CommandRunner for RecordingRunner {
    async fn run(&self, cmd: &Cmd) -> Result<()> {
        self.record(cmd)?;
        Ok(())
    }

    async fn capture(&self, cmd: &Cmd) -> Result<String> {
        let rendered = self.record(cmd)?;
        let captures = self.captures.lock().unwrap();
        match captures
            .iter()
            .find(|(needle, _)| rendered.contains(needle.as_str()))
        {
            Some((_, stdout)) => Ok(stdout.clone()),
            None => bail!("no scripted output for: {}", rendered),
        }
    }
}
