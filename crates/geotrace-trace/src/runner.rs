use crate::error::TraceError;
use crate::parser::{classify_line, Dialect, LineKind};
use geotrace_model::HopFact;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc::Sender;
use tracing::{debug, trace, warn};

const MAX_TARGET_LEN: usize = 253;

#[derive(Debug, Clone)]
pub struct TraceSettings {
    pub dialect: Dialect,
    pub max_hops: u32,
    /// Per-probe wait handed to the executable.
    pub wait_secs: u64,
    /// Upper bound on the whole subprocess run.
    pub run_timeout: Duration,
    /// Replaces the dialect's default program and flags.
    pub command: Option<TraceCommand>,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            dialect: Dialect::host(),
            max_hops: 30,
            wait_secs: 2,
            run_timeout: Duration::from_secs(120),
            command: None,
        }
    }
}

impl TraceSettings {
    /// Builds the process invocation; the target is always the last argument.
    pub fn command_for(&self, target: &str) -> Command {
        let (program, args) = match &self.command {
            Some(custom) => (custom.program.clone(), custom.args.clone()),
            None => (
                self.dialect.program().to_string(),
                self.dialect.default_args(self.max_hops, self.wait_secs),
            ),
        };

        let mut command = Command::new(program);
        command.args(args).arg(target).stdin(Stdio::null());
        command
    }

    pub fn program(&self) -> &str {
        match &self.command {
            Some(custom) => &custom.program,
            None => self.dialect.program(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// What a runner reports to its session, in arrival order.
#[derive(Debug)]
pub enum RunnerEvent {
    Hop(HopFact),
    Diagnostic(String),
    Exited { exit_code: i32, hop_count: usize },
    Failed(TraceError),
}

impl RunnerEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunnerEvent::Exited { .. } | RunnerEvent::Failed(_))
    }
}

/// Accepts a single hostname or address token and nothing a shell or
/// argument parser could reinterpret.
pub fn validate_target(target: &str) -> Result<String, TraceError> {
    let target = target.trim();
    if target.is_empty() {
        return Err(TraceError::validation("target required"));
    }
    if target.len() > MAX_TARGET_LEN {
        return Err(TraceError::validation("target is too long"));
    }
    if target.starts_with('-') {
        return Err(TraceError::validation("target must not start with '-'"));
    }
    if let Some(bad) = target
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '_')))
    {
        return Err(TraceError::validation(format!(
            "target contains invalid character {bad:?}"
        )));
    }
    Ok(target.to_string())
}

/// Runs the executable to completion and returns its standard output.
pub async fn run_traceroute(target: &str, settings: &TraceSettings) -> Result<String, TraceError> {
    let target = validate_target(target)?;
    let mut command = settings.command_for(&target);
    command.kill_on_drop(true);

    let output = match tokio::time::timeout(settings.run_timeout, command.output()).await {
        Ok(result) => result.map_err(|source| TraceError::Spawn {
            program: settings.program().to_string(),
            source,
        })?,
        Err(_) => return Err(TraceError::TimedOut(settings.run_timeout)),
    };

    if !output.status.success() {
        return Err(TraceError::AbnormalExit {
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// One-shot mode: hops are only reported once the process has succeeded.
pub async fn run_batch(target: &str, settings: &TraceSettings, sender: Sender<RunnerEvent>) {
    let stdout = match run_traceroute(target, settings).await {
        Ok(stdout) => stdout,
        Err(err) => {
            warn!(%target, error = %err, "batch traceroute failed");
            let _ = sender.send(RunnerEvent::Failed(err)).await;
            return;
        }
    };

    let mut hop_count = 0;
    for line in stdout.lines() {
        if let Some(fact) = interpret_line(line, settings.dialect) {
            hop_count += 1;
            if sender.send(RunnerEvent::Hop(fact)).await.is_err() {
                return;
            }
        }
    }

    let _ = sender
        .send(RunnerEvent::Exited {
            exit_code: 0,
            hop_count,
        })
        .await;
}

/// Parses a line, logging what was skipped.
pub(crate) fn interpret_line(line: &str, dialect: Dialect) -> Option<HopFact> {
    match classify_line(line, dialect) {
        LineKind::Hop(fact) => {
            debug!(hop = fact.hop_number, ip = %fact.ip, latency_ms = fact.latency_ms, "hop parsed");
            Some(fact)
        }
        LineKind::Timeout { hop_number } => {
            trace!(hop = hop_number, "hop did not answer");
            None
        }
        LineKind::Private { hop_number, ip } => {
            trace!(hop = hop_number, %ip, "private hop skipped");
            None
        }
        LineKind::Banner | LineKind::Unparsed => None,
    }
}
