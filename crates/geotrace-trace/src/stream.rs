use crate::error::TraceError;
use crate::runner::{interpret_line, validate_target, RunnerEvent, TraceSettings};
use std::process::ExitStatus;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 4096;

/// How long stderr may stay open after the process has exited.
const STDERR_GRACE: Duration = Duration::from_millis(500);

/// Accumulates raw output and hands back complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and drains every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&raw[..raw.len() - 1]));
        }
        lines
    }

    /// Returns whatever trailing fragment never saw a newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(decode_line(&raw))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Streaming mode: hop events are sent as soon as each line completes.
///
/// The terminal event is sent after stdout is exhausted, stderr is drained
/// and the exit status is known. When `cancel` fires the child is killed
/// and nothing further is sent.
pub async fn run_streaming(
    target: &str,
    settings: &TraceSettings,
    sender: Sender<RunnerEvent>,
    cancel: CancellationToken,
) {
    let target = match validate_target(target) {
        Ok(target) => target,
        Err(err) => {
            let _ = sender.send(RunnerEvent::Failed(err)).await;
            return;
        }
    };

    let mut command = settings.command_for(&target);
    command
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(source) => {
            let err = TraceError::Spawn {
                program: settings.program().to_string(),
                source,
            };
            warn!(%target, error = %err, "traceroute spawn failed");
            let _ = sender.send(RunnerEvent::Failed(err)).await;
            return;
        }
    };
    info!(%target, pid = child.id(), "traceroute started");
    let deadline = Instant::now() + settings.run_timeout;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stderr_task = stderr.map(|stderr| {
        let sender = sender.clone();
        tokio::spawn(forward_diagnostics(stderr, sender))
    });

    let body = async {
        let hop_count = match stdout {
            Some(stdout) => pump_stdout(stdout, settings, &sender).await?,
            None => 0,
        };
        let status = child.wait().await?;
        Ok::<(ExitStatus, usize), TraceError>((status, hop_count))
    };

    let outcome = tokio::select! {
        _ = cancel.cancelled() => None,
        result = tokio::time::timeout_at(deadline, body) => Some(result),
    };

    let stderr_text = match outcome {
        Some(Ok(Ok(_))) => match stderr_task {
            Some(task) => drain_diagnostics(task, deadline).await,
            None => String::new(),
        },
        _ => {
            if let Some(task) = stderr_task {
                task.abort();
            }
            String::new()
        }
    };

    let terminal = match outcome {
        None => {
            debug!(%target, "traceroute cancelled");
            let _ = child.start_kill();
            return;
        }
        Some(Err(_)) => {
            let _ = child.start_kill();
            RunnerEvent::Failed(TraceError::TimedOut(settings.run_timeout))
        }
        Some(Ok(Err(err))) => {
            let _ = child.start_kill();
            RunnerEvent::Failed(err)
        }
        Some(Ok(Ok((status, hop_count)))) if status.success() => {
            info!(%target, hop_count, "traceroute finished");
            RunnerEvent::Exited {
                exit_code: status.code().unwrap_or(0),
                hop_count,
            }
        }
        Some(Ok(Ok((status, hop_count)))) => {
            warn!(%target, hop_count, %status, "traceroute exited abnormally");
            RunnerEvent::Failed(TraceError::AbnormalExit {
                code: status.code(),
                stderr: stderr_text,
            })
        }
    };

    let _ = sender.send(terminal).await;
}

async fn pump_stdout<R>(
    mut stdout: R,
    settings: &TraceSettings,
    sender: &Sender<RunnerEvent>,
) -> Result<usize, TraceError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = LineBuffer::new();
    let mut chunk = [0u8; READ_CHUNK];
    let mut hop_count = 0;

    loop {
        let read = stdout.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        for line in buffer.push(&chunk[..read]) {
            if let Some(fact) = interpret_line(&line, settings.dialect) {
                hop_count += 1;
                let _ = sender.send(RunnerEvent::Hop(fact)).await;
            }
        }
    }

    if let Some(rest) = buffer.finish() {
        if let Some(fact) = interpret_line(&rest, settings.dialect) {
            hop_count += 1;
            let _ = sender.send(RunnerEvent::Hop(fact)).await;
        }
    }

    Ok(hop_count)
}

/// Forwards every stderr line as a diagnostic and returns the full text.
async fn forward_diagnostics<R>(stderr: R, sender: Sender<RunnerEvent>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    let mut collected = String::new();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim_end().to_string();
        if line.is_empty() {
            continue;
        }
        if !collected.is_empty() {
            collected.push('\n');
        }
        collected.push_str(&line);
        let _ = sender.send(RunnerEvent::Diagnostic(line)).await;
    }

    collected
}

/// Waits for the stderr reader, but never past the run deadline. A
/// descendant that inherited stderr can keep it open after the exit.
async fn drain_diagnostics(mut task: JoinHandle<String>, deadline: Instant) -> String {
    let limit = deadline.min(Instant::now() + STDERR_GRACE);
    match tokio::time::timeout_at(limit, &mut task).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            debug!("stderr still open after exit, giving up on it");
            task.abort();
            String::new()
        }
    }
}

/// Spawns the streaming runner and hands back its event channel.
pub fn stream_for_target(
    target: &str,
    settings: &TraceSettings,
    cancel: CancellationToken,
) -> Receiver<RunnerEvent> {
    let (tx, rx) = mpsc::channel(64);
    let target = target.to_string();
    let settings = settings.clone();
    tokio::spawn(async move {
        run_streaming(&target, &settings, tx, cancel).await;
    });
    rx
}
