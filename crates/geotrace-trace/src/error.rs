use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failures that end a trace session.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("{0}")]
    Validation(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("traceroute exited abnormally ({}){}", exit_label(.code), stderr_suffix(.stderr))]
    AbnormalExit { code: Option<i32>, stderr: String },

    #[error("traceroute did not finish within {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("traceroute output could not be read: {0}")]
    Io(#[from] io::Error),

    #[error("traceroute stopped without reporting an exit status")]
    Interrupted,

    #[error("trace cancelled")]
    Cancelled,
}

impl TraceError {
    pub fn validation(message: impl Into<String>) -> Self {
        TraceError::Validation(message.into())
    }

    /// Whether the caller, not the host, is to blame.
    pub fn is_client_error(&self) -> bool {
        matches!(self, TraceError::Validation(_))
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "terminated by signal".to_string(),
    }
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {trimmed}")
    }
}
