//! Background jobs and their event streams.
//!
//! Every job delivers zero or more non-decreasing `Progress` events, possibly
//! interleaved with `Stdout` lines, followed by exactly one terminal `Done` or
//! `Error`. The [`Reporter`] owned by the worker enforces that ordering;
//! nothing is sent after the terminal event.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

use tvault_common::{EngineError, EngineResult, ErrorCode, ErrorReport};
use tvault_container::{ContainerInfo, IssuedTokens, Operation, Stage, StageObserver};

/// Kind of a job, naming its event channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Encrypt,
    Decrypt,
    Reseal,
    Info,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Encrypt => "encrypt",
            JobKind::Decrypt => "decrypt",
            JobKind::Reseal => "reseal",
            JobKind::Info => "info",
        }
    }

    /// Channel name for `event`, e.g. `encrypt-progress`.
    pub fn event_name(self, event: &str) -> String {
        format!("{}-{}", self.as_str(), event)
    }

    fn operation(self) -> Option<Operation> {
        match self {
            JobKind::Encrypt => Some(Operation::Seal),
            JobKind::Decrypt => Some(Operation::Unseal),
            JobKind::Reseal => Some(Operation::Reseal),
            JobKind::Info => None,
        }
    }
}

/// Result of a container info lookup, tagged with the path asked about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoResult {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ContainerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

impl InfoResult {
    pub fn from_result(path: impl Into<String>, result: EngineResult<ContainerInfo>) -> Self {
        let path = path.into();
        match result {
            Ok(info) => Self {
                path,
                data: Some(info),
                error: None,
            },
            Err(e) => Self {
                path,
                data: None,
                error: Some(e.report()),
            },
        }
    }
}

/// Successful job output.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum JobOutput {
    /// Tokens issued by a seal.
    Tokens(IssuedTokens),
    /// Folder populated by an unseal.
    Folder { folder_path: String },
    /// Path written by a reseal, with tokens if it re-keyed.
    Resealed {
        path: String,
        #[serde(flatten)]
        tokens: Option<IssuedTokens>,
    },
    Info(ContainerInfo),
}

/// An event on a job's channel.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Progress(u8),
    /// A line the job writes for the caller, such as tokens sent to stdout.
    Stdout(String),
    Done(JobOutput),
    Error(ErrorReport),
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobEvent::Progress(_) | JobEvent::Stdout(_))
    }
}

/// A named event as the desktop bridge receives it.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeEvent {
    pub name: String,
    pub payload: Value,
}

impl BridgeEvent {
    fn new(kind: JobKind, event: &str, payload: Value) -> Self {
        Self {
            name: kind.event_name(event),
            payload,
        }
    }
}

/// Translate a job event into bridge events.
///
/// Terminal events are followed by `<kind>-done` carrying success. With a
/// `context` path, results and errors are wrapped as `{path, data}` and
/// `{path, error}`.
pub fn bridge_events(kind: JobKind, context: Option<&str>, event: &JobEvent) -> Vec<BridgeEvent> {
    let wrap = |key: &str, value: Value| match context {
        Some(path) => json!({ "path": path, key: value }),
        None => value,
    };
    match event {
        JobEvent::Progress(n) => vec![BridgeEvent::new(kind, "progress", json!(n))],
        JobEvent::Stdout(line) => vec![BridgeEvent::new(kind, "stdout", json!(line))],
        JobEvent::Done(output) => {
            let value = serde_json::to_value(output).unwrap_or(Value::Null);
            vec![
                BridgeEvent::new(kind, "result", wrap("data", value)),
                BridgeEvent::new(kind, "done", json!(true)),
            ]
        }
        JobEvent::Error(report) => {
            let value = serde_json::to_value(report).unwrap_or(Value::Null);
            vec![
                BridgeEvent::new(kind, "error", wrap("error", value)),
                BridgeEvent::new(kind, "done", json!(false)),
            ]
        }
    }
}

/// Sending side of a job channel.
#[derive(Debug)]
pub struct Reporter {
    kind: JobKind,
    tx: mpsc::UnboundedSender<JobEvent>,
    last: Option<u8>,
    finished: bool,
}

impl Reporter {
    fn new(kind: JobKind, tx: mpsc::UnboundedSender<JobEvent>) -> Self {
        Self {
            kind,
            tx,
            last: None,
            finished: false,
        }
    }

    /// Report progress. Decreases, repeats and anything after the terminal
    /// event are dropped.
    pub fn progress(&mut self, percent: u8) {
        let percent = percent.min(100);
        if self.finished || self.last.is_some_and(|last| percent <= last) {
            return;
        }
        self.last = Some(percent);
        // A closed receiver means nobody is listening any more.
        let _ = self.tx.send(JobEvent::Progress(percent));
    }

    /// Emit a line of caller-visible output. Dropped after the terminal event.
    pub fn stdout(&mut self, line: impl Into<String>) {
        if self.finished {
            return;
        }
        let _ = self.tx.send(JobEvent::Stdout(line.into()));
    }

    /// Send the terminal event. Only the first call has any effect.
    pub fn finish(&mut self, result: EngineResult<JobOutput>) {
        if self.finished {
            return;
        }
        self.finished = true;
        let event = match result {
            Ok(output) => {
                debug!(job = self.kind.as_str(), "Job finished");
                JobEvent::Done(output)
            }
            Err(e) => {
                error!(job = self.kind.as_str(), code = e.code().as_u16(), error = %e, "Job failed");
                JobEvent::Error(e.report())
            }
        };
        let _ = self.tx.send(event);
    }
}

impl StageObserver for Reporter {
    fn on_stage(&mut self, stage: Stage) {
        if let Some(op) = self.kind.operation() {
            debug!(job = self.kind.as_str(), stage = %stage, "Stage");
            self.progress(stage.percent(op));
        }
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(Err(ErrorCode::JobAborted.into()));
        }
    }
}

/// Receiving side of a job.
#[derive(Debug)]
pub struct JobHandle {
    kind: JobKind,
    context: Option<String>,
    rx: mpsc::UnboundedReceiver<JobEvent>,
}

/// Terminal event and everything before it.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub progress: Vec<u8>,
    pub stdout: Vec<String>,
    pub result: Result<JobOutput, ErrorReport>,
}

impl JobHandle {
    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Path the job's results are tagged with, if any.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Next event, or `None` once the channel is drained.
    pub async fn next(&mut self) -> Option<JobEvent> {
        self.rx.recv().await
    }

    /// Collect events until the terminal one.
    ///
    /// # Errors
    /// - `JobTimeout` if no terminal event arrives within `timeout`
    pub async fn wait(mut self, timeout: Duration) -> EngineResult<JobReport> {
        let mut progress = Vec::new();
        let mut stdout = Vec::new();
        let collect = async {
            while let Some(event) = self.rx.recv().await {
                match event {
                    JobEvent::Progress(n) => progress.push(n),
                    JobEvent::Stdout(line) => stdout.push(line),
                    JobEvent::Done(output) => return Ok(output),
                    JobEvent::Error(report) => return Err(report),
                }
            }
            Err(EngineError::new(ErrorCode::JobAborted).report())
        };
        let result = tokio::time::timeout(timeout, collect).await.map_err(|_| {
            EngineError::new(ErrorCode::JobTimeout)
                .with_details(format!("{} after {:?}", self.kind.as_str(), timeout))
        })?;
        Ok(JobReport {
            progress,
            stdout,
            result,
        })
    }
}

/// Run `work` on the blocking pool, streaming its events to the returned
/// handle.
///
/// A panic inside `work` ends the job with `JobAborted`.
pub fn spawn<F>(kind: JobKind, context: Option<String>, work: F) -> JobHandle
where
    F: FnOnce(&mut Reporter) -> EngineResult<JobOutput> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let mut reporter = Reporter::new(kind, tx);
    tokio::task::spawn_blocking(move || {
        let result = panic::catch_unwind(AssertUnwindSafe(|| work(&mut reporter)));
        match result {
            Ok(result) => reporter.finish(result),
            Err(_) => reporter.finish(Err(EngineError::new(ErrorCode::JobAborted)
                .with_details("worker panicked"))),
        }
    });
    JobHandle { kind, context, rx }
}
