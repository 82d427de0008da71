use std::sync::Arc;

use serde::Serialize;

/// Structured progress notification emitted while a job is submitted, polled and fetched.
#[derive(Debug, Clone, Serialize)]
pub struct JobProgressEvent {
    pub kind: JobProgressEventKind,
    pub job_id: String,
    pub state: Option<String>,
    pub elapsed_ms: f64,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobProgressEventKind {
    Submitted,
    StateChanged,
    Downloaded,
}

pub type JobProgressCallback = Arc<dyn Fn(JobProgressEvent) + Send + Sync>;

pub(crate) fn emit(callback: Option<&JobProgressCallback>, event: JobProgressEvent) {
    if let Some(cb) = callback {
        cb(event);
    }
}
