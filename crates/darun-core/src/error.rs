use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// How a single HTTP exchange failed before any response was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The connection could not be established; the request never reached the service.
    Connect,
    /// The request or the response body exceeded its timeout.
    Timeout,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportErrorKind::Connect => "connect error",
            TransportErrorKind::Timeout => "timed out",
            TransportErrorKind::Other => "transport error",
        };
        f.write_str(label)
    }
}

/// Network-level failure. Only used to drive the bounded retries; it is mapped to a
/// call-site error before leaving the retry boundary.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::Connect | TransportErrorKind::Timeout
        )
    }

    pub fn is_connect(&self) -> bool {
        self.kind == TransportErrorKind::Connect
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_connect() {
            TransportErrorKind::Connect
        } else if err.is_timeout() {
            TransportErrorKind::Timeout
        } else {
            TransportErrorKind::Other
        };
        // reqwest includes the full URL, which may carry a signature
        let err = err.without_url();
        TransportError::new(kind, err.to_string())
    }
}

/// Credential exchange failures. `Clone` so that every caller joined on one refresh
/// receives the same outcome.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("token endpoint rejected the client credentials (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("token endpoint returned a malformed body: {0}")]
    Malformed(String),
    #[error("token endpoint unreachable after {attempts} attempt(s): {message}")]
    Unreachable { attempts: u32, message: String },
}

/// Every failure a job run can surface to its caller.
#[derive(Debug, Error)]
pub enum DaError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("workitem submission rejected ({}): {body}", describe_status(.status))]
    Submission { status: Option<u16>, body: String },
    #[error("workitem {job_id} finished with {state} (report: {})", .report_url.as_deref().unwrap_or("none"))]
    JobExecution {
        job_id: String,
        state: String,
        report_url: Option<String>,
    },
    #[error("workitem {job_id} was cancelled by the service")]
    JobCancelled { job_id: String },
    #[error("workitem {job_id} still running after {:.1}s", .elapsed.as_secs_f64())]
    JobTimeout { job_id: String, elapsed: Duration },
    #[error("workitem {job_id} succeeded but outputs have no location: {}", .missing.join(", "))]
    IncompleteArtifacts { job_id: String, missing: Vec<String> },
    #[error("run cancelled by caller{}", .job_id.as_deref().map(|id| format!(" while waiting on {id}")).unwrap_or_default())]
    Cancelled { job_id: Option<String> },
    #[error("status of workitem {job_id} unavailable after {attempts} attempt(s): {message}")]
    StatusUnavailable {
        job_id: String,
        attempts: u32,
        message: String,
    },
    #[error("transfer of {location} failed ({}): {message}", describe_status(.status))]
    Transfer {
        location: String,
        status: Option<u16>,
        message: String,
    },
    #[error("unexpected service response: {0}")]
    Protocol(String),
    #[error("configuration error: {0}")]
    Config(String),
}

fn describe_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!("HTTP {code}"),
        None => "no response".to_string(),
    }
}

impl DaError {
    /// The workitem the error refers to, when one had been created.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            DaError::JobExecution { job_id, .. }
            | DaError::JobCancelled { job_id }
            | DaError::JobTimeout { job_id, .. }
            | DaError::IncompleteArtifacts { job_id, .. }
            | DaError::StatusUnavailable { job_id, .. } => Some(job_id),
            DaError::Cancelled { job_id } => job_id.as_deref(),
            _ => None,
        }
    }

    /// Whether a caller may reasonably resubmit by hand. Nothing here is retried
    /// automatically.
    pub fn is_retryable_by_caller(&self) -> bool {
        match self {
            DaError::Auth(AuthError::Unreachable { .. }) => true,
            DaError::Submission { status, .. } => match status {
                None => true,
                Some(code) => *code == 429 || *code >= 500,
            },
            DaError::StatusUnavailable { .. } | DaError::Transfer { .. } => true,
            _ => false,
        }
    }
}
