//! Waiting for a workitem to reach a terminal state.
//!
//! The wait is bounded by wall-clock time, not by a number of polls. Each status
//! query carries its own bounded retry so that one dropped request does not end
//! the wait, and the caller can cancel at any point: in-flight queries and the
//! inter-poll sleep are abandoned.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::TokenCache;
use crate::endpoints::Endpoints;
use crate::error::{DaError, TransportError};
use crate::http::{HttpRequest, HttpResponse, HttpTransport};
use crate::job::{JobHandle, JobState, JobStatus};
use crate::progress::{self, JobProgressCallback, JobProgressEvent, JobProgressEventKind};
use crate::retry::RetryPolicy;

pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(600);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Floor applied to `poll_interval` so a zero interval cannot spin on the service.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Status codes worth asking again for; the status query is an idempotent GET.
const TRANSIENT_STATUS_CODES: &[u16] = &[429, 502, 503, 504];
const UNAUTHORIZED: u16 = 401;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub max_wait: Duration,
    pub poll_interval: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            max_wait: DEFAULT_MAX_WAIT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl PollOptions {
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[derive(Debug)]
enum QueryFailure {
    Transport(TransportError),
    Throttled(HttpResponse),
}

impl QueryFailure {
    fn is_transient(&self) -> bool {
        match self {
            QueryFailure::Transport(err) => err.is_transient(),
            QueryFailure::Throttled(_) => true,
        }
    }
}

impl fmt::Display for QueryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryFailure::Transport(err) => write!(f, "{err}"),
            QueryFailure::Throttled(response) => {
                write!(f, "HTTP {}: {}", response.status, response.text_snippet())
            }
        }
    }
}

#[derive(Clone)]
pub struct JobPoller {
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<TokenCache>,
    endpoints: Endpoints,
    timeout: Duration,
    retry: RetryPolicy,
    progress: Option<JobProgressCallback>,
}

impl JobPoller {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        tokens: Arc<TokenCache>,
        endpoints: Endpoints,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            tokens,
            endpoints,
            timeout,
            retry,
            progress: None,
        }
    }

    pub fn with_progress(mut self, callback: JobProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Fetch one status snapshot.
    ///
    /// A 401 answer drops the cached token and the query is reissued once with a
    /// fresh one.
    pub async fn query_status(&self, job_id: &str) -> Result<JobStatus, DaError> {
        let url = self.endpoints.workitem_url(job_id);
        let mut reauthenticated = false;

        loop {
            let credential = self.tokens.token().await?;
            let request = HttpRequest::get(&url, self.timeout).bearer(&credential);
            let transport = self.transport.as_ref();

            let response = self
                .retry
                .run(
                    "status query",
                    move || {
                        let request = request.clone();
                        async move {
                            match transport.send(request).await {
                                Ok(response) if TRANSIENT_STATUS_CODES.contains(&response.status) => {
                                    Err(QueryFailure::Throttled(response))
                                }
                                Ok(response) => Ok(response),
                                Err(err) => Err(QueryFailure::Transport(err)),
                            }
                        }
                    },
                    QueryFailure::is_transient,
                )
                .await
                .map_err(|failure| DaError::StatusUnavailable {
                    job_id: job_id.to_string(),
                    attempts: failure.attempts,
                    message: failure.error.to_string(),
                })?;

            if response.status == UNAUTHORIZED && !reauthenticated {
                warn!(job_id, "status query unauthorized, refreshing token");
                self.tokens.invalidate();
                reauthenticated = true;
                continue;
            }

            if !response.is_success() {
                return Err(DaError::StatusUnavailable {
                    job_id: job_id.to_string(),
                    attempts: 1,
                    message: format!("HTTP {}: {}", response.status, response.text_snippet()),
                });
            }

            return response
                .json::<JobStatus>()
                .map_err(|err| DaError::Protocol(format!("status of {job_id}: {err}")));
        }
    }

    /// Poll until the workitem succeeds, fails, is cancelled, or `options.max_wait`
    /// elapses. Never runs longer than `max_wait` plus one status round-trip.
    pub async fn wait_until_done(
        &self,
        handle: &JobHandle,
        options: PollOptions,
        cancel: &CancellationToken,
    ) -> Result<JobStatus, DaError> {
        let start = Instant::now();
        let interval = options.poll_interval.max(MIN_POLL_INTERVAL);
        let mut last_state: Option<JobState> = None;

        loop {
            let status = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancelled(handle, start)),
                status = self.query_status(&handle.id) => status?,
            };

            if last_state.as_ref() != Some(&status.state) {
                self.report_transition(handle, last_state.as_ref(), &status, start);
                last_state = Some(status.state.clone());
            }

            match &status.state {
                JobState::Success => return Ok(status),
                JobState::FailedInstructions | JobState::Failed(_) => {
                    return Err(DaError::JobExecution {
                        job_id: handle.id.clone(),
                        state: status.state.to_string(),
                        report_url: status.report_url.clone(),
                    });
                }
                JobState::Cancelled => {
                    return Err(DaError::JobCancelled {
                        job_id: handle.id.clone(),
                    });
                }
                JobState::Pending | JobState::InProgress | JobState::Unknown(_) => {}
            }

            let elapsed = start.elapsed();
            if elapsed >= options.max_wait {
                warn!(
                    job_id = %handle.id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    state = %status.state,
                    "workitem did not finish before the deadline"
                );
                return Err(DaError::JobTimeout {
                    job_id: handle.id.clone(),
                    elapsed,
                });
            }

            let pause = interval.min(options.max_wait - elapsed);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancelled(handle, start)),
                _ = sleep(pause) => {}
            }
        }
    }

    fn report_transition(
        &self,
        handle: &JobHandle,
        previous: Option<&JobState>,
        status: &JobStatus,
        start: Instant,
    ) {
        let elapsed = start.elapsed();
        if let JobState::Unknown(raw) = &status.state {
            warn!(job_id = %handle.id, state = %raw, "unrecognised workitem state, still waiting");
        }
        info!(
            job_id = %handle.id,
            from = previous.map(JobState::as_str).unwrap_or("none"),
            to = %status.state,
            elapsed_ms = elapsed.as_millis() as u64,
            "workitem state changed"
        );
        progress::emit(
            self.progress.as_ref(),
            JobProgressEvent {
                kind: JobProgressEventKind::StateChanged,
                job_id: handle.id.clone(),
                state: Some(status.state.to_string()),
                elapsed_ms: elapsed.as_secs_f64() * 1_000.0,
                message: status.progress.clone(),
            },
        );
    }

    fn cancelled(&self, handle: &JobHandle, start: Instant) -> DaError {
        info!(
            job_id = %handle.id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "polling cancelled by caller"
        );
        DaError::Cancelled {
            job_id: Some(handle.id.clone()),
        }
    }
}
