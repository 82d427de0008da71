use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::TokenCache;
use crate::endpoints::Endpoints;
use crate::error::{DaError, TransportError};
use crate::http::{HttpRequest, HttpTransport};
use crate::job::{JobHandle, JobSpec, JobState};
use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize)]
struct WorkItemCreated {
    id: String,
    #[serde(default)]
    status: Option<JobState>,
}

#[derive(Debug)]
enum SendFailure {
    Transport(TransportError),
    Cancelled,
}

impl SendFailure {
    fn is_connect(&self) -> bool {
        matches!(self, SendFailure::Transport(err) if err.is_connect())
    }
}

impl fmt::Display for SendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendFailure::Transport(err) => write!(f, "{err}"),
            SendFailure::Cancelled => f.write_str("cancelled before sending"),
        }
    }
}

/// Posts workitems. Creation is not idempotent on the service side, so only
/// failures where the request never left this host are retried.
#[derive(Clone)]
pub struct JobSubmitter {
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<TokenCache>,
    endpoints: Endpoints,
    timeout: Duration,
    retry: RetryPolicy,
}

impl JobSubmitter {
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
        }
    }

    pub async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, DaError> {
        self.submit_until_cancelled(spec, &CancellationToken::new()).await
    }

    /// Submit `spec`, giving up with `Cancelled` if `cancel` fires while waiting
    /// for a token or between attempts. A POST already on the wire runs to its
    /// answer so a created workitem is never lost.
    pub async fn submit_until_cancelled(
        &self,
        spec: &JobSpec,
        cancel: &CancellationToken,
    ) -> Result<JobHandle, DaError> {
        let credential = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DaError::Cancelled { job_id: None }),
            credential = self.tokens.token() => credential?,
        };

        let envelope = serde_json::to_value(spec.to_envelope())
            .map_err(|err| DaError::Protocol(format!("failed to encode workitem: {err}")))?;
        let request = HttpRequest::post(self.endpoints.workitems_url(), self.timeout)
            .bearer(&credential)
            .json(envelope);
        let transport = self.transport.as_ref();

        let response = self
            .retry
            .run_until_cancelled(
                "workitem submission",
                cancel,
                move || {
                    let request = request.clone();
                    let cancelled = cancel.is_cancelled();
                    async move {
                        if cancelled {
                            return Err(SendFailure::Cancelled);
                        }
                        transport.send(request).await.map_err(SendFailure::Transport)
                    }
                },
                SendFailure::is_connect,
            )
            .await
            .map_err(|failure| match failure.error {
                SendFailure::Cancelled => DaError::Cancelled { job_id: None },
                SendFailure::Transport(err) => DaError::Submission {
                    status: None,
                    body: format!("{err} (after {} attempt(s))", failure.attempts),
                },
            })?;

        if !response.is_success() {
            warn!(
                status = response.status,
                activity = %spec.activity_id(),
                "workitem rejected"
            );
            return Err(DaError::Submission {
                status: Some(response.status),
                body: response.text_snippet(),
            });
        }

        let created: WorkItemCreated = response
            .json()
            .map_err(|err| DaError::Protocol(format!("workitem creation response: {err}")))?;
        if created.id.trim().is_empty() {
            return Err(DaError::Protocol(
                "workitem creation response carried an empty id".to_string(),
            ));
        }

        info!(
            job_id = %created.id,
            activity = %spec.activity_id(),
            status = created.status.as_ref().map(JobState::as_str).unwrap_or("unknown"),
            "workitem created"
        );

        Ok(JobHandle {
            id: created.id,
            submitted_at: Utc::now(),
        })
    }
}
