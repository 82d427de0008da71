//! End-to-end run of one workitem: submit, wait, fetch.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::{RemoteAuthenticator, TokenCache};
use crate::config::Settings;
use crate::endpoints::Endpoints;
use crate::error::DaError;
use crate::http::{HttpTransport, ReqwestTransport};
use crate::job::{JobSpec, JobStatus};
use crate::poll::{JobPoller, PollOptions};
use crate::progress::{self, JobProgressCallback, JobProgressEvent, JobProgressEventKind};
use crate::retry::RetryPolicy;
use crate::submit::JobSubmitter;
use crate::transfer::{ArtifactSet, ArtifactTransferer};

/// Composes the submitter, poller and transferer over one shared token cache.
#[derive(Clone)]
pub struct JobOrchestrator {
    tokens: Arc<TokenCache>,
    submitter: JobSubmitter,
    poller: JobPoller,
    transferer: ArtifactTransferer,
    progress: Option<JobProgressCallback>,
}

impl JobOrchestrator {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        tokens: Arc<TokenCache>,
        endpoints: Endpoints,
        control_timeout: Duration,
        transfer_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        let submitter = JobSubmitter::new(
            transport.clone(),
            tokens.clone(),
            endpoints.clone(),
            control_timeout,
            retry,
        );
        let poller = JobPoller::new(
            transport.clone(),
            tokens.clone(),
            endpoints.clone(),
            control_timeout,
            retry,
        );
        let transferer = ArtifactTransferer::new(
            transport,
            tokens.clone(),
            endpoints,
            control_timeout,
            transfer_timeout,
        );
        Self {
            tokens,
            submitter,
            poller,
            transferer,
            progress: None,
        }
    }

    /// Build an orchestrator talking to the real service.
    pub fn from_settings(settings: &Settings) -> Result<Self, DaError> {
        let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new()?);
        let authenticator = RemoteAuthenticator::new(
            transport.clone(),
            settings.endpoints.token_url(),
            settings.credentials.clone(),
        )
        .with_scope(settings.scope.clone())
        .with_timeout(settings.timeouts.control)
        .with_retry(settings.retry);
        let tokens = Arc::new(TokenCache::new(authenticator));

        Ok(Self::new(
            transport,
            tokens,
            settings.endpoints.clone(),
            settings.timeouts.control,
            settings.timeouts.transfer,
            settings.retry,
        ))
    }

    pub fn with_progress(mut self, callback: JobProgressCallback) -> Self {
        self.poller = self.poller.with_progress(callback.clone());
        self.transferer = self.transferer.with_progress(callback.clone());
        self.progress = Some(callback);
        self
    }

    pub fn tokens(&self) -> &Arc<TokenCache> {
        &self.tokens
    }

    pub fn submitter(&self) -> &JobSubmitter {
        &self.submitter
    }

    pub fn poller(&self) -> &JobPoller {
        &self.poller
    }

    pub fn transferer(&self) -> &ArtifactTransferer {
        &self.transferer
    }

    /// Submit `spec`, wait for it to finish and download every output.
    ///
    /// Artifacts are only returned when the workitem succeeded and every declared
    /// output was fetched. Cancellation while waiting for a token ends the run
    /// before anything is created; a submission already on the wire is allowed to
    /// finish, so the returned error names the job.
    pub async fn run_to_completion(
        &self,
        spec: &JobSpec,
        options: PollOptions,
        cancel: &CancellationToken,
    ) -> Result<(JobStatus, ArtifactSet), DaError> {
        let handle = self.submitter.submit_until_cancelled(spec, cancel).await?;
        progress::emit(
            self.progress.as_ref(),
            JobProgressEvent {
                kind: JobProgressEventKind::Submitted,
                job_id: handle.id.clone(),
                state: None,
                elapsed_ms: 0.0,
                message: Some(spec.activity_id().to_string()),
            },
        );

        let status = self
            .poller
            .wait_until_done(&handle, options, cancel)
            .await
            .inspect_err(|err| warn!(job_id = %handle.id, error = %err, "workitem did not succeed"))?;

        let artifacts = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(DaError::Cancelled { job_id: Some(handle.id.clone()) });
            }
            artifacts = self.transferer.fetch_all(spec, &status) => artifacts?,
        };

        info!(
            job_id = %handle.id,
            outputs = artifacts.len(),
            bytes = artifacts.total_bytes(),
            "workitem complete"
        );
        Ok((status, artifacts))
    }
}

/// One-shot helper: build an orchestrator from `settings` and run `spec`.
pub async fn run_workitem(
    settings: &Settings,
    spec: &JobSpec,
    options: PollOptions,
    cancel: &CancellationToken,
) -> Result<(JobStatus, ArtifactSet), DaError> {
    JobOrchestrator::from_settings(settings)?
        .run_to_completion(spec, options, cancel)
        .await
}
