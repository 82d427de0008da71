use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::TokenCache;
use crate::endpoints::Endpoints;
use crate::error::DaError;
use crate::http::{HttpRequest, HttpResponse, HttpTransport, redact_location};
use crate::job::{JobSpec, JobStatus};
use crate::progress::{self, JobProgressCallback, JobProgressEvent, JobProgressEventKind};

pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

/// Downloaded outputs keyed by argument name. Only ever handed out complete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactSet {
    artifacts: BTreeMap<String, Vec<u8>>,
}

impl ArtifactSet {
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.artifacts.get(name).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.artifacts.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.artifacts
            .iter()
            .map(|(name, bytes)| (name.as_str(), bytes.as_slice()))
    }

    pub fn total_bytes(&self) -> usize {
        self.artifacts.values().map(Vec::len).sum()
    }

    pub fn into_inner(self) -> BTreeMap<String, Vec<u8>> {
        self.artifacts
    }

    fn insert(&mut self, name: String, bytes: Vec<u8>) {
        self.artifacts.insert(name, bytes);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignedAccess {
    Read,
    Write,
    ReadWrite,
}

impl SignedAccess {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignedAccess::Read => "read",
            SignedAccess::Write => "write",
            SignedAccess::ReadWrite => "readwrite",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignedUrlResponse {
    signed_url: String,
}

/// Resolve which locations to download for a finished job.
///
/// Every declared output must have a location, taken from the final status or,
/// failing that, from the `JobSpec` itself. Undeclared arguments that the status
/// reports with a location are extra outputs and are fetched too; declared
/// inputs never are.
pub fn plan_downloads(
    spec: &JobSpec,
    status: &JobStatus,
) -> Result<Vec<(String, String)>, DaError> {
    let mut planned = Vec::new();
    let mut missing = Vec::new();

    for (name, argument) in spec.outputs() {
        match status.location_of(name).or_else(|| argument.location()) {
            Some(location) => planned.push((name.to_string(), location.to_string())),
            None => missing.push(name.to_string()),
        }
    }

    if !missing.is_empty() {
        return Err(DaError::IncompleteArtifacts {
            job_id: status.id.clone(),
            missing,
        });
    }

    for name in status.arguments.keys() {
        if spec.arguments().contains_key(name) {
            continue;
        }
        if let Some(location) = status.location_of(name) {
            planned.push((name.clone(), location.to_string()));
        }
    }

    Ok(planned)
}

/// Moves bytes to and from signed locations. Transfers use their own, much longer
/// timeout than control calls.
#[derive(Clone)]
pub struct ArtifactTransferer {
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<TokenCache>,
    endpoints: Endpoints,
    control_timeout: Duration,
    transfer_timeout: Duration,
    progress: Option<JobProgressCallback>,
}

impl ArtifactTransferer {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        tokens: Arc<TokenCache>,
        endpoints: Endpoints,
        control_timeout: Duration,
        transfer_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            tokens,
            endpoints,
            control_timeout,
            transfer_timeout,
            progress: None,
        }
    }

    pub fn with_progress(mut self, callback: JobProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    async fn exchange(&self, request: HttpRequest, location: &str) -> Result<HttpResponse, DaError> {
        let response = self
            .transport
            .send(request)
            .await
            .map_err(|err| DaError::Transfer {
                location: redact_location(location).to_string(),
                status: None,
                message: err.to_string(),
            })?;

        if !response.is_success() {
            return Err(DaError::Transfer {
                location: redact_location(location).to_string(),
                status: Some(response.status),
                message: response.text_snippet(),
            });
        }
        Ok(response)
    }

    pub async fn download(&self, location: &str) -> Result<Vec<u8>, DaError> {
        let request = HttpRequest::get(location, self.transfer_timeout);
        let response = self.exchange(request, location).await?;

        debug!(
            location = redact_location(location),
            bytes = response.body.len(),
            "download complete"
        );
        Ok(response.body)
    }

    pub async fn upload(&self, location: &str, content: Vec<u8>) -> Result<(), DaError> {
        let size = content.len();
        let request = HttpRequest::put(location, self.transfer_timeout)
            .header("Content-Type", "application/octet-stream")
            .bytes(content);
        self.exchange(request, location).await?;

        info!(location = redact_location(location), bytes = size, "upload complete");
        Ok(())
    }

    /// Ask object storage for a signed location for `bucket/object`.
    pub async fn signed_url(
        &self,
        bucket: &str,
        object: &str,
        access: SignedAccess,
    ) -> Result<String, DaError> {
        let credential = self.tokens.token().await?;
        let url = self
            .endpoints
            .signed_object_url(bucket, object, access.as_str());
        let request = HttpRequest::post(&url, self.control_timeout).bearer(&credential);
        let response = self.exchange(request, &url).await?;

        let body: SignedUrlResponse = response
            .json()
            .map_err(|err| DaError::Protocol(format!("signed url response: {err}")))?;
        Ok(body.signed_url)
    }

    /// Download every output of a finished job. Fails without downloading anything
    /// when a declared output has no location.
    pub async fn fetch_all(
        &self,
        spec: &JobSpec,
        status: &JobStatus,
    ) -> Result<ArtifactSet, DaError> {
        let planned = plan_downloads(spec, status).inspect_err(|err| {
            warn!(job_id = %status.id, error = %err, "outputs incomplete");
        })?;

        let started = Instant::now();
        let mut artifacts = ArtifactSet::default();
        for (name, location) in planned {
            let bytes = self.download(&location).await?;
            info!(job_id = %status.id, output = %name, bytes = bytes.len(), "output downloaded");
            progress::emit(
                self.progress.as_ref(),
                JobProgressEvent {
                    kind: JobProgressEventKind::Downloaded,
                    job_id: status.id.clone(),
                    state: Some(status.state.to_string()),
                    elapsed_ms: started.elapsed().as_secs_f64() * 1_000.0,
                    message: Some(format!("{name} ({} bytes)", bytes.len())),
                },
            );
            artifacts.insert(name, bytes);
        }

        Ok(artifacts)
    }
}
