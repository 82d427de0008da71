//! Client core for running Design Automation workitems: credential caching,
//! submission, bounded polling and artifact transfer.

pub mod auth;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod http;
pub mod job;
pub mod logging;
pub mod orchestrator;
pub mod poll;
pub mod progress;
pub mod retry;
pub mod submit;
pub mod transfer;

pub use auth::{
    ClientCredentials, Credential, DEFAULT_SCOPE, RemoteAuthenticator, TOKEN_SAFETY_MARGIN,
    TokenCache,
};
pub use config::{
    ConfigError, ENV_CLIENT_ID, ENV_CLIENT_SECRET, FileSettings, Settings, Timeouts,
    config_directory, config_path, load_settings, load_settings_with, read_file_settings,
};
pub use endpoints::Endpoints;
pub use error::{AuthError, DaError, TransportError, TransportErrorKind};
pub use http::{
    HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport, RequestBody,
    redact_location,
};
pub use job::{
    AccessVerb, ActivityId, ArgumentDescriptor, JobHandle, JobSpec, JobState, JobStatus,
    StatusArgument,
};
pub use logging::{LoggingDestination, LoggingError, current_log_path, init_logging};
pub use orchestrator::{JobOrchestrator, run_workitem};
pub use poll::{
    DEFAULT_MAX_WAIT, DEFAULT_POLL_INTERVAL, JobPoller, MIN_POLL_INTERVAL, PollOptions,
};
pub use progress::{JobProgressCallback, JobProgressEvent, JobProgressEventKind};
pub use retry::{RetryError, RetryPolicy};
pub use submit::JobSubmitter;
pub use transfer::{ArtifactSet, ArtifactTransferer, SignedAccess, plan_downloads};

pub use tokio_util::sync::CancellationToken;
