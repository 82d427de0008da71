//! Job descriptions, handles and status snapshots, plus their wire shapes.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::DaError;

/// Fully qualified activity identifier, e.g. `nickname.Activity+alias`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityId(String);

impl ActivityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn qualified(nickname: &str, activity: &str, alias: &str) -> Self {
        Self(format!("{nickname}.{activity}+{alias}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActivityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActivityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ActivityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessVerb {
    Get,
    Put,
}

/// One named argument binding of a workitem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgumentDescriptor {
    /// Read by the job from `location`.
    Input { location: String },
    /// Written by the job. An unassigned location is filled in by the service.
    Output { location: Option<String> },
}

impl ArgumentDescriptor {
    pub fn input(location: impl Into<String>) -> Self {
        ArgumentDescriptor::Input {
            location: location.into(),
        }
    }

    pub fn output() -> Self {
        ArgumentDescriptor::Output { location: None }
    }

    pub fn output_at(location: impl Into<String>) -> Self {
        ArgumentDescriptor::Output {
            location: Some(location.into()),
        }
    }

    pub fn verb(&self) -> AccessVerb {
        match self {
            ArgumentDescriptor::Input { .. } => AccessVerb::Get,
            ArgumentDescriptor::Output { .. } => AccessVerb::Put,
        }
    }

    pub fn location(&self) -> Option<&str> {
        match self {
            ArgumentDescriptor::Input { location } => Some(location),
            ArgumentDescriptor::Output { location } => location.as_deref(),
        }
    }

    pub fn is_output(&self) -> bool {
        matches!(self, ArgumentDescriptor::Output { .. })
    }
}

/// What to run and with which bindings. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    activity_id: ActivityId,
    arguments: BTreeMap<String, ArgumentDescriptor>,
}

impl JobSpec {
    pub fn new(activity_id: impl Into<ActivityId>) -> Self {
        Self {
            activity_id: activity_id.into(),
            arguments: BTreeMap::new(),
        }
    }

    pub fn with_argument(mut self, name: impl Into<String>, argument: ArgumentDescriptor) -> Self {
        self.arguments.insert(name.into(), argument);
        self
    }

    pub fn with_input(self, name: impl Into<String>, location: impl Into<String>) -> Self {
        self.with_argument(name, ArgumentDescriptor::input(location))
    }

    pub fn with_output(self, name: impl Into<String>) -> Self {
        self.with_argument(name, ArgumentDescriptor::output())
    }

    pub fn with_output_at(self, name: impl Into<String>, location: impl Into<String>) -> Self {
        self.with_argument(name, ArgumentDescriptor::output_at(location))
    }

    /// Input carried inline as a `data:` URI holding a JSON document.
    pub fn with_inline_json(self, name: impl Into<String>, document: &serde_json::Value) -> Self {
        let location = format!("data:application/json,{document}");
        self.with_input(name, location)
    }

    /// Build a spec from the wire form of the argument map
    /// (`{name: {"url": ..., "verb": "get"|"put"}}`).
    pub fn from_arguments_json(
        activity_id: impl Into<ActivityId>,
        raw: &str,
    ) -> Result<Self, DaError> {
        let wire: BTreeMap<String, OwnedWireArgument> = serde_json::from_str(raw)
            .map_err(|err| DaError::Config(format!("invalid argument map: {err}")))?;

        let mut spec = JobSpec::new(activity_id);
        for (name, argument) in wire {
            let descriptor = match argument.verb {
                AccessVerb::Get => {
                    let location = argument.url.filter(|url| !url.trim().is_empty()).ok_or_else(
                        || DaError::Config(format!("input argument '{name}' has no url")),
                    )?;
                    ArgumentDescriptor::Input { location }
                }
                AccessVerb::Put => ArgumentDescriptor::Output {
                    location: argument.url.filter(|url| !url.trim().is_empty()),
                },
            };
            spec.arguments.insert(name, descriptor);
        }
        Ok(spec)
    }

    pub fn activity_id(&self) -> &ActivityId {
        &self.activity_id
    }

    pub fn arguments(&self) -> &BTreeMap<String, ArgumentDescriptor> {
        &self.arguments
    }

    pub fn outputs(&self) -> impl Iterator<Item = (&str, &ArgumentDescriptor)> {
        self.arguments
            .iter()
            .filter(|(_, argument)| argument.is_output())
            .map(|(name, argument)| (name.as_str(), argument))
    }

    pub(crate) fn to_envelope(&self) -> WorkItemRequest<'_> {
        WorkItemRequest {
            activity_id: self.activity_id.as_str(),
            arguments: self
                .arguments
                .iter()
                .map(|(name, argument)| {
                    (
                        name.as_str(),
                        WireArgument {
                            url: argument.location(),
                            verb: argument.verb(),
                        },
                    )
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WorkItemRequest<'a> {
    activity_id: &'a str,
    arguments: BTreeMap<&'a str, WireArgument<'a>>,
}

#[derive(Debug, Serialize)]
struct WireArgument<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
    verb: AccessVerb,
}

#[derive(Debug, Deserialize)]
struct OwnedWireArgument {
    #[serde(default)]
    url: Option<String>,
    verb: AccessVerb,
}

/// Handle to one submitted workitem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub id: String,
    pub submitted_at: DateTime<Utc>,
}

/// Remote workitem state as last observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    InProgress,
    Success,
    FailedInstructions,
    Cancelled,
    /// Any other `failed*` state reported by the service (download, upload, limits).
    Failed(String),
    /// Not recognised; treated as still running.
    Unknown(String),
}

impl JobState {
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "pending" => JobState::Pending,
            "inprogress" => JobState::InProgress,
            "success" => JobState::Success,
            "failedinstructions" => JobState::FailedInstructions,
            "cancelled" => JobState::Cancelled,
            other if other.starts_with("failed") => JobState::Failed(raw.trim().to_string()),
            _ => JobState::Unknown(raw.trim().to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Success
                | JobState::FailedInstructions
                | JobState::Cancelled
                | JobState::Failed(_)
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobState::Pending => "pending",
            JobState::InProgress => "inprogress",
            JobState::Success => "success",
            JobState::FailedInstructions => "failedInstructions",
            JobState::Cancelled => "cancelled",
            JobState::Failed(raw) | JobState::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for JobState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(JobState::parse(&raw))
    }
}

/// Argument as echoed back in a status response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StatusArgument {
    #[serde(default)]
    pub url: Option<String>,
}

/// One status snapshot of a workitem. Never cached beyond the poll that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub id: String,
    #[serde(rename = "status")]
    pub state: JobState,
    #[serde(default)]
    pub report_url: Option<String>,
    #[serde(default)]
    pub progress: Option<String>,
    #[serde(default, deserialize_with = "object_arguments")]
    pub arguments: BTreeMap<String, StatusArgument>,
}

impl JobStatus {
    /// Location reported for `name`, ignoring empty strings.
    pub fn location_of(&self, name: &str) -> Option<&str> {
        self.arguments
            .get(name)
            .and_then(|argument| argument.url.as_deref())
            .filter(|url| !url.trim().is_empty())
    }
}

// Non-object entries carry no location; drop them instead of failing the whole snapshot.
fn object_arguments<'de, D>(deserializer: D) -> Result<BTreeMap<String, StatusArgument>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, serde_json::Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter(|(_, value)| value.is_object())
        .filter_map(|(name, value)| {
            serde_json::from_value::<StatusArgument>(value)
                .ok()
                .map(|argument| (name, argument))
        })
        .collect())
}
