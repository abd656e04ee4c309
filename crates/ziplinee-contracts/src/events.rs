//! Wire bodies sent to the control plane.

use crate::config::{BotConfig, BuildConfig, GitConfig, JobType, ReleaseConfig};
use crate::log::BuildLogStep;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Which lifecycle transition a builder event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum BuildEventType {
    UpdateStatus,
    Clean,
}

/// Body POSTed to the builder events endpoint for Started, Finished and
/// Cleaned transitions.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZiplineeCiBuilderEvent {
    pub build_event_type: BuildEventType,
    pub job_type: JobType,
    #[serde(default)]
    pub build: Option<BuildConfig>,
    #[serde(default)]
    pub release: Option<ReleaseConfig>,
    #[serde(default)]
    pub bot: Option<BotConfig>,
    #[serde(default)]
    pub git: Option<GitConfig>,
    pub job_name: String,
    #[serde(default)]
    pub pod_name: String,
    pub status: String,
}

/// Log envelope for release runs; step payload identical to a build log.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseLog {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub repo_source: String,
    #[serde(default)]
    pub repo_owner: String,
    #[serde(default)]
    pub repo_name: String,
    pub release_id: String,
    #[serde(default)]
    pub steps: Vec<BuildLogStep>,
}

/// Log envelope for bot runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BotLog {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub repo_source: String,
    #[serde(default)]
    pub repo_owner: String,
    #[serde(default)]
    pub repo_name: String,
    pub bot_id: String,
    #[serde(default)]
    pub steps: Vec<BuildLogStep>,
}
