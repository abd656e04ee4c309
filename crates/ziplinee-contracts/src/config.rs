//! Builder configuration passed in by the control plane.
//!
//! The config parameterizes a single run: what to build, which credentials
//! are available, which images are trusted, and where to report results.

use crate::manifest::{ZiplineeEvent, ZiplineeManifest};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The kind of job this run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Build,
    Release,
    Bot,
}

impl Default for JobType {
    fn default() -> Self {
        JobType::Build
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuilderConfig {
    #[serde(default)]
    pub job_type: JobType,
    #[serde(default)]
    pub job_name: Option<String>,

    #[serde(default)]
    pub build: Option<BuildConfig>,
    #[serde(default)]
    pub release: Option<ReleaseConfig>,
    #[serde(default)]
    pub bot: Option<BotConfig>,

    #[serde(default)]
    pub git: Option<GitConfig>,
    #[serde(default)]
    pub version: Option<BuildVersionConfig>,
    #[serde(default)]
    pub manifest: Option<ZiplineeManifest>,

    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
    #[serde(default)]
    pub trusted_images: Vec<TrustedImageConfig>,

    #[serde(default)]
    pub ci_server: Option<CiServerConfig>,

    /// Trigger occurrences that led to this run, in order.
    #[serde(default)]
    pub events: Vec<ZiplineeEvent>,
}

impl BuilderConfig {
    /// Stages to run for this job type: build stages, the targeted release's
    /// stages, or the targeted bot's stages.
    pub fn stages(&self) -> Vec<&crate::manifest::ZiplineeStage> {
        let Some(manifest) = &self.manifest else {
            return Vec::new();
        };

        match self.job_type {
            JobType::Build => manifest.stages.iter().collect(),
            JobType::Release => {
                let name = self.release.as_ref().map(|r| r.name.as_str());
                manifest
                    .releases
                    .iter()
                    .find(|r| Some(r.name.as_str()) == name)
                    .map(|r| r.stages.iter().collect())
                    .unwrap_or_default()
            }
            JobType::Bot => {
                let name = self.bot.as_ref().map(|b| b.name.as_str());
                manifest
                    .bots
                    .iter()
                    .find(|b| Some(b.name.as_str()) == name)
                    .map(|b| b.stages.iter().collect())
                    .unwrap_or_default()
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub action: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BotConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitConfig {
    #[serde(default)]
    pub repo_source: String,
    #[serde(default)]
    pub repo_owner: String,
    #[serde(default)]
    pub repo_name: String,
    #[serde(default)]
    pub repo_branch: String,
    #[serde(default)]
    pub repo_revision: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildVersionConfig {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub major: Option<i32>,
    #[serde(default)]
    pub minor: Option<i32>,
    /// Patch component, allocated by the control plane per revision.
    #[serde(default)]
    pub auto_increment: Option<i32>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub current_counter: i32,
    #[serde(default)]
    pub max_counter: i32,
    #[serde(default)]
    pub max_counter_current_branch: i32,
}

/// A named credential with decrypted properties.
///
/// Properties are free-form; their shape depends on the credential type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CredentialConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub credential_type: String,
    #[serde(flatten)]
    pub additional_properties: HashMap<String, serde_json::Value>,
}

/// Capabilities granted to images under a path prefix.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrustedImageConfig {
    /// Image path prefix, e.g. `extensions/git-clone`.
    pub path: String,
    #[serde(default)]
    pub run_docker: bool,
    #[serde(default)]
    pub run_privileged: bool,
    #[serde(default)]
    pub allow_commands: bool,
    #[serde(default)]
    pub injected_credential_types: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CiServerConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub builder_events_url: String,
    #[serde(default)]
    pub post_logs_url: String,
    #[serde(default)]
    pub cancel_job_url: String,
    #[serde(default)]
    pub jwt: String,
    #[serde(default)]
    pub jwt_expiry: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_minimal_config() {
        let json = r#"{
            "jobType": "build",
            "jobName": "build-github-com-ziplineeci-ziplinee-ci-builder-123",
            "git": {
                "repoSource": "github.com",
                "repoOwner": "ziplineeci",
                "repoName": "ziplinee-ci-builder",
                "repoBranch": "main",
                "repoRevision": "0ab1c2"
            }
        }"#;

        let config: BuilderConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.job_type, JobType::Build);
        assert_eq!(config.git.unwrap().repo_owner, "ziplineeci");
        assert!(config.credentials.is_empty());
    }

    #[test]
    fn deserializes_credential_with_additional_properties() {
        let json = r#"{
            "name": "github-api-token",
            "type": "github-api-token",
            "token": "abcd"
        }"#;

        let credential: CredentialConfig = serde_json::from_str(json).unwrap();

        assert_eq!(credential.credential_type, "github-api-token");
        assert_eq!(
            credential.additional_properties.get("token").unwrap(),
            "abcd"
        );
    }

    #[test]
    fn release_job_selects_release_stages() {
        let manifest: ZiplineeManifest = serde_yaml::from_str(
            r#"
stages:
  build:
    image: alpine:3
    commands:
    - echo build
releases:
  production:
    stages:
      deploy:
        image: alpine:3
        commands:
        - echo deploy
"#,
        )
        .unwrap();

        let config = BuilderConfig {
            job_type: JobType::Release,
            release: Some(ReleaseConfig {
                id: "5".into(),
                name: "production".into(),
                action: "".into(),
            }),
            manifest: Some(manifest),
            ..Default::default()
        };

        let stages = config.stages();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].name, "deploy");
    }
}
