//! The parsed `.ziplinee.yaml` manifest model.
//!
//! Stages, releases and bots are authored as ordered maps keyed by name; the
//! deserializer preserves declaration order and injects the key as the name.

use schemars::JsonSchema;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZiplineeManifest {
    #[serde(default)]
    pub builder: BuilderPreferences,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Environment variables applied to every stage.
    #[serde(default, rename = "env")]
    pub global_env: HashMap<String, String>,
    /// Trigger definitions; interpreted by the control plane, carried here so
    /// the full manifest round-trips through the builder config.
    #[serde(default)]
    pub triggers: Vec<serde_json::Value>,
    #[serde(
        default,
        deserialize_with = "named_stages",
        serialize_with = "stages_as_map"
    )]
    pub stages: Vec<ZiplineeStage>,
    /// Services with a run-scoped lifetime, started before the first stage.
    #[serde(
        default,
        deserialize_with = "named_services",
        serialize_with = "services_as_map"
    )]
    pub services: Vec<ZiplineeService>,
    #[serde(
        default,
        deserialize_with = "named_releases",
        serialize_with = "releases_as_map"
    )]
    pub releases: Vec<ZiplineeRelease>,
    #[serde(
        default,
        deserialize_with = "named_bots",
        serialize_with = "bots_as_map"
    )]
    pub bots: Vec<ZiplineeBot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuilderPreferences {
    #[serde(default = "default_track")]
    pub track: String,
    #[serde(default, rename = "type")]
    pub builder_type: BuilderType,
}

impl Default for BuilderPreferences {
    fn default() -> Self {
        BuilderPreferences {
            track: default_track(),
            builder_type: BuilderType::default(),
        }
    }
}

fn default_track() -> String {
    "stable".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BuilderType {
    Docker,
    Kubernetes,
}

impl Default for BuilderType {
    fn default() -> Self {
        BuilderType::Docker
    }
}

/// A named unit of work executed in a single container.
///
/// A stage carries either commands or nested parallel stages, never both.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZiplineeStage {
    #[serde(skip)]
    pub name: String,
    #[serde(default, rename = "image")]
    pub container_image: String,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_work_dir", rename = "workDir")]
    pub working_directory: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default = "default_when")]
    pub when: String,
    #[serde(default, rename = "env")]
    pub environment_variables: HashMap<String, String>,
    #[serde(default)]
    pub retries: u32,
    #[serde(
        default,
        deserialize_with = "named_services",
        serialize_with = "services_as_map"
    )]
    pub services: Vec<ZiplineeService>,
    #[serde(
        default,
        deserialize_with = "named_stages",
        serialize_with = "stages_as_map"
    )]
    pub parallel_stages: Vec<ZiplineeStage>,
    #[serde(default)]
    pub auto_injected: bool,
}

impl Default for ZiplineeStage {
    fn default() -> Self {
        ZiplineeStage {
            name: String::new(),
            container_image: String::new(),
            shell: default_shell(),
            working_directory: default_work_dir(),
            commands: Vec::new(),
            when: default_when(),
            environment_variables: HashMap::new(),
            retries: 0,
            services: Vec::new(),
            parallel_stages: Vec::new(),
            auto_injected: false,
        }
    }
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_work_dir() -> String {
    "/ziplinee-work".to_string()
}

fn default_when() -> String {
    "status == 'succeeded'".to_string()
}

/// A sidecar container bound to a stage (or, at manifest top level, to the
/// entire run).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZiplineeService {
    #[serde(skip)]
    pub name: String,
    #[serde(default, rename = "image")]
    pub container_image: String,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default, rename = "env")]
    pub environment_variables: HashMap<String, String>,
    #[serde(default, rename = "readiness")]
    pub readiness_probe: Option<ReadinessProbe>,
}

impl Default for ZiplineeService {
    fn default() -> Self {
        ZiplineeService {
            name: String::new(),
            container_image: String::new(),
            shell: default_shell(),
            commands: Vec::new(),
            environment_variables: HashMap::new(),
            readiness_probe: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessProbe {
    #[serde(default = "default_probe_scheme")]
    pub scheme: String,
    /// Defaults to the service name when empty.
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_probe_port")]
    pub port: u16,
    #[serde(default = "default_probe_path")]
    pub path: String,
    /// Overrides the HTTP Host header sent by the probe.
    #[serde(default)]
    pub hostname: String,
    #[serde(default = "default_probe_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        ReadinessProbe {
            scheme: default_probe_scheme(),
            host: String::new(),
            port: default_probe_port(),
            path: default_probe_path(),
            hostname: String::new(),
            timeout_seconds: default_probe_timeout(),
        }
    }
}

fn default_probe_scheme() -> String {
    "http".to_string()
}

fn default_probe_port() -> u16 {
    80
}

fn default_probe_path() -> String {
    "/".to_string()
}

fn default_probe_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZiplineeRelease {
    #[serde(skip)]
    pub name: String,
    #[serde(
        default,
        deserialize_with = "named_stages",
        serialize_with = "stages_as_map"
    )]
    pub stages: Vec<ZiplineeStage>,
    #[serde(default)]
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZiplineeBot {
    #[serde(skip)]
    pub name: String,
    #[serde(
        default,
        deserialize_with = "named_stages",
        serialize_with = "stages_as_map"
    )]
    pub stages: Vec<ZiplineeStage>,
}

/// Names carried as map keys in the manifest source.
trait Named {
    fn set_name(&mut self, name: String);
    fn name(&self) -> &str;
}

impl Named for ZiplineeStage {
    fn set_name(&mut self, name: String) {
        self.name = name;
    }
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for ZiplineeService {
    fn set_name(&mut self, name: String) {
        self.name = name;
    }
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for ZiplineeRelease {
    fn set_name(&mut self, name: String) {
        self.name = name;
    }
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for ZiplineeBot {
    fn set_name(&mut self, name: String) {
        self.name = name;
    }
    fn name(&self) -> &str {
        &self.name
    }
}

fn named_entries<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Named,
{
    struct NamedMapVisitor<T>(PhantomData<T>);

    impl<'de, T: Deserialize<'de> + Named> Visitor<'de> for NamedMapVisitor<T> {
        type Value = Vec<T>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map of named entries")
        }

        fn visit_map<M: MapAccess<'de>>(self, mut access: M) -> Result<Self::Value, M::Error> {
            let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
            while let Some((name, mut entry)) = access.next_entry::<String, T>()? {
                entry.set_name(name);
                entries.push(entry);
            }
            Ok(entries)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }
    }

    deserializer.deserialize_map(NamedMapVisitor(PhantomData))
}

fn entries_as_map<S, T>(entries: &[T], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: Serialize + Named,
{
    let mut map = serializer.serialize_map(Some(entries.len()))?;
    for entry in entries {
        map.serialize_entry(entry.name(), entry)?;
    }
    map.end()
}

fn named_stages<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<ZiplineeStage>, D::Error> {
    named_entries(d)
}

fn named_services<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<ZiplineeService>, D::Error> {
    named_entries(d)
}

fn named_releases<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<ZiplineeRelease>, D::Error> {
    named_entries(d)
}

fn named_bots<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<ZiplineeBot>, D::Error> {
    named_entries(d)
}

fn stages_as_map<S: Serializer>(v: &[ZiplineeStage], s: S) -> Result<S::Ok, S::Error> {
    entries_as_map(v, s)
}

fn services_as_map<S: Serializer>(v: &[ZiplineeService], s: S) -> Result<S::Ok, S::Error> {
    entries_as_map(v, s)
}

fn releases_as_map<S: Serializer>(v: &[ZiplineeRelease], s: S) -> Result<S::Ok, S::Error> {
    entries_as_map(v, s)
}

fn bots_as_map<S: Serializer>(v: &[ZiplineeBot], s: S) -> Result<S::Ok, S::Error> {
    entries_as_map(v, s)
}

/// One trigger occurrence that led to (or is referenced by) this run.
///
/// Exactly one of the kind fields is set per event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZiplineeEvent {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub fired: bool,
    #[serde(default)]
    pub pipeline: Option<ZiplineePipelineEvent>,
    #[serde(default)]
    pub release: Option<ZiplineeReleaseEvent>,
    #[serde(default)]
    pub git: Option<ZiplineeGitEvent>,
    #[serde(default)]
    pub docker: Option<ZiplineeDockerEvent>,
    #[serde(default)]
    pub cron: Option<ZiplineeCronEvent>,
    #[serde(default)]
    pub pubsub: Option<ZiplineePubSubEvent>,
    #[serde(default)]
    pub github: Option<ZiplineeGithubEvent>,
    #[serde(default)]
    pub bitbucket: Option<ZiplineeBitbucketEvent>,
    #[serde(default)]
    pub manual: Option<ZiplineeManualEvent>,
}

impl ZiplineeEvent {
    /// Projects the set kind into `(KIND, [(FIELD, value)])` pairs with
    /// upper-snake names ready for env variable construction.
    pub fn projections(&self) -> Vec<(&'static str, Vec<(&'static str, String)>)> {
        let mut out = Vec::new();
        if let Some(e) = &self.pipeline {
            out.push(("PIPELINE", e.fields()));
        }
        if let Some(e) = &self.release {
            out.push(("RELEASE", e.fields()));
        }
        if let Some(e) = &self.git {
            out.push(("GIT", e.fields()));
        }
        if let Some(e) = &self.docker {
            out.push(("DOCKER", e.fields()));
        }
        if let Some(e) = &self.cron {
            out.push(("CRON", e.fields()));
        }
        if let Some(e) = &self.pubsub {
            out.push(("PUBSUB", e.fields()));
        }
        if let Some(e) = &self.github {
            out.push(("GITHUB", e.fields()));
        }
        if let Some(e) = &self.bitbucket {
            out.push(("BITBUCKET", e.fields()));
        }
        if let Some(e) = &self.manual {
            out.push(("MANUAL", e.fields()));
        }
        out
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZiplineePipelineEvent {
    #[serde(default)]
    pub build_version: String,
    #[serde(default)]
    pub repo_source: String,
    #[serde(default)]
    pub repo_owner: String,
    #[serde(default)]
    pub repo_name: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub event: String,
}

impl ZiplineePipelineEvent {
    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("BUILD_VERSION", self.build_version.clone()),
            ("REPO_SOURCE", self.repo_source.clone()),
            ("REPO_OWNER", self.repo_owner.clone()),
            ("REPO_NAME", self.repo_name.clone()),
            ("BRANCH", self.branch.clone()),
            ("STATUS", self.status.clone()),
            ("EVENT", self.event.clone()),
        ]
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZiplineeReleaseEvent {
    #[serde(default)]
    pub release_version: String,
    #[serde(default)]
    pub repo_source: String,
    #[serde(default)]
    pub repo_owner: String,
    #[serde(default)]
    pub repo_name: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub event: String,
}

impl ZiplineeReleaseEvent {
    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("RELEASE_VERSION", self.release_version.clone()),
            ("REPO_SOURCE", self.repo_source.clone()),
            ("REPO_OWNER", self.repo_owner.clone()),
            ("REPO_NAME", self.repo_name.clone()),
            ("TARGET", self.target.clone()),
            ("STATUS", self.status.clone()),
            ("EVENT", self.event.clone()),
        ]
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZiplineeGitEvent {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub branch: String,
}

impl ZiplineeGitEvent {
    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("EVENT", self.event.clone()),
            ("REPOSITORY", self.repository.clone()),
            ("BRANCH", self.branch.clone()),
        ]
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZiplineeDockerEvent {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub tag: String,
}

impl ZiplineeDockerEvent {
    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("EVENT", self.event.clone()),
            ("IMAGE", self.image.clone()),
            ("TAG", self.tag.clone()),
        ]
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZiplineeCronEvent {
    #[serde(default)]
    pub time: String,
}

impl ZiplineeCronEvent {
    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![("TIME", self.time.clone())]
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZiplineePubSubEvent {
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub topic: String,
}

impl ZiplineePubSubEvent {
    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("PROJECT", self.project.clone()),
            ("TOPIC", self.topic.clone()),
        ]
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZiplineeGithubEvent {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub delivery: String,
}

impl ZiplineeGithubEvent {
    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("EVENT", self.event.clone()),
            ("REPOSITORY", self.repository.clone()),
            ("DELIVERY", self.delivery.clone()),
        ]
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZiplineeBitbucketEvent {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub repository: String,
}

impl ZiplineeBitbucketEvent {
    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("EVENT", self.event.clone()),
            ("REPOSITORY", self.repository.clone()),
        ]
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZiplineeManualEvent {
    #[serde(default)]
    pub user_id: String,
}

impl ZiplineeManualEvent {
    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![("USER_ID", self.user_id.clone())]
    }
}

impl ZiplineeManifest {
    /// Parses a manifest from YAML source.
    pub fn from_yaml(source: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
builder:
  track: stable
labels:
  app: ziplinee-ci-builder
  owningTeam: infra
env:
  GOOS: linux
stages:
  build:
    image: golang:1.21-alpine
    commands:
    - go build ./...
  test:
    image: golang:1.21-alpine
    env:
      CGO_ENABLED: "0"
    commands:
    - go test ./...
  integration:
    parallelStages:
      integration-a:
        image: alpine:3
        commands:
        - echo a
      integration-b:
        image: alpine:3
        commands:
        - echo b
"#;

    #[test]
    fn parses_stages_in_declaration_order() {
        let manifest = ZiplineeManifest::from_yaml(MANIFEST).unwrap();

        let names: Vec<&str> = manifest.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["build", "test", "integration"]);
    }

    #[test]
    fn parses_nested_parallel_stages() {
        let manifest = ZiplineeManifest::from_yaml(MANIFEST).unwrap();

        let integration = &manifest.stages[2];
        assert!(integration.commands.is_empty());
        assert_eq!(integration.parallel_stages.len(), 2);
        assert_eq!(integration.parallel_stages[0].name, "integration-a");
    }

    #[test]
    fn applies_stage_defaults() {
        let manifest = ZiplineeManifest::from_yaml(MANIFEST).unwrap();

        let build = &manifest.stages[0];
        assert_eq!(build.shell, "/bin/sh");
        assert_eq!(build.working_directory, "/ziplinee-work");
        assert_eq!(build.when, "status == 'succeeded'");
        assert_eq!(build.retries, 0);
    }

    #[test]
    fn parses_service_with_readiness_probe() {
        let manifest = ZiplineeManifest::from_yaml(
            r#"
stages:
  test:
    image: alpine:3
    commands:
    - echo hi
    services:
      database:
        image: postgres:15
        readiness:
          port: 5432
          path: /
          timeoutSeconds: 30
"#,
        )
        .unwrap();

        let service = &manifest.stages[0].services[0];
        assert_eq!(service.name, "database");
        let probe = service.readiness_probe.as_ref().unwrap();
        assert_eq!(probe.scheme, "http");
        assert_eq!(probe.port, 5432);
        assert_eq!(probe.timeout_seconds, 30);
    }

    #[test]
    fn stage_map_round_trips_through_json() {
        let manifest = ZiplineeManifest::from_yaml(MANIFEST).unwrap();

        let json = serde_json::to_string(&manifest).unwrap();
        let reparsed: ZiplineeManifest = serde_json::from_str(&json).unwrap();

        assert_eq!(reparsed.stages.len(), 3);
        assert_eq!(reparsed.stages[1].name, "test");
        assert_eq!(reparsed.labels.get("owningTeam").unwrap(), "infra");
    }

    #[test]
    fn projects_fired_event_fields() {
        let event = ZiplineeEvent {
            fired: true,
            pipeline: Some(ZiplineePipelineEvent {
                build_version: "1.2.3".into(),
                repo_name: "upstream".into(),
                status: "succeeded".into(),
                ..Default::default()
            }),
            ..Default::default()
        };

        let projections = event.projections();
        assert_eq!(projections.len(), 1);
        let (kind, fields) = &projections[0];
        assert_eq!(*kind, "PIPELINE");
        assert!(
            fields
                .iter()
                .any(|(k, v)| *k == "BUILD_VERSION" && v == "1.2.3")
        );
    }
}
