//! Prefix-scoped environment namespace for the run.
//!
//! The helper owns an explicit map rather than mutating the process
//! environment; values are written through to real env only when container
//! launch environments are assembled. Canonical `ZIPLINEE_` names are
//! rewritten to the active prefix so tests can run with their own prefix.

use crate::error::{Error, Result};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use tokio::process::Command;
use tracing::warn;
use ziplinee_contracts::{BuilderConfig, ZiplineeEvent, ZiplineeManifest};
use ziplinee_crypt::SecretHelper;

const CANONICAL_PREFIX: &str = "ZIPLINEE_";

fn origin_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(git@|https://)([^:/]+)(:|/)([^/]+)/([^/]+)\.git")
            .expect("origin regex is valid")
    })
}

pub struct EnvvarHelper {
    prefix: String,
    ci_server: String,
    work_dir: String,
    temp_dir: String,
    secret_helper: SecretHelper,
    envvars: RwLock<HashMap<String, String>>,
}

impl EnvvarHelper {
    /// Snapshots `ZIPLINEE_CI_SERVER`, `ZIPLINEE_WORKDIR` and
    /// `ZIPLINEE_TEMPDIR` from the process environment at construction.
    pub fn new(prefix: impl Into<String>, secret_helper: SecretHelper) -> Self {
        EnvvarHelper {
            prefix: prefix.into(),
            ci_server: std::env::var("ZIPLINEE_CI_SERVER").unwrap_or_default(),
            work_dir: std::env::var("ZIPLINEE_WORKDIR").unwrap_or_default(),
            temp_dir: std::env::var("ZIPLINEE_TEMPDIR").unwrap_or_default(),
            secret_helper,
            envvars: RwLock::new(HashMap::new()),
        }
    }

    pub fn secret_helper(&self) -> &SecretHelper {
        &self.secret_helper
    }

    pub fn ci_server(&self) -> &str {
        &self.ci_server
    }

    pub fn work_dir(&self) -> &str {
        &self.work_dir
    }

    pub fn temp_dir(&self) -> &str {
        &self.temp_dir
    }

    pub fn pod_name(&self) -> String {
        std::env::var("POD_NAME").unwrap_or_default()
    }

    pub fn pod_uid(&self) -> String {
        std::env::var("POD_UID").unwrap_or_default()
    }

    pub fn pod_namespace(&self) -> String {
        std::env::var("POD_NAMESPACE").unwrap_or_default()
    }

    pub fn pod_node_name(&self) -> String {
        std::env::var("POD_NODE_NAME").unwrap_or_default()
    }

    /// Rewrites the canonical `ZIPLINEE_` spelling to the active prefix.
    fn env_name(&self, key: &str) -> String {
        key.replace(CANONICAL_PREFIX, &self.prefix)
    }

    pub fn get_env(&self, key: &str) -> Option<String> {
        let key = self.env_name(key);
        self.envvars
            .read()
            .ok()
            .and_then(|vars| vars.get(&key).cloned())
    }

    /// Resolves a prefixed variable to its value, or leaves the reference
    /// intact (`${KEY}`) for names outside the namespace. Used by the
    /// when-evaluator's `${VAR}` expansion.
    pub fn expand(&self, key: &str) -> String {
        let key = self.env_name(key);
        if key.starts_with(&self.prefix) {
            self.get_env(&key).unwrap_or_default()
        } else {
            format!("${{{key}}}")
        }
    }

    pub fn set_env(&self, key: &str, value: impl Into<String>) {
        let key = self.env_name(key);
        if let Ok(mut vars) = self.envvars.write() {
            vars.insert(key, value.into());
        }
    }

    pub fn unset_env(&self, key: &str) {
        let key = self.env_name(key);
        if let Ok(mut vars) = self.envvars.write() {
            vars.remove(&key);
        }
    }

    /// Snapshot of every variable in the prefix namespace.
    pub fn collect_envvars(&self) -> HashMap<String, String> {
        self.envvars
            .read()
            .map(|vars| {
                vars.iter()
                    .filter(|(k, _)| k.starts_with(&self.prefix))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Clears the namespace so nothing leaks in from the host environment.
    /// Also drops any prefixed variables from the real process env.
    pub fn unset_all(&self) {
        if let Ok(mut vars) = self.envvars.write() {
            vars.clear();
        }
        for (key, _) in std::env::vars() {
            if key.starts_with(&self.prefix) {
                // Safety: single-threaded at run start, before any container work.
                unsafe { std::env::remove_var(&key) };
            }
        }
    }

    /// Seeds `ZIPLINEE_BUILD_DATETIME` (when unset) and resets
    /// `ZIPLINEE_BUILD_STATUS` to `succeeded`. For external-agent runs the
    /// git coordinates are derived from the local checkout as well.
    pub async fn set_global_envvars(&self) -> Result<()> {
        if self.get_env("ZIPLINEE_BUILD_DATETIME").is_none() {
            self.set_env("ZIPLINEE_BUILD_DATETIME", chrono::Utc::now().to_rfc3339());
        }
        self.set_env("ZIPLINEE_BUILD_STATUS", "succeeded");

        if self.ci_server != "gocd" {
            return Ok(());
        }

        self.init_git_source().await?;
        self.init_git_owner().await?;
        self.init_git_name().await?;
        self.init_git_full_name().await?;
        self.init_git_revision().await?;
        self.init_git_branch().await?;

        Ok(())
    }

    /// Projects the builder config into the namespace: git coordinates,
    /// version parts, counters, job identities and trigger events.
    pub fn set_builder_config_envvars(&self, config: &BuilderConfig) -> Result<()> {
        if let Some(git) = &config.git {
            self.set_env("ZIPLINEE_GIT_SOURCE", &git.repo_source);
            self.set_env("ZIPLINEE_GIT_OWNER", &git.repo_owner);
            self.set_env("ZIPLINEE_GIT_NAME", &git.repo_name);
            self.set_env(
                "ZIPLINEE_GIT_FULLNAME",
                format!("{}/{}", git.repo_owner, git.repo_name),
            );
            self.set_env("ZIPLINEE_GIT_BRANCH", &git.repo_branch);
            self.set_env(
                "ZIPLINEE_GIT_BRANCH_DNS_SAFE",
                make_dns_label_safe(&git.repo_branch),
            );
            self.set_env("ZIPLINEE_GIT_REVISION", &git.repo_revision);
        }

        if let Some(version) = &config.version {
            self.set_env("ZIPLINEE_BUILD_VERSION", &version.version);
            if let Some(major) = version.major {
                self.set_env("ZIPLINEE_BUILD_VERSION_MAJOR", major.to_string());
            }
            if let Some(minor) = version.minor {
                self.set_env("ZIPLINEE_BUILD_VERSION_MINOR", minor.to_string());
            }
            if let Some(patch) = version.auto_increment {
                self.set_env("ZIPLINEE_BUILD_VERSION_PATCH", patch.to_string());
            }
            if let Some(label) = &version.label {
                self.set_env("ZIPLINEE_BUILD_VERSION_LABEL", label);
            }
            // counters enable release locking for older revisions
            self.set_env(
                "ZIPLINEE_BUILD_CURRENT_COUNTER",
                version.current_counter.to_string(),
            );
            self.set_env(
                "ZIPLINEE_BUILD_MAX_COUNTER",
                version.max_counter.to_string(),
            );
            self.set_env(
                "ZIPLINEE_BUILD_MAX_COUNTER_CURRENT_BRANCH",
                version.max_counter_current_branch.to_string(),
            );
        }

        if let Some(build) = &config.build {
            self.set_env("ZIPLINEE_BUILD_ID", &build.id);
        }

        if let Some(release) = &config.release {
            self.set_env("ZIPLINEE_RELEASE_NAME", &release.name);
            self.set_env("ZIPLINEE_RELEASE_ACTION", &release.action);
            self.set_env("ZIPLINEE_RELEASE_ID", &release.id);

            let triggered_by = config
                .events
                .iter()
                .filter_map(|e| e.manual.as_ref())
                .map(|m| m.user_id.clone())
                .next_back()
                .unwrap_or_default();
            self.set_env("ZIPLINEE_RELEASE_TRIGGERED_BY", triggered_by);
        }

        if let Some(bot) = &config.bot {
            self.set_env("ZIPLINEE_BOT_NAME", &bot.name);
            self.set_env("ZIPLINEE_BOT_ID", &bot.id);
        }

        if let Some(ci_server) = &config.ci_server {
            self.set_env("ZIPLINEE_CI_SERVER_BASE_URL", &ci_server.base_url);
        }

        self.set_event_envvars(&config.events);

        Ok(())
    }

    /// Projects trigger events into `ZIPLINEE_TRIGGER_<KIND>_<FIELD>` for
    /// fired events, and `ZIPLINEE_TRIGGER_<NAME>_<FIELD>` for named events
    /// whether or not they fired, so upstream referents always resolve.
    fn set_event_envvars(&self, events: &[ZiplineeEvent]) {
        for event in events {
            for (kind, fields) in event.projections() {
                for (field, value) in fields {
                    if event.fired {
                        self.set_env(&format!("ZIPLINEE_TRIGGER_{kind}_{field}"), &value);
                    }
                    if !event.name.is_empty() {
                        let name = to_upper_snake_case(&event.name);
                        self.set_env(&format!("ZIPLINEE_TRIGGER_{name}_{field}"), &value);
                    }
                }
            }
        }
    }

    /// Seeds the git coordinate variables either from config or, when the
    /// config has no git block, from the local checkout.
    pub async fn set_pipeline_name(&self, config: &BuilderConfig) -> Result<()> {
        match &config.git {
            Some(git) => {
                self.set_env("ZIPLINEE_GIT_SOURCE", &git.repo_source);
                self.set_env("ZIPLINEE_GIT_OWNER", &git.repo_owner);
                self.set_env("ZIPLINEE_GIT_NAME", &git.repo_name);
                Ok(())
            }
            None => {
                self.init_git_source().await?;
                self.init_git_owner().await?;
                self.init_git_name().await
            }
        }
    }

    /// Fully qualified pipeline name `source/owner/name`; requires the git
    /// variables to have been seeded.
    pub fn get_pipeline_name(&self) -> Result<String> {
        let source = self.get_env("ZIPLINEE_GIT_SOURCE").unwrap_or_default();
        let owner = self.get_env("ZIPLINEE_GIT_OWNER").unwrap_or_default();
        let name = self.get_env("ZIPLINEE_GIT_NAME").unwrap_or_default();

        if source.is_empty() || owner.is_empty() || name.is_empty() {
            return Err(Error::Setup(
                "git environment variables have not been set yet, cannot resolve pipeline name"
                    .to_string(),
            ));
        }

        Ok(format!("{source}/{owner}/{name}"))
    }

    /// Manifest labels as `ZIPLINEE_LABEL_<UPPER_SNAKE(key)>` plus the
    /// current namespace snapshot.
    pub fn collect_envvars_and_labels(
        &self,
        manifest: &ZiplineeManifest,
    ) -> HashMap<String, String> {
        for (key, value) in &manifest.labels {
            self.set_env(
                &format!("ZIPLINEE_LABEL_{}", to_upper_snake_case(key)),
                value,
            );
        }

        self.collect_envvars()
    }

    pub fn collect_global_envvars(&self, manifest: &ZiplineeManifest) -> HashMap<String, String> {
        manifest.global_env.clone()
    }

    /// Variadic right-wins merge.
    pub fn override_envvars(maps: &[HashMap<String, String>]) -> HashMap<String, String> {
        let mut merged = HashMap::new();
        for map in maps {
            for (key, value) in map {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    /// Decrypts any envelopes inside the value; on failure the ciphertext is
    /// returned unchanged with a warning, never an error at this layer.
    pub fn decrypt_secret(&self, value: &str, pipeline: &str) -> String {
        match self.secret_helper.decrypt_all_envelopes(value, pipeline) {
            Ok(decrypted) => decrypted,
            Err(err) => {
                warn!(error = %err, "Failed decrypting secret");
                value.to_string()
            }
        }
    }

    pub fn decrypt_secrets(
        &self,
        envvars: &HashMap<String, String>,
        pipeline: &str,
    ) -> HashMap<String, String> {
        envvars
            .iter()
            .map(|(k, v)| (k.clone(), self.decrypt_secret(v, pipeline)))
            .collect()
    }

    async fn command_output(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(program).args(args).output().await?;
        if !output.status.success() {
            return Err(Error::Setup(format!(
                "{program} {} exited with {:?}",
                args.join(" "),
                output.status.code()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn git_origin(&self) -> Result<String> {
        self.command_output("git", &["config", "--get", "remote.origin.url"])
            .await
    }

    async fn init_git_source(&self) -> Result<()> {
        if self.get_env("ZIPLINEE_GIT_SOURCE").is_none() {
            let origin = self.git_origin().await?;
            self.set_env("ZIPLINEE_GIT_SOURCE", source_from_origin(&origin));
        }
        Ok(())
    }

    async fn init_git_owner(&self) -> Result<()> {
        if self.get_env("ZIPLINEE_GIT_OWNER").is_none() {
            let origin = self.git_origin().await?;
            self.set_env("ZIPLINEE_GIT_OWNER", owner_from_origin(&origin));
        }
        Ok(())
    }

    async fn init_git_name(&self) -> Result<()> {
        if self.get_env("ZIPLINEE_GIT_NAME").is_none() {
            let origin = self.git_origin().await?;
            self.set_env("ZIPLINEE_GIT_NAME", name_from_origin(&origin));
        }
        Ok(())
    }

    async fn init_git_full_name(&self) -> Result<()> {
        if self.get_env("ZIPLINEE_GIT_FULLNAME").is_none() {
            let origin = self.git_origin().await?;
            self.set_env(
                "ZIPLINEE_GIT_FULLNAME",
                format!(
                    "{}/{}",
                    owner_from_origin(&origin),
                    name_from_origin(&origin)
                ),
            );
        }
        Ok(())
    }

    async fn init_git_revision(&self) -> Result<()> {
        if self.get_env("ZIPLINEE_GIT_REVISION").is_none() {
            let revision = self.command_output("git", &["rev-parse", "HEAD"]).await?;
            self.set_env("ZIPLINEE_GIT_REVISION", revision);
        }
        Ok(())
    }

    async fn init_git_branch(&self) -> Result<()> {
        if self.get_env("ZIPLINEE_GIT_BRANCH").is_none() {
            let branch = self
                .command_output("git", &["rev-parse", "--abbrev-ref", "HEAD"])
                .await?;
            self.set_env("ZIPLINEE_GIT_BRANCH", branch);
        }
        Ok(())
    }
}

fn origin_capture(origin: &str, index: usize) -> String {
    origin_regex()
        .captures(origin)
        .and_then(|c| c.get(index))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

pub fn source_from_origin(origin: &str) -> String {
    origin_capture(origin, 2)
}

pub fn owner_from_origin(origin: &str) -> String {
    origin_capture(origin, 4)
}

pub fn name_from_origin(origin: &str) -> String {
    origin_capture(origin, 5)
}

/// `owningTeam` → `OWNING_TEAM`, `log-format` → `LOG_FORMAT`.
pub fn to_upper_snake_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 4);
    let mut prev_lower_or_digit = false;

    for c in input.chars() {
        if c.is_ascii_uppercase() {
            if prev_lower_or_digit {
                out.push('_');
            }
            out.push(c);
            prev_lower_or_digit = false;
        } else if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_uppercase());
            prev_lower_or_digit = true;
        } else {
            if !out.ends_with('_') && !out.is_empty() {
                out.push('_');
            }
            prev_lower_or_digit = false;
        }
    }

    out.trim_matches('_').to_string()
}

/// Makes a value usable as a dns label: lowercase letters, digits and
/// hyphens only, starting with a letter, not ending in a hyphen, at most 63
/// characters. Idempotent.
pub fn make_dns_label_safe(value: &str) -> String {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    static HYPHEN_RUN: OnceLock<Regex> = OnceLock::new();
    static LEADING: OnceLock<Regex> = OnceLock::new();

    let invalid = INVALID.get_or_init(|| Regex::new(r"[^a-z0-9-]+").expect("regex is valid"));
    let hyphen_run = HYPHEN_RUN.get_or_init(|| Regex::new(r"-{2,}").expect("regex is valid"));
    let leading = LEADING.get_or_init(|| Regex::new(r"^[0-9-]+").expect("regex is valid"));

    let value = value.to_lowercase();
    let value = invalid.replace_all(&value, "-");
    let value = hyphen_run.replace_all(&value, "-");
    let value = value.trim_matches('-');
    let value = leading.replace(value, "");

    let mut value = value.into_owned();
    if value.len() > 63 {
        value.truncate(63);
    }

    value.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ziplinee_contracts::{
        BuildVersionConfig, GitConfig, ZiplineeManualEvent, ZiplineePipelineEvent,
    };

    fn helper() -> EnvvarHelper {
        let secret_helper = SecretHelper::new("0123456789abcdef0123456789abcdef").unwrap();
        EnvvarHelper::new("TESTPREFIX_", secret_helper)
    }

    #[test]
    fn env_name_replaces_canonical_prefix() {
        let helper = helper();
        helper.set_env("ZIPLINEE_KEY", "value");

        assert_eq!(helper.get_env("TESTPREFIX_KEY").unwrap(), "value");
        assert_eq!(helper.get_env("ZIPLINEE_KEY").unwrap(), "value");
    }

    #[test]
    fn expand_resolves_prefixed_and_preserves_foreign_refs() {
        let helper = helper();
        helper.set_env("ZIPLINEE_GIT_BRANCH", "main");

        assert_eq!(helper.expand("ZIPLINEE_GIT_BRANCH"), "main");
        assert_eq!(helper.expand("HOME"), "${HOME}");
    }

    #[test]
    fn override_envvars_combines_maps() {
        let outer = HashMap::from([("ENVVAR1".to_string(), "value1".to_string())]);
        let inner = HashMap::from([("ENVVAR2".to_string(), "value2".to_string())]);

        let merged = EnvvarHelper::override_envvars(&[outer, inner]);

        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn override_envvars_right_wins() {
        let outer = HashMap::from([("ENVVAR1".to_string(), "value1".to_string())]);
        let inner = HashMap::from([("ENVVAR1".to_string(), "value2".to_string())]);

        let merged = EnvvarHelper::override_envvars(&[outer, inner]);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged["ENVVAR1"], "value2");
    }

    #[test]
    fn collect_envvars_and_labels_snake_cases_label_keys() {
        let helper = helper();
        let manifest = ZiplineeManifest {
            labels: HashMap::from([("owningTeam".to_string(), "infra".to_string())]),
            ..Default::default()
        };

        let envvars = helper.collect_envvars_and_labels(&manifest);

        assert_eq!(envvars["TESTPREFIX_LABEL_OWNING_TEAM"], "infra");
    }

    #[test]
    fn builder_config_envvars_project_git_version_and_counters() {
        let helper = helper();
        let config = BuilderConfig {
            git: Some(GitConfig {
                repo_source: "github.com".into(),
                repo_owner: "ziplineeci".into(),
                repo_name: "ziplinee-ci-builder".into(),
                repo_branch: "Feature/New-Thing".into(),
                repo_revision: "0ab1c2".into(),
            }),
            version: Some(BuildVersionConfig {
                version: "1.2.3".into(),
                major: Some(1),
                minor: Some(2),
                auto_increment: Some(3),
                label: None,
                current_counter: 3,
                max_counter: 9,
                max_counter_current_branch: 3,
            }),
            ..Default::default()
        };

        helper.set_builder_config_envvars(&config).unwrap();

        assert_eq!(
            helper.get_env("ZIPLINEE_GIT_FULLNAME").unwrap(),
            "ziplineeci/ziplinee-ci-builder"
        );
        assert_eq!(
            helper.get_env("ZIPLINEE_GIT_BRANCH_DNS_SAFE").unwrap(),
            "feature-new-thing"
        );
        assert_eq!(helper.get_env("ZIPLINEE_BUILD_VERSION_MAJOR").unwrap(), "1");
        assert_eq!(helper.get_env("ZIPLINEE_BUILD_MAX_COUNTER").unwrap(), "9");
    }

    #[test]
    fn event_envvars_set_for_fired_and_named_events() {
        let helper = helper();
        let config = BuilderConfig {
            events: vec![
                ZiplineeEvent {
                    fired: true,
                    pipeline: Some(ZiplineePipelineEvent {
                        build_version: "4.5.6".into(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ZiplineeEvent {
                    fired: false,
                    name: "upstream-protobuf".into(),
                    pipeline: Some(ZiplineePipelineEvent {
                        build_version: "7.8.9".into(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        helper.set_builder_config_envvars(&config).unwrap();

        assert_eq!(
            helper
                .get_env("ZIPLINEE_TRIGGER_PIPELINE_BUILD_VERSION")
                .unwrap(),
            "4.5.6"
        );
        // named but unfired events still resolve under their name
        assert_eq!(
            helper
                .get_env("ZIPLINEE_TRIGGER_UPSTREAM_PROTOBUF_BUILD_VERSION")
                .unwrap(),
            "7.8.9"
        );
        assert!(
            helper
                .get_env("ZIPLINEE_TRIGGER_PIPELINE_BUILD_VERSION")
                .is_some()
        );
    }

    #[test]
    fn release_triggered_by_comes_from_manual_event() {
        let helper = helper();
        let config = BuilderConfig {
            release: Some(ziplinee_contracts::ReleaseConfig {
                id: "5".into(),
                name: "production".into(),
                action: "deploy".into(),
            }),
            events: vec![ZiplineeEvent {
                fired: true,
                manual: Some(ZiplineeManualEvent {
                    user_id: "dev@example.com".into(),
                }),
                ..Default::default()
            }],
            ..Default::default()
        };

        helper.set_builder_config_envvars(&config).unwrap();

        assert_eq!(
            helper.get_env("ZIPLINEE_RELEASE_TRIGGERED_BY").unwrap(),
            "dev@example.com"
        );
    }

    #[test]
    fn get_pipeline_name_requires_git_envvars() {
        let helper = helper();
        assert!(helper.get_pipeline_name().is_err());

        helper.set_env("ZIPLINEE_GIT_SOURCE", "github.com");
        helper.set_env("ZIPLINEE_GIT_OWNER", "ziplineeci");
        helper.set_env("ZIPLINEE_GIT_NAME", "ziplinee-ci-builder");

        assert_eq!(
            helper.get_pipeline_name().unwrap(),
            "github.com/ziplineeci/ziplinee-ci-builder"
        );
    }

    #[test]
    fn origin_parsing_handles_ssh_and_https() {
        let ssh = "git@github.com:ziplineeci/ziplinee-ci-builder.git";
        assert_eq!(source_from_origin(ssh), "github.com");
        assert_eq!(owner_from_origin(ssh), "ziplineeci");
        assert_eq!(name_from_origin(ssh), "ziplinee-ci-builder");

        let https = "https://gitlab.example.com/platform/tooling.git";
        assert_eq!(source_from_origin(https), "gitlab.example.com");
        assert_eq!(owner_from_origin(https), "platform");
        assert_eq!(name_from_origin(https), "tooling");
    }

    #[test]
    fn origin_parsing_returns_empty_for_unknown_shapes() {
        assert_eq!(source_from_origin("file:///tmp/repo"), "");
    }

    #[test]
    fn to_upper_snake_case_handles_camel_and_kebab() {
        assert_eq!(to_upper_snake_case("owningTeam"), "OWNING_TEAM");
        assert_eq!(to_upper_snake_case("log-format"), "LOG_FORMAT");
        assert_eq!(to_upper_snake_case("app"), "APP");
    }

    #[test]
    fn dns_label_safe_shapes_values() {
        assert_eq!(make_dns_label_safe("Feature/NEW_thing"), "feature-new-thing");
        assert_eq!(make_dns_label_safe("123-starts-with-digits"), "starts-with-digits");
        let long = "a".repeat(80);
        assert_eq!(make_dns_label_safe(&long).len(), 63);
    }

    #[test]
    fn dns_label_safe_is_idempotent() {
        for input in ["Feature/NEW_thing", "9-lives--", "-_-", "release/v1.2.3"] {
            let once = make_dns_label_safe(input);
            assert_eq!(make_dns_label_safe(&once), once, "input {input:?}");
        }
    }

    #[test]
    fn decrypt_secret_returns_ciphertext_on_failure() {
        let helper = helper();
        let bogus = "ziplinee.secret(YWJjZGVmZ2hpamts.Zm9vYmFy)";

        let result = helper.decrypt_secret(bogus, "github.com/ziplineeci/repo");

        assert_eq!(result, bogus);
    }

    #[test]
    fn decrypt_secret_decrypts_valid_envelope() {
        let helper = helper();
        let pipeline = "github.com/ziplineeci/repo";
        let envelope = helper.secret_helper().encrypt("hunter2", pipeline).unwrap();

        let result = helper.decrypt_secret(&format!("password={envelope}"), pipeline);

        assert_eq!(result, "password=hunter2");
    }
}
