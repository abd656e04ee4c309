//! Build log model: the step tree reported to the control plane and the
//! channel records tailers produce while containers run.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a step (and, aggregated, of the whole run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Canceled,
    Unknown,
}

impl LogStatus {
    /// Lowercase wire value used in builder events and when-expressions.
    pub fn to_status(self) -> &'static str {
        match self {
            LogStatus::Pending => "pending",
            LogStatus::Running => "running",
            LogStatus::Succeeded => "succeeded",
            LogStatus::Failed => "failed",
            LogStatus::Skipped => "skipped",
            LogStatus::Canceled => "canceled",
            LogStatus::Unknown => "unknown",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LogStatus::Succeeded | LogStatus::Failed | LogStatus::Skipped | LogStatus::Canceled
        )
    }
}

/// Whether a step belongs to a stage container or a service sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Stage,
    Service,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// A single obfuscated log line within a step.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildLogLine {
    /// Monotonic within the owning step, starting at 1.
    pub line_number: u32,
    pub timestamp: DateTime<Utc>,
    pub stream_type: LogStream,
    pub text: String,
}

/// Metadata about the container image a step ran in.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerImageInfo {
    pub name: String,
    pub tag: String,
    pub is_pulled: bool,
    pub image_size: i64,
    pub pull_duration_ms: u64,
    pub is_trusted: bool,
    pub has_injected_credentials: bool,
}

/// The log record for one executed (or skipped) stage, service or attempt.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildLogStep {
    pub step: String,
    #[serde(default)]
    pub image: Option<ContainerImageInfo>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub log_lines: Vec<BuildLogLine>,
    #[serde(default)]
    pub exit_code: i64,
    pub status: LogStatus,
    #[serde(default)]
    pub auto_injected: bool,
    /// Attempt number; 0 for the first attempt, 1.. for retries.
    #[serde(default)]
    pub run_index: u32,
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub nested_steps: Vec<BuildLogStep>,
    #[serde(default)]
    pub services: Vec<BuildLogStep>,
}

impl BuildLogStep {
    pub fn new(step: impl Into<String>, depth: u32) -> Self {
        BuildLogStep {
            step: step.into(),
            image: None,
            duration_ms: 0,
            log_lines: Vec::new(),
            exit_code: 0,
            status: LogStatus::Pending,
            auto_injected: false,
            run_index: 0,
            depth,
            nested_steps: Vec::new(),
            services: Vec::new(),
        }
    }
}

/// The full log for a build run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildLog {
    #[serde(default)]
    pub id: String,
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
    #[serde(default)]
    pub steps: Vec<BuildLogStep>,
}

impl BuildLog {
    pub fn has_unknown_status(&self) -> bool {
        has_unknown_status(&self.steps)
    }
}

/// One record on the shared tail channel. Tailers emit log lines, image
/// metadata and terminal statuses; the runner's collector folds them into
/// the step tree.
#[derive(Debug, Clone)]
pub struct TailLogLine {
    pub step: String,
    /// Empty for top-level steps.
    pub parent_stage: String,
    pub log_type: LogType,
    pub depth: u32,
    pub run_index: u32,
    pub auto_injected: Option<bool>,
    pub image: Option<ContainerImageInfo>,
    pub duration_ms: Option<u64>,
    pub exit_code: Option<i64>,
    pub status: Option<LogStatus>,
    pub log_line: Option<BuildLogLine>,
}

impl TailLogLine {
    /// A record carrying only step coordinates; callers fill in the payload.
    pub fn for_step(step: &str, parent_stage: &str, log_type: LogType, depth: u32) -> Self {
        TailLogLine {
            step: step.to_string(),
            parent_stage: parent_stage.to_string(),
            log_type,
            depth,
            run_index: 0,
            auto_injected: None,
            image: None,
            duration_ms: None,
            exit_code: None,
            status: None,
            log_line: None,
        }
    }
}

/// Worst non-skipped status across the step list: failed beats canceled
/// beats succeeded; steps still pending or running aggregate to unknown.
/// A step superseded by a later attempt (same name, higher run index) does
/// not count, so a stage that fails and then succeeds on retry aggregates
/// as succeeded.
pub fn aggregated_status(steps: &[BuildLogStep]) -> LogStatus {
    let mut status = LogStatus::Succeeded;
    for (index, step) in steps.iter().enumerate() {
        let superseded = steps[index + 1..]
            .iter()
            .any(|later| later.step == step.step && later.run_index > step.run_index);
        if superseded {
            continue;
        }

        match step.status {
            LogStatus::Failed => return LogStatus::Failed,
            LogStatus::Canceled => status = LogStatus::Canceled,
            LogStatus::Pending | LogStatus::Running | LogStatus::Unknown
                if status != LogStatus::Canceled =>
            {
                status = LogStatus::Unknown
            }
            _ => {}
        }
    }
    status
}

pub fn has_succeeded_status(steps: &[BuildLogStep]) -> bool {
    aggregated_status(steps) == LogStatus::Succeeded
}

pub fn has_unknown_status(steps: &[BuildLogStep]) -> bool {
    aggregated_status(steps) == LogStatus::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_with_status(name: &str, status: LogStatus) -> BuildLogStep {
        let mut step = BuildLogStep::new(name, 0);
        step.status = status;
        step
    }

    #[test]
    fn aggregated_status_is_succeeded_when_all_succeed_or_skip() {
        let steps = vec![
            step_with_status("build", LogStatus::Succeeded),
            step_with_status("lint", LogStatus::Skipped),
        ];
        assert_eq!(aggregated_status(&steps), LogStatus::Succeeded);
    }

    #[test]
    fn aggregated_status_failed_beats_canceled() {
        let steps = vec![
            step_with_status("build", LogStatus::Canceled),
            step_with_status("test", LogStatus::Failed),
        ];
        assert_eq!(aggregated_status(&steps), LogStatus::Failed);
    }

    #[test]
    fn aggregated_status_reports_unknown_for_unfinished_steps() {
        let steps = vec![
            step_with_status("build", LogStatus::Succeeded),
            step_with_status("test", LogStatus::Running),
        ];
        assert_eq!(aggregated_status(&steps), LogStatus::Unknown);
        assert!(has_unknown_status(&steps));
    }

    #[test]
    fn successful_retry_supersedes_failed_attempt() {
        let mut failed_attempt = step_with_status("build", LogStatus::Failed);
        failed_attempt.run_index = 0;
        let mut retry = step_with_status("build", LogStatus::Succeeded);
        retry.run_index = 1;

        let steps = vec![failed_attempt, retry];
        assert_eq!(aggregated_status(&steps), LogStatus::Succeeded);
    }

    #[test]
    fn log_status_round_trips_uppercase() {
        let json = serde_json::to_string(&LogStatus::Succeeded).unwrap();
        assert_eq!(json, "\"SUCCEEDED\"");
        let status: LogStatus = serde_json::from_str("\"CANCELED\"").unwrap();
        assert_eq!(status, LogStatus::Canceled);
    }
}
