//! Reports run lifecycle and logs to the control plane.
//!
//! Every run observes `Started` ≺ `Finished` ≺ `Cleaned` regardless of how
//! it ends; transient HTTP failures are retried here and never escalate into
//! run failures.

use crate::error::{Error, Result};
use crate::pipeline::CancellationSignal;
use chrono::Utc;
use reqwest::RequestBuilder;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, warn};
use ziplinee_contracts::{
    BotLog, BuildEventType, BuildLog, BuildLogLine, BuildLogStep, BuilderConfig, JobType,
    LogStatus, LogStream, ReleaseLog, ZiplineeCiBuilderEvent,
};

const JOB_NAME_HEADER: &str = "X-Ziplinee-Event-Job-Name";
const TRUNCATION_MARKER: &str =
    "Truncated logs for reducing total log size; to prevent this use less verbose logging";

const EVENT_RETRIES: u32 = 3;
const EVENT_TIMEOUT: Duration = Duration::from_secs(10);
const LOG_TIMEOUT: Duration = Duration::from_secs(60);
const CANCEL_RETRIES: u32 = 1;

/// Cancel this many minutes before the JWT expires so teardown still
/// authenticates.
const JWT_EXPIRY_MARGIN_MINUTES: i64 = 15;

pub struct EndOfLifeHelper {
    run_as_job: bool,
    config: BuilderConfig,
    pod_name: String,
    client: reqwest::Client,
}

impl EndOfLifeHelper {
    pub fn new(run_as_job: bool, config: BuilderConfig, pod_name: String) -> Self {
        EndOfLifeHelper {
            run_as_job,
            config,
            pod_name,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> Option<(String, String, String, String)> {
        let ci_server = self.config.ci_server.as_ref()?;
        let job_name = self.config.job_name.clone()?;
        if ci_server.jwt.is_empty() || job_name.is_empty() {
            return None;
        }
        Some((
            ci_server.builder_events_url.clone(),
            ci_server.post_logs_url.clone(),
            ci_server.jwt.clone(),
            job_name,
        ))
    }

    pub async fn send_build_started_event(&self) -> Result<()> {
        self.send_builder_event(LogStatus::Running, BuildEventType::UpdateStatus)
            .await
    }

    pub async fn send_build_finished_event(&self, status: LogStatus) -> Result<()> {
        self.send_builder_event(status, BuildEventType::UpdateStatus)
            .await
    }

    pub async fn send_build_clean_event(&self, status: LogStatus) -> Result<()> {
        self.send_builder_event(status, BuildEventType::Clean).await
    }

    async fn send_builder_event(
        &self,
        status: LogStatus,
        build_event_type: BuildEventType,
    ) -> Result<()> {
        let Some((events_url, _, jwt, job_name)) = self.endpoint() else {
            return Ok(());
        };
        if events_url.is_empty() {
            return Ok(());
        }

        let event = ZiplineeCiBuilderEvent {
            build_event_type,
            job_type: self.config.job_type,
            build: self.config.build.clone(),
            release: self.config.release.clone(),
            bot: self.config.bot.clone(),
            git: self.config.git.clone(),
            job_name: job_name.clone(),
            pod_name: self.pod_name.clone(),
            status: status.to_status().to_string(),
        };

        let result = self
            .request_with_retries(EVENT_RETRIES, || {
                self.client
                    .post(&events_url)
                    .timeout(EVENT_TIMEOUT)
                    .bearer_auth(&jwt)
                    .header(JOB_NAME_HEADER, &job_name)
                    .json(&event)
            })
            .await;

        match &result {
            Ok(()) => debug!(
                url = %events_url,
                event_type = ?build_event_type,
                status = status.to_status(),
                "Sent builder event"
            ),
            Err(err) => error!(
                url = %events_url,
                error = %err,
                "Failed sending builder event"
            ),
        }
        result
    }

    /// Ships the full build log; if that fails, rebuilds the payload with
    /// slim logs (succeeded steps collapsed to a truncation marker) and
    /// retries once.
    pub async fn send_build_job_log_event(&self, build_log: &BuildLog) -> Result<()> {
        if let Err(err) = self.send_build_job_log_event_core(build_log).await {
            warn!(error = %err, "Shipping full logs failed, retrying with slim logs");

            let mut slim = build_log.clone();
            for step in &mut slim.steps {
                slim_down_step(step);
            }
            return self.send_build_job_log_event_core(&slim).await;
        }
        Ok(())
    }

    async fn send_build_job_log_event_core(&self, build_log: &BuildLog) -> Result<()> {
        let Some((_, logs_url, jwt, job_name)) = self.endpoint() else {
            return Ok(());
        };
        if logs_url.is_empty() {
            return Ok(());
        }

        // release and bot runs ship a differently-shaped envelope
        let body = match self.config.job_type {
            JobType::Release => serde_json::to_value(ReleaseLog {
                id: build_log.id.clone(),
                repo_source: build_log.repo_source.clone(),
                repo_owner: build_log.repo_owner.clone(),
                repo_name: build_log.repo_name.clone(),
                release_id: self
                    .config
                    .release
                    .as_ref()
                    .map(|r| r.id.clone())
                    .unwrap_or_default(),
                steps: build_log.steps.clone(),
            })?,
            JobType::Bot => serde_json::to_value(BotLog {
                id: build_log.id.clone(),
                repo_source: build_log.repo_source.clone(),
                repo_owner: build_log.repo_owner.clone(),
                repo_name: build_log.repo_name.clone(),
                bot_id: self
                    .config
                    .bot
                    .as_ref()
                    .map(|b| b.id.clone())
                    .unwrap_or_default(),
                steps: build_log.steps.clone(),
            })?,
            JobType::Build => serde_json::to_value(build_log)?,
        };

        let result = self
            .request_with_retries(0, || {
                self.client
                    .post(&logs_url)
                    .timeout(LOG_TIMEOUT)
                    .bearer_auth(&jwt)
                    .header(JOB_NAME_HEADER, &job_name)
                    .json(&body)
            })
            .await;

        match &result {
            Ok(()) => debug!(url = %logs_url, "Shipped logs"),
            Err(err) => error!(url = %logs_url, error = %err, "Failed shipping logs"),
        }
        result
    }

    /// Asks the control plane to cancel this job.
    pub async fn cancel_job(&self) -> Result<()> {
        let Some(ci_server) = self.config.ci_server.as_ref() else {
            return Ok(());
        };
        let cancel_url = ci_server.cancel_job_url.clone();
        let jwt = ci_server.jwt.clone();
        if cancel_url.is_empty() || jwt.is_empty() {
            return Ok(());
        }

        self.request_with_retries(CANCEL_RETRIES, || {
            self.client
                .delete(&cancel_url)
                .timeout(LOG_TIMEOUT)
                .bearer_auth(&jwt)
        })
        .await
    }

    /// Cancels the job shortly before the JWT expires, so the run never
    /// outlives its credentials. Also fires the local cancellation signal.
    pub fn spawn_jwt_expiry_watcher(self: &Arc<Self>, cancellation: CancellationSignal) {
        let Some(expiry) = self
            .config
            .ci_server
            .as_ref()
            .and_then(|ci_server| ci_server.jwt_expiry)
        else {
            return;
        };

        let helper = Arc::clone(self);
        tokio::spawn(async move {
            let fire_at = expiry - chrono::Duration::minutes(JWT_EXPIRY_MARGIN_MINUTES);
            let wait = (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            sleep(wait).await;

            warn!(
                expiry = %expiry,
                "Canceling job before the JWT expires"
            );

            if let Err(err) = helper.cancel_job().await {
                error!(error = %err, "Canceling job failed");
            }
            cancellation.fire();
        });
    }

    /// Records a fatal setup error as a synthetic init step, runs the full
    /// end-of-life sequence, then exits the process: 0 when run-as-job (the
    /// orchestration substrate treats status as reported out-of-band), 1
    /// otherwise. Never returns.
    pub async fn handle_fatal(&self, mut build_log: BuildLog, err: Option<&Error>, message: &str) {
        build_log
            .steps
            .push(fatal_init_step(err.map(|e| e.to_string()), message));

        let _ = self.send_build_finished_event(LogStatus::Failed).await;
        let _ = self.send_build_job_log_event(&build_log).await;
        let _ = self.send_build_clean_event(LogStatus::Failed).await;

        error!(error = ?err, message, "Fatal error, exiting");

        if self.run_as_job {
            std::process::exit(0);
        }
        std::process::exit(1);
    }

    async fn request_with_retries<F>(&self, retries: u32, request: F) -> Result<()>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut last_error = None;

        for attempt in 0..=retries {
            if attempt > 0 {
                sleep(backoff_with_jitter(attempt)).await;
            }

            match request().send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    last_error = Some(Error::Other(format!(
                        "control plane responded with {}",
                        response.status()
                    )));
                }
                Err(err) => last_error = Some(Error::Http(err)),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Other("request failed".to_string())))
    }
}

/// Exponential backoff with sub-second jitter derived from the clock.
fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = Duration::from_secs(1 << attempt.min(5));
    let jitter_ms = (Utc::now().timestamp_subsec_millis() % 500) as u64;
    base + Duration::from_millis(jitter_ms)
}

/// Collapses the log lines of a succeeded step (and recursively of its
/// nested and service steps) to a single truncation marker preserving the
/// first line's number and timestamp.
fn slim_down_step(step: &mut BuildLogStep) {
    if step.status == LogStatus::Succeeded
        && let Some(first) = step.log_lines.first()
    {
        step.log_lines = vec![BuildLogLine {
            line_number: first.line_number,
            timestamp: first.timestamp,
            stream_type: LogStream::Stdout,
            text: TRUNCATION_MARKER.to_string(),
        }];
    }

    for nested in &mut step.nested_steps {
        slim_down_step(nested);
    }
    for service in &mut step.services {
        slim_down_step(service);
    }
}

/// The synthetic step surfacing a fatal setup error in the build log.
fn fatal_init_step(err: Option<String>, message: &str) -> BuildLogStep {
    let mut step = BuildLogStep::new("init", 0);
    step.exit_code = -1;
    step.status = LogStatus::Failed;

    let mut line_number = 0u32;
    let mut push = |text: &str, lines: &mut Vec<BuildLogLine>| {
        line_number += 1;
        lines.push(BuildLogLine {
            line_number,
            timestamp: Utc::now(),
            stream_type: LogStream::Stderr,
            text: text.to_string(),
        });
    };

    if let Some(err) = err {
        push(&err, &mut step.log_lines);
    }
    if !message.is_empty() {
        push(message, &mut step.log_lines);
    }

    step
}
