//! The stage scheduler.
//!
//! Top-level stages run strictly sequentially; stages with nested parallel
//! stages fan out one task per sub-stage and aggregate worst-wins. Log lines
//! and status transitions travel as [`TailLogLine`] records over the shared
//! bounded channel; a collector task folds them into the step tree under a
//! mutex, which keeps concurrent writers (parallel sub-stages, service
//! tailers) from interleaving partial updates.

use crate::ApplicationInfo;
use crate::docker::ContainerOrchestrator;
use crate::envvar::EnvvarHelper;
use crate::error::{Error, Result};
use crate::obfuscate::Obfuscator;
use crate::when::WhenEvaluator;
use chrono::Utc;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tracing::{info, warn};
use ziplinee_contracts::{
    BuildLogLine, BuildLogStep, ContainerImageInfo, LogStatus, LogStream, LogType, TailLogLine,
    ZiplineeService, ZiplineeStage,
};

/// Capacity of the shared log channel; tailers block when the collector
/// falls this far behind, bounding memory during log floods.
pub const TAIL_CHANNEL_CAPACITY: usize = 10_000;

/// Broadcast cancellation token observed by every worker.
#[derive(Clone)]
pub struct CancellationSignal {
    inner: Arc<watch::Sender<bool>>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        CancellationSignal {
            inner: Arc::new(tx),
        }
    }

    pub fn fire(&self) {
        let _ = self.inner.send(true);
    }

    pub fn is_fired(&self) -> bool {
        *self.inner.borrow()
    }

    /// Resolves once the signal fires; immediately if it already has.
    pub async fn fired(&self) {
        let mut rx = self.inner.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Folds one channel record into the step tree.
///
/// Top-level steps are keyed by `(step, run_index)`; nested records find
/// their parent by stage name and land in `nested_steps` or `services`
/// depending on the record's log type.
pub(crate) fn apply_tail_log_line(steps: &mut Vec<BuildLogStep>, record: TailLogLine) {
    fn find_or_create<'a>(
        list: &'a mut Vec<BuildLogStep>,
        name: &str,
        run_index: u32,
        depth: u32,
    ) -> &'a mut BuildLogStep {
        if let Some(position) = list
            .iter()
            .position(|s| s.step == name && s.run_index == run_index)
        {
            return &mut list[position];
        }

        let mut step = BuildLogStep::new(name, depth);
        step.run_index = run_index;
        list.push(step);
        list.last_mut().expect("list is non-empty after push")
    }

    let step = if record.parent_stage.is_empty() {
        find_or_create(steps, &record.step, record.run_index, record.depth)
    } else {
        let Some(parent_position) = steps
            .iter()
            .rposition(|s| s.step == record.parent_stage)
        else {
            // parent unknown; drop rather than corrupt the tree
            return;
        };
        let parent = &mut steps[parent_position];
        let list = match record.log_type {
            LogType::Stage => &mut parent.nested_steps,
            LogType::Service => &mut parent.services,
        };
        find_or_create(list, &record.step, record.run_index, record.depth)
    };

    if let Some(line) = record.log_line {
        step.log_lines.push(line);
    }
    if let Some(image) = record.image {
        step.image = Some(image);
    }
    if let Some(duration_ms) = record.duration_ms {
        step.duration_ms = duration_ms;
    }
    if let Some(exit_code) = record.exit_code {
        step.exit_code = exit_code;
    }
    if let Some(status) = record.status {
        step.status = status;
    }
    if let Some(auto_injected) = record.auto_injected {
        step.auto_injected = auto_injected;
    }
}

fn is_flush_marker(record: &TailLogLine) -> bool {
    record.step.is_empty()
        && record.parent_stage.is_empty()
        && record.log_line.is_none()
        && record.status.is_none()
}

pub struct PipelineRunner {
    envvar_helper: Arc<EnvvarHelper>,
    when_evaluator: Arc<WhenEvaluator>,
    obfuscator: Arc<Obfuscator>,
    orchestrator: Arc<dyn ContainerOrchestrator>,
    application_info: ApplicationInfo,
    cancellation: CancellationSignal,
    tail_tx: mpsc::Sender<TailLogLine>,
    tail_rx: Mutex<Option<mpsc::Receiver<TailLogLine>>>,
    steps: Arc<Mutex<Vec<BuildLogStep>>>,
    flushed: Arc<Notify>,
    inject_builder_info: AtomicBool,
}

impl PipelineRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        envvar_helper: Arc<EnvvarHelper>,
        when_evaluator: Arc<WhenEvaluator>,
        obfuscator: Arc<Obfuscator>,
        orchestrator: Arc<dyn ContainerOrchestrator>,
        application_info: ApplicationInfo,
        cancellation: CancellationSignal,
        tail_tx: mpsc::Sender<TailLogLine>,
        tail_rx: mpsc::Receiver<TailLogLine>,
    ) -> Self {
        PipelineRunner {
            envvar_helper,
            when_evaluator,
            obfuscator,
            orchestrator,
            application_info,
            cancellation,
            tail_tx,
            tail_rx: Mutex::new(Some(tail_rx)),
            steps: Arc::new(Mutex::new(Vec::new())),
            flushed: Arc::new(Notify::new()),
            inject_builder_info: AtomicBool::new(false),
        }
    }

    /// Injects a synthetic builder-info step ahead of the first stage.
    pub fn enable_builder_info_stage_injection(&self) {
        self.inject_builder_info.store(true, Ordering::Relaxed);
    }

    pub fn cancellation(&self) -> CancellationSignal {
        self.cancellation.clone()
    }

    /// Watches the cancellation signal and tears down all containers when it
    /// fires. Spawn once per run.
    pub async fn stop_pipeline_on_cancellation(&self) {
        self.cancellation.fired().await;
        warn!("Cancellation received, stopping all containers");
        self.orchestrator.stop_all_containers().await;
    }

    async fn emit(&self, record: TailLogLine) {
        let _ = self.tail_tx.send(record).await;
    }

    async fn emit_status(
        &self,
        step: &str,
        parent_stage: &str,
        log_type: LogType,
        depth: u32,
        run_index: u32,
        status: LogStatus,
    ) {
        let mut record = TailLogLine::for_step(step, parent_stage, log_type, depth);
        record.run_index = run_index;
        record.status = Some(status);
        self.emit(record).await;
    }

    /// Emits a runner-generated line (errors, builder info); text passes
    /// through the obfuscator like any container output.
    async fn emit_line(
        &self,
        step: &str,
        parent_stage: &str,
        log_type: LogType,
        depth: u32,
        run_index: u32,
        line_number: u32,
        stream: LogStream,
        text: &str,
    ) {
        let mut record = TailLogLine::for_step(step, parent_stage, log_type, depth);
        record.run_index = run_index;
        record.log_line = Some(BuildLogLine {
            line_number,
            timestamp: Utc::now(),
            stream_type: stream,
            text: self.obfuscator.obfuscate(text),
        });
        self.emit(record).await;
    }

    /// Starts the collector draining the shared channel into the step tree.
    async fn start_collector(&self) {
        let Some(mut rx) = self.tail_rx.lock().await.take() else {
            return;
        };

        let steps = Arc::clone(&self.steps);
        let flushed = Arc::clone(&self.flushed);
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if is_flush_marker(&record) {
                    flushed.notify_one();
                    continue;
                }
                apply_tail_log_line(&mut *steps.lock().await, record);
            }
        });
    }

    /// Sends a marker through the channel and waits for the collector to
    /// process it; FIFO ordering guarantees everything sent before the
    /// marker has been applied.
    async fn flush_collector(&self) {
        self.start_collector().await;
        let notified = self.flushed.notified();
        self.emit(TailLogLine::for_step("", "", LogType::Stage, 0))
            .await;
        notified.await;
    }

    /// Runs the stage list and returns the collected step tree. Stage
    /// failures are recorded in their steps; an `Err` here means the run
    /// itself broke (when-expression errors, infrastructure failures).
    pub async fn run_stages(
        self: &Arc<Self>,
        depth: u32,
        stages: &[ZiplineeStage],
        multi_stage_services: &[ZiplineeService],
        dir: &str,
        envvars: HashMap<String, String>,
    ) -> Result<Vec<BuildLogStep>> {
        self.start_collector().await;

        if stages.is_empty() {
            return Err(Error::Setup("manifest has no stages to run".to_string()));
        }

        if self.inject_builder_info.swap(false, Ordering::Relaxed) {
            self.run_builder_info_stage().await;
        }

        for service in multi_stage_services {
            if let Err(err) = self.run_service(service, None, &envvars).await {
                warn!(service = %service.name, error = %err, "Multi-stage service failed to start");
                self.emit_status(&service.name, "", LogType::Service, depth, 0, LogStatus::Failed)
                    .await;
                self.flush_collector().await;
                return Err(err);
            }
        }

        info!(count = stages.len(), "Running stages");

        for stage in stages {
            if self.cancellation.is_fired() {
                self.emit_status(&stage.name, "", LogType::Stage, depth, 0, LogStatus::Canceled)
                    .await;
                continue;
            }

            let status = Arc::clone(self)
                .run_stage(depth, String::new(), stage.clone(), dir.to_string(), envvars.clone())
                .await?;

            if status == LogStatus::Failed {
                self.envvar_helper.set_env("ZIPLINEE_BUILD_STATUS", "failed");
            }
        }

        // run-scoped services live until the last stage is done
        self.orchestrator.stop_multi_stage_service_containers().await;
        let final_service_status = if self.cancellation.is_fired() {
            LogStatus::Canceled
        } else {
            LogStatus::Succeeded
        };
        for service in multi_stage_services {
            self.emit_status(&service.name, "", LogType::Service, depth, 0, final_service_status)
                .await;
        }

        self.flush_collector().await;

        Ok(self.steps.lock().await.clone())
    }

    /// Current snapshot of the step tree after draining in-flight records.
    /// Used by fatal paths that still want to ship whatever was collected.
    pub async fn build_log_steps(&self) -> Vec<BuildLogStep> {
        self.flush_collector().await;
        self.steps.lock().await.clone()
    }

    async fn run_builder_info_stage(&self) {
        let step = "builder-info";
        let mut record = TailLogLine::for_step(step, "", LogType::Stage, 0);
        record.auto_injected = Some(true);
        record.status = Some(LogStatus::Running);
        self.emit(record).await;

        self.emit_line(
            step,
            "",
            LogType::Stage,
            0,
            0,
            1,
            LogStream::Stdout,
            &format!(
                "Running {} version {}",
                self.application_info.app, self.application_info.version
            ),
        )
        .await;
        self.emit_line(
            step,
            "",
            LogType::Stage,
            0,
            0,
            2,
            LogStream::Stdout,
            &self.orchestrator.info().await,
        )
        .await;

        self.emit_status(step, "", LogType::Stage, 0, 0, LogStatus::Succeeded)
            .await;
    }

    /// Runs one stage (possibly a parallel group) to a terminal status.
    /// Boxed because parallel groups recurse into their sub-stages.
    fn run_stage(
        self: Arc<Self>,
        depth: u32,
        parent_stage: String,
        stage: ZiplineeStage,
        dir: String,
        envvars: HashMap<String, String>,
    ) -> BoxFuture<'static, Result<LogStatus>> {
        Box::pin(self.run_stage_inner(depth, parent_stage, stage, dir, envvars))
    }

    async fn run_stage_inner(
        self: Arc<Self>,
        depth: u32,
        parent_stage: String,
        stage: ZiplineeStage,
        dir: String,
        envvars: HashMap<String, String>,
    ) -> Result<LogStatus> {
        let parameters = self.when_evaluator.parameters();
        let pipeline = self.envvar_helper.get_pipeline_name().unwrap_or_default();

        let should_run = self
            .when_evaluator
            .evaluate(&pipeline, &stage.when, &parameters)?;

        if !should_run {
            info!(stage = %stage.name, when = %stage.when, "Skipping stage");
            self.emit_status(
                &stage.name,
                &parent_stage,
                LogType::Stage,
                depth,
                0,
                LogStatus::Skipped,
            )
            .await;
            return Ok(LogStatus::Skipped);
        }

        if !stage.parallel_stages.is_empty() {
            return self
                .run_parallel_stages(depth, parent_stage, stage, dir, envvars)
                .await;
        }

        let retries = stage.retries;
        let mut status = LogStatus::Failed;

        for run_index in 0..=retries {
            if self.cancellation.is_fired() {
                status = LogStatus::Canceled;
                self.emit_status(
                    &stage.name,
                    &parent_stage,
                    LogType::Stage,
                    depth,
                    run_index,
                    status,
                )
                .await;
                break;
            }

            if run_index > 0 {
                info!(stage = %stage.name, attempt = run_index, "Retrying stage");
            }

            status = self
                .run_stage_attempt(depth, &parent_stage, &stage, &dir, &envvars, run_index)
                .await;

            if status != LogStatus::Failed {
                break;
            }
        }

        Ok(status)
    }

    async fn run_parallel_stages(
        self: Arc<Self>,
        depth: u32,
        parent_stage: String,
        stage: ZiplineeStage,
        dir: String,
        envvars: HashMap<String, String>,
    ) -> Result<LogStatus> {
        info!(
            stage = %stage.name,
            count = stage.parallel_stages.len(),
            "Running parallel stages"
        );

        let started_at = Instant::now();
        self.emit_status(
            &stage.name,
            &parent_stage,
            LogType::Stage,
            depth,
            0,
            LogStatus::Running,
        )
        .await;

        let mut handles = Vec::with_capacity(stage.parallel_stages.len());
        for sub_stage in &stage.parallel_stages {
            let runner = Arc::clone(&self);
            let sub_stage = sub_stage.clone();
            let parent_name = stage.name.clone();
            let dir = dir.clone();
            let envvars = envvars.clone();
            handles.push(tokio::spawn(async move {
                runner
                    .run_stage(depth + 1, parent_name, sub_stage, dir, envvars)
                    .await
            }));
        }

        // the group completes only when every sub-stage has terminated
        let mut statuses = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(status)) => statuses.push(status),
                Ok(Err(err)) => first_error = first_error.or(Some(err)),
                Err(join_err) => {
                    first_error =
                        first_error.or(Some(Error::Other(format!("stage task panicked: {join_err}"))));
                }
            }
        }
        if let Some(err) = first_error {
            self.emit_status(
                &stage.name,
                &parent_stage,
                LogType::Stage,
                depth,
                0,
                LogStatus::Failed,
            )
            .await;
            return Err(err);
        }

        let group_status = worst_status(&statuses);

        let mut record = TailLogLine::for_step(&stage.name, &parent_stage, LogType::Stage, depth);
        record.status = Some(group_status);
        record.duration_ms = Some(started_at.elapsed().as_millis() as u64);
        self.emit(record).await;

        Ok(group_status)
    }

    /// One attempt of a commands stage: services, pull, start, tail, exit.
    async fn run_stage_attempt(
        &self,
        depth: u32,
        parent_stage: &str,
        stage: &ZiplineeStage,
        dir: &str,
        envvars: &HashMap<String, String>,
        run_index: u32,
    ) -> LogStatus {
        let started_at = Instant::now();

        let outcome: std::result::Result<i64, String> = async {
            for service in &stage.services {
                self.run_service(service, Some(stage), envvars)
                    .await
                    .map_err(|err| err.to_string())?;
            }

            let image_info = self
                .prepare_image(stage, parent_stage)
                .await
                .map_err(|err| err.to_string())?;

            let mut record =
                TailLogLine::for_step(&stage.name, parent_stage, LogType::Stage, depth);
            record.run_index = run_index;
            record.image = Some(image_info);
            record.status = Some(LogStatus::Running);
            self.emit(record).await;

            let container_id = self
                .orchestrator
                .start_stage_container(depth, dir, envvars, parent_stage, stage)
                .await
                .map_err(|err| err.to_string())?;

            self.orchestrator
                .tail_container_logs(
                    &container_id,
                    parent_stage,
                    &stage.name,
                    LogType::Stage,
                    depth,
                    run_index,
                )
                .await
                .map_err(|err| err.to_string())
        }
        .await;

        let attempt_errored = outcome.is_err();

        let (status, exit_code) = match outcome {
            Ok(0) => (LogStatus::Succeeded, 0),
            Ok(exit_code) if self.cancellation.is_fired() => (LogStatus::Canceled, exit_code),
            Ok(exit_code) => (LogStatus::Failed, exit_code),
            Err(message) => {
                let status = if self.cancellation.is_fired() {
                    LogStatus::Canceled
                } else {
                    LogStatus::Failed
                };
                self.emit_line(
                    &stage.name,
                    parent_stage,
                    LogType::Stage,
                    depth,
                    run_index,
                    1,
                    LogStream::Stderr,
                    &message,
                )
                .await;
                (status, -1)
            }
        };

        // single-stage services do not outlive their stage attempt
        if !stage.services.is_empty() {
            self.orchestrator
                .stop_single_stage_service_containers(&stage.name)
                .await;
            let service_status = if self.cancellation.is_fired() {
                LogStatus::Canceled
            } else if attempt_errored {
                // service startup or readiness broke the attempt
                LogStatus::Failed
            } else {
                LogStatus::Succeeded
            };
            for service in &stage.services {
                self.emit_status(
                    &service.name,
                    &stage.name,
                    LogType::Service,
                    depth + 1,
                    0,
                    service_status,
                )
                .await;
            }
        }

        let mut record = TailLogLine::for_step(&stage.name, parent_stage, LogType::Stage, depth);
        record.run_index = run_index;
        record.status = Some(status);
        record.exit_code = Some(exit_code);
        record.duration_ms = Some(started_at.elapsed().as_millis() as u64);
        self.emit(record).await;

        status
    }

    /// Ensures the stage image is present and reports image metadata.
    async fn prepare_image(
        &self,
        stage: &ZiplineeStage,
        parent_stage: &str,
    ) -> Result<ContainerImageInfo> {
        let image = &stage.container_image;
        if image.is_empty() {
            return Err(Error::Stage {
                stage: stage.name.clone(),
                message: "stage has no container image".to_string(),
            });
        }

        let already_pulled = self.orchestrator.is_image_pulled(&stage.name, image).await;
        let pull_duration_ms = if already_pulled {
            0
        } else {
            self.orchestrator
                .pull_image(&stage.name, parent_stage, image)
                .await?
        };

        let image_size = self.orchestrator.get_image_size(image).await.unwrap_or(0);
        let (name, tag) = split_image_reference(image);

        Ok(ContainerImageInfo {
            name,
            tag,
            is_pulled: already_pulled,
            image_size,
            pull_duration_ms,
            is_trusted: self.orchestrator.is_trusted_image(image),
            has_injected_credentials: self.orchestrator.has_injected_credentials(image),
        })
    }

    /// Starts a service container, waits for readiness and leaves its log
    /// tailer running in the background until the service is stopped.
    async fn run_service(
        &self,
        service: &ZiplineeService,
        parent_stage: Option<&ZiplineeStage>,
        envvars: &HashMap<String, String>,
    ) -> Result<()> {
        let parent_name = parent_stage.map(|s| s.name.as_str()).unwrap_or("");
        let depth = if parent_stage.is_some() { 1 } else { 0 };
        let log_type = LogType::Service;

        let image = &service.container_image;
        if !self.orchestrator.is_image_pulled(&service.name, image).await {
            self.orchestrator
                .pull_image(&service.name, parent_name, image)
                .await?;
        }

        let mut record = TailLogLine::for_step(&service.name, parent_name, log_type, depth);
        record.status = Some(LogStatus::Running);
        self.emit(record).await;

        let container_id = self
            .orchestrator
            .start_service_container(envvars, service, parent_stage.map(|s| s.name.as_str()))
            .await?;

        // tail until the service container is stopped at stage or run end
        {
            let orchestrator = Arc::clone(&self.orchestrator);
            let container_id = container_id.clone();
            let service_name = service.name.clone();
            let parent_name = parent_name.to_string();
            tokio::spawn(async move {
                let _ = orchestrator
                    .tail_container_logs(
                        &container_id,
                        &parent_name,
                        &service_name,
                        LogType::Service,
                        depth,
                        0,
                    )
                    .await;
            });
        }

        if let Some(probe) = &service.readiness_probe {
            self.orchestrator.run_readiness_probe(service, probe).await?;
        }

        Ok(())
    }
}

/// Worst-wins aggregation for a parallel group: failed > canceled >
/// succeeded; an all-skipped group is skipped.
fn worst_status(statuses: &[LogStatus]) -> LogStatus {
    if statuses.iter().any(|s| *s == LogStatus::Failed) {
        LogStatus::Failed
    } else if statuses.iter().any(|s| *s == LogStatus::Canceled) {
        LogStatus::Canceled
    } else if statuses.iter().any(|s| *s == LogStatus::Succeeded) {
        LogStatus::Succeeded
    } else {
        LogStatus::Skipped
    }
}

fn split_image_reference(image: &str) -> (String, String) {
    let without_digest = image.split('@').next().unwrap_or(image);
    match (without_digest.rfind(':'), without_digest.rfind('/')) {
        (Some(colon), Some(slash)) if colon > slash => (
            without_digest[..colon].to_string(),
            without_digest[colon + 1..].to_string(),
        ),
        (Some(colon), None) => (
            without_digest[..colon].to_string(),
            without_digest[colon + 1..].to_string(),
        ),
        _ => (without_digest.to_string(), "latest".to_string()),
    }
}
