//! End-to-end scheduler scenarios against a scripted orchestrator fake.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use ziplinee_builder::docker::ContainerOrchestrator;
use ziplinee_builder::error::{Error, Result};
use ziplinee_builder::{
    ApplicationInfo, CancellationSignal, EnvvarHelper, Obfuscator, PipelineRunner,
    WhenEvaluator,
};
use ziplinee_contracts::{
    BuildLogLine, BuildLogStep, LogStatus, LogStream, LogType, ReadinessProbe, TailLogLine,
    ZiplineeService, ZiplineeStage, aggregated_status,
};

/// Scripted behavior for one stage name.
#[derive(Default, Clone)]
struct StageScript {
    /// Exit codes per attempt; missing attempts exit 0.
    exit_codes: Vec<i64>,
    /// Lines the container "prints" on stdout.
    lines: Vec<String>,
    /// Simulated run duration.
    delay_ms: u64,
}

#[derive(Default)]
struct FakeOrchestrator {
    tail_tx: Option<mpsc::Sender<TailLogLine>>,
    obfuscator: Option<Arc<Obfuscator>>,
    scripts: HashMap<String, StageScript>,
    failing_services: Vec<String>,
    started: Mutex<Vec<String>>,
    attempts: Mutex<HashMap<String, u32>>,
    stopped_services_of: Mutex<Vec<String>>,
}

impl FakeOrchestrator {
    fn new(tail_tx: mpsc::Sender<TailLogLine>, obfuscator: Arc<Obfuscator>) -> Self {
        FakeOrchestrator {
            tail_tx: Some(tail_tx),
            obfuscator: Some(obfuscator),
            ..Default::default()
        }
    }

    fn script(mut self, stage: &str, script: StageScript) -> Self {
        self.scripts.insert(stage.to_string(), script);
        self
    }

    fn with_failing_service(mut self, service: &str) -> Self {
        self.failing_services.push(service.to_string());
        self
    }

    async fn started_containers(&self) -> Vec<String> {
        self.started.lock().await.clone()
    }
}

#[async_trait]
impl ContainerOrchestrator for FakeOrchestrator {
    async fn create_docker_client(&self) -> Result<()> {
        Ok(())
    }
    async fn start_docker_daemon(&self) -> Result<()> {
        Ok(())
    }
    async fn wait_for_docker_daemon(&self) -> Result<()> {
        Ok(())
    }
    async fn create_networks(&self) -> Result<()> {
        Ok(())
    }
    async fn delete_networks(&self) -> Result<()> {
        Ok(())
    }

    async fn is_image_pulled(&self, _stage_name: &str, _image: &str) -> bool {
        true
    }
    async fn pull_image(&self, _stage_name: &str, _parent_stage: &str, _image: &str) -> Result<u64> {
        Ok(0)
    }
    async fn get_image_size(&self, _image: &str) -> Result<i64> {
        Ok(0)
    }

    fn is_trusted_image(&self, _image: &str) -> bool {
        false
    }
    fn has_injected_credentials(&self, _image: &str) -> bool {
        false
    }

    async fn start_stage_container(
        &self,
        _depth: u32,
        _dir: &str,
        _envvars: &HashMap<String, String>,
        _parent_stage: &str,
        stage: &ZiplineeStage,
    ) -> Result<String> {
        self.started.lock().await.push(stage.name.clone());
        Ok(stage.name.clone())
    }

    async fn start_service_container(
        &self,
        _envvars: &HashMap<String, String>,
        service: &ZiplineeService,
        _parent_stage: Option<&str>,
    ) -> Result<String> {
        self.started
            .lock()
            .await
            .push(format!("service:{}", service.name));
        Ok(service.name.clone())
    }

    async fn run_readiness_probe(
        &self,
        service: &ZiplineeService,
        probe: &ReadinessProbe,
    ) -> Result<()> {
        if self.failing_services.contains(&service.name) {
            return Err(Error::ReadinessTimeout {
                service: service.name.clone(),
                timeout_seconds: probe.timeout_seconds,
            });
        }
        Ok(())
    }

    async fn tail_container_logs(
        &self,
        container_id: &str,
        parent_stage: &str,
        step_name: &str,
        log_type: LogType,
        depth: u32,
        run_index: u32,
    ) -> Result<i64> {
        if log_type == LogType::Service {
            return Ok(0);
        }

        let script = self.scripts.get(container_id).cloned().unwrap_or_default();
        if script.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(script.delay_ms)).await;
        }

        let tail_tx = self.tail_tx.as_ref().expect("fake has a sender");
        let obfuscator = self.obfuscator.as_ref().expect("fake has an obfuscator");

        for (index, text) in script.lines.iter().enumerate() {
            let mut record = TailLogLine::for_step(step_name, parent_stage, log_type, depth);
            record.run_index = run_index;
            record.log_line = Some(BuildLogLine {
                line_number: index as u32 + 1,
                timestamp: Utc::now(),
                stream_type: LogStream::Stdout,
                text: obfuscator.obfuscate(text),
            });
            let _ = tail_tx.send(record).await;
        }

        let mut attempts = self.attempts.lock().await;
        let attempt = attempts.entry(container_id.to_string()).or_insert(0);
        let exit_code = script
            .exit_codes
            .get(*attempt as usize)
            .copied()
            .unwrap_or(0);
        *attempt += 1;

        Ok(exit_code)
    }

    async fn stop_single_stage_service_containers(&self, parent_stage: &str) {
        self.stopped_services_of
            .lock()
            .await
            .push(parent_stage.to_string());
    }
    async fn stop_multi_stage_service_containers(&self) {}
    async fn stop_all_containers(&self) {}

    async fn info(&self) -> String {
        "fake orchestrator".to_string()
    }
}

struct Harness {
    runner: Arc<PipelineRunner>,
    orchestrator: Arc<FakeOrchestrator>,
    envvar_helper: Arc<EnvvarHelper>,
    cancellation: CancellationSignal,
}

async fn harness<F>(configure: F) -> Harness
where
    F: FnOnce(FakeOrchestrator) -> FakeOrchestrator,
{
    let secret_helper =
        ziplinee_crypt::SecretHelper::new("0123456789abcdef0123456789abcdef").unwrap();
    let envvar_helper = Arc::new(EnvvarHelper::new("ZIPLINEE_", secret_helper.clone()));
    envvar_helper.unset_all();
    envvar_helper.set_env("ZIPLINEE_BUILD_STATUS", "succeeded");

    let obfuscator = Arc::new(Obfuscator::new(secret_helper));
    let when_evaluator = Arc::new(WhenEvaluator::new(Arc::clone(&envvar_helper)));
    let cancellation = CancellationSignal::new();

    let (tail_tx, tail_rx) = mpsc::channel(10_000);
    let orchestrator = Arc::new(configure(FakeOrchestrator::new(
        tail_tx.clone(),
        Arc::clone(&obfuscator),
    )));

    let runner = Arc::new(PipelineRunner::new(
        Arc::clone(&envvar_helper),
        when_evaluator,
        obfuscator,
        orchestrator.clone() as Arc<dyn ContainerOrchestrator>,
        ApplicationInfo::new("ziplinee-ci-builder", "0.0.0-test"),
        cancellation.clone(),
        tail_tx,
        tail_rx,
    ));

    Harness {
        runner,
        orchestrator,
        envvar_helper,
        cancellation,
    }
}

fn stage(name: &str, image: &str) -> ZiplineeStage {
    ZiplineeStage {
        name: name.to_string(),
        container_image: image.to_string(),
        commands: vec![format!("echo {name}")],
        ..Default::default()
    }
}

fn find_step<'a>(steps: &'a [BuildLogStep], name: &str) -> &'a BuildLogStep {
    steps
        .iter()
        .find(|s| s.step == name)
        .unwrap_or_else(|| panic!("step {name} not found"))
}

#[tokio::test]
async fn happy_path_runs_all_stages_to_success() {
    let harness = harness(|fake| {
        fake.script(
            "build",
            StageScript {
                lines: vec!["hi".to_string()],
                ..Default::default()
            },
        )
    })
    .await;

    let stages = vec![stage("build", "alpine:3"), stage("test", "alpine:3")];
    let steps = harness
        .runner
        .run_stages(0, &stages, &[], "/work", HashMap::new())
        .await
        .unwrap();

    assert_eq!(find_step(&steps, "build").status, LogStatus::Succeeded);
    assert_eq!(find_step(&steps, "test").status, LogStatus::Succeeded);
    assert_eq!(aggregated_status(&steps), LogStatus::Succeeded);
}

#[tokio::test]
async fn log_lines_are_monotonic_within_a_step() {
    let harness = harness(|fake| {
        fake.script(
            "build",
            StageScript {
                lines: (1..=5).map(|i| format!("line {i}")).collect(),
                ..Default::default()
            },
        )
    })
    .await;

    let stages = vec![stage("build", "alpine:3")];
    let steps = harness
        .runner
        .run_stages(0, &stages, &[], "/work", HashMap::new())
        .await
        .unwrap();

    let build = find_step(&steps, "build");
    for (index, line) in build.log_lines.iter().enumerate() {
        assert_eq!(line.line_number, index as u32 + 1);
    }
}

#[tokio::test]
async fn failed_stage_lets_cleanup_stage_run_and_skips_the_rest() {
    let harness = harness(|fake| {
        fake.script(
            "build",
            StageScript {
                exit_codes: vec![1],
                ..Default::default()
            },
        )
    })
    .await;

    let mut notify = stage("notify", "alpine:3");
    notify.when = "status == 'failed'".to_string();
    let deploy = stage("deploy", "alpine:3"); // default when: status == 'succeeded'

    let stages = vec![stage("build", "alpine:3"), deploy, notify];
    let steps = harness
        .runner
        .run_stages(0, &stages, &[], "/work", HashMap::new())
        .await
        .unwrap();

    assert_eq!(find_step(&steps, "build").status, LogStatus::Failed);
    assert_eq!(find_step(&steps, "deploy").status, LogStatus::Skipped);
    assert_eq!(find_step(&steps, "notify").status, LogStatus::Succeeded);
    assert_eq!(aggregated_status(&steps), LogStatus::Failed);
}

#[tokio::test]
async fn skipped_stage_creates_no_container() {
    let harness = harness(|fake| fake).await;
    harness
        .envvar_helper
        .set_env("ZIPLINEE_GIT_BRANCH", "feature/x");

    let mut only_main = stage("release", "alpine:3");
    only_main.when = "branch == 'main'".to_string();

    let steps = harness
        .runner
        .run_stages(0, &[only_main], &[], "/work", HashMap::new())
        .await
        .unwrap();

    assert_eq!(find_step(&steps, "release").status, LogStatus::Skipped);
    assert!(harness.orchestrator.started_containers().await.is_empty());
    assert_eq!(aggregated_status(&steps), LogStatus::Succeeded);
}

#[tokio::test]
async fn secret_plaintext_never_reaches_the_build_log() {
    let harness = harness(|fake| {
        fake.script(
            "build",
            StageScript {
                lines: vec!["echo hunter2".to_string()],
                ..Default::default()
            },
        )
    })
    .await;

    // registered before stages run, as the coordinator does
    harness_obfuscator(&harness).add_secret("hunter2");

    let steps = harness
        .runner
        .run_stages(0, &[stage("build", "alpine:3")], &[], "/work", HashMap::new())
        .await
        .unwrap();

    let build = find_step(&steps, "build");
    assert_eq!(build.log_lines[0].text, "echo ***");
    assert!(
        steps
            .iter()
            .flat_map(|s| &s.log_lines)
            .all(|l| !l.text.contains("hunter2"))
    );
}

// the fake shares the runner's obfuscator; reach it through a fresh handle
fn harness_obfuscator(harness: &Harness) -> Arc<Obfuscator> {
    harness
        .orchestrator
        .obfuscator
        .as_ref()
        .expect("fake has an obfuscator")
        .clone()
}

#[tokio::test]
async fn readiness_timeout_fails_the_stage_and_stops_its_services() {
    let harness = harness(|fake| fake.with_failing_service("api")).await;

    let mut with_service = stage("integration", "alpine:3");
    with_service.services = vec![ZiplineeService {
        name: "api".to_string(),
        container_image: "api:latest".to_string(),
        readiness_probe: Some(ReadinessProbe {
            port: 8080,
            path: "/healthz".to_string(),
            timeout_seconds: 2,
            ..Default::default()
        }),
        ..Default::default()
    }];

    let steps = harness
        .runner
        .run_stages(0, &[with_service], &[], "/work", HashMap::new())
        .await
        .unwrap();

    let integration = find_step(&steps, "integration");
    assert_eq!(integration.status, LogStatus::Failed);
    assert!(
        integration.log_lines[0].text.contains("not ready"),
        "error line should mention readiness: {}",
        integration.log_lines[0].text
    );
    assert_eq!(
        harness.orchestrator.stopped_services_of.lock().await.as_slice(),
        ["integration"]
    );
}

#[tokio::test]
async fn retries_produce_one_attempt_per_configured_retry_plus_one() {
    let harness = harness(|fake| {
        fake.script(
            "flaky",
            StageScript {
                exit_codes: vec![1, 1, 1],
                ..Default::default()
            },
        )
    })
    .await;

    let mut flaky = stage("flaky", "alpine:3");
    flaky.retries = 2;

    let steps = harness
        .runner
        .run_stages(0, &[flaky], &[], "/work", HashMap::new())
        .await
        .unwrap();

    let attempts: Vec<&BuildLogStep> = steps.iter().filter(|s| s.step == "flaky").collect();
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|a| a.status == LogStatus::Failed));
    assert_eq!(aggregated_status(&steps), LogStatus::Failed);
}

#[tokio::test]
async fn successful_retry_recovers_the_build() {
    let harness = harness(|fake| {
        fake.script(
            "flaky",
            StageScript {
                exit_codes: vec![1, 0],
                ..Default::default()
            },
        )
    })
    .await;

    let mut flaky = stage("flaky", "alpine:3");
    flaky.retries = 1;

    let steps = harness
        .runner
        .run_stages(0, &[flaky], &[], "/work", HashMap::new())
        .await
        .unwrap();

    let attempts: Vec<&BuildLogStep> = steps.iter().filter(|s| s.step == "flaky").collect();
    assert_eq!(attempts.len(), 2);
    assert_eq!(aggregated_status(&steps), LogStatus::Succeeded);
}

#[tokio::test]
async fn parallel_group_aggregates_worst_status_and_overlaps_execution() {
    let harness = harness(|fake| {
        fake.script(
            "par-a",
            StageScript {
                delay_ms: 300,
                ..Default::default()
            },
        )
        .script(
            "par-b",
            StageScript {
                exit_codes: vec![1, 1],
                delay_ms: 300,
                ..Default::default()
            },
        )
    })
    .await;

    let mut group = stage("integration", "");
    group.commands = Vec::new();
    let mut par_b = stage("par-b", "alpine:3");
    par_b.retries = 1;
    group.parallel_stages = vec![stage("par-a", "alpine:3"), par_b];

    let started_at = Instant::now();
    let steps = harness
        .runner
        .run_stages(0, &[group], &[], "/work", HashMap::new())
        .await
        .unwrap();
    let elapsed = started_at.elapsed();

    let parent = find_step(&steps, "integration");
    assert_eq!(parent.status, LogStatus::Failed);

    let child_names: Vec<&str> = parent
        .nested_steps
        .iter()
        .map(|s| s.step.as_str())
        .collect();
    assert!(child_names.contains(&"par-a"));
    assert!(child_names.contains(&"par-b"));

    // a is 300ms, b is 2 attempts x 300ms; sequential would be ≥ 900ms
    assert!(
        elapsed < Duration::from_millis(850),
        "group should overlap children, took {elapsed:?}"
    );
}

#[tokio::test]
async fn cancellation_marks_unstarted_stages_canceled() {
    let harness = harness(|fake| fake).await;
    harness.cancellation.fire();

    let stages = vec![stage("build", "alpine:3"), stage("test", "alpine:3")];
    let steps = harness
        .runner
        .run_stages(0, &stages, &[], "/work", HashMap::new())
        .await
        .unwrap();

    assert!(steps.iter().all(|s| s.status == LogStatus::Canceled));
    assert!(harness.orchestrator.started_containers().await.is_empty());
    assert_eq!(aggregated_status(&steps), LogStatus::Canceled);
}

#[tokio::test]
async fn builder_info_step_is_injected_once_at_the_top() {
    let harness = harness(|fake| fake).await;
    harness.runner.enable_builder_info_stage_injection();

    let steps = harness
        .runner
        .run_stages(0, &[stage("build", "alpine:3")], &[], "/work", HashMap::new())
        .await
        .unwrap();

    assert_eq!(steps[0].step, "builder-info");
    assert!(steps[0].auto_injected);
    assert_eq!(steps[0].status, LogStatus::Succeeded);
    assert_eq!(steps.iter().filter(|s| s.step == "builder-info").count(), 1);
}

#[tokio::test]
async fn failed_stage_flips_build_status_parameter() {
    let harness = harness(|fake| {
        fake.script(
            "build",
            StageScript {
                exit_codes: vec![1],
                ..Default::default()
            },
        )
    })
    .await;

    let stages = vec![stage("build", "alpine:3")];
    harness
        .runner
        .run_stages(0, &stages, &[], "/work", HashMap::new())
        .await
        .unwrap();

    assert_eq!(
        harness.envvar_helper.get_env("ZIPLINEE_BUILD_STATUS").unwrap(),
        "failed"
    );
}
