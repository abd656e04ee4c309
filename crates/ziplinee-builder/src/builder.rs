//! Entry coordinator: wires env seeding, secret collection, the container
//! daemon, cancellation and end-of-life reporting together per run mode.

use crate::ApplicationInfo;
use crate::docker::ContainerOrchestrator;
use crate::envvar::EnvvarHelper;
use crate::eol::EndOfLifeHelper;
use crate::error::{Error, Result};
use crate::obfuscate::Obfuscator;
use crate::pipeline::PipelineRunner;
use crate::readiness::wait_for_readiness_http_get;
use console::style;
use std::sync::Arc;
use tracing::{error, info};
use ziplinee_contracts::{
    BuildLog, BuildLogStep, BuilderConfig, BuilderType, JobType, LogStatus, ZiplineeManifest,
    ZiplineeStage, aggregated_status, has_succeeded_status, has_unknown_status,
};

const MANIFEST_FILE: &str = ".ziplinee.yaml";

pub struct CiBuilder {
    application_info: ApplicationInfo,
}

impl CiBuilder {
    pub fn new(application_info: ApplicationInfo) -> Self {
        CiBuilder { application_info }
    }

    pub fn application_info(&self) -> &ApplicationInfo {
        &self.application_info
    }

    /// Readiness-probe mode: one HTTP GET loop, then exit. Never returns.
    pub async fn run_readiness_probe(
        &self,
        scheme: &str,
        host: &str,
        port: u16,
        path: &str,
        hostname: &str,
        timeout_seconds: u64,
    ) {
        match wait_for_readiness_http_get(scheme, host, port, path, hostname, timeout_seconds).await
        {
            Ok(()) => std::process::exit(0),
            Err(err) => {
                error!(error = %err, "Readiness probe failed");
                std::process::exit(1);
            }
        }
    }

    /// Hosted-job mode: full end-of-life protocol against the control
    /// plane. Exits the process when done.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_build_job(
        &self,
        pipeline_runner: Arc<PipelineRunner>,
        orchestrator: Arc<dyn ContainerOrchestrator>,
        envvar_helper: Arc<EnvvarHelper>,
        obfuscator: Arc<Obfuscator>,
        end_of_life_helper: Arc<EndOfLifeHelper>,
        builder_config: BuilderConfig,
        credentials_bytes: Vec<u8>,
        run_as_job: bool,
    ) {
        let mut build_log = build_log_from_config(&builder_config);

        // set running state, so a restarted job shows up as running again
        let _ = end_of_life_helper.send_build_started_event().await;

        end_of_life_helper.spawn_jwt_expiry_watcher(pipeline_runner.cancellation());

        let run_result = self
            .run_build_job_inner(
                Arc::clone(&pipeline_runner),
                Arc::clone(&orchestrator),
                envvar_helper,
                obfuscator,
                &builder_config,
                credentials_bytes,
            )
            .await;

        let steps = match run_result {
            Ok(steps) => steps,
            Err((err, message)) => {
                build_log.steps = pipeline_runner.build_log_steps().await;
                end_of_life_helper
                    .handle_fatal(build_log, Some(&err), &message)
                    .await;
                return;
            }
        };
        build_log.steps = steps;

        orchestrator.stop_all_containers().await;
        let _ = orchestrator.delete_networks().await;

        let build_status = aggregated_status(&build_log.steps);
        let _ = end_of_life_helper
            .send_build_finished_event(build_status)
            .await;
        let _ = end_of_life_helper.send_build_job_log_event(&build_log).await;
        let _ = end_of_life_helper.send_build_clean_event(build_status).await;

        if run_as_job {
            std::process::exit(0);
        }
        handle_exit(&build_log.steps);
    }

    async fn run_build_job_inner(
        &self,
        pipeline_runner: Arc<PipelineRunner>,
        orchestrator: Arc<dyn ContainerOrchestrator>,
        envvar_helper: Arc<EnvvarHelper>,
        obfuscator: Arc<Obfuscator>,
        builder_config: &BuilderConfig,
        credentials_bytes: Vec<u8>,
    ) -> std::result::Result<Vec<BuildLogStep>, (Error, String)> {
        let fatal = |message: &str| {
            let message = message.to_string();
            move |err: Error| (err, message)
        };

        // drop anything the host environment leaked into our namespace
        envvar_helper.unset_all();

        envvar_helper
            .set_builder_config_envvars(builder_config)
            .map_err(fatal("Setting builder config envvars failed"))?;

        orchestrator
            .start_docker_daemon()
            .await
            .map_err(fatal("Starting docker daemon failed"))?;
        orchestrator
            .wait_for_docker_daemon()
            .await
            .map_err(fatal("Waiting for docker daemon failed"))?;

        {
            let runner = Arc::clone(&pipeline_runner);
            tokio::spawn(async move { runner.stop_pipeline_on_cancellation().await });
        }

        let dir = envvar_helper.work_dir().to_string();
        if dir.is_empty() {
            return Err((
                Error::Config("ZIPLINEE_WORKDIR is not set".to_string()),
                "Getting working directory from ZIPLINEE_WORKDIR failed".to_string(),
            ));
        }

        envvar_helper
            .set_global_envvars()
            .await
            .map_err(fatal("Setting global environment variables failed"))?;

        let manifest = builder_config
            .manifest
            .clone()
            .ok_or_else(|| Error::Config("builder config contains no manifest".to_string()))
            .map_err(fatal("Builder config contains no manifest"))?;

        let pipeline = envvar_helper
            .get_pipeline_name()
            .map_err(fatal("Resolving pipeline name failed"))?;

        obfuscator
            .collect_secrets(&manifest, &credentials_bytes, &pipeline)
            .map_err(fatal("Collecting secrets to obfuscate failed"))?;

        // a kubernetes-type builder gets its daemonless containers scheduled
        // elsewhere; everything else talks to the local daemon
        if manifest.builder.builder_type != BuilderType::Kubernetes {
            orchestrator
                .create_docker_client()
                .await
                .map_err(fatal("Creating docker client failed"))?;
        }

        orchestrator
            .create_networks()
            .await
            .map_err(fatal("Creating network failed"))?;

        match builder_config.job_type {
            JobType::Build => {
                let version = builder_config
                    .version
                    .as_ref()
                    .map(|v| v.version.clone())
                    .unwrap_or_default();
                info!(version, "Starting build");
            }
            JobType::Release => {
                let release = builder_config
                    .release
                    .as_ref()
                    .map(|r| r.name.clone())
                    .unwrap_or_default();
                info!(release, "Starting release");
            }
            JobType::Bot => {
                let bot = builder_config
                    .bot
                    .as_ref()
                    .map(|b| b.name.clone())
                    .unwrap_or_default();
                info!(bot, "Starting bot");
            }
        }

        let stages: Vec<ZiplineeStage> = builder_config.stages().into_iter().cloned().collect();

        let ziplinee_envvars = envvar_helper.collect_envvars_and_labels(&manifest);
        let global_envvars = envvar_helper.collect_global_envvars(&manifest);
        let envvars = EnvvarHelper::override_envvars(&[ziplinee_envvars, global_envvars]);

        pipeline_runner.enable_builder_info_stage_injection();
        match pipeline_runner
            .run_stages(0, &stages, &manifest.services, &dir, envvars)
            .await
        {
            Ok(steps) => Ok(steps),
            Err(err) => {
                // stages that ran to a known status still get reported the
                // normal way; only an indeterminate run is fatal
                let steps = pipeline_runner.build_log_steps().await;
                if has_unknown_status(&steps) {
                    Err((err, "Executing stages from manifest failed".to_string()))
                } else {
                    Ok(steps)
                }
            }
        }
    }

    /// External-agent mode: manifest from disk, no daemon bootstrap, no
    /// control-plane reporting. Exits with the worst stage's exit code.
    pub async fn run_agent_build(
        &self,
        pipeline_runner: Arc<PipelineRunner>,
        orchestrator: Arc<dyn ContainerOrchestrator>,
        envvar_helper: Arc<EnvvarHelper>,
        obfuscator: Arc<Obfuscator>,
        builder_config: BuilderConfig,
        credentials_bytes: Vec<u8>,
    ) {
        match self
            .run_agent_build_inner(
                pipeline_runner,
                orchestrator,
                envvar_helper,
                obfuscator,
                builder_config,
                credentials_bytes,
            )
            .await
        {
            Ok(steps) => {
                render_stats(&steps);
                handle_exit(&steps);
            }
            Err(err) => {
                error!(error = %err, "Agent build failed");
                std::process::exit(1);
            }
        }
    }

    async fn run_agent_build_inner(
        &self,
        pipeline_runner: Arc<PipelineRunner>,
        orchestrator: Arc<dyn ContainerOrchestrator>,
        envvar_helper: Arc<EnvvarHelper>,
        obfuscator: Arc<Obfuscator>,
        builder_config: BuilderConfig,
        credentials_bytes: Vec<u8>,
    ) -> Result<Vec<BuildLogStep>> {
        orchestrator.create_docker_client().await?;

        let manifest = read_manifest_from_file(MANIFEST_FILE)?;

        envvar_helper.set_pipeline_name(&builder_config).await?;
        envvar_helper.set_global_envvars().await?;

        let pipeline = envvar_helper.get_pipeline_name()?;
        obfuscator.collect_secrets(&manifest, &credentials_bytes, &pipeline)?;

        let dir = std::env::current_dir()?.display().to_string();

        {
            let runner = Arc::clone(&pipeline_runner);
            tokio::spawn(async move { runner.stop_pipeline_on_cancellation().await });
        }

        orchestrator.create_networks().await?;

        let ziplinee_envvars = envvar_helper.collect_envvars_and_labels(&manifest);
        let global_envvars = envvar_helper.collect_global_envvars(&manifest);
        let envvars = EnvvarHelper::override_envvars(&[ziplinee_envvars, global_envvars]);

        let steps = pipeline_runner
            .run_stages(0, &manifest.stages, &manifest.services, &dir, envvars)
            .await?;

        orchestrator.stop_all_containers().await;
        let _ = orchestrator.delete_networks().await;

        Ok(steps)
    }

    /// Local mode: run a named subset of manifest stages from the current
    /// checkout, without any control plane.
    pub async fn run_local_build(
        &self,
        pipeline_runner: Arc<PipelineRunner>,
        orchestrator: Arc<dyn ContainerOrchestrator>,
        envvar_helper: Arc<EnvvarHelper>,
        builder_config: BuilderConfig,
        stages_to_run: &[String],
    ) -> Result<()> {
        orchestrator.create_docker_client().await?;

        let manifest = read_manifest_from_file(MANIFEST_FILE)?;

        let stage_names: Vec<&str> = manifest.stages.iter().map(|s| s.name.as_str()).collect();
        let stages: Vec<ZiplineeStage> = manifest
            .stages
            .iter()
            .filter(|s| stages_to_run.iter().any(|name| name == &s.name))
            .cloned()
            .collect();

        if stages.is_empty() {
            return Err(Error::Config(format!(
                "choose one of the following stages: {}",
                stage_names.join(",")
            )));
        }

        let dir = std::env::current_dir()?.display().to_string();

        envvar_helper.unset_all();
        envvar_helper.set_pipeline_name(&builder_config).await?;
        envvar_helper.set_global_envvars().await?;

        let ziplinee_envvars = envvar_helper.collect_envvars_and_labels(&manifest);
        let global_envvars = envvar_helper.collect_global_envvars(&manifest);
        let envvars = EnvvarHelper::override_envvars(&[ziplinee_envvars, global_envvars]);

        {
            let runner = Arc::clone(&pipeline_runner);
            tokio::spawn(async move { runner.stop_pipeline_on_cancellation().await });
        }

        orchestrator.create_networks().await?;

        let steps = pipeline_runner
            .run_stages(0, &stages, &[], &dir, envvars)
            .await?;

        orchestrator.stop_all_containers().await;
        let _ = orchestrator.delete_networks().await;

        render_stats(&steps);

        if !has_succeeded_status(&steps) {
            return Err(Error::Other("failed running stages".to_string()));
        }

        Ok(())
    }
}

fn read_manifest_from_file(path: &str) -> Result<ZiplineeManifest> {
    let source = std::fs::read_to_string(path)
        .map_err(|err| Error::Config(format!("reading {path} failed: {err}")))?;
    ZiplineeManifest::from_yaml(&source)
        .map_err(|err| Error::Config(format!("parsing {path} failed: {err}")))
}

fn build_log_from_config(builder_config: &BuilderConfig) -> BuildLog {
    let git = builder_config.git.clone().unwrap_or_default();
    BuildLog {
        repo_source: git.repo_source,
        repo_owner: git.repo_owner,
        repo_name: git.repo_name,
        repo_branch: git.repo_branch,
        repo_revision: git.repo_revision,
        ..Default::default()
    }
}

/// Exit code for non-job runs: 0 when everything succeeded, otherwise the
/// worst stage's exit code (or 1 when a stage failed without one).
pub fn exit_code_for_steps(steps: &[BuildLogStep]) -> i32 {
    if aggregated_status(steps) == LogStatus::Succeeded {
        return 0;
    }

    steps
        .iter()
        .filter(|step| step.status == LogStatus::Failed && step.exit_code > 0)
        .map(|step| step.exit_code as i32)
        .next_back()
        .unwrap_or(1)
}

pub fn handle_exit(steps: &[BuildLogStep]) -> ! {
    std::process::exit(exit_code_for_steps(steps));
}

/// Prints a per-stage summary table for local and agent runs.
pub fn render_stats(steps: &[BuildLogStep]) {
    println!();
    for step in steps {
        let status = match step.status {
            LogStatus::Succeeded => style("✓").green().to_string(),
            LogStatus::Failed => style("✗").red().to_string(),
            LogStatus::Skipped => style("-").dim().to_string(),
            LogStatus::Canceled => style("■").yellow().to_string(),
            _ => style("?").dim().to_string(),
        };
        println!(
            "  {} {} ({:.2}s)",
            status,
            style(&step.step).bold(),
            step.duration_ms as f64 / 1000.0
        );
    }

    let overall = aggregated_status(steps);
    println!(
        "\n  {} overall: {}\n",
        if overall == LogStatus::Succeeded {
            style("✓").green()
        } else {
            style("✗").red()
        },
        overall.to_status()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, status: LogStatus, exit_code: i64) -> BuildLogStep {
        let mut step = BuildLogStep::new(name, 0);
        step.status = status;
        step.exit_code = exit_code;
        step
    }

    #[test]
    fn exit_code_zero_when_all_succeeded() {
        let steps = vec![
            step("build", LogStatus::Succeeded, 0),
            step("notify", LogStatus::Skipped, 0),
        ];
        assert_eq!(exit_code_for_steps(&steps), 0);
    }

    #[test]
    fn exit_code_matches_failed_stage() {
        let steps = vec![
            step("build", LogStatus::Succeeded, 0),
            step("test", LogStatus::Failed, 2),
        ];
        assert_eq!(exit_code_for_steps(&steps), 2);
    }

    #[test]
    fn exit_code_defaults_to_one_for_failures_without_code() {
        let steps = vec![step("build", LogStatus::Failed, -1)];
        assert_eq!(exit_code_for_steps(&steps), 1);
    }

    #[test]
    fn build_log_carries_repo_identity() {
        let config = BuilderConfig {
            git: Some(ziplinee_contracts::GitConfig {
                repo_source: "github.com".into(),
                repo_owner: "ziplineeci".into(),
                repo_name: "ziplinee-ci-builder".into(),
                repo_branch: "main".into(),
                repo_revision: "0ab1c2".into(),
            }),
            ..Default::default()
        };

        let build_log = build_log_from_config(&config);

        assert_eq!(build_log.repo_owner, "ziplineeci");
        assert_eq!(build_log.repo_branch, "main");
        assert!(build_log.steps.is_empty());
    }
}
