//! Container orchestration against the Docker Engine API.
//!
//! Owns the daemon lifecycle, the per-run bridge network, image pulls,
//! stage/service containers, readiness probes and log tailing. Containers
//! and networks are tracked in owned sets so teardown is complete on every
//! exit path.

use crate::envvar::{EnvvarHelper, to_upper_snake_case};
use crate::error::{Error, Result};
use crate::obfuscate::Obfuscator;
use crate::trusted::TrustedImagePolicy;
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, NetworkingConfig,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointSettings, HostConfig};
use bollard::network::CreateNetworkOptions;
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;
use ziplinee_contracts::{
    BuildLogLine, LogStream, LogType, ReadinessProbe, TailLogLine, ZiplineeService, ZiplineeStage,
};

const DOCKER_DAEMON_CONFIG: &str = "/daemon.json";
const DOCKER_SOCKET: &str = "/var/run/docker.sock";
const PROBE_BINARY_MOUNT: &str = "/ziplinee-ci-builder";
const PULL_RETRIES: u32 = 2;
const STOP_TIMEOUT_SECONDS: i64 = 5;

/// Seam between the pipeline runner and the container runtime.
#[async_trait]
pub trait ContainerOrchestrator: Send + Sync {
    async fn create_docker_client(&self) -> Result<()>;
    async fn start_docker_daemon(&self) -> Result<()>;
    async fn wait_for_docker_daemon(&self) -> Result<()>;

    async fn create_networks(&self) -> Result<()>;
    async fn delete_networks(&self) -> Result<()>;

    async fn is_image_pulled(&self, stage_name: &str, image: &str) -> bool;
    /// Pulls the image with bounded retries; returns the pull duration.
    async fn pull_image(&self, stage_name: &str, parent_stage: &str, image: &str) -> Result<u64>;
    async fn get_image_size(&self, image: &str) -> Result<i64>;

    fn is_trusted_image(&self, image: &str) -> bool;
    fn has_injected_credentials(&self, image: &str) -> bool;

    async fn start_stage_container(
        &self,
        depth: u32,
        dir: &str,
        envvars: &HashMap<String, String>,
        parent_stage: &str,
        stage: &ZiplineeStage,
    ) -> Result<String>;

    /// `parent_stage` is `None` for run-scoped (multi-stage) services.
    async fn start_service_container(
        &self,
        envvars: &HashMap<String, String>,
        service: &ZiplineeService,
        parent_stage: Option<&str>,
    ) -> Result<String>;

    async fn run_readiness_probe(
        &self,
        service: &ZiplineeService,
        probe: &ReadinessProbe,
    ) -> Result<()>;

    /// Streams the container's output as obfuscated, numbered log lines onto
    /// the shared channel, then waits for exit and returns the exit code.
    async fn tail_container_logs(
        &self,
        container_id: &str,
        parent_stage: &str,
        step_name: &str,
        log_type: LogType,
        depth: u32,
        run_index: u32,
    ) -> Result<i64>;

    async fn stop_single_stage_service_containers(&self, parent_stage: &str);
    async fn stop_multi_stage_service_containers(&self);
    async fn stop_all_containers(&self);

    async fn info(&self) -> String;
}

#[derive(Debug, Clone)]
struct TrackedContainer {
    /// Set for service containers; the owning stage for single-stage
    /// services, `None` for run-scoped ones.
    service_name: Option<String>,
    parent_stage: Option<String>,
}

pub struct DockerOrchestrator {
    docker: RwLock<Option<Docker>>,
    policy: TrustedImagePolicy,
    envvar_helper: Arc<EnvvarHelper>,
    obfuscator: Arc<Obfuscator>,
    tail_tx: mpsc::Sender<TailLogLine>,
    network_name: String,
    networks: Mutex<Vec<String>>,
    containers: Mutex<HashMap<String, TrackedContainer>>,
    daemon: Mutex<Option<tokio::process::Child>>,
}

impl DockerOrchestrator {
    pub fn new(
        policy: TrustedImagePolicy,
        envvar_helper: Arc<EnvvarHelper>,
        obfuscator: Arc<Obfuscator>,
        tail_tx: mpsc::Sender<TailLogLine>,
    ) -> Self {
        DockerOrchestrator {
            docker: RwLock::new(None),
            policy,
            envvar_helper,
            obfuscator,
            tail_tx,
            network_name: format!("ziplinee-{}", Uuid::new_v4().simple()),
            networks: Mutex::new(Vec::new()),
            containers: Mutex::new(HashMap::new()),
            daemon: Mutex::new(None),
        }
    }

    async fn docker(&self) -> Result<Docker> {
        self.docker
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Setup("docker client has not been created".to_string()))
    }

    async fn track(&self, container_id: &str, tracked: TrackedContainer) {
        self.containers
            .lock()
            .await
            .insert(container_id.to_string(), tracked);
    }

    async fn untrack(&self, container_id: &str) {
        self.containers.lock().await.remove(container_id);
    }

    /// Stops and force-kills one container; errors are logged, not returned,
    /// so teardown always proceeds.
    async fn stop_container(&self, docker: &Docker, container_id: &str) {
        if let Err(err) = docker
            .stop_container(
                container_id,
                Some(StopContainerOptions {
                    t: STOP_TIMEOUT_SECONDS,
                }),
            )
            .await
        {
            debug!(container = container_id, error = %err, "Graceful stop failed, killing");
            if let Err(err) = docker.kill_container::<String>(container_id, None).await {
                debug!(container = container_id, error = %err, "Kill failed");
            }
        }
        self.untrack(container_id).await;
    }

    async fn stop_tracked<F>(&self, predicate: F)
    where
        F: Fn(&TrackedContainer) -> bool,
    {
        let Ok(docker) = self.docker().await else {
            return;
        };

        let to_stop: Vec<String> = self
            .containers
            .lock()
            .await
            .iter()
            .filter(|(_, tracked)| predicate(tracked))
            .map(|(id, _)| id.clone())
            .collect();

        for container_id in to_stop {
            self.stop_container(&docker, &container_id).await;
        }
    }

    /// Network endpoint config attaching a container to the run network,
    /// with optional DNS aliases.
    async fn networking_config(&self, aliases: Vec<String>) -> Option<NetworkingConfig<String>> {
        let networks = self.networks.lock().await;
        if networks.is_empty() {
            return None;
        }

        let mut endpoints = HashMap::new();
        endpoints.insert(
            self.network_name.clone(),
            EndpointSettings {
                aliases: if aliases.is_empty() {
                    None
                } else {
                    Some(aliases)
                },
                ..Default::default()
            },
        );
        Some(NetworkingConfig {
            endpoints_config: endpoints,
        })
    }

    /// Formats the merged environment for a container, decrypting stage-level
    /// values against the pipeline name.
    fn container_env(
        &self,
        base: &HashMap<String, String>,
        stage_env: &HashMap<String, String>,
    ) -> Vec<String> {
        let pipeline = self.envvar_helper.get_pipeline_name().unwrap_or_default();
        let merged = EnvvarHelper::override_envvars(&[base.clone(), stage_env.clone()]);
        let merged = self.envvar_helper.decrypt_secrets(&merged, &pipeline);

        let mut env: Vec<String> = merged.iter().map(|(k, v)| format!("{k}={v}")).collect();
        env.sort();
        env
    }

    /// Writes injected credentials to a directory the container mounts at
    /// `/credentials`, and returns the env entries plus the host path.
    async fn prepare_injected_credentials(
        &self,
        image: &str,
    ) -> Result<(Vec<String>, Option<String>)> {
        let injected = self.policy.injected_credentials(image);
        if injected.is_empty() {
            return Ok((Vec::new(), None));
        }

        let mut by_type: HashMap<&str, Vec<&ziplinee_contracts::CredentialConfig>> = HashMap::new();
        for credential in injected {
            by_type
                .entry(credential.credential_type.as_str())
                .or_default()
                .push(credential);
        }

        let base_dir = if self.envvar_helper.temp_dir().is_empty() {
            std::env::temp_dir()
        } else {
            PathBuf::from(self.envvar_helper.temp_dir())
        };
        let credentials_dir = base_dir.join(format!("credentials-{}", Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&credentials_dir).await?;

        let mut env = Vec::new();
        for (credential_type, credentials) in by_type {
            let json = serde_json::to_string(&credentials)?;
            env.push(format!(
                "ZIPLINEE_CREDENTIALS_{}={json}",
                to_upper_snake_case(credential_type)
            ));

            let file = credentials_dir.join(format!("{credential_type}.json"));
            tokio::fs::write(&file, &json).await?;
        }
        env.sort();

        Ok((env, Some(credentials_dir.display().to_string())))
    }
}

/// Joins stage commands into a single shell script that stops at the first
/// failing command.
pub fn entrypoint_script(commands: &[String]) -> String {
    let mut script = String::from("set -e\n");
    script.push_str(&commands.join("\n"));
    script
}

#[async_trait]
impl ContainerOrchestrator for DockerOrchestrator {
    async fn create_docker_client(&self) -> Result<()> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Setup(format!("failed to connect to docker: {e}")))?;
        *self.docker.write().await = Some(docker);
        Ok(())
    }

    async fn start_docker_daemon(&self) -> Result<()> {
        info!("Starting docker daemon");

        let child = Command::new("dockerd")
            .arg("--config-file")
            .arg(DOCKER_DAEMON_CONFIG)
            .spawn()
            .map_err(|e| Error::Setup(format!("failed to start dockerd: {e}")))?;

        *self.daemon.lock().await = Some(child);
        Ok(())
    }

    async fn wait_for_docker_daemon(&self) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(60);

        loop {
            if let Ok(docker) = Docker::connect_with_local_defaults()
                && docker.info().await.is_ok()
            {
                info!("Docker daemon is ready");
                *self.docker.write().await = Some(docker);
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(Error::Setup(
                    "docker daemon did not become ready within 60s".to_string(),
                ));
            }

            sleep(Duration::from_secs(1)).await;
        }
    }

    async fn create_networks(&self) -> Result<()> {
        let docker = self.docker().await?;

        docker
            .create_network(CreateNetworkOptions {
                name: self.network_name.clone(),
                check_duplicate: true,
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await?;

        debug!(network = %self.network_name, "Created network");
        self.networks.lock().await.push(self.network_name.clone());
        Ok(())
    }

    async fn delete_networks(&self) -> Result<()> {
        let docker = self.docker().await?;

        let mut networks = self.networks.lock().await;
        for network in networks.drain(..) {
            if let Err(err) = docker.remove_network(&network).await {
                warn!(network = %network, error = %err, "Failed to remove network");
            } else {
                debug!(network = %network, "Removed network");
            }
        }
        Ok(())
    }

    async fn is_image_pulled(&self, stage_name: &str, image: &str) -> bool {
        let Ok(docker) = self.docker().await else {
            return false;
        };

        let pulled = docker.inspect_image(image).await.is_ok();
        debug!(stage = stage_name, image, pulled, "Checked local image presence");
        pulled
    }

    async fn pull_image(&self, stage_name: &str, parent_stage: &str, image: &str) -> Result<u64> {
        let docker = self.docker().await?;
        let start = Instant::now();

        info!(stage = stage_name, parent_stage, image, "Pulling image");

        let mut last_error = None;
        for attempt in 0..=PULL_RETRIES {
            if attempt > 0 {
                warn!(image, attempt, "Retrying image pull");
                sleep(Duration::from_secs(1)).await;
            }

            let mut stream = docker.create_image(
                Some(CreateImageOptions {
                    from_image: image.to_string(),
                    ..Default::default()
                }),
                None,
                None,
            );

            let mut failed = false;
            while let Some(progress) = stream.next().await {
                if let Err(err) = progress {
                    warn!(image, error = %err, "Image pull failed");
                    last_error = Some(err);
                    failed = true;
                    break;
                }
            }

            if !failed {
                return Ok(start.elapsed().as_millis() as u64);
            }
        }

        Err(last_error.map(Error::Docker).unwrap_or_else(|| {
            Error::Other(format!("pulling image {image} failed"))
        }))
    }

    async fn get_image_size(&self, image: &str) -> Result<i64> {
        let docker = self.docker().await?;
        let inspected = docker.inspect_image(image).await?;
        Ok(inspected.size.unwrap_or_default())
    }

    fn is_trusted_image(&self, image: &str) -> bool {
        self.policy.is_trusted(image)
    }

    fn has_injected_credentials(&self, image: &str) -> bool {
        self.policy.has_injected_credentials(image)
    }

    async fn start_stage_container(
        &self,
        depth: u32,
        dir: &str,
        envvars: &HashMap<String, String>,
        parent_stage: &str,
        stage: &ZiplineeStage,
    ) -> Result<String> {
        let image = &stage.container_image;
        let granted = self.policy.capabilities(image);
        let capabilities = self.policy.authorize(
            image,
            granted.run_privileged,
            granted.run_docker,
            !stage.commands.is_empty(),
        )?;

        let docker = self.docker().await?;
        let container_name = format!(
            "{}-{}",
            crate::envvar::make_dns_label_safe(&stage.name),
            Uuid::new_v4().simple()
        );

        let mut env = self.container_env(envvars, &stage.environment_variables);
        let (credential_env, credentials_dir) =
            self.prepare_injected_credentials(image).await?;
        env.extend(credential_env);

        let mut binds = vec![format!("{dir}:{}", stage.working_directory)];
        if capabilities.run_docker {
            binds.push(format!("{DOCKER_SOCKET}:{DOCKER_SOCKET}"));
        }
        if let Some(credentials_dir) = credentials_dir {
            binds.push(format!("{credentials_dir}:/credentials"));
        }

        let cmd = if stage.commands.is_empty() {
            None
        } else {
            Some(vec![
                stage.shell.clone(),
                "-c".to_string(),
                entrypoint_script(&stage.commands),
            ])
        };

        let config = Config {
            image: Some(image.clone()),
            cmd,
            env: Some(env),
            working_dir: Some(stage.working_directory.clone()),
            host_config: Some(HostConfig {
                binds: Some(binds),
                privileged: Some(capabilities.run_privileged),
                auto_remove: Some(false),
                ..Default::default()
            }),
            networking_config: self.networking_config(Vec::new()).await,
            ..Default::default()
        };

        docker
            .create_container(
                Some(CreateContainerOptions {
                    name: &container_name,
                    platform: None,
                }),
                config,
            )
            .await?;

        docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await?;

        info!(
            stage = %stage.name,
            parent_stage,
            depth,
            image = %image,
            container = %container_name,
            "Started stage container"
        );

        self.track(
            &container_name,
            TrackedContainer {
                service_name: None,
                parent_stage: (!parent_stage.is_empty()).then(|| parent_stage.to_string()),
            },
        )
        .await;

        Ok(container_name)
    }

    async fn start_service_container(
        &self,
        envvars: &HashMap<String, String>,
        service: &ZiplineeService,
        parent_stage: Option<&str>,
    ) -> Result<String> {
        let image = &service.container_image;
        let granted = self.policy.capabilities(image);
        let capabilities = self.policy.authorize(
            image,
            granted.run_privileged,
            granted.run_docker,
            !service.commands.is_empty(),
        )?;

        let docker = self.docker().await?;
        let container_name = format!(
            "{}-{}",
            crate::envvar::make_dns_label_safe(&service.name),
            Uuid::new_v4().simple()
        );

        let cmd = if service.commands.is_empty() {
            None
        } else {
            Some(vec![
                service.shell.clone(),
                "-c".to_string(),
                entrypoint_script(&service.commands),
            ])
        };

        let config = Config {
            image: Some(image.clone()),
            cmd,
            env: Some(self.container_env(envvars, &service.environment_variables)),
            host_config: Some(HostConfig {
                privileged: Some(capabilities.run_privileged),
                auto_remove: Some(false),
                ..Default::default()
            }),
            // the service name doubles as its dns name on the run network
            networking_config: self.networking_config(vec![service.name.clone()]).await,
            ..Default::default()
        };

        docker
            .create_container(
                Some(CreateContainerOptions {
                    name: &container_name,
                    platform: None,
                }),
                config,
            )
            .await?;

        docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await?;

        info!(
            service = %service.name,
            parent_stage = parent_stage.unwrap_or("<run>"),
            image = %image,
            container = %container_name,
            "Started service container"
        );

        self.track(
            &container_name,
            TrackedContainer {
                service_name: Some(service.name.clone()),
                parent_stage: parent_stage.map(|s| s.to_string()),
            },
        )
        .await;

        Ok(container_name)
    }

    /// Runs the probe inside a container on the run network, so the service
    /// is reached through the same DNS name stages will use. The builder's
    /// own binary is bind-mounted and invoked in readiness-probe mode.
    async fn run_readiness_probe(
        &self,
        service: &ZiplineeService,
        probe: &ReadinessProbe,
    ) -> Result<()> {
        let docker = self.docker().await?;

        let binary = std::env::current_exe()?;
        let container_name = format!("readiness-{}", Uuid::new_v4().simple());

        let host = if probe.host.is_empty() {
            service.name.clone()
        } else {
            probe.host.clone()
        };
        let hostname = if probe.hostname.is_empty() {
            host.clone()
        } else {
            probe.hostname.clone()
        };

        let env = vec![
            "RUN_AS_READINESS_PROBE=true".to_string(),
            format!("READINESS_SCHEME={}", probe.scheme),
            format!("READINESS_HOST={host}"),
            format!("READINESS_PORT={}", probe.port),
            format!("READINESS_PATH={}", probe.path),
            format!("READINESS_HOSTNAME={hostname}"),
            format!("READINESS_TIMEOUT_SECONDS={}", probe.timeout_seconds),
        ];

        let config = Config {
            image: Some(service.container_image.clone()),
            entrypoint: Some(vec![PROBE_BINARY_MOUNT.to_string()]),
            cmd: Some(Vec::new()),
            env: Some(env),
            host_config: Some(HostConfig {
                binds: Some(vec![format!(
                    "{}:{PROBE_BINARY_MOUNT}:ro",
                    binary.display()
                )]),
                auto_remove: Some(false),
                ..Default::default()
            }),
            networking_config: self.networking_config(Vec::new()).await,
            ..Default::default()
        };

        docker
            .create_container(
                Some(CreateContainerOptions {
                    name: &container_name,
                    platform: None,
                }),
                config,
            )
            .await?;
        docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await?;

        self.track(
            &container_name,
            TrackedContainer {
                service_name: Some(service.name.clone()),
                parent_stage: None,
            },
        )
        .await;

        let wait_result = timeout(
            Duration::from_secs(probe.timeout_seconds + 10),
            docker
                .wait_container(
                    &container_name,
                    Some(WaitContainerOptions {
                        condition: "not-running",
                    }),
                )
                .next(),
        )
        .await;

        let exit_code = match wait_result {
            Ok(Some(Ok(response))) => response.status_code,
            Ok(Some(Err(err))) => {
                // a nonzero probe exit surfaces as an error on the wait stream
                debug!(service = %service.name, error = %err, "Readiness probe wait errored");
                1
            }
            Ok(None) => 1,
            Err(_) => {
                let _ = docker.kill_container::<String>(&container_name, None).await;
                1
            }
        };

        let _ = docker
            .remove_container(
                &container_name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        self.untrack(&container_name).await;

        if exit_code != 0 {
            return Err(Error::ReadinessTimeout {
                service: service.name.clone(),
                timeout_seconds: probe.timeout_seconds,
            });
        }

        debug!(service = %service.name, "Service is ready");
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
        let docker = self.docker().await?;

        let mut log_stream = docker.logs(
            container_id,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let mut line_number = 0u32;
        while let Some(log_result) = log_stream.next().await {
            let (stream_type, message) = match log_result {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    (LogStream::Stdout, message)
                }
                Ok(LogOutput::StdErr { message }) => (LogStream::Stderr, message),
                Ok(_) => continue,
                Err(err) => {
                    warn!(container = container_id, error = %err, "Error reading container logs");
                    break;
                }
            };

            line_number += 1;
            let text = self
                .obfuscator
                .obfuscate(String::from_utf8_lossy(&message).trim_end());

            let mut record = TailLogLine::for_step(step_name, parent_stage, log_type, depth);
            record.run_index = run_index;
            record.log_line = Some(BuildLogLine {
                line_number,
                timestamp: Utc::now(),
                stream_type,
                text,
            });

            // the channel is bounded; a slow collector applies backpressure here
            if self.tail_tx.send(record).await.is_err() {
                break;
            }
        }

        let exit_code = docker
            .wait_container(
                container_id,
                Some(WaitContainerOptions {
                    condition: "not-running",
                }),
            )
            .next()
            .await
            .transpose()
            .map(|response| response.map(|r| r.status_code).unwrap_or_default())
            .unwrap_or_else(|err| {
                // wait errors carry the nonzero exit for containers that failed
                debug!(container = container_id, error = %err, "Container wait returned error");
                match err {
                    bollard::errors::Error::DockerContainerWaitError { code, .. } => code,
                    _ => -1,
                }
            });

        if let Err(err) = docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            debug!(container = container_id, error = %err, "Failed to remove container");
        }
        self.untrack(container_id).await;

        Ok(exit_code)
    }

    async fn stop_single_stage_service_containers(&self, parent_stage: &str) {
        self.stop_tracked(|tracked| {
            tracked.service_name.is_some() && tracked.parent_stage.as_deref() == Some(parent_stage)
        })
        .await;
    }

    async fn stop_multi_stage_service_containers(&self) {
        self.stop_tracked(|tracked| tracked.service_name.is_some() && tracked.parent_stage.is_none())
            .await;
    }

    async fn stop_all_containers(&self) {
        info!("Stopping all containers");
        self.stop_tracked(|_| true).await;
    }

    async fn info(&self) -> String {
        match self.docker().await {
            Ok(docker) => match docker.version().await {
                Ok(version) => format!(
                    "docker {} (api {})",
                    version.version.unwrap_or_default(),
                    version.api_version.unwrap_or_default()
                ),
                Err(err) => format!("docker version unavailable: {err}"),
            },
            Err(_) => "docker client not connected".to_string(),
        }
    }
}
