//! Ziplinee CI builder entrypoint.

use clap::Parser;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;
use ziplinee_builder::{
    ApplicationInfo, CancellationSignal, CiBuilder, DockerOrchestrator, EndOfLifeHelper,
    EnvvarHelper, Obfuscator, PipelineRunner, TAIL_CHANNEL_CAPACITY, TrustedImagePolicy,
    WhenEvaluator,
};
use ziplinee_crypt::SecretHelper;

mod config;

#[derive(Parser)]
#[command(name = "ziplinee-ci-builder")]
#[command(author, version, about = "Executes build stages in containers", long_about = None)]
struct Cli {
    /// JSON structure parameterizing the build, trusted images and credentials.
    #[arg(long, env = "BUILDER_CONFIG", default_value = "")]
    builder_config: String,

    /// Path to the builder config json stored in a mounted file.
    #[arg(long, env = "BUILDER_CONFIG_PATH", default_value = "")]
    builder_config_path: String,

    /// AES-256 key used to decrypt secrets.
    #[arg(long, env = "SECRET_DECRYPTION_KEY", default_value = "")]
    secret_decryption_key: String,

    /// Path to the AES-256 key used to decrypt secrets.
    #[arg(
        long,
        env = "SECRET_DECRYPTION_KEY_PATH",
        default_value = "/secrets/secretDecryptionKey"
    )]
    secret_decryption_key_path: String,

    /// Run as a job: build failures are reported out-of-band and do not
    /// fail the job itself.
    #[arg(long, env = "RUN_AS_JOB", default_value_t = false)]
    run_as_job: bool,

    /// Name of the pod this builder runs in.
    #[arg(long, env = "POD_NAME", default_value = "")]
    pod_name: String,

    /// Run a single readiness probe instead of a build.
    #[arg(long, env = "RUN_AS_READINESS_PROBE", default_value_t = false)]
    run_as_readiness_probe: bool,

    #[arg(long, env = "READINESS_SCHEME", default_value = "http")]
    readiness_scheme: String,

    #[arg(long, env = "READINESS_HOST", default_value = "")]
    readiness_host: String,

    #[arg(long, env = "READINESS_PORT", default_value_t = 80)]
    readiness_port: u16,

    #[arg(long, env = "READINESS_PATH", default_value = "/")]
    readiness_path: String,

    #[arg(long, env = "READINESS_HOSTNAME", default_value = "")]
    readiness_hostname: String,

    #[arg(long, env = "READINESS_TIMEOUT_SECONDS", default_value_t = 60)]
    readiness_timeout_seconds: u64,

    /// Stages to run in local build mode.
    #[arg(long = "stage")]
    stages: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();

    let application_info =
        ApplicationInfo::new("ziplinee-ci-builder", env!("CARGO_PKG_VERSION"));
    let ci_builder = CiBuilder::new(application_info.clone());

    // mounted inside a scratch container to probe service containers
    if cli.run_as_readiness_probe {
        ci_builder
            .run_readiness_probe(
                &cli.readiness_scheme,
                &cli.readiness_host,
                cli.readiness_port,
                &cli.readiness_path,
                &cli.readiness_hostname,
                cli.readiness_timeout_seconds,
            )
            .await;
        return Ok(());
    }

    let decryption_key =
        config::read_decryption_key(&cli.secret_decryption_key, &cli.secret_decryption_key_path)?;
    let secret_helper = SecretHelper::new(&decryption_key)?;

    let envvar_helper = Arc::new(EnvvarHelper::new("ZIPLINEE_", secret_helper.clone()));

    // the pipeline name binds credential decryption to this repository
    let peeked = config::peek_builder_config(&cli.builder_config, &cli.builder_config_path)?;
    envvar_helper.set_pipeline_name(&peeked).await?;
    let pipeline = envvar_helper.get_pipeline_name()?;

    let (builder_config, credentials_bytes) = config::load_builder_config(
        &cli.builder_config,
        &cli.builder_config_path,
        &secret_helper,
        &pipeline,
    )?;

    let (tail_tx, tail_rx) = mpsc::channel(TAIL_CHANNEL_CAPACITY);
    let obfuscator = Arc::new(Obfuscator::new(secret_helper.clone()));
    let when_evaluator = Arc::new(WhenEvaluator::new(Arc::clone(&envvar_helper)));

    let policy = TrustedImagePolicy::new(
        builder_config.trusted_images.clone(),
        builder_config.credentials.clone(),
    );
    let orchestrator = Arc::new(DockerOrchestrator::new(
        policy,
        Arc::clone(&envvar_helper),
        Arc::clone(&obfuscator),
        tail_tx.clone(),
    ));

    let cancellation = CancellationSignal::new();
    spawn_signal_handler(cancellation.clone());

    let pipeline_runner = Arc::new(PipelineRunner::new(
        Arc::clone(&envvar_helper),
        when_evaluator,
        Arc::clone(&obfuscator),
        orchestrator.clone(),
        application_info,
        cancellation,
        tail_tx,
        tail_rx,
    ));

    if !cli.stages.is_empty() {
        ci_builder
            .run_local_build(
                pipeline_runner,
                orchestrator,
                envvar_helper,
                builder_config,
                &cli.stages,
            )
            .await?;
        return Ok(());
    }

    match envvar_helper.ci_server() {
        "gocd" => {
            ci_builder
                .run_agent_build(
                    pipeline_runner,
                    orchestrator,
                    envvar_helper,
                    obfuscator,
                    builder_config,
                    credentials_bytes,
                )
                .await;
        }
        "ziplinee" => {
            let end_of_life_helper = Arc::new(EndOfLifeHelper::new(
                cli.run_as_job,
                builder_config.clone(),
                cli.pod_name.clone(),
            ));
            ci_builder
                .run_build_job(
                    pipeline_runner,
                    orchestrator,
                    envvar_helper,
                    obfuscator,
                    end_of_life_helper,
                    builder_config,
                    credentials_bytes,
                    cli.run_as_job,
                )
                .await;
        }
        other => {
            warn!(ci_server = other, "The CI server is not recognized, exiting");
        }
    }

    Ok(())
}

/// Selects log output from `ZIPLINEE_LOG_FORMAT` ∈ {console, v3, json}.
fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let format = std::env::var("ZIPLINEE_LOG_FORMAT").unwrap_or_default();

    match format.as_str() {
        "json" | "v3" => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init(),
    }
}

/// Fires the cancellation signal on SIGINT or SIGTERM.
fn spawn_signal_handler(cancellation: CancellationSignal) {
    tokio::spawn(async move {
        let ctrl_c = async {
            let _ = tokio::signal::ctrl_c().await;
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(_) => std::future::pending::<()>().await,
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }

        warn!("Received termination signal, canceling run");
        cancellation.fire();
    });
}
