//! Pipeline execution engine for the Ziplinee CI builder.
//!
//! Runs manifest stages in containers, streams and obfuscates their logs,
//! aggregates per-step status and reports the run's lifecycle to the
//! control plane.

pub mod builder;
pub mod docker;
pub mod envvar;
pub mod eol;
pub mod error;
pub mod obfuscate;
pub mod pipeline;
pub mod readiness;
pub mod trusted;
pub mod when;

pub use builder::{CiBuilder, exit_code_for_steps, handle_exit, render_stats};
pub use docker::{ContainerOrchestrator, DockerOrchestrator};
pub use envvar::EnvvarHelper;
pub use eol::EndOfLifeHelper;
pub use error::{Error, Result};
pub use obfuscate::Obfuscator;
pub use pipeline::{CancellationSignal, PipelineRunner, TAIL_CHANNEL_CAPACITY};
pub use trusted::TrustedImagePolicy;
pub use when::WhenEvaluator;

/// Identity of the running builder binary, surfaced in the injected
/// builder-info step.
#[derive(Debug, Clone)]
pub struct ApplicationInfo {
    pub app: String,
    pub version: String,
}

impl ApplicationInfo {
    pub fn new(app: impl Into<String>, version: impl Into<String>) -> Self {
        ApplicationInfo {
            app: app.into(),
            version: version.into(),
        }
    }
}
