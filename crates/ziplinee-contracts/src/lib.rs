//! Contract types shared between the Ziplinee CI builder and its control plane.
//!
//! These types mirror the JSON the control plane sends (builder config) and
//! receives (builder events, build logs), plus the parsed manifest model.

pub mod config;
pub mod events;
pub mod log;
pub mod manifest;

pub use config::{
    BotConfig, BuildConfig, BuilderConfig, BuildVersionConfig, CiServerConfig, CredentialConfig,
    GitConfig, JobType, ReleaseConfig, TrustedImageConfig,
};
pub use events::{BotLog, BuildEventType, ReleaseLog, ZiplineeCiBuilderEvent};
pub use log::{
    BuildLog, BuildLogLine, BuildLogStep, ContainerImageInfo, LogStatus, LogStream, LogType,
    TailLogLine, aggregated_status, has_succeeded_status, has_unknown_status,
};
pub use manifest::{
    BuilderPreferences, BuilderType, ReadinessProbe, ZiplineeBitbucketEvent, ZiplineeBot,
    ZiplineeCronEvent, ZiplineeDockerEvent, ZiplineeEvent, ZiplineeGitEvent, ZiplineeGithubEvent,
    ZiplineeManifest, ZiplineeManualEvent, ZiplineePipelineEvent, ZiplineePubSubEvent,
    ZiplineeRelease, ZiplineeReleaseEvent, ZiplineeService, ZiplineeStage,
};
