//! Trusted-image policy: which images may run privileged, reach the Docker
//! socket, run custom commands, or receive injected credentials.

use crate::error::{Error, Result};
use ziplinee_contracts::{CredentialConfig, TrustedImageConfig};

/// Capabilities resolved for a concrete image reference.
#[derive(Debug, Clone, Default)]
pub struct ImageCapabilities {
    pub trusted: bool,
    pub run_docker: bool,
    pub run_privileged: bool,
    pub allow_commands: bool,
    pub injected_credential_types: Vec<String>,
}

pub struct TrustedImagePolicy {
    entries: Vec<TrustedImageConfig>,
    credentials: Vec<CredentialConfig>,
}

impl TrustedImagePolicy {
    pub fn new(entries: Vec<TrustedImageConfig>, credentials: Vec<CredentialConfig>) -> Self {
        TrustedImagePolicy {
            entries,
            credentials,
        }
    }

    /// The repository part of an image reference, without tag or digest.
    fn repository(image: &str) -> &str {
        let image = image.split('@').next().unwrap_or(image);
        // a colon after the last slash separates the tag, not a registry port
        match (image.rfind(':'), image.rfind('/')) {
            (Some(colon), Some(slash)) if colon > slash => &image[..colon],
            (Some(colon), None) => &image[..colon],
            _ => image,
        }
    }

    /// Longest matching path-prefix entry for the image, if any.
    pub fn find(&self, image: &str) -> Option<&TrustedImageConfig> {
        let repository = Self::repository(image);

        self.entries
            .iter()
            .filter(|entry| {
                repository == entry.path
                    || repository.starts_with(&format!("{}/", entry.path))
                    || repository.starts_with(&format!("{}-", entry.path))
            })
            .max_by_key(|entry| entry.path.len())
    }

    pub fn is_trusted(&self, image: &str) -> bool {
        self.find(image).is_some()
    }

    /// Capabilities the image inherits from its matched entry; untrusted
    /// images may run commands but nothing elevated.
    pub fn capabilities(&self, image: &str) -> ImageCapabilities {
        match self.find(image) {
            Some(entry) => ImageCapabilities {
                trusted: true,
                run_docker: entry.run_docker,
                run_privileged: entry.run_privileged,
                allow_commands: entry.allow_commands,
                injected_credential_types: entry.injected_credential_types.clone(),
            },
            None => ImageCapabilities {
                trusted: false,
                allow_commands: true,
                ..Default::default()
            },
        }
    }

    /// Gates a container request before anything is created.
    pub fn authorize(
        &self,
        image: &str,
        wants_privileged: bool,
        wants_docker_socket: bool,
        has_commands: bool,
    ) -> Result<ImageCapabilities> {
        let capabilities = self.capabilities(image);

        if wants_privileged && !capabilities.run_privileged {
            return Err(Error::TrustedImageViolation {
                image: image.to_string(),
                capability: "run privileged".to_string(),
            });
        }
        if wants_docker_socket && !capabilities.run_docker {
            return Err(Error::TrustedImageViolation {
                image: image.to_string(),
                capability: "access the docker socket".to_string(),
            });
        }
        if has_commands && !capabilities.allow_commands {
            return Err(Error::TrustedImageViolation {
                image: image.to_string(),
                capability: "run custom commands".to_string(),
            });
        }

        Ok(capabilities)
    }

    /// Credentials of the types the matched entry injects; other credentials
    /// stay invisible to the stage.
    pub fn injected_credentials(&self, image: &str) -> Vec<&CredentialConfig> {
        let capabilities = self.capabilities(image);
        if capabilities.injected_credential_types.is_empty() {
            return Vec::new();
        }

        self.credentials
            .iter()
            .filter(|c| {
                capabilities
                    .injected_credential_types
                    .iter()
                    .any(|t| t == &c.credential_type)
            })
            .collect()
    }

    pub fn has_injected_credentials(&self, image: &str) -> bool {
        !self.injected_credentials(image).is_empty()
    }
}
