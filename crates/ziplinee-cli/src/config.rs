//! Builder config and decryption key loading.

use anyhow::{Context, bail};
use std::path::Path;
use ziplinee_contracts::BuilderConfig;
use ziplinee_crypt::SecretHelper;

/// Reads the AES-256 decryption key: the key flag wins, otherwise the
/// mounted key file when it exists.
pub fn read_decryption_key(key: &str, key_path: &str) -> anyhow::Result<String> {
    if !key_path.is_empty() && Path::new(key_path).exists() {
        let key = std::fs::read_to_string(key_path)
            .with_context(|| format!("reading secret decryption key from {key_path}"))?;
        return Ok(key);
    }

    if key.is_empty() {
        bail!("neither SECRET_DECRYPTION_KEY nor a key file at SECRET_DECRYPTION_KEY_PATH is set");
    }

    Ok(key.to_string())
}

/// Loads the builder config from the inline JSON blob or the mounted file
/// (exactly one must be set), decrypts credential properties, and returns
/// the config plus the original encrypted credential bytes for the
/// obfuscator to extract secrets from.
pub fn load_builder_config(
    config_json: &str,
    config_path: &str,
    secret_helper: &SecretHelper,
    pipeline: &str,
) -> anyhow::Result<(BuilderConfig, Vec<u8>)> {
    let raw = match (config_json.is_empty(), config_path.is_empty()) {
        (false, true) => {
            tracing::debug!("Reading builder config from BUILDER_CONFIG");
            // keep the blob out of the environment of child processes
            unsafe { std::env::remove_var("BUILDER_CONFIG") };
            config_json.to_string()
        }
        (true, false) => {
            tracing::debug!(path = config_path, "Reading builder config from file");
            std::fs::read_to_string(config_path)
                .with_context(|| format!("reading builder config from {config_path}"))?
        }
        (true, true) => {
            bail!("neither BUILDER_CONFIG nor BUILDER_CONFIG_PATH is set; one of them is required")
        }
        (false, false) => {
            bail!("both BUILDER_CONFIG and BUILDER_CONFIG_PATH are set; only one is allowed")
        }
    };

    let mut config: BuilderConfig =
        serde_json::from_str(&raw).context("unmarshalling builder config")?;

    // the obfuscator needs the still-encrypted credentials to find envelopes
    let credentials_bytes =
        serde_json::to_vec(&config.credentials).context("marshalling credentials")?;

    for credential in &mut config.credentials {
        for (key, value) in credential.additional_properties.iter_mut() {
            if let Some(text) = value.as_str() {
                let decrypted = secret_helper
                    .decrypt_all_envelopes(text, pipeline)
                    .with_context(|| {
                        format!(
                            "decrypting credential {} property {key}",
                            credential.name
                        )
                    })?;
                *value = serde_json::Value::String(decrypted);
            }
        }
    }

    Ok((config, credentials_bytes))
}

/// Parses the builder config without decrypting credentials; used to learn
/// the pipeline name before decryption can be bound to it.
pub fn peek_builder_config(config_json: &str, config_path: &str) -> anyhow::Result<BuilderConfig> {
    let raw = if !config_json.is_empty() {
        config_json.to_string()
    } else if !config_path.is_empty() {
        std::fs::read_to_string(config_path)
            .with_context(|| format!("reading builder config from {config_path}"))?
    } else {
        bail!("neither BUILDER_CONFIG nor BUILDER_CONFIG_PATH is set; one of them is required")
    };

    serde_json::from_str(&raw).context("unmarshalling builder config")
}
