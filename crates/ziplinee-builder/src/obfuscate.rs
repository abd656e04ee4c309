//! Replaces secret plaintexts with `***` in log lines.
//!
//! Secrets are collected once before any stage runs; every code path that
//! appends to a build log step routes its text through [`Obfuscator::obfuscate`].

use crate::error::Result;
use std::sync::RwLock;
use tracing::debug;
use ziplinee_contracts::ZiplineeManifest;
use ziplinee_crypt::{SecretHelper, collect_all_envelopes};

const REPLACEMENT: &str = "***";

/// Secrets shorter than this are not registered; masking one or two
/// characters corrupts ordinary output without hiding anything.
const MIN_SECRET_LEN: usize = 3;

pub struct Obfuscator {
    secret_helper: SecretHelper,
    /// Plaintexts sorted longest-first so longer secrets win substitution.
    secrets: RwLock<Vec<String>>,
}

impl Obfuscator {
    pub fn new(secret_helper: SecretHelper) -> Self {
        Obfuscator {
            secret_helper,
            secrets: RwLock::new(Vec::new()),
        }
    }

    /// Scans the manifest and the raw credentials blob for secret envelopes,
    /// decrypts each, and registers the plaintexts. Multiline plaintexts also
    /// register every individual line, so partial leakage through
    /// line-by-line output is still masked.
    pub fn collect_secrets(
        &self,
        manifest: &ZiplineeManifest,
        credentials_bytes: &[u8],
        pipeline: &str,
    ) -> Result<()> {
        let manifest_source = serde_yaml::to_string(manifest)
            .map_err(|e| crate::error::Error::Setup(format!("serializing manifest: {e}")))?;

        let mut envelopes = collect_all_envelopes(&manifest_source);
        envelopes.extend(collect_all_envelopes(&String::from_utf8_lossy(
            credentials_bytes,
        )));

        let mut collected = Vec::new();
        for envelope in envelopes {
            let plaintext = self.secret_helper.decrypt_envelope(&envelope, pipeline)?;
            for line in plaintext.lines() {
                if line.len() >= MIN_SECRET_LEN {
                    collected.push(line.to_string());
                }
            }
            if plaintext.len() >= MIN_SECRET_LEN {
                collected.push(plaintext);
            }
        }

        collected.sort_by(|a, b| b.len().cmp(&a.len()));
        collected.dedup();

        debug!(count = collected.len(), "Collected secrets to obfuscate");

        if let Ok(mut secrets) = self.secrets.write() {
            *secrets = collected;
        }

        Ok(())
    }

    /// Registers an already-decrypted plaintext directly.
    pub fn add_secret(&self, plaintext: &str) {
        if plaintext.len() < MIN_SECRET_LEN {
            return;
        }
        if let Ok(mut secrets) = self.secrets.write() {
            let mut additions: Vec<String> =
                plaintext.lines().map(|l| l.to_string()).collect();
            additions.push(plaintext.to_string());
            additions.retain(|s| s.len() >= MIN_SECRET_LEN);

            secrets.extend(additions);
            secrets.sort_by(|a, b| b.len().cmp(&a.len()));
            secrets.dedup();
        }
    }

    /// Replaces every registered secret in the input with `***`,
    /// longest match first.
    pub fn obfuscate(&self, input: &str) -> String {
        let Ok(secrets) = self.secrets.read() else {
            return input.to_string();
        };

        let mut output = input.to_string();
        for secret in secrets.iter() {
            if output.contains(secret.as_str()) {
                output = output.replace(secret.as_str(), REPLACEMENT);
            }
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE: &str = "github.com/ziplineeci/ziplinee-ci-builder";

    fn secret_helper() -> SecretHelper {
        SecretHelper::new("0123456789abcdef0123456789abcdef").unwrap()
    }

    #[test]
    fn obfuscates_collected_manifest_secret() {
        let helper = secret_helper();
        let envelope = helper.encrypt("hunter2", PIPELINE).unwrap();

        let manifest = ZiplineeManifest::from_yaml(&format!(
            r#"
stages:
  build:
    image: alpine:3
    env:
      PASSWORD: {envelope}
    commands:
    - echo $PASSWORD
"#
        ))
        .unwrap();

        let obfuscator = Obfuscator::new(helper);
        obfuscator.collect_secrets(&manifest, b"[]", PIPELINE).unwrap();

        assert_eq!(obfuscator.obfuscate("echo hunter2"), "echo ***");
    }

    #[test]
    fn obfuscates_secret_from_credentials_blob() {
        let helper = secret_helper();
        let envelope = helper.encrypt("tok-abcdef", PIPELINE).unwrap();
        let credentials = format!(
            r#"[{{"name":"api","type":"api-token","token":"{envelope}"}}]"#
        );

        let obfuscator = Obfuscator::new(helper);
        obfuscator
            .collect_secrets(&ZiplineeManifest::default(), credentials.as_bytes(), PIPELINE)
            .unwrap();

        assert_eq!(
            obfuscator.obfuscate("using token tok-abcdef now"),
            "using token *** now"
        );
    }

    #[test]
    fn obfuscates_each_line_of_multiline_secret() {
        let helper = secret_helper();
        let envelope = helper
            .encrypt("-----BEGIN KEY-----\nsecretline\n-----END KEY-----", PIPELINE)
            .unwrap();

        let manifest = ZiplineeManifest::from_yaml(&format!(
            r#"
stages:
  deploy:
    image: alpine:3
    env:
      KEY: {envelope}
    commands:
    - echo done
"#
        ))
        .unwrap();

        let obfuscator = Obfuscator::new(helper);
        obfuscator.collect_secrets(&manifest, b"[]", PIPELINE).unwrap();

        // a single leaked line of the multiline value is still masked
        assert_eq!(obfuscator.obfuscate("leaked: secretline"), "leaked: ***");
    }

    #[test]
    fn longest_secret_wins_substitution() {
        let obfuscator = Obfuscator::new(secret_helper());
        obfuscator.add_secret("abc");
        obfuscator.add_secret("abcdef");

        assert_eq!(obfuscator.obfuscate("x abcdef y"), "x *** y");
    }

    #[test]
    fn leaves_lines_without_secrets_untouched() {
        let obfuscator = Obfuscator::new(secret_helper());
        obfuscator.add_secret("hunter2");

        assert_eq!(obfuscator.obfuscate("plain output"), "plain output");
    }

    #[test]
    fn skips_secrets_shorter_than_minimum() {
        let obfuscator = Obfuscator::new(secret_helper());
        obfuscator.add_secret("ab");

        assert_eq!(obfuscator.obfuscate("lab report"), "lab report");
    }
}
