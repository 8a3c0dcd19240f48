//! Service configuration loaded from `webpatcher.toml`.
//!
//! Every field has a default, so a missing file or a partial one is fine.
//! `WEBPATCHER_KEYSTORE_PASSWORD` and `WEBPATCHER_WORK_ROOT` take
//! precedence over the file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::engine::KeystoreDetails;
use crate::events::DEFAULT_REPLAY;

pub const CONFIG_FILE: &str = "webpatcher.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WebPatcherConfig {
    /// Identity written into output signatures.
    #[serde(default = "default_signer")]
    pub signer: String,

    /// Keystore file name, created inside each job workspace.
    #[serde(default = "default_keystore_file")]
    pub keystore_file: String,

    #[serde(default)]
    pub keystore_password: Option<String>,

    /// Parent directory for job workspaces. System temp dir when unset.
    #[serde(default)]
    pub work_root: Option<PathBuf>,

    /// Events kept per job for late subscribers.
    #[serde(default = "default_event_replay")]
    pub event_replay: usize,

    /// Used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_signer() -> String {
    "WebPatcher".to_string()
}

fn default_keystore_file() -> String {
    "signing.keystore".to_string()
}

fn default_event_replay() -> usize {
    DEFAULT_REPLAY
}

fn default_log_filter() -> String {
    "webpatcher=info".to_string()
}

impl Default for WebPatcherConfig {
    fn default() -> Self {
        Self {
            signer: default_signer(),
            keystore_file: default_keystore_file(),
            keystore_password: None,
            work_root: None,
            event_replay: default_event_replay(),
            log_filter: default_log_filter(),
        }
    }
}

impl WebPatcherConfig {
    /// Load `webpatcher.toml` from the working directory, then apply the
    /// environment.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(Path::new(CONFIG_FILE))?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse `path`, or defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = toml::from_str::<WebPatcherConfig>(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Override file values with non-empty variables from `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(password) = lookup("WEBPATCHER_KEYSTORE_PASSWORD").filter(|v| !v.is_empty()) {
            self.keystore_password = Some(password);
        }
        if let Some(root) = lookup("WEBPATCHER_WORK_ROOT").filter(|v| !v.is_empty()) {
            self.work_root = Some(PathBuf::from(root));
        }
    }

    pub fn signing(&self) -> SigningConfig {
        SigningConfig {
            signer: self.signer.clone(),
            keystore_file: self.keystore_file.clone(),
            keystore_password: self.keystore_password.clone(),
        }
    }
}

/// What the orchestrator needs to sign an output artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningConfig {
    pub signer: String,
    pub keystore_file: String,
    pub keystore_password: Option<String>,
}

impl Default for SigningConfig {
    fn default() -> Self {
        WebPatcherConfig::default().signing()
    }
}

impl SigningConfig {
    /// Keystore location inside `workspace`.
    pub fn keystore_in(&self, workspace: &Path) -> KeystoreDetails {
        KeystoreDetails {
            path: workspace.join(&self.keystore_file),
            password: self.keystore_password.clone(),
        }
    }
}
