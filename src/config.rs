//! Configuration file for llm-switch
//!
//! The file is JSON. Only `models` is required:
//!
//! ```json
//! {
//!   "server": { "port": 3000, "backend_url": "http://localhost:3004" },
//!   "models": {
//!     "qwen3-coder": "qwen3-coder.service",
//!     "gpt-oss": { "unit": "gpt-oss.service", "url": "http://localhost:3005" }
//!   },
//!   "switch": { "ready_timeout_secs": 120 }
//! }
//! ```
use crate::model_switcher::ModelSwitcherConfig;
use crate::registry::{ModelEntry, ModelRegistry};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Models to manage, keyed by the id clients send
    pub models: BTreeMap<String, ModelSpec>,

    #[serde(default)]
    pub switch: SwitchSettings,

    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Base URL for models that don't name their own
    pub backend_url: Option<Url>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            backend_url: None,
        }
    }
}

/// Either just the unit name, or the unit plus the URL it listens on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelSpec {
    Unit(String),
    Detailed {
        unit: String,
        #[serde(default)]
        url: Option<Url>,
    },
}

impl ModelSpec {
    pub fn unit(&self) -> &str {
        match self {
            ModelSpec::Unit(unit) | ModelSpec::Detailed { unit, .. } => unit,
        }
    }

    pub fn url(&self) -> Option<&Url> {
        match self {
            ModelSpec::Unit(_) => None,
            ModelSpec::Detailed { url, .. } => url.as_ref(),
        }
    }
}

/// Timing of switches and forwarded requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchSettings {
    pub ready_timeout_secs: u64,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub readiness_path: String,
    pub supervisor_timeout_secs: u64,
    pub drain_timeout_secs: u64,
    pub forward_timeout_secs: u64,
    /// Report the requested model id instead of whatever the backend calls itself
    pub rewrite_model: bool,
}

impl Default for SwitchSettings {
    fn default() -> Self {
        Self {
            ready_timeout_secs: 120,
            probe_interval_ms: 1000,
            probe_timeout_ms: 1000,
            readiness_path: "/health".to_string(),
            supervisor_timeout_secs: 30,
            drain_timeout_secs: 30,
            forward_timeout_secs: 1800,
            rewrite_model: false,
        }
    }
}

impl SwitchSettings {
    pub fn switcher_config(&self) -> ModelSwitcherConfig {
        ModelSwitcherConfig {
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
            supervisor_timeout: Duration::from_secs(self.supervisor_timeout_secs),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
        }
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub systemctl: PathBuf,
    /// Talk to the user manager (`systemctl --user`)
    pub user: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            systemctl: PathBuf::from("/usr/bin/systemctl"),
            user: true,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            bail!("No models configured");
        }
        if self.switch.probe_interval_ms == 0 {
            bail!("switch.probe_interval_ms must be greater than zero");
        }
        self.build_registry().map(|_| ())
    }

    /// Build the model registry, resolving each model's URL
    pub fn build_registry(&self) -> Result<ModelRegistry> {
        let mut entries = Vec::with_capacity(self.models.len());
        for (model_id, spec) in &self.models {
            if spec.unit().trim().is_empty() {
                bail!("Model '{}' has an empty unit name", model_id);
            }
            let base_url = spec
                .url()
                .or(self.server.backend_url.as_ref())
                .cloned()
                .with_context(|| {
                    format!(
                        "Model '{}' has no url and server.backend_url is not set",
                        model_id
                    )
                })?;

            entries.push(
                ModelEntry::builder()
                    .model_id(model_id.clone())
                    .unit_name(spec.unit().to_string())
                    .base_url(base_url)
                    .build(),
            );
        }

        ModelRegistry::new(entries).context("Invalid model configuration")
    }
}
