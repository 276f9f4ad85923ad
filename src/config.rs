use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::{Cli, KnowledgeBackend};
use crate::model::{DEFAULT_GENERATE_ENDPOINT, ModelTiers};

pub const DEFAULT_GENERATE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 300;

/// Fully resolved runtime settings: CLI flags win over the active profile,
/// which wins over built-in defaults.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub profile: String,
    pub config_path: String,
    pub user_id: String,
    pub model_tiers: ModelTiers,
    pub generate_endpoint: String,
    pub generate_timeout_secs: u64,
    pub knowledge_backend: KnowledgeBackend,
    pub knowledge_doc_path: Option<String>,
    pub grace_period_secs: u64,
    pub telemetry_enabled: bool,
    pub telemetry_path: String,
    pub server_token: Option<String>,
    pub show_sensitive_config: bool,
}

impl RuntimeConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub user_id: Option<String>,
    #[serde(default)]
    pub primary_models: Vec<String>,
    #[serde(default)]
    pub fast_models: Vec<String>,
    #[serde(default)]
    pub classification_models: Vec<String>,
    #[serde(default)]
    pub planning_models: Vec<String>,
    pub generate_endpoint: Option<String>,
    pub generate_timeout_secs: Option<u64>,
    pub knowledge_backend: Option<KnowledgeBackend>,
    pub knowledge_doc_path: Option<String>,
    pub grace_period_secs: Option<u64>,
    pub telemetry_enabled: Option<bool>,
    pub telemetry_path: Option<String>,
    pub server_token: Option<String>,
}

pub fn load_profiles(config_path: &str) -> Result<ProfilesFile> {
    let path = Path::new(config_path);
    if !path.exists() {
        return Ok(ProfilesFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read profile config file at '{}'", path.display()))?;
    toml::from_str::<ProfilesFile>(&content).with_context(|| {
        format!(
            "invalid profile configuration in '{}'. Check backend values and field names.",
            path.display()
        )
    })
}

pub fn resolve_runtime_config(cli: &Cli, profiles: &ProfilesFile) -> Result<RuntimeConfig> {
    let selected = cli.profile.trim();
    if selected.is_empty() {
        return Err(anyhow::anyhow!(
            "profile name cannot be empty. Set --profile <name>."
        ));
    }

    let profile = if selected == "default" && !profiles.profiles.contains_key("default") {
        ProfileConfig::default()
    } else {
        profiles.profiles.get(selected).cloned().ok_or_else(|| {
            let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
            names.sort();
            if names.is_empty() {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. No profiles are defined yet.",
                    selected,
                    cli.config_path
                )
            } else {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. Available profiles: {}",
                    selected,
                    cli.config_path,
                    names.join(", ")
                )
            }
        })?
    };

    let defaults = ModelTiers::default();
    let mut model_tiers = ModelTiers {
        primary: non_empty_or(profile.primary_models.clone(), defaults.primary),
        fast: non_empty_or(profile.fast_models.clone(), defaults.fast),
        classification: non_empty_or(profile.classification_models.clone(), defaults.classification),
        planning: non_empty_or(profile.planning_models.clone(), defaults.planning),
    };
    // A pinned model becomes the only primary candidate; the other tiers
    // keep their fallback chains.
    if let Some(model) = cli.model.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        model_tiers.primary = vec![model.to_string()];
    }

    Ok(RuntimeConfig {
        profile: selected.to_string(),
        config_path: cli.config_path.clone(),
        user_id: cli
            .user_id
            .clone()
            .or(profile.user_id)
            .unwrap_or_else(|| "local-user".to_string()),
        model_tiers,
        generate_endpoint: cli
            .generate_endpoint
            .clone()
            .or(profile.generate_endpoint)
            .unwrap_or_else(|| DEFAULT_GENERATE_ENDPOINT.to_string()),
        generate_timeout_secs: cli
            .generate_timeout_secs
            .or(profile.generate_timeout_secs)
            .unwrap_or(DEFAULT_GENERATE_TIMEOUT_SECS)
            .max(1),
        knowledge_backend: cli
            .knowledge_backend
            .or(profile.knowledge_backend)
            .unwrap_or(KnowledgeBackend::Disabled),
        knowledge_doc_path: cli
            .knowledge_doc_path
            .clone()
            .or(profile.knowledge_doc_path),
        grace_period_secs: cli
            .grace_period_secs
            .or(profile.grace_period_secs)
            .unwrap_or(DEFAULT_GRACE_PERIOD_SECS)
            .max(1),
        telemetry_enabled: cli
            .telemetry_enabled
            .or(profile.telemetry_enabled)
            .unwrap_or(true),
        telemetry_path: cli
            .telemetry_path
            .clone()
            .or(profile.telemetry_path)
            .unwrap_or_else(|| ".cortex/telemetry/events.jsonl".to_string()),
        server_token: cli.server_token.clone().or(profile.server_token),
        show_sensitive_config: cli.show_sensitive_config,
    })
}

fn non_empty_or(values: Vec<String>, fallback: Vec<String>) -> Vec<String> {
    if values.is_empty() { fallback } else { values }
}

pub fn display_server_token(cfg: &RuntimeConfig) -> String {
    match cfg.server_token.as_deref() {
        None => "disabled".to_string(),
        Some(token) if cfg.show_sensitive_config => token.to_string(),
        Some(_) => "set (use --show-sensitive-config to reveal)".to_string(),
    }
}
