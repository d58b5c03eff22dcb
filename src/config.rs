use draftwright::llm::{BreakerConfig, RetryPolicy};
use draftwright::server::ServerConfig;
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub server: ServerSection,
    pub llm: LlmConfig,
    pub review: ReviewConfig,
    pub resilience: ResilienceConfig,
    pub rules: RulesConfig,
    pub knowledge: KnowledgeConfig,
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub generate_path: String,
    pub max_body_bytes: usize,
    pub head_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            bind: defaults.bind,
            generate_path: defaults.generate_path,
            max_body_bytes: defaults.max_body_bytes,
            head_timeout_ms: defaults.head_timeout.as_millis() as u64,
            shutdown_grace_ms: defaults.shutdown_grace.as_millis() as u64,
        }
    }
}

impl ServerSection {
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            bind: self.bind.clone(),
            generate_path: self.generate_path.clone(),
            max_body_bytes: self.max_body_bytes,
            head_timeout: Duration::from_millis(self.head_timeout_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            ..ServerConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    /// Tried once after the primary model's retries are spent
    pub fallback_model: Option<String>,
    pub api_key_env: String,
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            fallback_model: None,
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: None,
            max_tokens: 8192,
            timeout_ms: 300000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    pub enabled: bool,
    /// Defaults to the drafting model
    pub model: Option<String>,
    pub timeout_ms: u64,
    pub max_tokens: u32,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: None,
            timeout_ms: 60000,
            max_tokens: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        let breaker = BreakerConfig::default();
        let retry = RetryPolicy::default();
        Self {
            failure_threshold: breaker.failure_threshold,
            cooldown_ms: breaker.cooldown.as_millis() as u64,
            max_retries: retry.max_retries,
            base_delay_ms: retry.base_delay.as_millis() as u64,
            max_delay_ms: retry.max_delay.as_millis() as u64,
        }
    }
}

impl ResilienceConfig {
    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Rule pack JSON; the bundled pack when unset
    pub pack_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    /// Directory of markdown reference files
    pub dir: Option<PathBuf>,
    pub max_chars: usize,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_chars: 20000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_spec_chars: usize,
    /// Directory of `.hbs` files overriding the bundled prompts
    pub prompt_dir: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_spec_chars: draftwright::orchestrator::DEFAULT_MAX_SPEC_CHARS,
            prompt_dir: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            server: ServerSection::default(),
            llm: LlmConfig::default(),
            review: ReviewConfig::default(),
            resilience: ResilienceConfig::default(),
            rules: RulesConfig::default(),
            knowledge: KnowledgeConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let project_name = env!("CARGO_PKG_NAME");
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}
