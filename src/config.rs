use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub scraper: ScraperSettings,
    pub images: ImageSettings,
    pub captioner: CaptionerSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScraperSettings {
    pub timeout_secs: u64,
    pub user_agent: String,
    pub insecure_ssl: bool,
    /// Largest HTML body read from a page.
    pub max_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageSettings {
    /// Images with `width * height` below this are rejected.
    pub min_pixel_area: u64,
    pub timeout_secs: u64,
    /// Largest image body or local file read.
    pub max_bytes: u64,
    /// Directory local-file captioning is confined to. Unset disables it.
    #[serde(default)]
    pub local_root: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptionerSettings {
    /// Base URL of an Ollama-compatible server.
    pub endpoint: String,
    pub model: String,
    pub timeout_secs: u64,
    #[serde(default)]
    pub default_prompt: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Settings {
    /// Defaults, then `config/default.toml` if present, then `IMAGE_CAPTION__*`
    /// environment variables (e.g. `IMAGE_CAPTION__CAPTIONER__MODEL`).
    pub fn new() -> Result<Self, ConfigError> {
        Self::builder()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(Environment::with_prefix("IMAGE_CAPTION").separator("__"))
            .build()?
            .try_deserialize()
    }

    fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8000)?
            .set_default("scraper.timeout_secs", 10)?
            .set_default("scraper.user_agent", BROWSER_USER_AGENT)?
            .set_default("scraper.insecure_ssl", false)?
            .set_default("scraper.max_bytes", 5 * 1024 * 1024)?
            .set_default("images.min_pixel_area", 200)?
            .set_default("images.timeout_secs", 10)?
            .set_default("images.max_bytes", 20 * 1024 * 1024)?
            .set_default("captioner.endpoint", "http://localhost:11434")?
            .set_default("captioner.model", "llava:7b")?
            .set_default("captioner.timeout_secs", 120)?
            .set_default("captioner.max_tokens", 64)?
            .set_default("captioner.temperature", 0.2)
    }
}

impl ScraperSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ImageSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl CaptionerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
