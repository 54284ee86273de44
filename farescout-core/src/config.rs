use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ScraperConfig {
    pub chromium: ChromiumSection,
    pub flags: FlagsSection,
    pub user_agents: UserAgentSection,
    pub viewport: ViewportSection,
    pub fingerprint: FingerprintSection,
    pub proxy: ProxySection,
    pub retry: RetrySection,
    pub cache: CacheSection,
    pub observability: ObservabilitySection,
}

impl ScraperConfig {
    pub fn from_directory<P: AsRef<Path>>(dir: P) -> ConfigResult<Self> {
        load_scraper_config(dir.as_ref().join("scraper.toml"))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChromiumSection {
    pub executable_path: Option<String>,
    pub headless: bool,
    pub sandbox: bool,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlagsSection {
    pub disable_automation_controlled: bool,
    pub mute_audio: bool,
    pub lang: Option<String>,
    pub accept_language: Option<String>,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentSection {
    pub pool: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ViewportSection {
    pub width: u32,
    pub height: u32,
    pub jitter_pixels: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FingerprintSection {
    pub enable_canvas_noise: bool,
    pub enable_webgl_mask: bool,
    pub enable_audio_mask: bool,
    pub hide_webdriver: bool,
    #[serde(default = "default_canvas_noise_range")]
    pub canvas_noise_range: [i32; 2],
    #[serde(default = "default_audio_noise")]
    pub audio_noise: f64,
    pub webgl_vendor: Option<String>,
    pub webgl_renderer: Option<String>,
}

fn default_canvas_noise_range() -> [i32; 2] {
    [-2, 2]
}

fn default_audio_noise() -> f64 {
    0.0001
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxySection {
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    pub max_attempts: usize,
    pub delay_seconds: Vec<u64>,
    pub jitter_seconds: u64,
    pub retryable_outcomes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Sqlite,
    File,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    pub enabled: bool,
    pub backend: CacheBackend,
    pub db_path: String,
    pub file_dir: String,
    pub ttl_seconds: u64,
    pub busy_timeout_ms: u32,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_jitter_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilitySection {
    pub failure_log: String,
    pub trace_dir: Option<String>,
}

pub fn load_scraper_config<P: AsRef<Path>>(path: P) -> ConfigResult<ScraperConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> ConfigResult<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
