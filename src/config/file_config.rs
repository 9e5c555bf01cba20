use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub backend_url: Option<String>,
    pub anon_key: Option<String>,
    pub site_url: Option<String>,
    pub request_timeout_sec: Option<u64>,

    // Feature configs
    pub search: Option<SearchConfig>,
    pub catalog: Option<CatalogConfig>,
    pub auth: Option<AuthConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SearchConfig {
    /// Quiet period before a typed query is sent.
    pub debounce_ms: Option<u64>,
    pub page_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct CatalogConfig {
    pub browse_page_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct AuthConfig {
    pub auto_refresh: Option<bool>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
