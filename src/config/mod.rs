mod file_config;

pub use file_config::{AuthConfig, CatalogConfig, FileConfig, SearchConfig};

use anyhow::{bail, Result};
use std::time::Duration;

use crate::catalog::DEFAULT_BROWSE_PAGE_SIZE;
use crate::search::{DEFAULT_PAGE_SIZE, DEFAULT_QUIET_PERIOD};

pub const DEFAULT_SITE_URL: &str = "http://localhost:5173";
pub const DEFAULT_REQUEST_TIMEOUT_SEC: u64 = 30;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub backend_url: Option<String>,
    pub anon_key: Option<String>,
    pub site_url: Option<String>,
    pub request_timeout_sec: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub backend_url: String,
    pub anon_key: String,
    pub site_url: String,
    pub request_timeout_sec: u64,

    // Feature configs (with defaults)
    pub search: SearchSettings,
    pub catalog: CatalogSettings,
    pub auth: AuthSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchSettings {
    pub debounce: Duration,
    pub page_size: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_QUIET_PERIOD,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogSettings {
    pub browse_page_size: usize,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            browse_page_size: DEFAULT_BROWSE_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthSettings {
    pub auto_refresh: bool,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self { auto_refresh: true }
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        // TOML overrides CLI for each field
        let backend_url = file
            .backend_url
            .or_else(|| cli.backend_url.clone())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "backend_url must be specified via --backend-url or in config file"
                )
            })?;
        validate_http_url("backend_url", &backend_url)?;

        let anon_key = file
            .anon_key
            .or_else(|| cli.anon_key.clone())
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!("anon_key must be specified via --anon-key or in config file")
            })?;

        let site_url = file
            .site_url
            .or_else(|| cli.site_url.clone())
            .unwrap_or_else(|| DEFAULT_SITE_URL.to_string());
        validate_http_url("site_url", &site_url)?;

        let request_timeout_sec = file
            .request_timeout_sec
            .or(cli.request_timeout_sec)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SEC);
        if request_timeout_sec == 0 {
            bail!("request_timeout_sec must be greater than 0");
        }

        // Search settings - merge file config with defaults
        let search_file = file.search.unwrap_or_default();
        let defaults = SearchSettings::default();
        let debounce = search_file
            .debounce_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.debounce);
        if debounce.is_zero() {
            bail!("search.debounce_ms must be greater than 0");
        }
        let search = SearchSettings {
            debounce,
            page_size: search_file.page_size.unwrap_or(defaults.page_size).max(1),
        };

        let catalog = CatalogSettings {
            browse_page_size: file
                .catalog
                .and_then(|c| c.browse_page_size)
                .unwrap_or(DEFAULT_BROWSE_PAGE_SIZE)
                .max(1),
        };

        let auth = AuthSettings {
            auto_refresh: file
                .auth
                .and_then(|a| a.auto_refresh)
                .unwrap_or(AuthSettings::default().auto_refresh),
        };

        Ok(Self {
            backend_url,
            anon_key,
            site_url,
            request_timeout_sec,
            search,
            catalog,
            auth,
        })
    }
}

fn validate_http_url(field: &str, url: &str) -> Result<()> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!("{} must start with http:// or https://, got {:?}", field, url);
    }
    Ok(())
}
