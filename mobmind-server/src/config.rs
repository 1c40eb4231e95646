//! Configuration loading.
//!
//! Precedence: environment > TOML file > defaults. A missing file is
//! created with the defaults so operators have something to edit.
//!
//! ```text
//! ~/.config/mobmind/
//! └── config.toml      # MOBMIND_CONFIG overrides the path
//! ```

use anyhow::Context;
use mobmind_core::ServiceConfig;
use std::path::{Path, PathBuf};
use tracing::info;

pub const CONFIG_PATH_VAR: &str = "MOBMIND_CONFIG";
pub const HTTP_PORT_VAR: &str = "MOBMIND_HTTP_PORT";
pub const DATABASE_PATH_VAR: &str = "MOBMIND_DATABASE_PATH";
pub const MODEL_DIR_VAR: &str = "MOBMIND_MODEL_DIR";

/// Resolved configuration and where it came from
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub path: PathBuf,
    pub service: ServiceConfig,
}

/// Default config file location
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mobmind")
        .join("config.toml")
}

/// Load configuration from the process environment
pub fn load() -> anyhow::Result<LoadedConfig> {
    load_with(|key| std::env::var(key).ok())
}

/// Load configuration with an injectable environment lookup
pub fn load_with(env: impl Fn(&str) -> Option<String>) -> anyhow::Result<LoadedConfig> {
    let path = env(CONFIG_PATH_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    let mut service = read_or_create(&path)?;
    apply_env_overrides(&mut service, &env)?;
    service
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;

    Ok(LoadedConfig { path, service })
}

/// Parse `path`, writing defaults there first if it does not exist
fn read_or_create(path: &Path) -> anyhow::Result<ServiceConfig> {
    if !path.exists() {
        let defaults = ServiceConfig::default();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let rendered = toml::to_string_pretty(&defaults)?;
        std::fs::write(path, rendered)
            .with_context(|| format!("Failed to write default config to {}", path.display()))?;
        info!(path = %path.display(), "Wrote default configuration");
        return Ok(defaults);
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(config)
}

fn apply_env_overrides(
    config: &mut ServiceConfig,
    env: &impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    if let Some(port) = env(HTTP_PORT_VAR) {
        config.http_server.port = port
            .trim()
            .parse()
            .with_context(|| format!("{HTTP_PORT_VAR} is not a valid port: {port}"))?;
    }
    if let Some(path) = env(DATABASE_PATH_VAR) {
        config.database.path = PathBuf::from(path);
    }
    if let Some(dir) = env(MODEL_DIR_VAR) {
        config.models.directory = PathBuf::from(dir);
    }
    Ok(())
}
