use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::EmbodyConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["embody.toml", "embody.yaml", "embody.yml", "embody.json"];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<EmbodyConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations, then apply
/// environment overrides.
///
/// Search order:
/// 1. `./embody.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/embody/embody.{toml,yaml,yml,json}` (user-global)
///
/// Falls back to `EmbodyConfig::default()` if no config file is found or the
/// file fails to parse.
pub fn discover_and_load() -> EmbodyConfig {
    let mut config = match find_config_file() {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            load_config(&path).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                EmbodyConfig::default()
            })
        },
        None => {
            debug!("no config file found, using defaults");
            EmbodyConfig::default()
        },
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config
}

/// Apply the `REQUESTS_PER_MINUTE`, `MAX_CONCURRENT_REQUESTS` and
/// `SANDBOX_DOMAIN` overrides. Unparseable numbers are ignored with a warning.
pub fn apply_env_overrides(config: &mut EmbodyConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(raw) = lookup("REQUESTS_PER_MINUTE") {
        match raw.trim().parse() {
            Ok(n) => config.rate_limit.requests_per_minute = n,
            Err(e) => warn!(value = %raw, error = %e, "ignoring invalid REQUESTS_PER_MINUTE"),
        }
    }
    if let Some(raw) = lookup("MAX_CONCURRENT_REQUESTS") {
        match raw.trim().parse() {
            Ok(n) => config.rate_limit.max_concurrent_requests = n,
            Err(e) => warn!(value = %raw, error = %e, "ignoring invalid MAX_CONCURRENT_REQUESTS"),
        }
    }
    if let Some(domain) = lookup("SANDBOX_DOMAIN")
        && !domain.trim().is_empty()
    {
        config.server.sandbox_domain = domain.trim().to_lowercase();
    }
}

fn find_config_file() -> Option<PathBuf> {
    // Project-local
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    // User-global: ~/.config/embody/
    let dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the user-global config directory, `~/.config/embody/`.
pub fn config_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().join(".config").join("embody"))
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<EmbodyConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}
