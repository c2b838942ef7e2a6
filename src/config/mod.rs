mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: EngineConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<EngineConfig> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = [
        "./filmstrip.toml",
        "~/.config/filmstrip/config.toml",
        "/etc/filmstrip/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    Ok(EngineConfig::default())
}

/// Validate configuration
pub fn validate_config(config: &EngineConfig) -> Result<()> {
    if config.coordinator.throttle_ms == 0 {
        anyhow::bail!("coordinator.throttle_ms must be greater than 0");
    }

    let k = config.cache.span_multiplier;
    if !k.is_finite() || k < 0.0 {
        anyhow::bail!("cache.span_multiplier must be a finite value >= 0, got {}", k);
    }

    if config.decode.one_shot_timeout_secs == 0 {
        anyhow::bail!("decode.one_shot_timeout_secs must be greater than 0");
    }

    if config.decode.command_capacity == 0 {
        anyhow::bail!("decode.command_capacity must be greater than 0");
    }

    if config.layout.thumbnail_width == 0 {
        anyhow::bail!("layout.thumbnail_width must be greater than 0");
    }

    if k > 20.0 {
        tracing::warn!(
            span_multiplier = k,
            "Large span multiplier keeps many off-screen bitmaps alive"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.coordinator.throttle_ms, 200);
        assert_eq!(config.cache.span_multiplier, 3.0);
        assert_eq!(config.decode.one_shot_timeout_secs, 15);
        assert_eq!(config.decode.command_capacity, 64);
        assert_eq!(config.layout.thumbnail_width, 160);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[coordinator]\nthrottle_ms = 50\n\n[cache]\nspan_multiplier = 1.5").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.coordinator.throttle_ms, 50);
        assert_eq!(config.cache.span_multiplier, 1.5);
        assert_eq!(config.decode.one_shot_timeout_secs, 15);
        assert_eq!(config.throttle().as_millis(), 50);
    }

    #[test]
    fn test_rejects_zero_values() {
        let mut config = EngineConfig::default();
        config.decode.command_capacity = 0;
        assert!(validate_config(&config).is_err());

        let mut config = EngineConfig::default();
        config.cache.span_multiplier = -1.0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_explicit_missing_path_errors() {
        let missing = Path::new("/nonexistent/filmstrip.toml");
        let err = load_config_or_default(Some(missing)).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to read config file"));
    }
}
