//! Config file loading and default-config generation.

use std::path::Path;

use tracing::info;

use crate::{ConfigError, CoreConfig};

/// Default config file name, looked up in the current directory.
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Load a [`CoreConfig`] from a JSON file. Missing fields fall back to
/// their defaults.
pub fn load_json_config(path: impl AsRef<Path>) -> Result<CoreConfig, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    let config: CoreConfig =
        serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    info!(path = %path.display(), "configuration loaded");
    Ok(config)
}

/// Write a config file populated with default values.
pub fn generate_json_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let path = path.as_ref();
    let contents = serde_json::to_string_pretty(&CoreConfig::default())
        .expect("default config always serializes");
    std::fs::write(path, contents).map_err(|source| ConfigError::FileWrite {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "default configuration generated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn generate_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        generate_json_config(&path).unwrap();
        let config = load_json_config(&path).unwrap();
        assert_eq!(config, CoreConfig::default());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = load_json_config("/nonexistent/config.json").unwrap_err();
        assert!(matches!(err, ConfigError::FileRead { .. }));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{broken").unwrap();

        let err = load_json_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
