pub mod settings;

pub use settings::{
    parse_settings, validate_settings, EngineSettings, PackagingSettings, Secret, ServerSettings,
    Settings, SettingsError, StorageSettings, WorkerCredentials,
};

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors for file I/O operations (separate from pure parsing errors)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Settings error: {0}")]
    SettingsError(#[from] SettingsError),
}

/// Default settings location: ~/.nbpipe/config.yaml
pub fn default_settings_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".nbpipe")
        .join("config.yaml")
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load settings from a file.
pub fn load_settings_from(path: &Path) -> Result<Settings, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let settings = parse_settings(&content)?;
    Ok(settings)
}

/// Load settings from `path`, or from the default location when `None`.
/// Only a missing default file falls back to the built-in defaults.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    match path {
        Some(p) => load_settings_from(p),
        None => {
            let default_path = default_settings_path();
            if default_path.exists() {
                load_settings_from(&default_path)
            } else {
                Ok(Settings::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_settings_file() {
        let file = create_temp_file("storage:\n  bucket: notebooks\n");
        let settings = load_settings_from(file.path()).unwrap();
        assert_eq!(settings.storage.bucket, "notebooks");
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let result = load_settings(Some(Path::new("/nonexistent/config.yaml")));
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_invalid_file() {
        let file = create_temp_file("storage: [unterminated\n");
        let result = load_settings_from(file.path());
        assert!(matches!(result, Err(ConfigError::SettingsError(_))));
    }
}
