//! Configuration file discovery and loading.

use std::path::{Path, PathBuf};

use super::{Config, ConfigError};

/// Configuration file search paths, in priority order.
#[must_use]
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(path) = std::env::var("BIOPATROL_CONFIG") {
        paths.push(PathBuf::from(path));
    }
    paths.push(PathBuf::from("/etc/biopatrol/config.yaml"));
    paths.push(PathBuf::from("./config.yaml"));

    paths
}

/// Finds the first existing config file. An explicit path (CLI flag) wins
/// over the search paths and must exist.
pub fn find_config_file(explicit_path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit_path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(ConfigError::NotFound {
            searched: vec![path.to_path_buf()],
        });
    }

    let paths = default_config_paths();
    for path in &paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    Err(ConfigError::NotFound { searched: paths })
}

/// Loads and validates configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;

    if contents.trim().is_empty() {
        return Err(ConfigError::EmptyFile);
    }

    let config: Config = serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
        message: e.to_string(),
    })?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_a_valid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "monitor:\n  period: 1s").unwrap();

        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.monitor.period, std::time::Duration::from_secs(1));
    }

    #[test]
    fn empty_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "   ").unwrap();
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::EmptyFile)
        ));
    }

    #[test]
    fn invalid_values_are_rejected_on_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "monitor:\n  period: 0s").unwrap();
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn missing_explicit_path_is_an_error() {
        let err = find_config_file(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }
}
