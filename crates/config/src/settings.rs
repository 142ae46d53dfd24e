// Session settings

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum ConfigError {
    Parse(String),
    Validation(String),
    Io(std::io::Error),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Parse(_) => "config_parse",
            ConfigError::Validation(_) => "config_invalid",
            ConfigError::Io(_) => "config_io",
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Parse(msg) => write!(f, "cannot parse settings: {}", msg),
            ConfigError::Validation(msg) => write!(f, "invalid settings: {}", msg),
            ConfigError::Io(e) => write!(f, "settings file: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Most history states kept per sheet
    pub max_undo: usize,

    /// Idle seconds before a runtime sheet is closed
    pub session_timeout_secs: u64,

    pub aggregate_only_traps: bool,

    /// gzip level for session snapshots (0-9)
    pub compression_level: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_db: Option<PathBuf>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_undo: 50,
            session_timeout_secs: 30 * 60,
            aggregate_only_traps: false,
            compression_level: 6,
            snapshot_db: None,
        }
    }
}

impl SessionSettings {
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let settings: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_undo == 0 {
            return Err(ConfigError::Validation("max_undo must be at least 1".into()));
        }
        if self.compression_level > 9 {
            return Err(ConfigError::Validation(format!(
                "compression_level {} is outside 0..=9",
                self.compression_level
            )));
        }
        if self.session_timeout_secs == 0 {
            return Err(ConfigError::Validation("session_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    /// Get the settings file path
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sheetsession")
            .join("settings.toml")
    }

    /// Load settings from the default path, falling back to defaults when absent
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::path())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::debug!("no settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let settings = SessionSettings::from_toml("").unwrap();
        assert_eq!(settings, SessionSettings::default());
        assert_eq!(settings.max_undo, 50);
        assert_eq!(settings.session_timeout_secs, 1800);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let settings = SessionSettings::from_toml(
            "max_undo = 5\naggregate_only_traps = true\nsnapshot_db = \"/tmp/s.db\"\n",
        )
        .unwrap();
        assert_eq!(settings.max_undo, 5);
        assert!(settings.aggregate_only_traps);
        assert_eq!(settings.compression_level, 6);
        assert_eq!(settings.snapshot_db, Some(PathBuf::from("/tmp/s.db")));
    }

    #[test]
    fn rejects_zero_undo_and_bad_level() {
        let err = SessionSettings::from_toml("max_undo = 0").unwrap_err();
        assert_eq!(err.code(), "config_invalid");
        let err = SessionSettings::from_toml("compression_level = 12").unwrap_err();
        assert_eq!(err.code(), "config_invalid");
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = SessionSettings::from_toml("max_undo = [").unwrap_err();
        assert_eq!(err.code(), "config_parse");
        let err = SessionSettings::from_toml("max_undo = \"ten\"").unwrap_err();
        assert_eq!(err.code(), "config_parse");
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");
        let settings = SessionSettings {
            max_undo: 7,
            session_timeout_secs: 60,
            ..SessionSettings::default()
        };
        settings.save_to(&path).unwrap();
        assert_eq!(SessionSettings::load_from(&path).unwrap(), settings);
    }

    #[test]
    fn missing_file_is_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = SessionSettings::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(loaded, SessionSettings::default());
    }

    #[test]
    fn path_is_under_sheetsession() {
        let path = SessionSettings::path();
        assert!(path.ends_with("sheetsession/settings.toml"));
    }
}
