//! TOML persistence for [`ServerConfig`].
//!
//! The file lives at:
//! - Windows:  `%APPDATA%\SNESLink\snes-server.toml`
//! - Linux:    `~/.config/sneslink/snes-server.toml`
//! - macOS:    `~/Library/Application Support/SNESLink/snes-server.toml`
//!
//! A missing file is not an error; defaults are used instead.

use std::path::{Path, PathBuf};

use crate::domain::config::{ConfigError, ServerConfig};

const FILE_NAME: &str = "snes-server.toml";

/// # Errors
///
/// [`ConfigError::NoPlatformConfigDir`] when the platform base directory is unknown.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// # Errors
///
/// See [`config_dir`].
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join(FILE_NAME))
}

/// Loads the default config file, or defaults if it does not exist.
///
/// # Errors
///
/// [`ConfigError::Io`] or [`ConfigError::Parse`].
pub fn load_config() -> Result<ServerConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads `path`, or defaults if it does not exist.
///
/// # Errors
///
/// [`ConfigError::Io`] for failures other than "not found", and
/// [`ConfigError::Parse`] for malformed TOML.
pub fn load_config_from(path: &Path) -> Result<ServerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// # Errors
///
/// See [`save_config_to`].
pub fn save_config(config: &ServerConfig) -> Result<(), ConfigError> {
    save_config_to(config, &config_file_path()?)
}

/// Writes `config` to `path`, creating parent directories.
///
/// # Errors
///
/// [`ConfigError::Io`] or [`ConfigError::Serialize`].
pub fn save_config_to(config: &ServerConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("SNESLink"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("sneslink"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join("Library").join("Application Support").join("SNESLink"))
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::ServerMode;

    fn scratch_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("snes-server-test-{}", uuid::Uuid::new_v4()))
            .join(FILE_NAME)
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = load_config_from(&scratch_path()).unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_saved_config_loads_back() {
        // Arrange
        let path = scratch_path();
        let mut config = ServerConfig::default();
        config.server.port = 23075;
        config.relay.mode = ServerMode::Fallback;
        config.relay.target = Some("ws://10.0.0.2:23074".into());

        // Act
        save_config_to(&config, &path).unwrap();
        let loaded = load_config_from(&path).unwrap();

        // Assert
        assert_eq!(loaded, config);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_malformed_file_is_a_parse_error() {
        let path = scratch_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[server\nport = ").unwrap();
        assert!(matches!(load_config_from(&path), Err(ConfigError::Parse(_))));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
