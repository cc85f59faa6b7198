use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "config.toml";
pub const ENV_DATA_DIR: &str = "TEXTREEL_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub render: RenderConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub body_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Per-job overlay text and rendered artifacts. Relative paths are
    /// resolved against the data directory.
    pub work_dir: PathBuf,
}

/// Parameters handed to the external encoder for every job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RenderConfig {
    pub encoder_binary: String,
    pub width: u32,
    pub height: u32,
    pub duration_secs: u32,
    pub font_size: u32,
    pub font_color: String,
    pub background_color: String,
    pub video_codec: String,
    pub pixel_format: String,
    /// Trailing window of encoder stderr kept as the job's error diagnostic.
    pub diagnostic_tail_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionConfig {
    /// Terminal (DONE/ERROR) records kept in memory; older ones are evicted
    /// together with their artifacts.
    pub max_finished_jobs: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            body_limit_bytes: 50 * 1024 * 1024,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("renders"),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            encoder_binary: "ffmpeg".to_string(),
            width: 1080,
            height: 1920,
            duration_secs: 12,
            font_size: 48,
            font_color: "white".to_string(),
            background_color: "black".to_string(),
            video_codec: "libx264".to_string(),
            pixel_format: "yuv420p".to_string(),
            diagnostic_tail_chars: 2000,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_finished_jobs: 500,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Absolute-or-data-dir-relative location of the render work directory.
    pub fn work_dir(&self, data_dir: &Path) -> PathBuf {
        resolve_relative_to(data_dir, &self.paths.work_dir)
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. TEXTREEL_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Creates the data directory and writes a default config.toml unless one
/// already exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.server.port, 3000);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.server.body_limit_bytes, 50 * 1024 * 1024);
        assert_eq!(cfg.paths.work_dir, PathBuf::from("renders"));
        assert_eq!(cfg.render.encoder_binary, "ffmpeg");
        assert_eq!((cfg.render.width, cfg.render.height), (1080, 1920));
        assert_eq!(cfg.render.duration_secs, 12);
        assert_eq!(cfg.render.diagnostic_tail_chars, 2000);
        assert_eq!(cfg.retention.max_finished_jobs, 500);
    }

    #[test]
    fn partial_toml_keeps_defaults_for_missing_sections() {
        let cfg: AppConfig = toml::from_str("[render]\nwidth = 720\n").expect("parse config");

        assert_eq!(cfg.render.width, 720);
        assert_eq!(cfg.render.height, 1920);
        assert_eq!(cfg.server, ServerConfig::default());
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let dir = tempdir().expect("tempdir");
        let loaded =
            AppConfig::load_from_path(&dir.path().join("missing.toml")).expect("load config");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn load_from_blank_file_returns_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "  \n").expect("write blank config");

        let loaded = AppConfig::load_from_path(&path).expect("load config");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn load_from_malformed_file_reports_path() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[server\nport = ").expect("write malformed config");

        let err = AppConfig::load_from_path(&path).expect_err("malformed config must fail");
        assert!(format!("{err:#}").contains("config.toml"));
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let root = tempdir().expect("tempdir");
        let data = root.path().join("nested");
        initialize_data_dir(&data).expect("initialize data dir");

        assert!(data.join("config.toml").exists());
        let loaded = AppConfig::load_from_path(&config_path(&data)).expect("reload config");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let dir = tempdir().expect("tempdir");
        let cfg_path = dir.path().join("config.toml");
        let custom_content = "[server]\nport = 9999\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(dir.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn work_dir_resolves_against_data_dir() {
        let mut cfg = AppConfig::default();
        assert_eq!(
            cfg.work_dir(Path::new("/data")),
            PathBuf::from("/data/renders")
        );

        cfg.paths.work_dir = PathBuf::from("/var/renders");
        assert_eq!(cfg.work_dir(Path::new("/data")), PathBuf::from("/var/renders"));
    }
}
