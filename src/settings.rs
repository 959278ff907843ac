use anyhow::Context;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CURRENT_VERSION: u32 = 1;
const SETTINGS_FILENAME: &str = "config.yaml";
const APP_NAME: &str = "imagemaps";

/// Side length of a host surface, in pixels
pub const DEFAULT_TILE_RESOLUTION: u32 = 128;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Maximum number of surfaces used by all owners together, 0 means unlimited
    #[serde(default)]
    pub global_limit: usize,

    /// Maximum number of surfaces a single owner may use, 0 means unlimited
    #[serde(default)]
    pub per_owner_limit: usize,

    #[serde(default = "default_tile_resolution")]
    pub tile_resolution: u32,

    /// Upper bound for the image worker pool; the pool never exceeds the CPU count
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: u64,

    #[serde(default = "default_max_source_pixels")]
    pub max_source_pixels: u64,

    #[serde(default = "default_main_thread_timeout_secs")]
    pub main_thread_timeout_secs: u64,
}

fn default_version() -> u32 {
    CURRENT_VERSION
}

fn default_tile_resolution() -> u32 {
    DEFAULT_TILE_RESOLUTION
}

fn default_max_workers() -> usize {
    4
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

fn default_max_source_bytes() -> u64 {
    16 * 1024 * 1024
}

fn default_max_source_pixels() -> u64 {
    64 * 1024 * 1024
}

fn default_main_thread_timeout_secs() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            global_limit: 0,
            per_owner_limit: 0,
            tile_resolution: default_tile_resolution(),
            max_workers: default_max_workers(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_source_bytes: default_max_source_bytes(),
            max_source_pixels: default_max_source_pixels(),
            main_thread_timeout_secs: default_main_thread_timeout_secs(),
        }
    }
}

impl Settings {
    /// Number of image workers for this machine
    #[must_use]
    pub fn worker_count(&self) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cpus.min(self.max_workers).max(1)
    }

    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    #[must_use]
    pub fn main_thread_timeout(&self) -> Duration {
        Duration::from_secs(self.main_thread_timeout_secs)
    }

    /// Read settings from `path`, creating the file with defaults when missing.
    /// Unreadable files are logged and replaced by defaults in memory only.
    pub fn load_or_create(path: &Path) -> Self {
        if !path.exists() {
            info!("Settings file not found, creating with defaults at {path:?}");
            let settings = Settings::default();
            if let Err(e) = settings.save_to(path) {
                error!("Failed to save default settings to {path:?}: {e:#}");
            }
            return settings;
        }

        match Self::load_from_path(path) {
            Ok(settings) => settings,
            Err(e) => {
                error!("Failed to load settings from {path:?}: {e:#}");
                Settings::default()
            }
        }
    }

    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {path:?}"))?;
        let mut settings: Settings = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse settings file {path:?}"))?;
        debug!("Loaded settings from {path:?}");

        if settings.version < CURRENT_VERSION {
            migrate_settings(&mut settings);
            if let Err(e) = settings.save_to(path) {
                warn!("Failed to write migrated settings to {path:?}: {e:#}");
            }
        }

        if settings.tile_resolution == 0 {
            warn!("tile_resolution must be positive, using {DEFAULT_TILE_RESOLUTION}");
            settings.tile_resolution = DEFAULT_TILE_RESOLUTION;
        }

        Ok(settings)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory {parent:?}"))?;
            }
        }

        fs::write(path, generate_settings_yaml(self))
            .with_context(|| format!("Failed to save settings to {path:?}"))?;
        debug!("Saved settings to {path:?}");
        Ok(())
    }
}

fn migrate_settings(settings: &mut Settings) {
    info!(
        "Migrating settings from v{} to v{}",
        settings.version, CURRENT_VERSION
    );

    // Future migrations go here:
    // if settings.version < 2 {
    //     migrate_v1_to_v2(settings);
    // }

    settings.version = CURRENT_VERSION;
}

/// Default data directory holding `config.yaml`, `maps/` and `images/`
#[must_use]
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

#[must_use]
pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join(SETTINGS_FILENAME)
}

fn generate_settings_yaml(settings: &Settings) -> String {
    let mut content = String::new();

    content.push_str(&format!("version: {}\n", settings.version));
    content.push('\n');
    content.push_str("# Surface limits, 0 means unlimited\n");
    content.push_str(&format!("global_limit: {}\n", settings.global_limit));
    content.push_str(&format!("per_owner_limit: {}\n", settings.per_owner_limit));
    content.push('\n');
    content.push_str("# Pixel size of one surface tile\n");
    content.push_str(&format!("tile_resolution: {}\n", settings.tile_resolution));
    content.push_str(&format!("max_workers: {}\n", settings.max_workers));
    content.push('\n');
    content.push_str("# Source download limits\n");
    content.push_str(&format!(
        "fetch_timeout_secs: {}\n",
        settings.fetch_timeout_secs
    ));
    content.push_str(&format!("max_source_bytes: {}\n", settings.max_source_bytes));
    content.push_str(&format!(
        "max_source_pixels: {}\n",
        settings.max_source_pixels
    ));
    content.push_str(&format!(
        "main_thread_timeout_secs: {}\n",
        settings.main_thread_timeout_secs
    ));

    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_fill_missing_fields() {
        let settings: Settings = serde_yaml::from_str("global_limit: 12\n").unwrap();
        assert_eq!(settings.global_limit, 12);
        assert_eq!(settings.per_owner_limit, 0);
        assert_eq!(settings.tile_resolution, DEFAULT_TILE_RESOLUTION);
        assert_eq!(settings.version, CURRENT_VERSION);
    }

    #[test]
    fn generated_yaml_round_trips() {
        let settings = Settings {
            global_limit: 300,
            per_owner_limit: 20,
            max_workers: 2,
            ..Settings::default()
        };
        let parsed: Settings = serde_yaml::from_str(&generate_settings_yaml(&settings)).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn load_or_create_writes_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = settings_path(temp_dir.path());

        let settings = Settings::load_or_create(&path);
        assert_eq!(settings, Settings::default());
        assert!(path.exists());
    }

    #[test]
    fn broken_file_falls_back_to_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = settings_path(temp_dir.path());
        fs::write(&path, "global_limit: [not a number").unwrap();

        assert_eq!(Settings::load_or_create(&path), Settings::default());
        assert!(Settings::load_from_path(&path).is_err());
    }

    #[test]
    fn zero_tile_resolution_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = settings_path(temp_dir.path());
        fs::write(&path, "tile_resolution: 0\n").unwrap();

        let settings = Settings::load_from_path(&path).unwrap();
        assert_eq!(settings.tile_resolution, DEFAULT_TILE_RESOLUTION);
    }

    #[test]
    fn worker_count_is_bounded() {
        let settings = Settings {
            max_workers: 1,
            ..Settings::default()
        };
        assert_eq!(settings.worker_count(), 1);

        let settings = Settings {
            max_workers: 0,
            ..Settings::default()
        };
        assert_eq!(settings.worker_count(), 1);
    }
}
