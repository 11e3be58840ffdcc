//! Layered configuration.
//!
//! Sources, lowest priority first: built-in defaults, the TOML file, `RESTOR_*`
//! environment variables, then whatever the command line sets.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::core::imaging_tool::ImagingToolType;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/restor/config.toml";
const CONFIG_PATH_VAR: &str = "RESTOR_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Flat directory holding verified image files.
    pub cache_directory: PathBuf,
    /// JSON catalog of images.
    pub catalog_path: PathBuf,
    /// Unix socket the helper listens on.
    pub socket_path: PathBuf,
    /// Permission bits applied to the socket file.
    pub socket_mode: u32,
    pub imaging_tool: ImagingToolType,
    /// Read the disk back after writing.
    pub verify_images: bool,
    /// Re-hash the source file in the helper before writing.
    pub verify_source_checksum: bool,
    /// Run after the write as `<script> <disk> <image name>`.
    pub post_script: Option<PathBuf>,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cache_directory: PathBuf::from("/var/cache/restor"),
            catalog_path: PathBuf::from("/etc/restor/catalog.json"),
            socket_path: PathBuf::from("/run/restor/helper.sock"),
            socket_mode: 0o660,
            imaging_tool: ImagingToolType::default(),
            verify_images: true,
            verify_source_checksum: true,
            post_script: None,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default file location.
    pub fn new<T: Serialize>(overrides: Option<&T>) -> Result<Self, figment::Error> {
        let path = std::env::var_os(CONFIG_PATH_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load(&path, overrides)
    }

    /// Load configuration with `path` as the TOML layer. A missing file is skipped.
    pub fn load<T: Serialize>(path: &Path, overrides: Option<&T>) -> Result<Self, figment::Error> {
        let figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("RESTOR_").ignore(&["config"]));
        Self::extract(figment, overrides)
    }

    fn extract<T: Serialize>(
        figment: Figment,
        overrides: Option<&T>,
    ) -> Result<Self, figment::Error> {
        let figment = match overrides {
            Some(args) => figment.merge(Serialized::defaults(args)),
            None => figment,
        };
        figment.extract()
    }
}
