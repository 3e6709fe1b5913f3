//! Service Configuration
//!
//! This module handles loading the service settings: where to listen, where
//! staged projects live, how the packaging tool is invoked and where it leaves
//! its output. Configuration is stored in the user's XDG config directory as
//! JSON.
//!
//! # Storage Location
//!
//! - Linux: `$XDG_CONFIG_HOME/apk-forge/config.json` or `~/.config/apk-forge/config.json`
//! - An explicit path can be passed as the first command-line argument
//!
//! Every field has a default, so a partial file only overrides what it names.

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::prober::Requirement;

const APP_DIR: &str = "apk-forge";

/// Settings for one running instance of the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Socket address the HTTP front end binds to
    pub bind: String,

    /// Directory under which per-upload project directories are created.
    /// Owned by the service: every upload empties it first.
    pub workspace: PathBuf,

    /// Packaging tool executable (looked up on `PATH`)
    pub builder: String,

    /// Pass the tool's verbose flag on builds
    pub verbose: bool,

    /// Arguments that generate a default configuration file
    pub init_args: Vec<String>,

    /// Arguments that build a debug package
    pub build_args: Vec<String>,

    /// Build-configuration file, relative to the project root
    pub config_file: PathBuf,

    /// Name the uploaded archive is saved under inside the project root
    pub archive_name: String,

    /// Build log written to the project root after every build
    pub log_file: String,

    /// Output directories searched for the package, relative to the project root
    pub artifact_dirs: Vec<PathBuf>,

    /// Package file extension, without the dot
    pub artifact_extension: String,

    /// Kill the build after this many seconds; `None` waits forever
    pub build_timeout_secs: Option<u64>,

    /// External capabilities that must be present before uploads are accepted
    pub requirements: Vec<Requirement>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8501".to_string(),
            workspace: default_workspace(),
            builder: "buildozer".to_string(),
            verbose: true,
            init_args: vec!["init".to_string()],
            build_args: vec!["android".to_string(), "debug".to_string()],
            config_file: PathBuf::from("buildozer.spec"),
            archive_name: "project.zip".to_string(),
            log_file: "build_output.log".to_string(),
            artifact_dirs: vec![
                PathBuf::from(".buildozer/android/platform/build/outputs/apk"),
                PathBuf::from("buildozer/bin"),
            ],
            artifact_extension: "apk".to_string(),
            build_timeout_secs: Some(3600),
            requirements: Requirement::defaults(),
        }
    }
}

impl AppConfig {
    /// Full argument list for a build, with the verbose flag in front.
    pub fn build_command(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.build_args.len() + 1);
        if self.verbose {
            args.push("-v".to_string());
        }
        args.extend(self.build_args.iter().cloned());
        args
    }

    pub fn build_timeout(&self) -> Option<std::time::Duration> {
        self.build_timeout_secs.map(std::time::Duration::from_secs)
    }
}

fn default_workspace() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.data_local_dir().join(APP_DIR).join("projects"))
        .unwrap_or_else(|| PathBuf::from("kivy_project"))
}

/// Get the path to the configuration file.
///
/// # Returns
///
/// - `Ok(PathBuf)` with the full path to config.json
/// - `Err` if no config directory can be determined
///
/// # File Location
///
/// - First tries `$XDG_CONFIG_HOME/apk-forge/config.json`
/// - Falls back to `~/.config/apk-forge/config.json` on Linux
///
/// Unlike the workspace, the directory is not created here: a missing file
/// simply means defaults.
pub fn get_config_path() -> Result<PathBuf> {
    let config_dir = if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config)
    } else if let Some(home) = directories::BaseDirs::new() {
        home.config_dir().to_path_buf()
    } else {
        return Err(anyhow::anyhow!("Could not determine config directory"));
    };

    Ok(config_dir.join(APP_DIR).join("config.json"))
}

/// Load the configuration from an explicit path, or the default location.
///
/// # Arguments
///
/// * `explicit` - Path given on the command line, if any
///
/// # Returns
///
/// The parsed configuration, with defaults for every field the file omits.
///
/// # Errors
///
/// An explicit path that cannot be read or parsed is an error, since the
/// operator asked for it by name. The default location degrades gracefully:
/// problems are logged and defaults are used.
pub fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = explicit {
        return read_config_file(path);
    }

    match get_config_path() {
        Ok(path) if path.exists() => match read_config_file(&path) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!("Failed to load config, using defaults: {:#}", e);
                Ok(AppConfig::default())
            }
        },
        Ok(path) => {
            info!("No config file found at {:?}, using defaults", path);
            Ok(AppConfig::default())
        }
        Err(e) => {
            warn!("Failed to get config path: {}", e);
            Ok(AppConfig::default())
        }
    }
}

fn read_config_file(path: &Path) -> Result<AppConfig> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config {:?}", path))?;
    let config = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config {:?}", path))?;
    info!("Loaded config from {:?}", path);
    Ok(config)
}
