//! Project staging: turning an uploaded archive into a buildable directory.
//!
//! Every upload gets its own directory under the workspace, named by a cycle
//! id. The workspace is emptied first, so nothing from an earlier upload, or
//! from an earlier run of the service, can leak into the next build.

use log::{info, warn};
use serde::Serialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::process::Command;

use crate::config::AppConfig;
use crate::error::{ForgeError, Result};

static CYCLE_SEQ: AtomicU64 = AtomicU64::new(0);

/// A project extracted and ready to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedProject {
    /// Per-upload identifier, also the directory name under the workspace
    pub id: String,
    pub root: PathBuf,
    pub config_path: PathBuf,
    /// The configuration file was generated by the tool's init subcommand
    pub bootstrapped: bool,
}

fn next_cycle_id() -> String {
    let seq = CYCLE_SEQ.fetch_add(1, Ordering::SeqCst);
    format!("{}-{}", chrono::Local::now().format("%Y%m%d-%H%M%S"), seq)
}

/// Stage `archive` as the new current project.
///
/// # Arguments
///
/// * `config` - Supplies the workspace, archive and configuration file names
///   and the init command used when the archive has no configuration file
/// * `archive` - Raw bytes of the uploaded zip file
///
/// # Returns
///
/// The staged project, rooted in a fresh directory under the workspace.
///
/// # Errors
///
/// Every entry already in the workspace is removed first, whether or not this
/// process created it. A removal that fails aborts staging with
/// `ForgeError::Staging`. Extraction and bootstrap failures also abort, and
/// the half-written directory is removed again.
pub async fn stage(config: &AppConfig, archive: &[u8]) -> Result<StagedProject> {
    sweep_workspace(&config.workspace).await?;

    tokio::fs::create_dir_all(&config.workspace)
        .await
        .map_err(|e| ForgeError::staging(&config.workspace, e))?;

    let id = next_cycle_id();
    let root = config.workspace.join(&id);
    tokio::fs::create_dir(&root)
        .await
        .map_err(|e| ForgeError::staging(&root, e))?;

    match populate(config, &root, archive).await {
        Ok(bootstrapped) => Ok(StagedProject {
            id,
            config_path: root.join(&config.config_file),
            root,
            bootstrapped,
        }),
        Err(e) => {
            // Leave no half-staged directory behind
            if let Err(cleanup) = tokio::fs::remove_dir_all(&root).await {
                warn!("[Stager] Failed to remove {:?}: {}", root, cleanup);
            }
            Err(e)
        }
    }
}

/// Save and extract the archive into `root`, then make sure the
/// configuration file exists. Returns whether it had to be generated.
async fn populate(config: &AppConfig, root: &Path, archive: &[u8]) -> Result<bool> {
    let archive_path = root.join(&config.archive_name);
    tokio::fs::write(&archive_path, archive)
        .await
        .map_err(|e| ForgeError::staging(&archive_path, e))?;

    let entries = {
        let archive_path = archive_path.clone();
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || extract_archive(&archive_path, &root))
            .await
            .map_err(|e| ForgeError::Extraction(format!("extraction task failed: {e}")))??
    };
    info!("[Stager] Extracted {} entries into {:?}", entries, root);

    let config_path = root.join(&config.config_file);
    if config_path.exists() {
        info!("[Stager] Found existing {:?}", config.config_file);
        return Ok(false);
    }

    warn!("[Stager] {:?} not found, creating a default one", config.config_file);
    bootstrap_config(config, root, &config_path).await?;
    Ok(true)
}

/// Remove everything under the workspace. A missing workspace is fine;
/// anything that blocks deletion aborts staging.
async fn sweep_workspace(workspace: &Path) -> Result<()> {
    let mut entries = match tokio::fs::read_dir(workspace).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(ForgeError::staging(workspace, e)),
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ForgeError::staging(workspace, e))?
    {
        let path = entry.path();
        let is_dir = entry
            .file_type()
            .await
            .map_err(|e| ForgeError::staging(&path, e))?
            .is_dir();
        let removed = if is_dir {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match removed {
            Ok(()) => info!("[Stager] Removed previous project {:?}", path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => return Err(ForgeError::staging(&path, e)),
        }
    }
    Ok(())
}

fn extract_archive(archive_path: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(archive_path).map_err(|e| ForgeError::staging(archive_path, e))?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))?;
    let entries = archive.len();
    archive.extract(dest)?;
    Ok(entries)
}

async fn bootstrap_config(config: &AppConfig, root: &Path, config_path: &Path) -> Result<()> {
    let output = Command::new(&config.builder)
        .args(&config.init_args)
        .current_dir(root)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| ForgeError::Spawn {
            program: config.builder.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(ForgeError::Bootstrap {
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    if !config_path.exists() {
        return Err(ForgeError::Bootstrap {
            exit_code: output.status.code(),
            stderr: format!("init finished but {:?} was not created", config.config_file),
        });
    }

    info!("[Stager] Created default {:?}", config.config_file);
    Ok(())
}

/// Current text of the project's configuration file.
pub async fn read_config(project: &StagedProject) -> Result<String> {
    let bytes = tokio::fs::read(&project.config_path)
        .await
        .map_err(|e| ForgeError::staging(&project.config_path, e))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Replace the configuration file with operator-edited text.
pub async fn write_config(project: &StagedProject, text: &str) -> Result<()> {
    tokio::fs::write(&project.config_path, text)
        .await
        .map_err(|e| ForgeError::staging(&project.config_path, e))?;
    info!("[Stager] Saved edited {:?}", project.config_path);
    Ok(())
}
