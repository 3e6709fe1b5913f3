//! Locating the built package and classifying how a build ended.

use log::{error, info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::config::AppConfig;
use crate::runner::{BuildRun, Termination};

/// What the operator gets to see and download after a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BuildOutcome {
    /// Zero exit and a package on disk
    Packaged { artifact: PathBuf, file_name: String },

    /// Zero exit, yet none of the output directories holds a package
    ArtifactMissing { searched: Vec<PathBuf> },

    /// Non-zero exit or signal death
    Failed { exit_code: Option<i32>, stderr: String },

    TimedOut,

    Cancelled,
}

impl BuildOutcome {
    pub fn message(&self) -> String {
        match self {
            Self::Packaged { file_name, .. } => {
                format!("APK build completed successfully! APK generated: {file_name}")
            }
            Self::ArtifactMissing { .. } => {
                "Build reported success, but no APK file was found in the build output.".to_string()
            }
            Self::Failed { exit_code: Some(code), .. } => {
                format!("APK build failed with exit code {code}. Check the build log for details.")
            }
            Self::Failed { exit_code: None, .. } => {
                "APK build failed. Check the build log for details.".to_string()
            }
            Self::TimedOut => "APK build timed out and was stopped.".to_string(),
            Self::Cancelled => "APK build was cancelled.".to_string(),
        }
    }
}

/// Summary of the last build, kept for the report and download endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub project_id: String,
    pub command_line: String,
    pub termination: Termination,
    pub outcome: BuildOutcome,
    pub message: String,
    pub log_path: PathBuf,
    pub finished_at: String,
}

/// Classify a finished run against what is on disk.
pub fn conclude(run: &BuildRun, project_id: &str, config: &AppConfig) -> BuildReport {
    let outcome = match run.termination {
        Termination::Exited(0) => {
            match locate(&run.working_dir, &config.artifact_dirs, &config.artifact_extension) {
                Some(artifact) => {
                    let file_name = artifact
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    info!("[Artifact] Found {:?}", artifact);
                    BuildOutcome::Packaged {
                        artifact,
                        file_name,
                    }
                }
                None => {
                    let searched: Vec<PathBuf> = config
                        .artifact_dirs
                        .iter()
                        .map(|dir| run.working_dir.join(dir))
                        .collect();
                    error!(
                        "[Artifact] Build exited 0 but no .{} file in {:?}",
                        config.artifact_extension, searched
                    );
                    BuildOutcome::ArtifactMissing { searched }
                }
            }
        }
        Termination::TimedOut => BuildOutcome::TimedOut,
        Termination::Cancelled => BuildOutcome::Cancelled,
        other => {
            warn!("[Artifact] Build failed: {:?}", other);
            BuildOutcome::Failed {
                exit_code: other.exit_code(),
                stderr: run.stderr.clone(),
            }
        }
    };

    BuildReport {
        project_id: project_id.to_string(),
        command_line: run.command_line.clone(),
        termination: run.termination,
        message: outcome.message(),
        outcome,
        log_path: run.log_path.clone(),
        finished_at: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
    }
}

/// Find the package among `dirs` (relative to `root`).
///
/// # Arguments
///
/// * `root` - Project directory the build ran in
/// * `dirs` - Output directories to search, relative to `root`
/// * `extension` - Package extension, compared case-insensitively
///
/// # Returns
///
/// - `Some(PathBuf)` for the chosen regular file
/// - `None` if no directory holds a matching file
///
/// When several files match, the most recently modified one wins, then the
/// greatest file name, so the choice does not depend on directory order.
pub fn locate(root: &Path, dirs: &[PathBuf], extension: &str) -> Option<PathBuf> {
    let mut best: Option<(SystemTime, String, PathBuf)> = None;

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(root.join(dir)) else {
            continue;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let matches = path
                .extension()
                .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case(extension));
            if !matches {
                continue;
            }
            let Ok(meta) = std::fs::metadata(&path) else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }

            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let name = entry.file_name().to_string_lossy().into_owned();
            let newer = best
                .as_ref()
                .is_none_or(|(t, n, _)| (modified, &name) > (*t, n));
            if newer {
                best = Some((modified, name, path));
            }
        }
    }

    best.map(|(_, _, path)| path)
}
