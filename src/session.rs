//! The single implicit operator session.
//!
//! Tracks the current staged project and the last build report, and makes
//! sure only one staging or build operation touches the workspace at a time.
//! A second request while one is in flight is rejected, not queued.

use log::info;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc, watch};

use crate::artifact::{BuildOutcome, BuildReport, conclude};
use crate::config::AppConfig;
use crate::error::{ForgeError, Result};
use crate::prober::EnvironmentReport;
use crate::runner::{BuildCommand, OutputLine, RunOptions, run_build};
use crate::stager::{self, StagedProject};

/// Events sent to the client while a build runs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildEvent {
    Line(OutputLine),
    Finished(BuildReport),
    Error { code: String, message: String },
}

#[derive(Default)]
struct SessionState {
    project: Option<StagedProject>,
    report: Option<BuildReport>,
    cancel: Option<watch::Sender<bool>>,
}

pub struct Session {
    config: AppConfig,
    environment: EnvironmentReport,
    state: Mutex<SessionState>,
    busy: Arc<AtomicBool>,
}

pub type SharedSession = Arc<Session>;

/// Exclusive use of the workspace; released on drop.
struct WorkspacePermit {
    busy: Arc<AtomicBool>,
}

impl Drop for WorkspacePermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

impl Session {
    pub fn new(config: AppConfig, environment: EnvironmentReport) -> SharedSession {
        Arc::new(Self {
            config,
            environment,
            state: Mutex::new(SessionState::default()),
            busy: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn environment(&self) -> &EnvironmentReport {
        &self.environment
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Uploads and builds are refused while dependencies are missing.
    pub fn ensure_ready(&self) -> Result<()> {
        if self.environment.ready {
            Ok(())
        } else {
            Err(ForgeError::MissingDependencies(self.environment.missing.clone()))
        }
    }

    fn acquire(&self) -> Result<WorkspacePermit> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| ForgeError::Busy)?;
        Ok(WorkspacePermit {
            busy: self.busy.clone(),
        })
    }

    /// Replace the current project with the uploaded archive.
    ///
    /// # Arguments
    ///
    /// * `archive` - Raw bytes of the uploaded zip file
    ///
    /// # Returns
    ///
    /// The newly staged project, which becomes the current one.
    ///
    /// # Errors
    ///
    /// `MissingDependencies` while the host is not ready and `Busy` while
    /// another upload, save or build holds the workspace. Staging errors are
    /// passed through; the previous project and report are gone afterwards
    /// either way, since staging starts by emptying the workspace.
    pub async fn upload(&self, archive: &[u8]) -> Result<StagedProject> {
        self.ensure_ready()?;
        let _permit = self.acquire()?;

        let staged = stager::stage(&self.config, archive).await;

        let mut state = self.state.lock().await;
        state.report = None;
        state.project = staged.as_ref().ok().cloned();
        drop(state);

        let project = staged?;
        info!("[Session] Staged project {} at {:?}", project.id, project.root);
        Ok(project)
    }

    pub async fn project(&self) -> Result<StagedProject> {
        self.state.lock().await.project.clone().ok_or(ForgeError::NoProject)
    }

    pub async fn config_text(&self) -> Result<String> {
        let project = self.project().await?;
        stager::read_config(&project).await
    }

    /// Write operator edits back; refused while a build could be reading it.
    pub async fn save_config_text(&self, text: &str) -> Result<()> {
        let _permit = self.acquire()?;
        let project = self.project().await?;
        stager::write_config(&project, text).await
    }

    /// Start a build of the current project in the background.
    ///
    /// Lines arrive on the returned channel as the tool prints them, followed
    /// by exactly one `Finished` or `Error` event; then the channel closes.
    pub async fn start_build(
        self: &Arc<Self>,
    ) -> Result<mpsc::UnboundedReceiver<BuildEvent>> {
        self.ensure_ready()?;
        let permit = self.acquire()?;

        let (cancel_tx, cancel) = watch::channel(false);
        let project = {
            let mut state = self.state.lock().await;
            let project = state.project.clone().ok_or(ForgeError::NoProject)?;
            state.cancel = Some(cancel_tx);
            project
        };

        let command = BuildCommand::new(&self.config.builder, self.config.build_command());
        let options = RunOptions {
            log_path: project.root.join(&self.config.log_file),
            timeout: self.config.build_timeout(),
            cancel,
        };

        let (events, receiver) = mpsc::unbounded_channel();
        let session = Arc::clone(self);

        tokio::spawn(async move {
            let lines = events.clone();
            let sink = move |line: OutputLine| {
                let _ = lines.send(BuildEvent::Line(line));
            };

            let result = run_build(&command, &project.root, sink, options).await;

            let mut state = session.state.lock().await;
            state.cancel = None;
            let event = match result {
                Ok(run) => {
                    let report = conclude(&run, &project.id, &session.config);
                    info!("[Session] Build finished: {}", report.message);
                    state.report = Some(report.clone());
                    BuildEvent::Finished(report)
                }
                Err(e) => BuildEvent::Error {
                    code: e.code().to_string(),
                    message: e.to_string(),
                },
            };
            drop(state);
            drop(permit);

            let _ = events.send(event);
        });

        Ok(receiver)
    }

    pub async fn cancel_build(&self) -> Result<()> {
        let state = self.state.lock().await;
        let cancel = state.cancel.as_ref().ok_or(ForgeError::NotBuilding)?;
        cancel.send_replace(true);
        info!("[Session] Cancellation requested");
        Ok(())
    }

    pub async fn report(&self) -> Result<BuildReport> {
        self.state.lock().await.report.clone().ok_or(ForgeError::NoBuild)
    }

    /// File name and path of the package produced by the last build.
    pub async fn artifact(&self) -> Result<(String, PathBuf)> {
        let report = self.report().await?;
        match report.outcome {
            BuildOutcome::Packaged {
                artifact,
                file_name,
            } => Ok((file_name, artifact)),
            BuildOutcome::ArtifactMissing { .. } => Err(ForgeError::ArtifactMissing),
            _ => Err(ForgeError::NoArtifact(report.message)),
        }
    }

    /// Log of the last build, whatever its outcome.
    pub async fn log_path(&self) -> Result<PathBuf> {
        Ok(self.report().await?.log_path)
    }
}
