//! Error taxonomy for staging and building, with its HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::prober::MissingDependency;

#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("Missing system dependencies: {}", list_missing(.0))]
    MissingDependencies(Vec<MissingDependency>),

    #[error("Archive extraction failed: {0}")]
    Extraction(String),

    #[error("Staging failed at {path:?}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Configuration bootstrap failed (exit code {exit_code:?}): {stderr}")]
    Bootstrap {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Another upload or build is in progress")]
    Busy,

    #[error("No project has been uploaded")]
    NoProject,

    #[error("No build has been run for the current project")]
    NoBuild,

    #[error("No build is running")]
    NotBuilding,

    #[error("The last build produced no package: {0}")]
    NoArtifact(String),

    #[error("The build reported success but produced no package")]
    ArtifactMissing,

    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid upload: {0}")]
    BadUpload(String),
}

fn list_missing(missing: &[MissingDependency]) -> String {
    missing
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl ForgeError {
    pub fn staging(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Staging {
            path: path.into(),
            source,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingDependencies(_) => "MISSING_DEPENDENCIES",
            Self::Extraction(_) => "EXTRACTION_FAILED",
            Self::Staging { .. } => "STAGING_FAILED",
            Self::Bootstrap { .. } => "BOOTSTRAP_FAILED",
            Self::Busy => "BUSY",
            Self::NoProject => "NO_PROJECT",
            Self::NoBuild => "NO_BUILD",
            Self::NotBuilding => "NOT_BUILDING",
            Self::NoArtifact(_) => "NO_ARTIFACT",
            Self::ArtifactMissing => "ARTIFACT_MISSING",
            Self::Spawn { .. } => "SPAWN_FAILED",
            Self::BadUpload(_) => "BAD_UPLOAD",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingDependencies(_) => StatusCode::PRECONDITION_FAILED,
            Self::Extraction(_) | Self::Bootstrap { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Busy | Self::NoProject | Self::NotBuilding => StatusCode::CONFLICT,
            Self::NoBuild | Self::ArtifactMissing | Self::NoArtifact(_) => StatusCode::NOT_FOUND,
            Self::BadUpload(_) => StatusCode::BAD_REQUEST,
            Self::Staging { .. } | Self::Spawn { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut error = serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        if let Self::MissingDependencies(missing) = self {
            error["missing"] = serde_json::to_value(missing).unwrap_or_default();
        }
        serde_json::json!({ "error": error })
    }
}

impl From<zip::result::ZipError> for ForgeError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Extraction(err.to_string())
    }
}

impl IntoResponse for ForgeError {
    fn into_response(self) -> Response {
        if self.status().is_server_error() {
            log::error!("[HTTP] {}", self);
        } else {
            log::warn!("[HTTP] {}", self);
        }
        (self.status(), Json(self.to_json())).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ForgeError>;
