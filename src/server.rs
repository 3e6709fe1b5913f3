//! HTTP front end: the single page, the JSON API and the live build stream.

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use log::info;
use serde::Serialize;
use std::convert::Infallible;
use tokio_stream::{Stream, StreamExt};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{ForgeError, Result};
use crate::prober::EnvironmentReport;
use crate::session::{BuildEvent, SharedSession};
use crate::stager::StagedProject;

const INDEX_HTML: &str = include_str!("../assets/index.html");
const APK_MIME: &str = "application/vnd.android.package-archive";
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;
const ARCHIVE_FIELD: &str = "archive";

#[derive(Serialize)]
struct ProjectView {
    project: StagedProject,
    config: String,
}

pub fn router(session: SharedSession) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/environment", get(environment))
        .route("/api/project", post(upload_project))
        .route("/api/project/config", get(get_config).put(put_config))
        .route("/api/build", post(start_build))
        .route("/api/build/cancel", post(cancel_build))
        .route("/api/build/report", get(build_report))
        .route("/api/build/artifact", get(download_artifact))
        .route("/api/build/log", get(download_log))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(session)
}

pub async fn serve(session: SharedSession) -> anyhow::Result<()> {
    let addr = session.config().bind.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    info!("[HTTP] APK forge running on http://{}", local_addr);
    axum::serve(listener, router(session)).await?;
    Ok(())
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn environment(State(session): State<SharedSession>) -> Json<EnvironmentReport> {
    Json(session.environment().clone())
}

async fn upload_project(
    State(session): State<SharedSession>,
    mut multipart: Multipart,
) -> Result<Json<ProjectView>> {
    // Refuse before reading a possibly large body
    session.ensure_ready()?;
    if session.is_busy() {
        return Err(ForgeError::Busy);
    }

    let mut archive: Option<Bytes> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ForgeError::BadUpload(e.to_string()))?
    {
        if field.name() == Some(ARCHIVE_FIELD) {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ForgeError::BadUpload(e.to_string()))?;
            archive = Some(bytes);
        }
    }
    let archive = archive
        .ok_or_else(|| ForgeError::BadUpload(format!("missing `{ARCHIVE_FIELD}` field")))?;
    info!("[HTTP] Received archive of {} bytes", archive.len());

    let project = session.upload(&archive).await?;
    let config = session.config_text().await?;
    Ok(Json(ProjectView { project, config }))
}

async fn get_config(State(session): State<SharedSession>) -> Result<String> {
    session.config_text().await
}

async fn put_config(State(session): State<SharedSession>, text: String) -> Result<()> {
    session.save_config_text(&text).await
}

async fn start_build(
    State(session): State<SharedSession>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let events = session.start_build().await?;
    let stream = UnboundedReceiverStream::new(events).map(|event| Ok(sse_event(&event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn sse_event(event: &BuildEvent) -> Event {
    let name = match event {
        BuildEvent::Line(_) => "line",
        BuildEvent::Finished(_) => "finished",
        BuildEvent::Error { .. } => "error",
    };
    let data = serde_json::to_string(event).unwrap_or_default();
    Event::default().event(name).data(data)
}

async fn cancel_build(State(session): State<SharedSession>) -> Result<()> {
    session.cancel_build().await
}

async fn build_report(
    State(session): State<SharedSession>,
) -> Result<Json<crate::artifact::BuildReport>> {
    Ok(Json(session.report().await?))
}

async fn download_artifact(State(session): State<SharedSession>) -> Result<Response> {
    let (file_name, path) = session.artifact().await?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| ForgeError::staging(&path, e))?;
    info!("[HTTP] Serving {} ({} bytes)", file_name, bytes.len());
    Ok(attachment(APK_MIME, &file_name, bytes))
}

async fn download_log(State(session): State<SharedSession>) -> Result<Response> {
    let path = session.log_path().await?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| ForgeError::staging(&path, e))?;
    Ok(attachment(
        "text/plain; charset=utf-8",
        &session.config().log_file,
        bytes,
    ))
}

fn attachment(content_type: &str, file_name: &str, bytes: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        bytes,
    )
        .into_response()
}
