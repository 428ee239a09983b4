//! Static plugin resources.
//!
//! `/resources/{plugin}/{*path}` serves files below the plugin's
//! `resources/` directory; `/` serves the core plugin's `index.html`.

use std::path::{Component, Path, PathBuf};

use axum::extract::{Path as UrlPath, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tower::ServiceExt;
use tower_http::services::ServeFile;

use crate::worker::runtime::WorkerState;

const RESOURCES_DIR: &str = "resources";

/// Join `relative` onto `base`, refusing anything but plain components.
pub fn resolve(base: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(base.join(relative))
}

async fn serve_file(path: PathBuf, request: Request) -> Response {
    match ServeFile::new(path).oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(never) => match never {},
    }
}

pub async fn resource(
    State(state): State<WorkerState>,
    UrlPath((plugin, path)): UrlPath<(String, String)>,
    request: Request,
) -> Response {
    let Some(dir) = state.plugins.content_dir(&plugin) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match resolve(&dir.join(RESOURCES_DIR), &path) {
        Some(file) => serve_file(file, request).await,
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub async fn index(State(state): State<WorkerState>, request: Request) -> Response {
    match state.plugins.content_dir("core") {
        Some(dir) => serve_file(dir.join(RESOURCES_DIR).join("index.html"), request).await,
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
