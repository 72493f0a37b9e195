use std::future::Future;
use std::sync::Arc;

use askama::Template;
use axum::extract::{DefaultBodyLimit, Multipart, Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::pm::config::WebUi;
use crate::pm::daemon::{build_banner, event};
use crate::pm::errors::{ControlError, PortInUse};
use crate::pm::installer::MAX_ARCHIVE_BYTES;
use crate::pm::program::{Program, ProgramKind};
use crate::pm::registry::ProgramPatch;
use crate::pm::supervisor::{Supervisor, UploadRequest};

/// Body limit: the archive cap plus headroom for the other form fields.
const BODY_LIMIT: usize = MAX_ARCHIVE_BYTES as usize + 1024 * 1024;

pub async fn bind(web_ui: &WebUi) -> anyhow::Result<tokio::net::TcpListener> {
    let addr = format!("{}:{}", web_ui.host, web_ui.port);
    match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => Ok(l),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => Err(PortInUse(addr).into()),
        Err(e) => Err(anyhow::anyhow!("failed to bind {addr}: {e}")),
    }
}

pub async fn serve(
    listener: tokio::net::TcpListener,
    sup: Arc<Supervisor>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = router(sup);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn router(sup: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(api_status))
        .route("/api/logs/:name", get(api_logs))
        .route("/api/start/:name", post(api_start))
        .route("/api/stop/:name", post(api_stop))
        .route("/api/restart/:name", post(api_restart))
        .route("/api/add", post(api_add))
        .route("/api/edit/:name", post(api_edit))
        .route("/api/remove/:name", post(api_remove))
        .route("/api/upload", post(api_upload))
        .route("/api/update/:name", post(api_update))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .with_state(sup)
}

// -------- error mapping --------

struct ApiError(ControlError);

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

fn accepted() -> Response {
    (StatusCode::ACCEPTED, Json(json!({ "ok": true }))).into_response()
}

fn ok() -> Response {
    Json(json!({ "ok": true })).into_response()
}

// -------- dashboard --------

#[derive(Template)]
#[template(path = "status.html")]
struct StatusTemplate<'a> {
    title: &'a str,
    build_banner: String,
}

async fn index(State(sup): State<Arc<Supervisor>>) -> Response {
    let t = StatusTemplate {
        title: &sup.settings.web_ui.title,
        build_banner: build_banner(),
    };
    match t.render() {
        Ok(s) => Html(s).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// -------- API handlers --------

async fn api_status(State(sup): State<Arc<Supervisor>>) -> Response {
    Json(sup.status()).into_response()
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    offset: Option<usize>,
    lines: Option<usize>,
}

async fn api_logs(
    State(sup): State<Arc<Supervisor>>,
    AxumPath(name): AxumPath<String>,
    Query(q): Query<LogsQuery>,
) -> Result<Response, ApiError> {
    let page = sup.logs(&name, q.offset, q.lines)?;
    Ok(Json(page).into_response())
}

async fn api_start(
    State(sup): State<Arc<Supervisor>>,
    AxumPath(name): AxumPath<String>,
) -> Result<Response, ApiError> {
    sup.request_start(&name)?;
    Ok(accepted())
}

async fn api_stop(
    State(sup): State<Arc<Supervisor>>,
    AxumPath(name): AxumPath<String>,
) -> Result<Response, ApiError> {
    sup.request_stop(&name)?;
    Ok(accepted())
}

async fn api_restart(
    State(sup): State<Arc<Supervisor>>,
    AxumPath(name): AxumPath<String>,
) -> Result<Response, ApiError> {
    sup.request_restart(&name)?;
    Ok(accepted())
}

async fn api_add(
    State(sup): State<Arc<Supervisor>>,
    Json(prog): Json<Program>,
) -> Result<Response, ApiError> {
    let name = prog.name.clone();
    sup.add(prog)?;
    event("web", Some(&name), "add accepted");
    Ok(ok())
}

async fn api_edit(
    State(sup): State<Arc<Supervisor>>,
    AxumPath(name): AxumPath<String>,
    Json(patch): Json<ProgramPatch>,
) -> Result<Response, ApiError> {
    sup.edit(&name, &patch)?;
    Ok(ok())
}

async fn api_remove(
    State(sup): State<Arc<Supervisor>>,
    AxumPath(name): AxumPath<String>,
) -> Result<Response, ApiError> {
    sup.remove(&name).await?;
    Ok(ok())
}

async fn api_upload(
    State(sup): State<Arc<Supervisor>>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let (req, archive) = read_upload_form(multipart).await?;
    let name = req.name.clone();
    sup.upload(req, archive)?;
    event("web", Some(&name), "upload accepted");
    Ok(accepted())
}

async fn api_update(
    State(sup): State<Arc<Supervisor>>,
    AxumPath(name): AxumPath<String>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let archive = read_archive_only(multipart).await?;
    sup.update(&name, archive)?;
    event("web", Some(&name), "update accepted");
    Ok(accepted())
}

// -------- multipart plumbing --------

async fn read_upload_form(
    mut multipart: Multipart,
) -> Result<(UploadRequest, Vec<u8>), ControlError> {
    let mut name = None;
    let mut kind = ProgramKind::Python;
    let mut script = None;
    let mut enabled = true;
    let mut args = Vec::new();
    let mut environment = Vec::new();
    let mut comment = None;
    let mut archive = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ControlError::BadDeclaration(format!("invalid multipart body: {e}")))?
    {
        let field_name = field.name().unwrap_or("").to_string();
        if field_name == "file" {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ControlError::BadDeclaration(format!("unreadable upload: {e}")))?;
            archive = Some(bytes.to_vec());
            continue;
        }
        let text = field
            .text()
            .await
            .map_err(|e| ControlError::BadDeclaration(format!("unreadable field: {e}")))?;
        match field_name.as_str() {
            "name" => name = non_empty(&text),
            "type" => kind = parse_kind(&text)?,
            "script" => script = non_empty(&text),
            "enabled" => enabled = parse_bool(&text),
            "args" => args = text.split_whitespace().map(str::to_string).collect(),
            "environment" => {
                environment = text
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "comment" => comment = non_empty(&text),
            _ => {}
        }
    }

    let name = name.ok_or_else(|| ControlError::BadDeclaration("missing field: name".into()))?;
    let archive =
        archive.ok_or_else(|| ControlError::BadDeclaration("missing field: file".into()))?;
    Ok((
        UploadRequest {
            name,
            kind,
            script,
            enabled,
            args,
            environment,
            comment,
        },
        archive,
    ))
}

async fn read_archive_only(mut multipart: Multipart) -> Result<Vec<u8>, ControlError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ControlError::BadDeclaration(format!("invalid multipart body: {e}")))?
    {
        if field.name() == Some("file") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ControlError::BadDeclaration(format!("unreadable upload: {e}")))?;
            return Ok(bytes.to_vec());
        }
    }
    Err(ControlError::BadDeclaration("missing field: file".into()))
}

fn parse_kind(s: &str) -> Result<ProgramKind, ControlError> {
    match s.trim() {
        "" | "python" => Ok(ProgramKind::Python),
        "node" => Ok(ProgramKind::Node),
        "exec" => Ok(ProgramKind::Exec),
        other => Err(ControlError::BadDeclaration(format!(
            "unknown program type '{other}'"
        ))),
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(s.trim(), "true" | "1" | "on" | "yes")
}

fn non_empty(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parsing_accepts_known_values_only() {
        assert_eq!(parse_kind("python").unwrap(), ProgramKind::Python);
        assert_eq!(parse_kind("").unwrap(), ProgramKind::Python);
        assert_eq!(parse_kind("node").unwrap(), ProgramKind::Node);
        assert_eq!(parse_kind("exec").unwrap(), ProgramKind::Exec);
        assert!(parse_kind("ruby").is_err());
    }

    #[test]
    fn error_kinds_map_to_documented_statuses() {
        assert_eq!(ControlError::NameConflict("x".into()).http_status(), 409);
        assert_eq!(ControlError::NotFound("x".into()).http_status(), 404);
        assert_eq!(
            ControlError::Busy {
                name: "x".into(),
                state: "running"
            }
            .http_status(),
            409
        );
        assert_eq!(ControlError::BadDeclaration("x".into()).http_status(), 400);
        assert_eq!(ControlError::UnsafePath("x".into()).http_status(), 400);
        assert_eq!(
            ControlError::ArchiveTooLarge { size: 1, limit: 0 }.http_status(),
            413
        );
    }

    #[test]
    fn bool_fields_accept_form_spellings() {
        assert!(parse_bool("true"));
        assert!(parse_bool("1"));
        assert!(parse_bool("on"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool(""));
    }
}
