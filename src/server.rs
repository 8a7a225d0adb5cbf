#![forbid(unsafe_code)]

//! HTTP control surface and WebSocket push channel.

use std::path::PathBuf;

use axum::{
    Json, Router,
    body::Body,
    extract::{
        Path as AxumPath, State,
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use crate::error::{BOT_DETECTION_GUIDANCE, FetchError};
use crate::format::DownloadOptions;
use crate::progress::{SubscriberId, Subscription};
use crate::registry::{TaskId, TaskRecord};
use crate::security::content_disposition;
use crate::service::{
    DownloadService, FormatListing, HealthReport, MetadataSummary, artifact_name,
};

pub fn router(service: DownloadService) -> Router {
    Router::new()
        .route("/metadata", post(fetch_metadata))
        .route("/formats", post(list_formats))
        .route("/downloads", post(start_download))
        .route("/downloads/{task_id}", get(download_status))
        .route("/downloads/{task_id}/file", get(download_file))
        .route("/health", get(health))
        .route("/ws", get(push_channel))
        .with_state(service)
}

/// Error body returned by every endpoint. `error` is always present.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: serde_json::Value,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: json!({ "error": message.into() }),
        }
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        let message = err.to_string();
        let (status, body) = match &err {
            FetchError::Validation(_)
            | FetchError::MetadataFetch(_)
            | FetchError::FormatUnavailable(_)
            | FetchError::TaskNotReady(_) => (StatusCode::BAD_REQUEST, json!({ "error": message })),
            FetchError::BotDetection { technical } => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({
                    "error": message,
                    "details": BOT_DETECTION_GUIDANCE,
                    "technical": technical,
                }),
            ),
            FetchError::TaskNotFound => (StatusCode::NOT_FOUND, json!({ "error": message })),
            FetchError::ArtifactMissing(path) => (
                StatusCode::NOT_FOUND,
                json!({
                    "error": "File not found",
                    "expected_path": path.display().to_string(),
                    "message": "The downloaded file could not be located. It may have been moved or deleted.",
                }),
            ),
            FetchError::ShuttingDown => {
                (StatusCode::SERVICE_UNAVAILABLE, json!({ "error": message }))
            }
            FetchError::Io(_) => {
                error!(error = %err, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": message }),
                )
            }
        };
        debug!(kind = err.kind(), status = status.as_u16(), "request rejected");
        Self { status, body }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct UrlRequest {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    #[serde(default)]
    url: String,
    quality: Option<String>,
    #[serde(alias = "format")]
    container_format: Option<String>,
    format_type: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
    subscriber_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct DownloadStarted {
    task_id: TaskId,
    status: &'static str,
}

async fn fetch_metadata(
    State(service): State<DownloadService>,
    payload: Result<Json<UrlRequest>, JsonRejection>,
) -> ApiResult<Json<MetadataSummary>> {
    let Json(request) = payload?;
    let summary = service.metadata(&request.url).await?;
    Ok(Json(summary))
}

async fn list_formats(
    State(service): State<DownloadService>,
    payload: Result<Json<UrlRequest>, JsonRejection>,
) -> ApiResult<Json<FormatListing>> {
    let Json(request) = payload?;
    let listing = service.formats(&request.url).await?;
    Ok(Json(listing))
}

async fn start_download(
    State(service): State<DownloadService>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> ApiResult<Json<DownloadStarted>> {
    let Json(request) = payload?;
    if request.url.trim().is_empty() {
        return Err(ApiError::bad_request("URL is required"));
    }
    let options = DownloadOptions::parse(
        request.quality.as_deref(),
        request.container_format.as_deref(),
        request.format_type.as_deref(),
        request.start_time.as_deref(),
        request.end_time.as_deref(),
    )?;
    let subscriber = parse_subscriber(request.subscriber_id.as_deref())?;
    let task_id = service.submit(&request.url, options, subscriber)?;
    Ok(Json(DownloadStarted {
        task_id,
        status: "started",
    }))
}

fn parse_subscriber(raw: Option<&str>) -> Result<Option<SubscriberId>, FetchError> {
    match raw.map(str::trim).filter(|value| !value.is_empty()) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| FetchError::Validation(format!("invalid subscriber_id '{value}'"))),
    }
}

fn parse_task_id(raw: &str) -> Result<TaskId, FetchError> {
    // Anything that is not one of our ids cannot name a task.
    raw.parse().map_err(|_| FetchError::TaskNotFound)
}

async fn download_status(
    State(service): State<DownloadService>,
    AxumPath(task_id): AxumPath<String>,
) -> ApiResult<Json<TaskRecord>> {
    let id = parse_task_id(&task_id)?;
    Ok(Json(service.status(id)?))
}

async fn download_file(
    State(service): State<DownloadService>,
    AxumPath(task_id): AxumPath<String>,
) -> ApiResult<Response> {
    let id = parse_task_id(&task_id)?;
    let path = service.artifact(id).await?;
    stream_file(path).await
}

async fn stream_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| FetchError::ArtifactMissing(path.clone()))?;
    let size = file.metadata().await.map_err(FetchError::Io)?.len();

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    let mime = MimeGuess::from_path(&path).first_or_octet_stream();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    if let Ok(value) = HeaderValue::from_str(&content_disposition(&artifact_name(&path))) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

async fn health(State(service): State<DownloadService>) -> Json<HealthReport> {
    Json(service.health())
}

async fn push_channel(
    ws: WebSocketUpgrade,
    State(service): State<DownloadService>,
) -> Response {
    let subscription = service.progress().connect();
    ws.on_upgrade(move |socket| handle_socket(socket, subscription))
}

#[derive(Debug, Deserialize)]
struct ClientMessage {
    #[serde(rename = "type")]
    kind: String,
}

fn subscriber_frame(event: &str, subscriber: SubscriberId) -> Message {
    Message::Text(
        json!({ "event": event, "subscriber_id": subscriber })
            .to_string()
            .into(),
    )
}

async fn handle_socket(mut socket: WebSocket, mut subscription: Subscription) {
    let subscriber = subscription.id();
    info!(subscriber = %subscriber, "push client connected");
    if socket
        .send(subscriber_frame("connected", subscriber))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            message = subscription.recv() => {
                let Some(message) = message else { break };
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(subscriber = %subscriber, error = %err, "cannot encode progress event");
                        continue;
                    }
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(message) if message.kind == "join" => {
                                subscription.rejoin();
                                if socket.send(subscriber_frame("joined", subscriber)).await.is_err() {
                                    break;
                                }
                            }
                            _ => debug!(subscriber = %subscriber, "ignoring client message"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        debug!(subscriber = %subscriber, error = %err, "push socket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
    info!(subscriber = %subscriber, "push client disconnected");
}
