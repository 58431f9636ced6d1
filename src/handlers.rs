use std::convert::Infallible;

use axum::{
    extract::{Multipart, State},
    http::{header, HeaderName},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Form, Json,
};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::documents;
use crate::error::AppError;
use crate::llm::UserContent;
use crate::models::{
    ChatForm, ChatFrame, ChatReply, Schedule, SelectedEventsRequest, WelcomeResponse,
};
use crate::prompts::{TEST_DATA, TEST_SYSTEM_PROMPT};
use crate::AppState;

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

pub async fn root() -> Json<WelcomeResponse> {
    Json(WelcomeResponse {
        message: "Welcome to the Syllendar API!".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// One-shot model call with the test prompt.
pub async fn test_completion(State(state): State<AppState>) -> Result<String, AppError> {
    let reply = state
        .llm
        .complete(TEST_SYSTEM_PROMPT, UserContent::Text(TEST_DATA.to_string()))
        .await?;
    Ok(reply)
}

/// Raw token passthrough with the test prompt.
pub async fn test_stream(State(state): State<AppState>) -> Result<Response, AppError> {
    let tokens = state.llm.stream(TEST_SYSTEM_PROMPT, TEST_DATA).await?;
    let events = tokens.map(|item| match item {
        Ok(chunk) => Event::default().data(chunk),
        Err(err) => Event::default().event("error").data(err.to_string()),
    });
    Ok(sse_response(events.map(Ok::<_, Infallible>)))
}

/// Extract events from a syllabus image
pub async fn analyze_image(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Schedule>, AppError> {
    let upload = read_upload(multipart).await?;
    info!(
        file = upload.file_name.as_deref().unwrap_or("-"),
        content_type = upload.content_type.as_deref().unwrap_or("-"),
        bytes = upload.bytes.len(),
        "received image"
    );
    let mime = documents::ensure_image(upload.content_type.as_deref())?;
    let image_url = documents::image_to_data_url(&upload.bytes, mime);

    let schedule = state.analyzer.analyze_image(image_url).await?;
    info!(events = schedule.events.len(), "image analyzed");
    Ok(Json(schedule))
}

pub async fn generate_ics(
    State(state): State<AppState>,
    Json(schedule): Json<Schedule>,
) -> Result<Response, AppError> {
    let body = state.calendar.render(&schedule)?;
    Ok(calendar_response(body, "schedule.ics"))
}

pub async fn generate_ics_selected(
    State(state): State<AppState>,
    Json(request): Json<SelectedEventsRequest>,
) -> Result<Response, AppError> {
    let schedule = request.into_schedule();
    let body = state.calendar.render(&schedule)?;
    Ok(calendar_response(body, "selected_events.ics"))
}

pub async fn chat(
    State(state): State<AppState>,
    Form(form): Form<ChatForm>,
) -> Result<Json<ChatReply>, AppError> {
    let reply = state
        .chat
        .reply(&form.message, form.conversation_history.as_deref())
        .await?;
    Ok(Json(reply))
}

pub async fn chat_stream(State(state): State<AppState>, Form(form): Form<ChatForm>) -> Response {
    let frames = state
        .chat
        .reply_stream(&form.message, form.conversation_history.as_deref());
    sse_response(frames.map(json_event::<ChatFrame>))
}

/// Extract exams and deadlines from a PDF syllabus
pub async fn analyze_pdf(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Schedule>, AppError> {
    let text = read_pdf_text(multipart).await?;
    let schedule = state.analyzer.analyze_pdf_text(text).await?;
    info!(events = schedule.events.len(), "pdf analyzed");
    Ok(Json(schedule))
}

pub async fn analyze_pdf_stream(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let text = read_pdf_text(multipart).await?;
    let frames = state.analyzer.analyze_pdf_text_stream(text);
    Ok(sse_response(frames.map(json_event)))
}

// Helper functions

struct Upload {
    file_name: Option<String>,
    content_type: Option<String>,
    bytes: Bytes,
}

async fn read_upload(mut multipart: Multipart) -> Result<Upload, AppError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await?;
        return Ok(Upload {
            file_name,
            content_type,
            bytes,
        });
    }
    Err(AppError::BadRequest("Missing 'file' field".to_string()))
}

async fn read_pdf_text(multipart: Multipart) -> Result<String, AppError> {
    let upload = read_upload(multipart).await?;
    info!(
        file = upload.file_name.as_deref().unwrap_or("-"),
        bytes = upload.bytes.len(),
        "received pdf"
    );
    documents::ensure_pdf(upload.content_type.as_deref())?;

    let text = tokio::task::spawn_blocking(move || documents::pdf_to_text(&upload.bytes))
        .await
        .map_err(|err| {
            warn!(error = %err, "pdf extraction task failed");
            AppError::Document(documents::DocumentError::Pdf(err.to_string()))
        })??;
    info!(chars = text.len(), "extracted pdf text");
    Ok(text)
}

fn json_event<T: Serialize>(frame: T) -> Result<Event, axum::Error> {
    Event::default().json_data(frame)
}

fn sse_response<S, E>(events: S) -> Response
where
    S: Stream<Item = Result<Event, E>> + Send + 'static,
    E: Into<axum::BoxError>,
{
    (
        [(X_ACCEL_BUFFERING, "no")],
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

fn calendar_response(body: String, filename: &str) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/calendar".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={filename}"),
            ),
        ],
        body,
    )
        .into_response()
}
