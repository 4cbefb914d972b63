//! # REST API Endpoints
//!
//! Read-only HTTP endpoints next to the relay: a health probe, the live room
//! overview, and lookup of stored proctoring screenshots.

use crate::error::ApiError;
use crate::screenshots::ScreenshotEntry;
use crate::state::{AppState, Participant};
use axum::{
    extract::{Path, State},
    http::header,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};

/// `GET /health`
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// One live room in the `/api/rooms` listing.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomListItem {
    /// The room's interview id.
    pub interview_id: String,

    /// Open connections in the room, one entry each.
    pub participants: Vec<Participant>,
}

/// `GET /api/rooms` — Returns every room that currently has at least one
/// open connection, sorted by interview id.
pub async fn list_rooms(State(state): State<AppState>) -> Json<Vec<RoomListItem>> {
    let rooms = state
        .registry
        .rooms()
        .into_iter()
        .map(|(interview_id, participants)| RoomListItem {
            interview_id,
            participants,
        })
        .collect();
    Json(rooms)
}

/// `GET /api/interviews/{interview_id}/screenshots`
pub async fn list_screenshots(
    State(state): State<AppState>,
    Path(interview_id): Path<String>,
) -> Result<Json<Vec<ScreenshotEntry>>, ApiError> {
    Ok(Json(state.screenshots.list(&interview_id).await?))
}

/// `GET /api/interviews/{interview_id}/screenshots/{user_id}/{filename}`
pub async fn get_screenshot(
    State(state): State<AppState>,
    Path((interview_id, user_id, filename)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let bytes = state
        .screenshots
        .read(&interview_id, &user_id, &filename)
        .await?;
    Ok(([(header::CONTENT_TYPE, "image/png")], bytes))
}
