//! # Interview Relay
//!
//! Per-interview WebSocket fan-out. Participants connect to `/ws` with
//! `?interviewId=..&userId=..&role=..`; code, notes, test results and AI
//! insights sent by one participant are forwarded to everyone else in the
//! same interview. Screenshots are written to disk instead of forwarded.

pub mod api;
pub mod config;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod screenshots;
pub mod state;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;

pub use state::AppState;

/// Builds the full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::ws_handler))
        .route("/ws", get(handlers::ws_handler))
        .route("/health", get(api::health))
        .route("/api/rooms", get(api::list_rooms))
        .route(
            "/api/interviews/{interview_id}/screenshots",
            get(api::list_screenshots),
        )
        .route(
            "/api/interviews/{interview_id}/screenshots/{user_id}/{filename}",
            get(api::get_screenshot),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}
