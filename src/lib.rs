pub mod appresult;
pub mod config;
pub mod db;
pub mod res;
pub mod rooms;

use axum::{extract::FromRef, Router};
use sqlx::SqlitePool;
use tower_http::trace::TraceLayer;

pub use appresult::{AppError, AppResult};
use rooms::{HistoryMaxLimit, RoomRegistry};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub rooms: RoomRegistry,
    pub history_max_limit: HistoryMaxLimit,
}

pub fn app(app_state: AppState) -> Router {
    Router::new()
        .merge(rooms::router())
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
}
