mod history;
mod registry;
mod ws;

use axum::{routing::get, Router};

use crate::AppState;

pub use history::HistoryMaxLimit;
pub use registry::{Outbound, RoomRegistry, SubscriberId};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws/{chat_id}/{user_id}", get(ws::chat_ws))
        .route("/history/{chat_id}", get(history::history))
}
