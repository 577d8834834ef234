use axum::{debug_handler, extract::{Path, Query, State}, Json};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::{db::{self, Message, Page}, AppResult};

/// Upper bound for a single history page.
#[derive(Debug, Clone, Copy)]
pub struct HistoryMaxLimit(pub u32);

#[derive(Debug, Deserialize)]
pub(crate) struct HistoryQuery {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    10
}

#[derive(Debug, Serialize)]
pub(crate) struct HistoryResponse {
    messages: Vec<Message>,
}

impl HistoryQuery {
    /// Rejects negative values and clamps `limit` to `max`.
    fn page(&self, HistoryMaxLimit(max): HistoryMaxLimit) -> AppResult<Page> {
        if self.limit < 0 {
            return Err(format!("limit must not be negative, got {}", self.limit))?;
        }
        if self.offset < 0 {
            return Err(format!("offset must not be negative, got {}", self.offset))?;
        }

        Ok(Page {
            limit: self.limit.min(i64::from(max)),
            offset: self.offset,
        })
    }
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn history(
    Path(chat_id): Path<i64>,
    Query(query): Query<HistoryQuery>,
    State(db_pool): State<SqlitePool>,
    State(max_limit): State<HistoryMaxLimit>,
) -> AppResult<Json<HistoryResponse>> {
    let page = query.page(max_limit)?;
    let messages = db::chat_history(&db_pool, chat_id, page).await?;

    Ok(Json(HistoryResponse { messages }))
}
