use axum::{
    debug_handler,
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{stream::SplitStream, SinkExt, StreamExt};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::{self, NewMessage};

use super::registry::{Outbound, RoomRegistry};

#[debug_handler(state = crate::AppState)]
pub(crate) async fn chat_ws(
    Path((chat_id, user_id)): Path<(i64, i64)>,
    State(db_pool): State<SqlitePool>,
    State(rooms): State<RoomRegistry>,

    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(async move |socket| {
        serve_socket(socket, db_pool, rooms, chat_id, user_id).await
    })
}

/// Who is talking in an accepted connection.
#[derive(Clone, Copy)]
struct Participants {
    chat_id: i64,
    sender_id: i64,
    receiver_id: i64,
}

async fn serve_socket(mut socket: WebSocket, db_pool: SqlitePool, rooms: RoomRegistry, chat_id: i64, user_id: i64) {
    let participants = match validate(&db_pool, chat_id, user_id).await {
        Ok(Ok(participants)) => participants,
        Ok(Err(reason)) => {
            info!(chat_id, user_id, reason, "rejecting connection");
            close(&mut socket, close_code::POLICY, reason).await;
            return;
        }
        Err(e) => {
            error!(chat_id, user_id, error = %e, "participant lookup failed");
            close(&mut socket, close_code::ERROR, "internal error").await;
            return;
        }
    };

    let subscriber_id = Uuid::now_v7();
    let (sink, mut outbound) = mpsc::unbounded_channel::<Outbound>();
    rooms.register(chat_id, subscriber_id, sink).await;
    info!(chat_id, user_id, %subscriber_id, "connected");

    let (mut sender, receiver) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        sender
    });

    let outcome = pump(receiver, &db_pool, &rooms, &participants).await;

    // every exit path ends here; dropping the registry's sink also stops the writer
    rooms.unregister(chat_id, subscriber_id).await;
    info!(chat_id, user_id, %subscriber_id, "disconnected");

    let Ok(mut sender) = writer.await else {
        return;
    };
    if let Err(e) = outcome {
        error!(chat_id, user_id, error = ?e, "connection failed");
        let _ = sender.send(close_frame(close_code::ERROR, "internal error")).await;
    }
    // flushes the reply to a client-initiated close, or starts our own
    if let Err(e) = sender.close().await {
        debug!(chat_id, user_id, error = %e, "close handshake not completed");
    }
}

/// Resolves the sender and the other party. The inner `Err` is a diagnostic
/// for the client.
async fn validate(db_pool: &SqlitePool, chat_id: i64, user_id: i64) -> Result<Result<Participants, &'static str>, sqlx::Error> {
    if db::find_chat(db_pool, chat_id).await?.is_none() {
        return Ok(Err("chat not found"));
    }
    let Some(sender) = db::find_user(db_pool, user_id).await? else {
        return Ok(Err("sender not found"));
    };
    let Some(receiver) = db::find_counterpart(db_pool, sender.id).await? else {
        return Ok(Err("second chat participant not found"));
    };

    Ok(Ok(Participants {
        chat_id,
        sender_id: sender.id,
        receiver_id: receiver.id,
    }))
}

/// Persists and fans out each inbound text frame until the client goes away.
/// Returns `Err` only for server-side failures.
async fn pump(
    mut receiver: SplitStream<WebSocket>,
    db_pool: &SqlitePool,
    rooms: &RoomRegistry,
    participants: &Participants,
) -> anyhow::Result<()> {
    let Participants { chat_id, sender_id, receiver_id } = *participants;

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                warn!(chat_id, sender_id, "ignoring binary frame");
                continue;
            }
            Ok(_) => continue,
            Err(e) => {
                debug!(chat_id, sender_id, error = %e, "transport error");
                break;
            }
        };

        let message = db::insert_message(db_pool, NewMessage { chat_id, sender_id, receiver_id, text }).await?;
        let payload: Outbound = serde_json::to_string(&message)?.into();
        let recipients = rooms.broadcast(chat_id, payload).await;
        debug!(chat_id, message_id = message.id, recipients, "message delivered");
    }

    Ok(())
}

fn close_frame(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_owned().into(),
    }))
}

async fn close(socket: &mut WebSocket, code: u16, reason: &str) {
    if let Err(e) = socket.send(close_frame(code, reason)).await {
        debug!(error = %e, "close frame not delivered");
    }
}
