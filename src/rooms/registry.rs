//! Live subscribers per chat.
//!
//! Every chat with at least one subscriber is owned by a room task that keeps
//! the subscriber list in registration order. The rest of the server talks to
//! it only through [`RoomRegistry`].

use std::{collections::HashMap, sync::Arc};

use axum::extract::ws::Utf8Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// A serialized frame. Clones share one buffer, so fan-out does not copy it.
pub type Outbound = Utf8Bytes;

pub type SubscriberId = Uuid;

enum RoomCommand {
    Register {
        subscriber_id: SubscriberId,
        sink: mpsc::UnboundedSender<Outbound>,
        reply_tx: oneshot::Sender<()>,
    },
    /// Replies with the number of subscribers left.
    Unregister {
        subscriber_id: SubscriberId,
        reply_tx: oneshot::Sender<usize>,
    },
    /// Replies with the number of subscribers that accepted the payload.
    Broadcast {
        payload: Outbound,
        reply_tx: oneshot::Sender<usize>,
    },
    Count {
        reply_tx: oneshot::Sender<usize>,
    },
}

type RoomHandle = mpsc::UnboundedSender<RoomCommand>;

#[derive(Clone, Default)]
pub struct RoomRegistry {
    // register/unregister hold this lock until the room acknowledges, so a
    // room never stops while a registration for it is queued
    rooms: Arc<Mutex<HashMap<i64, RoomHandle>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `sink` to the chat's subscribers, starting the room if needed.
    pub async fn register(&self, chat_id: i64, subscriber_id: SubscriberId, sink: mpsc::UnboundedSender<Outbound>) {
        let mut rooms = self.rooms.lock().await;
        let room = rooms.entry(chat_id).or_insert_with(|| spawn_room(chat_id));
        if room.is_closed() {
            *room = spawn_room(chat_id);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if room.send(RoomCommand::Register { subscriber_id, sink, reply_tx }).is_ok() {
            let _ = reply_rx.await;
        }
    }

    /// Removes a subscriber. Unknown chats and subscribers are ignored.
    pub async fn unregister(&self, chat_id: i64, subscriber_id: SubscriberId) {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.get(&chat_id) else {
            return;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let remaining = match room.send(RoomCommand::Unregister { subscriber_id, reply_tx }) {
            Ok(()) => reply_rx.await.unwrap_or(0),
            Err(_) => 0,
        };

        if remaining == 0 {
            rooms.remove(&chat_id);
        }
    }

    /// Delivers `payload` to every subscriber of the chat and returns how many
    /// accepted it. Subscribers that have gone away are evicted without
    /// affecting delivery to the rest.
    pub async fn broadcast(&self, chat_id: i64, payload: Outbound) -> usize {
        self.ask(chat_id, |reply_tx| RoomCommand::Broadcast { payload, reply_tx }).await
    }

    pub async fn subscriber_count(&self, chat_id: i64) -> usize {
        self.ask(chat_id, |reply_tx| RoomCommand::Count { reply_tx }).await
    }

    async fn ask(&self, chat_id: i64, command: impl FnOnce(oneshot::Sender<usize>) -> RoomCommand) -> usize {
        let Some(room) = self.rooms.lock().await.get(&chat_id).cloned() else {
            return 0;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if room.send(command(reply_tx)).is_err() {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }
}

fn spawn_room(chat_id: i64) -> RoomHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_room(chat_id, rx));
    debug!(chat_id, "room opened");
    tx
}

async fn run_room(chat_id: i64, mut rx: mpsc::UnboundedReceiver<RoomCommand>) {
    let mut subscribers: Vec<(SubscriberId, mpsc::UnboundedSender<Outbound>)> = Vec::new();

    while let Some(command) = rx.recv().await {
        match command {
            RoomCommand::Register { subscriber_id, sink, reply_tx } => {
                subscribers.push((subscriber_id, sink));
                debug!(chat_id, %subscriber_id, subscribers = subscribers.len(), "subscriber registered");
                let _ = reply_tx.send(());
            }

            RoomCommand::Unregister { subscriber_id, reply_tx } => {
                subscribers.retain(|(id, _)| *id != subscriber_id);
                debug!(chat_id, %subscriber_id, subscribers = subscribers.len(), "subscriber unregistered");
                let remaining = subscribers.len();
                let _ = reply_tx.send(remaining);
                if remaining == 0 {
                    break;
                }
            }

            RoomCommand::Broadcast { payload, reply_tx } => {
                subscribers.retain(|(subscriber_id, sink)| {
                    if sink.send(payload.clone()).is_ok() {
                        return true;
                    }
                    warn!(chat_id, %subscriber_id, "subscriber gone, evicting");
                    false
                });
                debug!(chat_id, recipients = subscribers.len(), "broadcast");
                let _ = reply_tx.send(subscribers.len());
            }

            RoomCommand::Count { reply_tx } => {
                let _ = reply_tx.send(subscribers.len());
            }
        }
    }

    debug!(chat_id, "room closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscriber() -> (SubscriberId, mpsc::UnboundedSender<Outbound>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Uuid::now_v7(), tx, rx)
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber_of_the_chat() {
        let rooms = RoomRegistry::new();
        let (a, a_tx, mut a_rx) = subscriber();
        let (b, b_tx, mut b_rx) = subscriber();
        let (c, c_tx, mut c_rx) = subscriber();
        rooms.register(1, a, a_tx).await;
        rooms.register(1, b, b_tx).await;
        rooms.register(2, c, c_tx).await;

        assert_eq!(rooms.broadcast(1, "hello".into()).await, 2);

        assert_eq!(&*a_rx.try_recv().unwrap(), "hello");
        assert_eq!(&*b_rx.try_recv().unwrap(), "hello");
        assert!(c_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscribers_share_one_payload_buffer() {
        let rooms = RoomRegistry::new();
        let (a, a_tx, mut a_rx) = subscriber();
        let (b, b_tx, mut b_rx) = subscriber();
        rooms.register(1, a, a_tx).await;
        rooms.register(1, b, b_tx).await;

        rooms.broadcast(1, String::from("shared").into()).await;
        let (a_frame, b_frame) = (a_rx.try_recv().unwrap(), b_rx.try_recv().unwrap());
        assert_eq!(a_frame.as_str().as_ptr(), b_frame.as_str().as_ptr());
    }

    #[tokio::test]
    async fn broadcast_to_unknown_chat_reaches_nobody() {
        let rooms = RoomRegistry::new();
        assert_eq!(rooms.broadcast(7, "anyone?".into()).await, 0);
        assert_eq!(rooms.subscriber_count(7).await, 0);
    }

    #[tokio::test]
    async fn payloads_arrive_in_broadcast_order() {
        let rooms = RoomRegistry::new();
        let (a, a_tx, mut a_rx) = subscriber();
        rooms.register(1, a, a_tx).await;

        for i in 0..5 {
            rooms.broadcast(1, format!("m{i}").into()).await;
        }
        for i in 0..5 {
            assert_eq!(&*a_rx.recv().await.unwrap(), format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn unregistered_subscriber_gets_nothing() {
        let rooms = RoomRegistry::new();
        let (a, a_tx, mut a_rx) = subscriber();
        let (b, b_tx, mut b_rx) = subscriber();
        rooms.register(1, a, a_tx).await;
        rooms.register(1, b, b_tx).await;

        rooms.unregister(1, a).await;
        assert_eq!(rooms.subscriber_count(1).await, 1);
        assert_eq!(rooms.broadcast(1, "after".into()).await, 1);

        // the registry dropped a's sink, so its channel is closed and empty
        assert!(a_rx.recv().await.is_none());
        assert_eq!(&*b_rx.try_recv().unwrap(), "after");
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let rooms = RoomRegistry::new();
        let (a, a_tx, _a_rx) = subscriber();
        let (b, b_tx, _b_rx) = subscriber();
        rooms.register(1, a, a_tx).await;
        rooms.register(1, b, b_tx).await;

        rooms.unregister(1, a).await;
        rooms.unregister(1, a).await;
        rooms.unregister(9, a).await;
        assert_eq!(rooms.subscriber_count(1).await, 1);
    }

    #[tokio::test]
    async fn room_restarts_after_last_subscriber_leaves() {
        let rooms = RoomRegistry::new();
        let (a, a_tx, _a_rx) = subscriber();
        rooms.register(1, a, a_tx).await;
        rooms.unregister(1, a).await;
        assert!(rooms.rooms.lock().await.is_empty());

        let (b, b_tx, mut b_rx) = subscriber();
        rooms.register(1, b, b_tx).await;
        assert_eq!(rooms.broadcast(1, "again".into()).await, 1);
        assert_eq!(&*b_rx.try_recv().unwrap(), "again");
    }

    #[tokio::test]
    async fn dead_subscriber_does_not_block_the_others() {
        let rooms = RoomRegistry::new();
        let (a, a_tx, a_rx) = subscriber();
        let (b, b_tx, mut b_rx) = subscriber();
        rooms.register(1, a, a_tx).await;
        rooms.register(1, b, b_tx).await;
        drop(a_rx);

        assert_eq!(rooms.broadcast(1, "still here".into()).await, 1);
        assert_eq!(&*b_rx.try_recv().unwrap(), "still here");
        assert_eq!(rooms.subscriber_count(1).await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registration_is_consistent() {
        let rooms = RoomRegistry::new();
        let mut receivers = Vec::new();
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let (id, tx, rx) = subscriber();
            receivers.push(rx);
            let rooms = rooms.clone();
            tasks.push(tokio::spawn(async move { rooms.register(3, id, tx).await }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(rooms.subscriber_count(3).await, 32);
        assert_eq!(rooms.broadcast(3, "all".into()).await, 32);
        for rx in &mut receivers {
            assert_eq!(&*rx.try_recv().unwrap(), "all");
        }
    }
}
