use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tandem_types::error::ChatError;
use tandem_types::events::{ClientCommand, ServerEvent};

use crate::router::BroadcastRouter;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Identity of an authenticated socket, resolved at the HTTP upgrade.
#[derive(Debug, Clone)]
pub struct SocketUser {
    pub user_id: Uuid,
    pub name: String,
}

/// Drive one pre-authenticated WebSocket until it closes.
pub async fn handle_connection(
    socket: WebSocket,
    router: BroadcastRouter,
    user: SocketUser,
    notification_poll_secs: u64,
) {
    let (mut sender, receiver) = socket.split();

    let ready = ServerEvent::Ready {
        user_id: user.user_id,
        name: user.name.clone(),
        notification_poll_secs,
    };
    if send_event(&mut sender, &ready).await.is_err() {
        return;
    }

    let (conn_id, events) = router.connect(user.user_id);
    info!("{} ({}) connected to gateway as {}", user.name, user.user_id, conn_id);

    run_connection_loop(sender, receiver, events, &router, conn_id, &user).await;

    router.close(conn_id).await;
    info!("{} ({}) disconnected from gateway", user.name, user.user_id);
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut events: mpsc::Receiver<ServerEvent>,
    router: &BroadcastRouter,
    conn_id: Uuid,
    user: &SocketUser,
) {
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;

    // Forward room events and replies -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = events.recv() => {
                    // Registry dropped the sender: the connection was closed.
                    let Some(event) = event else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_router = router.clone();
    let user_id = user.user_id;
    let name = user.name.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => handle_command(&recv_router, conn_id, user_id, cmd).await,
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            name,
                            user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

/// Apply one client command. Replies go through the registry queue, so
/// they are ordered with room events for the same connection.
pub async fn handle_command(router: &BroadcastRouter, conn_id: Uuid, user_id: Uuid, cmd: ClientCommand) {
    let registry = router.registry();

    match cmd {
        ClientCommand::JoinChannel { channel_id } => {
            let reply = match router.join(conn_id, channel_id).await {
                Ok(access) => ServerEvent::JoinOk { channel_id, access },
                Err(ChatError::ConnectionClosed) => return,
                Err(e) => {
                    debug!("Join of {} refused for {}: {}", channel_id, user_id, e);
                    ServerEvent::JoinError {
                        channel_id,
                        reason: e.reason(),
                    }
                }
            };
            registry.send_to(conn_id, reply);
        }

        ClientCommand::LeaveChannel { channel_id } => {
            router.leave(conn_id, channel_id).await;
        }

        ClientCommand::SendMessage {
            channel_id,
            content,
            client_token,
        } => match router.publish(user_id, channel_id, content, client_token.clone()).await {
            Ok(view) => {
                // Joined senders already got the room broadcast.
                if !registry.is_joined(conn_id, channel_id) {
                    registry.send_to(conn_id, ServerEvent::MessageCreated { message: view });
                }
            }
            Err(e) => {
                debug!("Send to {} refused for {}: {}", channel_id, user_id, e);
                let detail = match &e {
                    ChatError::ValidationFailed(msg) | ChatError::PermissionDenied(msg) => Some(msg.clone()),
                    _ => None,
                };
                registry.send_to(
                    conn_id,
                    ServerEvent::SendError {
                        channel_id,
                        reason: e.reason(),
                        client_token,
                        detail,
                    },
                );
            }
        },
    }
}

async fn send_event(sender: &mut SplitSink<WebSocket, Message>, event: &ServerEvent) -> Result<(), ()> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to encode gateway event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}
