//! WebSocket transport for the broker
//!
//! One task per socket reads commands; a spawned task owns the sink and
//! writes queued replies, pushes and periodic pings.

use crate::auth::TokenVerifier;
use crate::channels::Channel;
use crate::server::connections::{ClientConnection, ConnectionManager, OutboundFrame};
use crate::server::protocol::{
    parse_frame, ChannelParams, ClientCommand, ErrorCode, FrameError, HistoryBody, HistoryParams,
    Method, PublicationBody, PublishParams, ServerReply, SubscribeParams, PING,
};
use crate::server::router::TopicRouter;
use crate::storage::{HistoryStore, StoredPublication};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

/// Path clients connect to
pub const WEBSOCKET_PATH: &str = "/connection/websocket";

/// Close code sent after a rejected connect
const CLOSE_INVALID_TOKEN: u16 = 3500;

/// Shared state for WebSocket handlers
#[derive(Clone)]
pub struct WsState {
    pub connections: Arc<ConnectionManager>,
    pub router: Arc<TopicRouter>,
    pub history: Arc<dyn HistoryStore>,
    pub verifier: TokenVerifier,
    pub ping_interval: Duration,
    pub outbound_capacity: usize,
}

/// Create the broker router
pub fn create_router(state: WsState) -> Router {
    Router::new()
        .route(WEBSOCKET_PATH, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Store a publication's push frame and fan it out to subscribers
pub(crate) fn broadcast(router: &TopicRouter, channel: &Channel, stored: StoredPublication) -> usize {
    let push = ServerReply::push(
        channel.as_str().to_string(),
        PublicationBody {
            data: stored.data,
            offset: stored.offset,
        },
    );

    match push.encode() {
        Ok(frame) => router.route(channel, &frame),
        Err(e) => {
            warn!(channel = %channel, error = %e, "Failed to encode push");
            0
        }
    }
}

async fn reject(sender: &mut SplitSink<WebSocket, Message>, id: u32, code: ErrorCode) {
    if let Ok(frame) = ServerReply::error(id, code).encode() {
        let _ = sender.send(Message::Text(frame.into())).await;
    }
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_INVALID_TOKEN,
            reason: String::from(code.message()).into(),
        })))
        .await;
}

async fn handle_frame(
    commands: impl IntoIterator<Item = Result<ClientCommand, FrameError>>,
    conn: &ClientConnection,
    state: &WsState,
) {
    for parsed in commands {
        let reply = match parsed {
            Ok(cmd) => handle_command(cmd, conn, state).await,
            Err(e) => {
                debug!(conn_id = %conn.id, error = %e.error, "Malformed command");
                Some(ServerReply::error(e.id, ErrorCode::BadRequest))
            }
        };

        if let Some(reply) = reply {
            send_reply(conn, reply).await;
        }
    }
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut sender, mut receiver) = socket.split();

    // The first command of the first frame must be connect; the rest of that
    // frame is handled once the connection is registered
    let mut first_frame = match receiver.next().await {
        Some(Ok(Message::Text(text))) => parse_frame(text.as_str()).into_iter(),
        _ => return,
    };

    let (connect_id, params) = match first_frame.next() {
        Some(Ok(cmd)) => {
            let id = cmd.id;
            match cmd.into_method() {
                Some(Method::Connect(params)) => (id, params),
                _ => {
                    reject(&mut sender, id, ErrorCode::BadRequest).await;
                    return;
                }
            }
        }
        Some(Err(e)) => {
            reject(&mut sender, e.id, ErrorCode::BadRequest).await;
            return;
        }
        None => {
            reject(&mut sender, 0, ErrorCode::BadRequest).await;
            return;
        }
    };

    let claims = match state.verifier.verify(&params.token) {
        Ok(claims) => claims,
        Err(e) => {
            info!(error = %e, "Rejected connection token");
            reject(&mut sender, connect_id, ErrorCode::Unauthorized).await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::channel::<OutboundFrame>(state.outbound_capacity);
    let conn = Arc::new(ClientConnection::new(claims.sub, params.name, tx));
    let conn_id = conn.id;

    // Written before registration so no push can overtake the connect reply
    let connected = match ServerReply::connected(connect_id, conn_id.to_string()).encode() {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "Failed to encode connect reply");
            return;
        }
    };
    if sender.send(Message::Text(connected.into())).await.is_err() {
        return;
    }

    state.connections.add(conn.clone());
    info!(conn_id = %conn_id, subject = %conn.subject, "WebSocket client connected");

    let ping_interval = state.ping_interval;
    let send_task = tokio::spawn(async move {
        let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    if sender.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sender.send(Message::Text(String::from(PING).into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    handle_frame(first_frame, &conn, &state).await;

    while let Some(msg_result) = receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => handle_frame(parse_frame(text.as_str()), &conn, &state).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {
                // Binary frames are not part of the protocol; ping/pong handled by axum
            }
            Err(e) => {
                warn!(conn_id = %conn_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    debug!(conn_id = %conn_id, "WebSocket client disconnected");
    state.connections.remove(conn_id);
    send_task.abort();
}

async fn send_reply(conn: &ClientConnection, reply: ServerReply) {
    match reply.encode() {
        Ok(frame) => {
            if conn.send(frame).await.is_err() {
                debug!(conn_id = %conn.id, "Reply dropped, connection closing");
            }
        }
        Err(e) => warn!(conn_id = %conn.id, error = %e, "Failed to encode reply"),
    }
}

async fn handle_command(
    cmd: ClientCommand,
    conn: &ClientConnection,
    state: &WsState,
) -> Option<ServerReply> {
    let id = cmd.id;

    match cmd.into_method() {
        Some(Method::Pong) => None,
        // Already connected
        Some(Method::Connect(_)) | None => Some(ServerReply::error(id, ErrorCode::BadRequest)),
        Some(Method::Subscribe(params)) => Some(subscribe(id, params, conn, state)),
        Some(Method::Unsubscribe(params)) => Some(unsubscribe(id, params, conn)),
        Some(Method::Publish(params)) => Some(publish(id, params, conn, state).await),
        Some(Method::History(params)) => Some(history(id, params, conn, state).await),
    }
}

fn subscribe(id: u32, params: SubscribeParams, conn: &ClientConnection, state: &WsState) -> ServerReply {
    let Ok(channel) = Channel::parse(&params.channel) else {
        return ServerReply::error(id, ErrorCode::UnknownChannel);
    };

    let Some(token) = params.token else {
        return ServerReply::error(id, ErrorCode::PermissionDenied);
    };

    // The token must be scoped to this subject and exactly this channel
    match state.verifier.verify(&token) {
        Ok(claims)
            if claims.sub == conn.subject
                && claims.channel.as_deref() == Some(channel.as_str()) => {}
        Ok(claims) => {
            debug!(
                conn_id = %conn.id,
                channel = %channel,
                token_sub = %claims.sub,
                token_channel = ?claims.channel,
                "Subscription token does not match request"
            );
            return ServerReply::error(id, ErrorCode::PermissionDenied);
        }
        Err(e) => {
            debug!(conn_id = %conn.id, channel = %channel, error = %e, "Invalid subscription token");
            return ServerReply::error(id, ErrorCode::PermissionDenied);
        }
    }

    if !conn.subscribe(&channel) {
        return ServerReply::error(id, ErrorCode::AlreadySubscribed);
    }

    debug!(conn_id = %conn.id, channel = %channel, "Subscribed");
    ServerReply::subscribed(id)
}

fn unsubscribe(id: u32, params: ChannelParams, conn: &ClientConnection) -> ServerReply {
    let Ok(channel) = Channel::parse(&params.channel) else {
        return ServerReply::error(id, ErrorCode::UnknownChannel);
    };

    conn.unsubscribe(&channel);
    ServerReply::unsubscribed(id)
}

async fn publish(id: u32, params: PublishParams, conn: &ClientConnection, state: &WsState) -> ServerReply {
    let Ok(channel) = Channel::parse(&params.channel) else {
        return ServerReply::error(id, ErrorCode::UnknownChannel);
    };

    if !conn.is_subscribed(&channel) {
        return ServerReply::error(id, ErrorCode::PermissionDenied);
    }

    // Stored before the reply, so an acknowledged publish is always in history
    match state.history.append(channel.as_str(), params.data).await {
        Ok(stored) => {
            broadcast(&state.router, &channel, stored);
            ServerReply::published(id)
        }
        Err(e) => {
            warn!(channel = %channel, error = %e, "Failed to store publication");
            ServerReply::error(id, ErrorCode::Internal)
        }
    }
}

async fn history(id: u32, params: HistoryParams, conn: &ClientConnection, state: &WsState) -> ServerReply {
    let Ok(channel) = Channel::parse(&params.channel) else {
        return ServerReply::error(id, ErrorCode::UnknownChannel);
    };

    if !conn.is_subscribed(&channel) {
        return ServerReply::error(id, ErrorCode::PermissionDenied);
    }

    match state.history.history(channel.as_str(), params.limit).await {
        Ok(slice) => ServerReply::history(
            id,
            HistoryBody {
                publications: slice
                    .publications
                    .into_iter()
                    .map(|p| PublicationBody {
                        data: p.data,
                        offset: p.offset,
                    })
                    .collect(),
                offset: slice.offset,
                epoch: slice.epoch,
            },
        ),
        Err(e) => {
            warn!(channel = %channel, error = %e, "Failed to read history");
            ServerReply::error(id, ErrorCode::Internal)
        }
    }
}
