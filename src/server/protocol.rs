//! Broker side of the wire protocol
//!
//! Commands arrive as `{"id":N,"<method>":{..}}`; replies echo the id with
//! either `error` or the method-named result. Pushes carry no id and `{}` is
//! the ping/pong frame. A text frame may hold several newline-separated objects.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Broker error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Internal,
    Unauthorized,
    UnknownChannel,
    PermissionDenied,
    AlreadySubscribed,
    BadRequest,
}

impl ErrorCode {
    pub fn code(self) -> u32 {
        match self {
            ErrorCode::Internal => 100,
            ErrorCode::Unauthorized => 101,
            ErrorCode::UnknownChannel => 102,
            ErrorCode::PermissionDenied => 103,
            ErrorCode::AlreadySubscribed => 105,
            ErrorCode::BadRequest => 107,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Internal => "internal server error",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::UnknownChannel => "unknown channel",
            ErrorCode::PermissionDenied => "permission denied",
            ErrorCode::AlreadySubscribed => "already subscribed",
            ErrorCode::BadRequest => "bad request",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub token: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeParams {
    pub channel: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChannelParams {
    pub channel: String,
}

#[derive(Debug, Deserialize)]
pub struct PublishParams {
    pub channel: String,
    pub data: Value,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub channel: String,
    #[serde(default)]
    pub limit: i64,
}

/// Raw command frame from a client
#[derive(Debug, Default, Deserialize)]
pub struct ClientCommand {
    #[serde(default)]
    pub id: u32,
    #[serde(default)]
    connect: Option<ConnectParams>,
    #[serde(default)]
    subscribe: Option<SubscribeParams>,
    #[serde(default)]
    unsubscribe: Option<ChannelParams>,
    #[serde(default)]
    publish: Option<PublishParams>,
    #[serde(default)]
    history: Option<HistoryParams>,
}

/// A command resolved to exactly one method
#[derive(Debug)]
pub enum Method {
    Connect(ConnectParams),
    Subscribe(SubscribeParams),
    Unsubscribe(ChannelParams),
    Publish(PublishParams),
    History(HistoryParams),
    /// Answer to a server ping
    Pong,
}

impl ClientCommand {
    /// Resolve the method; `None` when the frame names zero or several methods
    pub fn into_method(self) -> Option<Method> {
        let mut methods = Vec::with_capacity(1);
        if let Some(p) = self.connect {
            methods.push(Method::Connect(p));
        }
        if let Some(p) = self.subscribe {
            methods.push(Method::Subscribe(p));
        }
        if let Some(p) = self.unsubscribe {
            methods.push(Method::Unsubscribe(p));
        }
        if let Some(p) = self.publish {
            methods.push(Method::Publish(p));
        }
        if let Some(p) = self.history {
            methods.push(Method::History(p));
        }

        match (self.id, methods.len()) {
            (0, 0) => Some(Method::Pong),
            (0, _) => None,
            (_, 1) => methods.pop(),
            _ => None,
        }
    }
}

/// A line of a frame that is not a valid command
///
/// `id` is recovered from the raw object when it has a numeric one, so the
/// error reply still reaches the caller waiting on it; otherwise it is 0.
#[derive(Debug)]
pub struct FrameError {
    pub id: u32,
    pub error: serde_json::Error,
}

/// Parse every command in a text frame; malformed lines are yielded as errors
pub fn parse_frame(text: &str) -> Vec<Result<ClientCommand, FrameError>> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|error| FrameError {
                id: recover_id(line),
                error,
            })
        })
        .collect()
}

fn recover_id(line: &str) -> u32 {
    serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|v| v.get("id").and_then(Value::as_u64))
        .and_then(|id| u32::try_from(id).ok())
        .unwrap_or(0)
}

fn is_zero(id: &u32) -> bool {
    *id == 0
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplyError {
    pub code: u32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectBody {
    pub client: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Empty {}

#[derive(Debug, Clone, Serialize)]
pub struct PublicationBody {
    pub data: Value,
    pub offset: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryBody {
    pub publications: Vec<PublicationBody>,
    pub offset: u64,
    pub epoch: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushBody {
    pub channel: String,
    #[serde(rename = "pub")]
    pub publication: PublicationBody,
}

/// A frame sent to a client
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerReply {
    #[serde(skip_serializing_if = "is_zero")]
    pub id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push: Option<PushBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect: Option<ConnectBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unsubscribe: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryBody>,
}

impl ServerReply {
    pub fn error(id: u32, code: ErrorCode) -> Self {
        Self {
            id,
            error: Some(ReplyError {
                code: code.code(),
                message: code.message().to_string(),
            }),
            ..Default::default()
        }
    }

    pub fn connected(id: u32, client: String) -> Self {
        Self {
            id,
            connect: Some(ConnectBody {
                client,
                version: env!("CARGO_PKG_VERSION").to_string(),
            }),
            ..Default::default()
        }
    }

    pub fn subscribed(id: u32) -> Self {
        Self {
            id,
            subscribe: Some(Empty {}),
            ..Default::default()
        }
    }

    pub fn unsubscribed(id: u32) -> Self {
        Self {
            id,
            unsubscribe: Some(Empty {}),
            ..Default::default()
        }
    }

    pub fn published(id: u32) -> Self {
        Self {
            id,
            publish: Some(Empty {}),
            ..Default::default()
        }
    }

    pub fn history(id: u32, body: HistoryBody) -> Self {
        Self {
            id,
            history: Some(body),
            ..Default::default()
        }
    }

    pub fn push(channel: String, publication: PublicationBody) -> Self {
        Self {
            push: Some(PushBody {
                channel,
                publication,
            }),
            ..Default::default()
        }
    }

    /// Encode as one text line
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// The keepalive frame
pub const PING: &str = "{}";
