//! Message types for the broker protocol
//!
//! Every frame is a JSON object. Commands carry a non-zero `id` and exactly one
//! method field; replies echo the `id` with either `error` or the method-named
//! result. Pushes have no `id`. An empty object `{}` is the ping/pong frame.
//!
//! These mirror the server-side definitions to keep both ends compatible.

use serde::{Deserialize, Serialize};

fn is_zero(id: &u32) -> bool {
    *id == 0
}

/// A frame sent from client to server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub id: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect: Option<ConnectRequest>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<SubscribeRequest>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsubscribe: Option<UnsubscribeRequest>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishRequest>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryRequest>,
}

impl Command {
    /// The empty frame used to answer server pings
    pub fn pong() -> Self {
        Self::default()
    }

    /// True for the `{}` keepalive frame
    pub fn is_ping(&self) -> bool {
        self.id == 0
            && self.connect.is_none()
            && self.subscribe.is_none()
            && self.unsubscribe.is_none()
            && self.publish.is_none()
            && self.history.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub channel: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRequest {
    pub channel: String,
    /// `-1` requests the whole stream, `0` only the stream position
    pub limit: i64,
}

/// A frame received from the server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub id: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push: Option<Push>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect: Option<ConnectResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<SubscribeResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsubscribe: Option<UnsubscribeResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryResult>,
}

impl Reply {
    /// True for the `{}` keepalive frame
    pub fn is_ping(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u32,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectResult {
    #[serde(default)]
    pub client: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscribeResult {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeResult {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishResult {}

/// A record stored in a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    pub data: serde_json::Value,
    #[serde(default)]
    pub offset: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryResult {
    #[serde(default)]
    pub publications: Vec<Publication>,
    /// Offset of the newest record in the stream
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub epoch: String,
}

/// Asynchronous message delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Push {
    pub channel: String,
    #[serde(rename = "pub", default, skip_serializing_if = "Option::is_none")]
    pub publication: Option<Publication>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pong_serializes_to_empty_object() {
        let json = serde_json::to_string(&Command::pong()).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn test_connect_serialization() {
        let cmd = Command {
            id: 1,
            connect: Some(ConnectRequest {
                token: "t".to_string(),
                name: None,
            }),
            ..Default::default()
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(json, r#"{"id":1,"connect":{"token":"t"}}"#);
    }

    #[test]
    fn test_subscribe_serialization() {
        let cmd = Command {
            id: 2,
            subscribe: Some(SubscribeRequest {
                channel: "training_logs".to_string(),
                token: Some("sub-token".to_string()),
            }),
            ..Default::default()
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(
            json,
            r#"{"id":2,"subscribe":{"channel":"training_logs","token":"sub-token"}}"#
        );
    }

    #[test]
    fn test_publish_serialization() {
        let cmd = Command {
            id: 3,
            publish: Some(PublishRequest {
                channel: "training_logs".to_string(),
                data: serde_json::json!({"log": "Training started"}),
            }),
            ..Default::default()
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(
            json,
            r#"{"id":3,"publish":{"channel":"training_logs","data":{"log":"Training started"}}}"#
        );
    }

    #[test]
    fn test_history_full_limit() {
        let cmd = Command {
            id: 4,
            history: Some(HistoryRequest {
                channel: "training_logs".to_string(),
                limit: -1,
            }),
            ..Default::default()
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(json, r#"{"id":4,"history":{"channel":"training_logs","limit":-1}}"#);
    }

    #[test]
    fn test_empty_command_is_ping() {
        let cmd: Command = serde_json::from_str("{}").unwrap();
        assert!(cmd.is_ping());

        let cmd: Command = serde_json::from_str(r#"{"id":1,"connect":{"token":"x"}}"#).unwrap();
        assert!(!cmd.is_ping());
    }

    #[test]
    fn test_reply_error_deserialization() {
        let reply: Reply =
            serde_json::from_str(r#"{"id":7,"error":{"code":103,"message":"permission denied"}}"#)
                .unwrap();
        assert_eq!(reply.id, 7);
        assert_eq!(
            reply.error,
            Some(ErrorBody {
                code: 103,
                message: "permission denied".to_string()
            })
        );
    }

    #[test]
    fn test_reply_connect_deserialization() {
        let reply: Reply =
            serde_json::from_str(r#"{"id":1,"connect":{"client":"abc","version":"0.1.0"}}"#)
                .unwrap();
        assert_eq!(reply.connect.unwrap().client, "abc");
    }

    #[test]
    fn test_reply_empty_results() {
        let reply: Reply = serde_json::from_str(r#"{"id":2,"subscribe":{}}"#).unwrap();
        assert_eq!(reply.subscribe, Some(SubscribeResult {}));
        assert!(!reply.is_ping());

        let reply: Reply = serde_json::from_str("{}").unwrap();
        assert!(reply.is_ping());
    }

    #[test]
    fn test_history_reply_deserialization() {
        let json = r#"{"id":5,"history":{"publications":[{"data":{"log":"a"},"offset":1},{"data":{"log":"b"},"offset":2}],"offset":2,"epoch":"xyz"}}"#;
        let reply: Reply = serde_json::from_str(json).unwrap();
        let history = reply.history.unwrap();
        assert_eq!(history.publications.len(), 2);
        assert_eq!(history.publications[1].data["log"], "b");
        assert_eq!(history.offset, 2);
        assert_eq!(history.epoch, "xyz");
    }

    #[test]
    fn test_push_deserialization() {
        let json = r#"{"push":{"channel":"training_logs","pub":{"data":{"log":"x"},"offset":9}}}"#;
        let reply: Reply = serde_json::from_str(json).unwrap();
        let push = reply.push.unwrap();
        assert_eq!(push.channel, "training_logs");
        assert_eq!(push.publication.unwrap().offset, 9);
    }
}
