//! Gateway wire messages.
//!
//! Requests and replies are JSON objects discriminated by the `janus`
//! field. Every request carries a `transaction` string that the gateway
//! echoes back on the replies belonging to it. Plugin message bodies are
//! discriminated by their `request` field.

use serde::{Deserialize, Serialize};

/// Requests sent to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "janus", rename_all = "lowercase")]
pub enum Request {
    /// Create a session.
    Create,

    /// Attach a plugin handle to a session.
    Attach {
        session_id: u64,
        plugin: String,
        participant: String,
    },

    /// Send a message to an attached plugin handle.
    Message {
        session_id: u64,
        handle_id: u64,
        body: Body,
        #[serde(skip_serializing_if = "Option::is_none")]
        jsep: Option<Jsep>,
    },

    /// Keep a session from expiring.
    Keepalive { session_id: u64 },
}

impl Request {
    /// Value of the `janus` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Attach { .. } => "attach",
            Self::Message { .. } => "message",
            Self::Keepalive { .. } => "keepalive",
        }
    }
}

/// A request together with its transaction, as written to the wire.
#[derive(Debug, Serialize)]
pub struct Outgoing<'a> {
    pub transaction: &'a str,
    #[serde(flatten)]
    pub request: &'a Request,
}

/// Videoroom plugin message bodies.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "request", rename_all = "lowercase")]
pub enum Body {
    /// Join a room as publisher and configure in one step.
    JoinAndConfigure {
        ptype: String,
        room: u64,
        participant: String,
        display: String,
        bitrate: u64,
        agent: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        mtype: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        alinip: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        alinport: Option<String>,
    },

    /// Publish media described by the attached offer.
    Configure { audio: bool, video: bool, data: bool },
}

/// SDP payload attached to a message or event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jsep {
    #[serde(rename = "type")]
    pub kind: JsepType,
    pub sdp: String,
}

impl Jsep {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: JsepType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: JsepType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// SDP type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsepType {
    Offer,
    Answer,
    #[serde(other)]
    Other,
}

/// Messages received from the gateway.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "janus", rename_all = "lowercase")]
pub enum GatewayMessage {
    /// Synchronous success, carrying a new id or plugin data.
    Success {
        transaction: Option<String>,
        data: Option<IdData>,
        plugindata: Option<PluginData>,
    },

    /// Request received; a separate event follows.
    Ack { transaction: Option<String> },

    /// Asynchronous plugin event.
    Event {
        transaction: Option<String>,
        sender: Option<u64>,
        plugindata: Option<PluginData>,
        jsep: Option<Jsep>,
    },

    /// Request failed.
    Error {
        transaction: Option<String>,
        error: ErrorBody,
    },

    /// PeerConnection established on the gateway side.
    Webrtcup { sender: Option<u64> },

    /// PeerConnection closed by the gateway.
    Hangup {
        sender: Option<u64>,
        reason: Option<String>,
    },

    /// Session expired.
    Timeout { session_id: Option<u64> },

    /// Any other notification (`media`, `slowlink`, `detached`, ...).
    #[serde(other)]
    Other,
}

impl GatewayMessage {
    /// Transaction this message belongs to, if any.
    pub fn transaction(&self) -> Option<&str> {
        match self {
            Self::Success { transaction, .. }
            | Self::Ack { transaction }
            | Self::Event { transaction, .. }
            | Self::Error { transaction, .. } => transaction.as_deref(),
            _ => None,
        }
    }

    /// Value of the `janus` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Ack { .. } => "ack",
            Self::Event { .. } => "event",
            Self::Error { .. } => "error",
            Self::Webrtcup { .. } => "webrtcup",
            Self::Hangup { .. } => "hangup",
            Self::Timeout { .. } => "timeout",
            Self::Other => "other",
        }
    }

    /// Whether this is an ack that will be followed by more replies.
    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack { .. })
    }
}

/// `data` of a success reply.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IdData {
    #[serde(default)]
    pub id: u64,
}

/// Plugin payload of a success or event reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PluginData {
    #[serde(default)]
    pub plugin: String,
    #[serde(default)]
    pub data: PluginPayload,
}

/// Videoroom fields the publish flow looks at.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PluginPayload {
    pub videoroom: Option<String>,
    pub room: Option<serde_json::Value>,
    pub id: Option<u64>,
    pub error_code: Option<i64>,
    pub error: Option<String>,
}

/// `error` of an error reply.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorBody {
    pub code: i64,
    #[serde(default)]
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode(transaction: &str, request: &Request) -> serde_json::Value {
        serde_json::to_value(Outgoing {
            transaction,
            request,
        })
        .unwrap()
    }

    #[test]
    fn test_create_request() {
        assert_eq!(
            encode("abc", &Request::Create),
            json!({"janus": "create", "transaction": "abc"})
        );
    }

    #[test]
    fn test_attach_request() {
        let request = Request::Attach {
            session_id: 1,
            plugin: "janus.plugin.videoroom".to_string(),
            participant: "token".to_string(),
        };
        assert_eq!(
            encode("t1", &request),
            json!({
                "janus": "attach",
                "transaction": "t1",
                "session_id": 1,
                "plugin": "janus.plugin.videoroom",
                "participant": "token"
            })
        );
    }

    #[test]
    fn test_configure_serializes_every_flag() {
        let request = Request::Message {
            session_id: 1,
            handle_id: 2,
            body: Body::Configure {
                audio: true,
                video: true,
                data: false,
            },
            jsep: Some(Jsep::offer("v=0")),
        };
        let value = encode("t2", &request);

        assert_eq!(
            value["body"],
            json!({"request": "configure", "audio": true, "video": true, "data": false})
        );
        assert_eq!(value["jsep"], json!({"type": "offer", "sdp": "v=0"}));
        assert_eq!(value["handle_id"], json!(2));
    }

    #[test]
    fn test_join_body() {
        let body = Body::JoinAndConfigure {
            ptype: "publisher".to_string(),
            room: 1234,
            participant: "p".to_string(),
            display: "d".to_string(),
            bitrate: 4194304,
            agent: "bridge".to_string(),
            mtype: Some("main".to_string()),
            alinip: None,
            alinport: None,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["request"], json!("joinandconfigure"));
        assert_eq!(value["ptype"], json!("publisher"));
        assert_eq!(value["room"], json!(1234));
        assert_eq!(value["bitrate"], json!(4194304));
        assert_eq!(value["mtype"], json!("main"));
        assert!(value.get("alinip").is_none());
    }

    #[test]
    fn test_message_without_jsep_omits_field() {
        let request = Request::Message {
            session_id: 1,
            handle_id: 2,
            body: Body::Configure {
                audio: false,
                video: true,
                data: false,
            },
            jsep: None,
        };
        assert!(encode("t", &request).get("jsep").is_none());
    }

    #[test]
    fn test_decode_success_with_id() {
        let msg: GatewayMessage =
            serde_json::from_str(r#"{"janus":"success","transaction":"x","data":{"id":42}}"#)
                .unwrap();
        assert_eq!(msg.transaction(), Some("x"));
        match msg {
            GatewayMessage::Success { data, .. } => assert_eq!(data.unwrap().id, 42),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_decode_joined_event() {
        let msg: GatewayMessage = serde_json::from_str(
            r#"{"janus":"event","session_id":1,"sender":2,"transaction":"x",
                "plugindata":{"plugin":"janus.plugin.videoroom",
                "data":{"videoroom":"joined","room":1234,"id":99}}}"#,
        )
        .unwrap();
        match msg {
            GatewayMessage::Event {
                plugindata, sender, ..
            } => {
                let data = plugindata.unwrap().data;
                assert_eq!(data.videoroom.as_deref(), Some("joined"));
                assert_eq!(data.id, Some(99));
                assert_eq!(sender, Some(2));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_decode_error() {
        let msg: GatewayMessage = serde_json::from_str(
            r#"{"janus":"error","transaction":"x","error":{"code":458,"reason":"No such session"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            GatewayMessage::Error {
                transaction: Some("x".to_string()),
                error: ErrorBody {
                    code: 458,
                    reason: "No such session".to_string()
                }
            }
        );
    }

    #[test]
    fn test_decode_unknown_kind() {
        let msg: GatewayMessage =
            serde_json::from_str(r#"{"janus":"media","type":"audio","receiving":true}"#).unwrap();
        assert_eq!(msg, GatewayMessage::Other);
        assert_eq!(msg.transaction(), None);
    }
}
