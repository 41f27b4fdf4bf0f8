//! Session wire protocol.

use crate::types::Hit;
use serde::{Deserialize, Serialize};

/// Frames sent from clients to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start the pipeline for a question. `top_k <= 0` selects the default.
    Ask {
        query: String,
        #[serde(default)]
        top_k: i64,
    },
    /// Abandon the running ask at the next stage boundary.
    Cancel,
}

/// Events sent from the gateway to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Pipeline progress.
    Status { stage: String, msg: String },
    /// A generated text fragment.
    Delta { text: String },
    /// Retrieved passages, sent once generation has finished.
    Hits { items: Vec<Hit> },
    /// The answer is complete.
    Done,
    /// The ask failed. Replaces every remaining event.
    Error { msg: String },
}

impl ServerMessage {
    pub fn status(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        ServerMessage::Status {
            stage: stage.into(),
            msg: msg.into(),
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        ServerMessage::Error { msg: msg.into() }
    }

    /// `done` and `error` end the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerMessage::Done | ServerMessage::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ask_deserialization() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"ask","query":"test","top_k":2}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Ask {
                query: "test".into(),
                top_k: 2
            }
        );
    }

    #[test]
    fn test_ask_top_k_optional() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ask","query":"q"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ask { top_k: 0, .. }));
    }

    #[test]
    fn test_ask_requires_query() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"ask","top_k":2}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"query":"q"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"nope"}"#).is_err());
    }

    #[test]
    fn test_cancel_deserialization() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"cancel"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Cancel);
    }

    #[test]
    fn test_server_message_wire_shapes() {
        let cases = vec![
            (
                ServerMessage::status("search", "query vector index"),
                json!({"type": "status", "stage": "search", "msg": "query vector index"}),
            ),
            (
                ServerMessage::Delta { text: "Hi".into() },
                json!({"type": "delta", "text": "Hi"}),
            ),
            (
                ServerMessage::Hits {
                    items: vec![Hit::new("1", 0.9, "alpha")],
                },
                json!({"type": "hits", "items": [{"id": "1", "score": 0.9, "text": "alpha"}]}),
            ),
            (ServerMessage::Done, json!({"type": "done"})),
            (
                ServerMessage::error("invalid ask"),
                json!({"type": "error", "msg": "invalid ask"}),
            ),
        ];
        for (msg, expected) in cases {
            assert_eq!(serde_json::to_value(&msg).unwrap(), expected);
        }
    }

    #[test]
    fn test_terminal_events() {
        assert!(ServerMessage::Done.is_terminal());
        assert!(ServerMessage::error("x").is_terminal());
        assert!(!ServerMessage::Delta { text: "x".into() }.is_terminal());
        assert!(!ServerMessage::Hits { items: vec![] }.is_terminal());
        assert!(!ServerMessage::status("a", "b").is_terminal());
    }
}
