//! Control plane wire types.
//!
//! The front-end talks to the bridge over a persistent WebSocket carrying
//! JSON envelopes. Targeted messages correlate request and response by id;
//! broadcasts use id 0 and never expect a response.

pub mod api;
pub mod server;
pub mod session;

pub use server::Frontend;

use crate::commissioning::MatterSnapshot;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sender/endpoint names of the logical channel.
pub const MATTERBRIDGE: &str = "Matterbridge";
pub const FRONTEND: &str = "Frontend";

/// Id carried by broadcast envelopes.
pub const BROADCAST_ID: u64 = 0;

/// One control-plane envelope, both directions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiMessage {
    pub id: Value,
    pub sender: String,
    pub method: String,
    pub src: String,
    pub dst: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiMessage {
    /// Successful response correlated to a request.
    pub fn response_to(request: &ApiMessage, response: Value) -> Self {
        Self {
            id: request.id.clone(),
            sender: MATTERBRIDGE.to_string(),
            method: request.method.clone(),
            src: MATTERBRIDGE.to_string(),
            dst: FRONTEND.to_string(),
            params: None,
            response: Some(response),
            error: None,
        }
    }

    /// Error response correlated to a request.
    pub fn error_to(request: &ApiMessage, error: impl Into<String>) -> Self {
        Self {
            id: request.id.clone(),
            sender: MATTERBRIDGE.to_string(),
            method: request.method.clone(),
            src: MATTERBRIDGE.to_string(),
            dst: FRONTEND.to_string(),
            params: None,
            response: None,
            error: Some(error.into()),
        }
    }

    /// Server-initiated broadcast (id 0, no response expected).
    pub fn broadcast(method: &str, response: Value) -> Self {
        Self {
            id: Value::from(BROADCAST_ID),
            sender: MATTERBRIDGE.to_string(),
            method: method.to_string(),
            src: MATTERBRIDGE.to_string(),
            dst: FRONTEND.to_string(),
            params: None,
            response: Some(response),
            error: None,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.id == Value::from(BROADCAST_ID)
    }
}

/// What a `refresh_required` broadcast invalidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Changed {
    Settings,
    Plugins,
    Matter,
    Devices,
}

/// Snackbar severity for user-visible notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Server-initiated event fanned out to every connected session.
#[derive(Debug, Clone)]
pub enum BroadcastEvent {
    RefreshRequired {
        changed: Changed,
        matter: Option<MatterSnapshot>,
    },
    Snackbar {
        severity: Severity,
        message: String,
    },
    /// Streamed output of a long-running operation (package install).
    Progress {
        operation: String,
        line: String,
    },
    RestartRequired,
}

impl BroadcastEvent {
    pub fn refresh(changed: Changed) -> Self {
        Self::RefreshRequired {
            changed,
            matter: None,
        }
    }

    pub fn snackbar(severity: Severity, message: impl Into<String>) -> Self {
        Self::Snackbar {
            severity,
            message: message.into(),
        }
    }

    /// Render as a wire envelope.
    pub fn to_message(&self) -> ApiMessage {
        match self {
            Self::RefreshRequired { changed, matter } => {
                let mut response = serde_json::json!({ "changed": changed });
                if let (Some(snapshot), Some(map)) = (matter, response.as_object_mut()) {
                    map.insert(
                        "matter".to_string(),
                        serde_json::to_value(snapshot).unwrap_or(Value::Null),
                    );
                }
                ApiMessage::broadcast("refresh_required", response)
            }
            Self::Snackbar { severity, message } => ApiMessage::broadcast(
                "snackbar",
                serde_json::json!({ "severity": severity, "message": message, "timeout": 5 }),
            ),
            Self::Progress { operation, line } => ApiMessage::broadcast(
                "progress",
                serde_json::json!({ "operation": operation, "line": line }),
            ),
            Self::RestartRequired => {
                ApiMessage::broadcast("restart_required", serde_json::json!({}))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str) -> ApiMessage {
        ApiMessage {
            id: Value::from(42),
            sender: "frontend-1".to_string(),
            method: method.to_string(),
            src: FRONTEND.to_string(),
            dst: MATTERBRIDGE.to_string(),
            params: None,
            response: None,
            error: None,
        }
    }

    #[test]
    fn test_response_echoes_request_id() {
        let req = request("/api/settings");
        let resp = ApiMessage::response_to(&req, serde_json::json!({"ok": true}));
        assert_eq!(resp.id, Value::from(42));
        assert_eq!(resp.dst, FRONTEND);
        assert!(resp.error.is_none());
    }

    #[test]
    fn test_broadcast_uses_sentinel_id() {
        let msg = ApiMessage::broadcast("refresh_required", serde_json::json!({"changed":"matter"}));
        assert!(msg.is_broadcast());
        assert!(!request("/api/settings").is_broadcast());
    }

    #[test]
    fn test_envelope_wire_shape() {
        let msg = BroadcastEvent::refresh(Changed::Settings).to_message();
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains("\"refresh_required\""));
        assert!(text.contains("\"changed\":\"settings\""));
        // Optional fields stay off the wire
        assert!(!text.contains("params"));
        assert!(!text.contains("error"));
    }

    #[test]
    fn test_envelope_round_trip() {
        let req = request("/api/config");
        let text = serde_json::to_string(&req).unwrap();
        let back: ApiMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(req, back);
    }
}
