//! JSON message types exchanged over the terminal WebSocket.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::SessionOverrides;
use crate::process::{OutputEvent, OutputKind};
use crate::session::HistoryEntry;

/// ISO-8601 with millisecond precision and a `Z` suffix.
pub fn iso_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Error procesando mensaje")]
    Malformed,

    #[error("Tipo de mensaje requerido")]
    MissingType,

    #[error("Tipo de mensaje no soportado: {0}")]
    UnsupportedType(String),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSession {
    pub session_id: Option<String>,
    pub config: Option<SessionOverrides>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecuteCommand {
    /// Kept raw so non-string commands reach the validator.
    #[serde(default)]
    pub command: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChangeDirectory {
    pub directory: String,
}

/// Inbound client message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    StartSession(StartSession),
    ExecuteCommand(ExecuteCommand),
    ChangeDirectory(ChangeDirectory),
    GetHistory,
    KillSession,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::Malformed)?;
        if !value.is_object() {
            return Err(ProtocolError::Malformed);
        }
        let kind = match value.get("type") {
            Some(Value::String(t)) if !t.is_empty() => t.clone(),
            Some(Value::Null) | None => return Err(ProtocolError::MissingType),
            Some(Value::String(_)) => return Err(ProtocolError::MissingType),
            Some(other) => return Err(ProtocolError::UnsupportedType(other.to_string())),
        };

        fn payload<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ProtocolError> {
            serde_json::from_value(value).map_err(|_| ProtocolError::Malformed)
        }

        match kind.as_str() {
            "start_session" => payload(value).map(Self::StartSession),
            "execute_command" => payload(value).map(Self::ExecuteCommand),
            "change_directory" => payload(value).map(Self::ChangeDirectory),
            "get_history" => Ok(Self::GetHistory),
            "kill_session" => Ok(Self::KillSession),
            _ => Err(ProtocolError::UnsupportedType(kind)),
        }
    }
}

/// Outbound server message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionStarted {
        #[serde(rename = "sessionId")]
        session_id: String,
        success: bool,
    },
    SessionError {
        error: String,
    },
    Stdout {
        data: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        timestamp: String,
    },
    Stderr {
        data: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        timestamp: String,
    },
    Close {
        data: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        timestamp: String,
    },
    /// Either a session-scoped error (`data`, `sessionId`, `timestamp`) or a
    /// connection-level one (`error` only).
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    DirectoryChanged {
        directory: String,
    },
    History {
        history: Vec<HistoryEntry>,
    },
    SessionKilled {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

impl ServerMessage {
    /// Connection-level error: `{type:"error", error}`.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            data: None,
            error: Some(message.into()),
            session_id: None,
            timestamp: None,
        }
    }

    pub fn session_error(message: impl Into<String>) -> Self {
        Self::SessionError {
            error: message.into(),
        }
    }

    /// Wrap a session output event for the wire.
    pub fn from_output(session_id: &str, event: OutputEvent) -> Self {
        let session_id = session_id.to_string();
        let timestamp = iso_timestamp(event.timestamp);
        let data = event.data;
        match event.kind {
            OutputKind::Stdout => Self::Stdout { data, session_id, timestamp },
            OutputKind::Stderr => Self::Stderr { data, session_id, timestamp },
            OutputKind::Close => Self::Close { data, session_id, timestamp },
            OutputKind::Error => Self::Error {
                data: Some(data),
                error: None,
                session_id: Some(session_id),
                timestamp: Some(timestamp),
            },
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing these plain structs cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_start_session_with_config() {
        let msg = ClientMessage::parse(
            r#"{"type":"start_session","sessionId":"s1","config":{"maxHistorySize":3}}"#,
        )
        .unwrap();
        let ClientMessage::StartSession(start) = msg else {
            panic!("expected start_session");
        };
        assert_eq!(start.session_id.as_deref(), Some("s1"));
        assert_eq!(start.config.unwrap().max_history_size, Some(3));
    }

    #[test]
    fn parses_bare_messages() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"get_history"}"#),
            Ok(ClientMessage::GetHistory)
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"kill_session"}"#),
            Ok(ClientMessage::KillSession)
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"start_session"}"#),
            Ok(ClientMessage::StartSession(StartSession::default()))
        );
    }

    #[test]
    fn execute_command_keeps_raw_value() {
        let msg = ClientMessage::parse(r#"{"type":"execute_command","command":7}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::ExecuteCommand(ExecuteCommand { command: json!(7) })
        );
        let msg = ClientMessage::parse(r#"{"type":"execute_command"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::ExecuteCommand(ExecuteCommand { command: Value::Null })
        );
    }

    #[test]
    fn protocol_errors() {
        assert_eq!(ClientMessage::parse("not json"), Err(ProtocolError::Malformed));
        assert_eq!(ClientMessage::parse("[1,2]"), Err(ProtocolError::Malformed));
        assert_eq!(ClientMessage::parse(r#"{"command":"ls"}"#), Err(ProtocolError::MissingType));
        assert_eq!(
            ClientMessage::parse(r#"{"type":"resize"}"#),
            Err(ProtocolError::UnsupportedType("resize".into()))
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"change_directory"}"#),
            Err(ProtocolError::Malformed)
        );
        assert_eq!(
            ProtocolError::UnsupportedType("resize".into()).to_string(),
            "Tipo de mensaje no soportado: resize"
        );
    }

    #[test]
    fn serializes_wire_shapes() {
        let started = ServerMessage::SessionStarted {
            session_id: "s1".into(),
            success: true,
        };
        assert_eq!(
            serde_json::to_value(&started).unwrap(),
            json!({"type": "session_started", "sessionId": "s1", "success": true})
        );

        assert_eq!(
            serde_json::to_value(ServerMessage::error("boom")).unwrap(),
            json!({"type": "error", "error": "boom"})
        );

        assert_eq!(
            serde_json::to_value(ServerMessage::DirectoryChanged { directory: "/tmp".into() })
                .unwrap(),
            json!({"type": "directory_changed", "directory": "/tmp"})
        );
    }

    #[test]
    fn output_events_carry_session_and_timestamp() {
        let msg = ServerMessage::from_output("s1", OutputEvent::error("Patrón de comando no permitido"));
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "error");
        assert_eq!(v["data"], "Patrón de comando no permitido");
        assert_eq!(v["sessionId"], "s1");
        assert!(v["timestamp"].as_str().unwrap().ends_with('Z'));
        assert!(v.get("error").is_none());

        let msg = ServerMessage::from_output("s1", OutputEvent::stdout("hi\n"));
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "stdout");
        assert_eq!(v["data"], "hi\n");
    }
}
