//! JSON frame protocol spoken over a site's real-time channel.
//!
//! Every WebSocket text frame carries one object tagged by `type`:
//! ```text
//! client → server   join | update-presence | request-presence | edit | commit | leave | ping
//! server → client   joined | presence-list | presence-updated | user-left | edit
//!                   | committed | conflict | element-committed | error | pong
//! ```
//!
//! Presence and edit payloads reuse the camelCase shapes from [`crate::model`].

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::conflict::CommitRequest;
use crate::model::{CollaborativeEdit, EditConflict, PresencePatch, PresenceRecord, VersionToken};

/// Display profile a client announces when joining.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_avatar: Option<String>,
}

/// Frames sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Must be the first frame on a connection.
    Join {
        site_id: Uuid,
        session_token: String,
        #[serde(default)]
        profile: JoinProfile,
    },
    UpdatePresence {
        patch: PresencePatch,
    },
    /// Ask for the full presence list again (used after reconnect).
    RequestPresence,
    Edit {
        edit: CollaborativeEdit,
    },
    Commit {
        request_id: Uuid,
        commit: CommitRequest,
    },
    Leave,
    Ping,
}

/// Machine-readable error category carried by [`ServerFrame::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    Unauthorized,
    NotJoined,
    SiteFull,
    InvalidFrame,
    NotFound,
    Persistence,
    Internal,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Joined {
        connection_id: Uuid,
        user_id: Uuid,
    },
    /// Everyone else on the site; never contains the receiver's own record.
    PresenceList {
        records: Vec<PresenceRecord>,
    },
    PresenceUpdated {
        record: PresenceRecord,
    },
    UserLeft {
        user_id: Uuid,
    },
    Edit {
        edit: CollaborativeEdit,
    },
    Committed {
        request_id: Uuid,
        element_id: String,
        content: String,
        version: VersionToken,
    },
    Conflict {
        request_id: Uuid,
        conflict: EditConflict,
    },
    /// Another editor's commit landed; peers should rebase on `version`.
    ElementCommitted {
        element_id: String,
        language: String,
        variant: String,
        content: String,
        version: VersionToken,
        user_id: Uuid,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Uuid>,
        code: ErrorCode,
        message: String,
        retryable: bool,
    },
    Pong,
}

impl ClientFrame {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Join { .. } => "join",
            ClientFrame::UpdatePresence { .. } => "update-presence",
            ClientFrame::RequestPresence => "request-presence",
            ClientFrame::Edit { .. } => "edit",
            ClientFrame::Commit { .. } => "commit",
            ClientFrame::Leave => "leave",
            ClientFrame::Ping => "ping",
        }
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    pub fn error(code: ErrorCode, message: impl Into<String>, retryable: bool) -> Self {
        ServerFrame::Error {
            request_id: None,
            code,
            message: message.into(),
            retryable,
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(&'static str),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}
