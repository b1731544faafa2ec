use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// A chat message as it travels: the exact shape the reliable path persists
/// and the live transport forwards verbatim. Absent optionals are omitted
/// from the JSON.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub sender: UserId,
    pub recipient: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl ChatPayload {
    pub fn text(sender: UserId, recipient: UserId, text: impl Into<String>) -> Self {
        Self {
            sender,
            recipient,
            text: Some(text.into()),
            file: None,
        }
    }

    /// A well-formed payload carries text, a file reference, or both.
    pub fn has_content(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
            || self.file.as_deref().is_some_and(|f| !f.is_empty())
    }
}

/// Routing identity for one logical chat window: who is speaking, to whom,
/// and which surface the window lives on ("overview", "chat", ...).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingIdentity {
    pub sender: UserId,
    pub counterparty: UserId,
    pub origin: String,
}

/// Frames a client may send over the socket.
///
/// `announce` must be the first text frame on a fresh connection; it replaces
/// the delimited-cookie side channel with a handshake the server validates
/// before registering the connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Announce(RoutingIdentity),
    Publish(ChatPayload),
}
