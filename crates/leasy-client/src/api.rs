//! Response shapes of the reliable path, as seen by the client.

use serde::{Deserialize, Serialize};

use leasy_core::ids::{ConversationId, MessageId, UserId};
use leasy_core::wire::ChatPayload;

/// A conversation participant as the server resolves it for display.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Participant {
    pub id: UserId,
    pub firstname: String,
    pub lastname: String,
    #[serde(default)]
    pub profile_picture: Option<String>,
}

/// A persisted message as returned by the reliable path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub recipient: UserId,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    pub created_at: String,
}

impl StoredMessage {
    /// The wire shape the live transport carries for this message.
    pub fn payload(&self) -> ChatPayload {
        ChatPayload {
            sender: self.sender.clone(),
            recipient: self.recipient.clone(),
            text: self.text.clone(),
            file: self.file.clone(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub host: Participant,
    pub applicant: Participant,
    pub messages: Vec<StoredMessage>,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct ConversationResponse {
    pub conversation: Conversation,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageResponse {
    pub new_message: StoredMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_message_payload_projection() {
        let msg = StoredMessage {
            id: MessageId::from_raw("msg_1"),
            conversation_id: ConversationId::from_raw("conv_1"),
            sender: UserId::from_raw("user_a"),
            recipient: UserId::from_raw("user_b"),
            text: Some("hello".into()),
            file: None,
            created_at: "2026-08-01T12:00:00Z".into(),
        };
        let json = serde_json::to_value(msg.payload()).unwrap();
        assert_eq!(json["sender"], "user_a");
        assert_eq!(json["recipient"], "user_b");
        assert_eq!(json["text"], "hello");
        assert!(json.get("file").is_none());
    }

    #[test]
    fn conversation_response_parses() {
        let raw = r#"{
            "conversation": {
                "id": "conv_1",
                "host": {"id": "user_a", "firstname": "Hanna", "lastname": "Host"},
                "applicant": {"id": "user_b", "firstname": "Arno", "lastname": "Applicant"},
                "messages": [],
                "created_at": "2026-08-01T12:00:00Z"
            }
        }"#;
        let parsed: ConversationResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.conversation.host.firstname, "Hanna");
        assert!(parsed.conversation.messages.is_empty());
    }
}
