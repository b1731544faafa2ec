use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use leasy_core::ids::{ConversationId, MessageId, UserId};
use leasy_core::wire::ChatPayload;

use crate::database::Database;
use crate::error::StoreError;
use crate::users::{Identity, UserRepo};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: ConversationId,
    pub host: UserId,
    pub applicant: UserId,
    pub created_at: String,
}

/// A persisted message. `payload()` projects the wire shape that is pushed
/// verbatim over the live transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub recipient: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub created_at: String,
}

impl MessageRow {
    pub fn payload(&self) -> ChatPayload {
        ChatPayload {
            sender: self.sender.clone(),
            recipient: self.recipient.clone(),
            text: self.text.clone(),
            file: self.file.clone(),
        }
    }
}

/// A conversation with both participants resolved for display and its
/// messages in persistence order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationView {
    pub id: ConversationId,
    pub host: Identity,
    pub applicant: Identity,
    pub messages: Vec<MessageRow>,
    pub created_at: String,
}

/// Canonical key for an unordered participant pair. (A,B) and (B,A) map to
/// the same key, which backs the one-conversation-per-pair invariant.
fn pair_key(a: &UserId, b: &UserId) -> String {
    if a.as_str() <= b.as_str() {
        format!("{}|{}", a.as_str(), b.as_str())
    } else {
        format!("{}|{}", b.as_str(), a.as_str())
    }
}

pub struct ConversationRepo {
    db: Database,
    users: UserRepo,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        let users = UserRepo::new(db.clone());
        Self { db, users }
    }

    /// Create-or-fetch the conversation between two participants.
    /// Idempotent by unordered pair; role labels follow the caller on first
    /// creation and are cosmetic afterwards.
    #[instrument(skip(self), fields(host = %host, applicant = %applicant))]
    pub fn create_or_fetch(
        &self,
        host: &UserId,
        applicant: &UserId,
    ) -> Result<ConversationRow, StoreError> {
        if host == applicant {
            return Err(StoreError::Invalid(
                "the two participants of one conversation can not be the same user".into(),
            ));
        }
        if !self.users.exists(host)? {
            return Err(StoreError::NotFound(format!("user {host}")));
        }
        if !self.users.exists(applicant)? {
            return Err(StoreError::NotFound(format!("user {applicant}")));
        }

        let key = pair_key(host, applicant);
        self.db.with_conn(|conn| {
            let existing = conn
                .query_row(
                    "SELECT id, host_id, applicant_id, created_at
                     FROM conversations WHERE pair_key = ?1",
                    [key.as_str()],
                    row_to_conversation,
                )
                .ok();

            if let Some(row) = existing {
                return Ok(row);
            }

            let id = ConversationId::new();
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO conversations (id, host_id, applicant_id, pair_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id.as_str(), host.as_str(), applicant.as_str(), key, now],
            )?;

            Ok(ConversationRow {
                id,
                host: host.clone(),
                applicant: applicant.clone(),
                created_at: now,
            })
        })
    }

    /// Conversation with resolved participants and ordered messages.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn get(&self, id: &ConversationId) -> Result<ConversationView, StoreError> {
        let row = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, host_id, applicant_id, created_at
                 FROM conversations WHERE id = ?1",
                [id.as_str()],
                row_to_conversation,
            )
            .map_err(|_| StoreError::NotFound(format!("conversation {id}")))
        })?;
        self.view(row)
    }

    /// All conversations the user participates in, as host or applicant.
    #[instrument(skip(self), fields(user_id = %user))]
    pub fn list_for_participant(
        &self,
        user: &UserId,
    ) -> Result<Vec<ConversationView>, StoreError> {
        if !self.users.exists(user)? {
            return Err(StoreError::NotFound(format!("user {user}")));
        }
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, host_id, applicant_id, created_at
                 FROM conversations
                 WHERE host_id = ?1 OR applicant_id = ?1
                 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map([user.as_str()], row_to_conversation)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter().map(|row| self.view(row)).collect()
    }

    /// Append a message to the sender/recipient pair's conversation.
    /// The timestamp is assigned here; messages are immutable once created.
    #[instrument(skip(self, payload), fields(sender = %payload.sender, recipient = %payload.recipient))]
    pub fn append_message(&self, payload: &ChatPayload) -> Result<MessageRow, StoreError> {
        if payload.sender == payload.recipient {
            return Err(StoreError::Invalid(
                "the sender and the recipient of a message can not be the same".into(),
            ));
        }
        if !payload.has_content() {
            return Err(StoreError::Invalid(
                "a message must carry text or a file reference".into(),
            ));
        }
        if !self.users.exists(&payload.sender)? {
            return Err(StoreError::NotFound(format!("user {}", payload.sender)));
        }
        if !self.users.exists(&payload.recipient)? {
            return Err(StoreError::NotFound(format!("user {}", payload.recipient)));
        }

        let key = pair_key(&payload.sender, &payload.recipient);
        self.db.with_conn(|conn| {
            let conversation_id: String = conn
                .query_row(
                    "SELECT id FROM conversations WHERE pair_key = ?1",
                    [key.as_str()],
                    |row| row.get(0),
                )
                .map_err(|_| {
                    StoreError::NotFound(
                        "there is no conversation between these two users yet".into(),
                    )
                })?;

            let id = MessageId::new();
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, recipient_id, text, file, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    id.as_str(),
                    conversation_id,
                    payload.sender.as_str(),
                    payload.recipient.as_str(),
                    payload.text,
                    payload.file,
                    now,
                ],
            )?;

            Ok(MessageRow {
                id,
                conversation_id: ConversationId::from_raw(conversation_id),
                sender: payload.sender.clone(),
                recipient: payload.recipient.clone(),
                text: payload.text.clone(),
                file: payload.file.clone(),
                created_at: now,
            })
        })
    }

    /// Messages of a conversation in persistence order.
    pub fn messages(&self, id: &ConversationId) -> Result<Vec<MessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, sender_id, recipient_id, text, file, created_at
                 FROM messages WHERE conversation_id = ?1
                 ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt
                .query_map([id.as_str()], row_to_message)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Delete a conversation and its messages. Testing escape hatch; there
    /// is no user-facing delete path.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn delete(&self, id: &ConversationId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM messages WHERE conversation_id = ?1",
                [id.as_str()],
            )?;
            let removed = conn.execute("DELETE FROM conversations WHERE id = ?1", [id.as_str()])?;
            if removed == 0 {
                return Err(StoreError::NotFound(format!("conversation {id}")));
            }
            Ok(())
        })
    }

    fn view(&self, row: ConversationRow) -> Result<ConversationView, StoreError> {
        let host = self.users.get(&row.host)?;
        let applicant = self.users.get(&row.applicant)?;
        let messages = self.messages(&row.id)?;
        Ok(ConversationView {
            id: row.id,
            host,
            applicant,
            messages,
            created_at: row.created_at,
        })
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> Result<ConversationRow, rusqlite::Error> {
    Ok(ConversationRow {
        id: ConversationId::from_raw(row.get::<_, String>(0)?),
        host: UserId::from_raw(row.get::<_, String>(1)?),
        applicant: UserId::from_raw(row.get::<_, String>(2)?),
        created_at: row.get(3)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<MessageRow, rusqlite::Error> {
    Ok(MessageRow {
        id: MessageId::from_raw(row.get::<_, String>(0)?),
        conversation_id: ConversationId::from_raw(row.get::<_, String>(1)?),
        sender: UserId::from_raw(row.get::<_, String>(2)?),
        recipient: UserId::from_raw(row.get::<_, String>(3)?),
        text: row.get(4)?,
        file: row.get(5)?,
        created_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (ConversationRepo, UserId, UserId) {
        let db = Database::in_memory().unwrap();
        let users = UserRepo::new(db.clone());
        let host = users.create("Hanna", "Host", None).unwrap();
        let applicant = users.create("Arno", "Applicant", None).unwrap();
        (ConversationRepo::new(db), host.id, applicant.id)
    }

    #[test]
    fn create_conversation() {
        let (repo, host, applicant) = setup();
        let conv = repo.create_or_fetch(&host, &applicant).unwrap();
        assert!(conv.id.as_str().starts_with("conv_"));
        assert_eq!(conv.host, host);
        assert_eq!(conv.applicant, applicant);
    }

    #[test]
    fn unordered_pair_is_unique() {
        let (repo, host, applicant) = setup();
        let c1 = repo.create_or_fetch(&host, &applicant).unwrap();
        let c2 = repo.create_or_fetch(&host, &applicant).unwrap();
        let c3 = repo.create_or_fetch(&applicant, &host).unwrap();
        assert_eq!(c1.id, c2.id);
        assert_eq!(c1.id, c3.id);
    }

    #[test]
    fn same_user_pair_rejected() {
        let (repo, host, _) = setup();
        let result = repo.create_or_fetch(&host, &host);
        assert!(matches!(result, Err(StoreError::Invalid(_))));
    }

    #[test]
    fn unknown_participant_rejected() {
        let (repo, host, _) = setup();
        let result = repo.create_or_fetch(&host, &UserId::from_raw("user_missing"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn append_and_fetch_messages() {
        let (repo, host, applicant) = setup();
        repo.create_or_fetch(&host, &applicant).unwrap();

        let m1 = repo
            .append_message(&ChatPayload::text(host.clone(), applicant.clone(), "hello"))
            .unwrap();
        let m2 = repo
            .append_message(&ChatPayload::text(applicant.clone(), host.clone(), "hi back"))
            .unwrap();

        let messages = repo.messages(&m1.conversation_id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, m1.id);
        assert_eq!(messages[1].id, m2.id);
        assert_eq!(messages[0].text.as_deref(), Some("hello"));
    }

    #[test]
    fn message_without_conversation_rejected() {
        let (repo, host, applicant) = setup();
        let result = repo.append_message(&ChatPayload::text(host, applicant, "hello"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn empty_message_rejected() {
        let (repo, host, applicant) = setup();
        repo.create_or_fetch(&host, &applicant).unwrap();
        let payload = ChatPayload {
            sender: host,
            recipient: applicant,
            text: None,
            file: None,
        };
        let result = repo.append_message(&payload);
        assert!(matches!(result, Err(StoreError::Invalid(_))));
    }

    #[test]
    fn self_message_rejected() {
        let (repo, host, _) = setup();
        let result = repo.append_message(&ChatPayload::text(host.clone(), host, "me"));
        assert!(matches!(result, Err(StoreError::Invalid(_))));
    }

    #[test]
    fn file_message_persists_reference() {
        let (repo, host, applicant) = setup();
        repo.create_or_fetch(&host, &applicant).unwrap();
        let payload = ChatPayload {
            sender: host,
            recipient: applicant,
            text: None,
            file: Some("https://files.example/contract.pdf".into()),
        };
        let row = repo.append_message(&payload).unwrap();
        assert_eq!(row.file.as_deref(), Some("https://files.example/contract.pdf"));
        assert!(row.text.is_none());
    }

    #[test]
    fn persisted_message_survives_without_live_connections() {
        // At-least-once eventual delivery: nothing is listening, the pull
        // path still returns the message.
        let (repo, host, applicant) = setup();
        let conv = repo.create_or_fetch(&host, &applicant).unwrap();
        repo.append_message(&ChatPayload::text(host.clone(), applicant.clone(), "offline hello"))
            .unwrap();

        let view = repo.get(&conv.id).unwrap();
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.messages[0].text.as_deref(), Some("offline hello"));
        assert_eq!(view.messages[0].recipient, applicant);
    }

    #[test]
    fn get_populates_participants() {
        let (repo, host, applicant) = setup();
        let conv = repo.create_or_fetch(&host, &applicant).unwrap();
        let view = repo.get(&conv.id).unwrap();
        assert_eq!(view.host.firstname, "Hanna");
        assert_eq!(view.applicant.firstname, "Arno");
    }

    #[test]
    fn list_for_participant_covers_both_roles() {
        let (repo, host, applicant) = setup();
        let conv = repo.create_or_fetch(&host, &applicant).unwrap();

        let as_host = repo.list_for_participant(&host).unwrap();
        let as_applicant = repo.list_for_participant(&applicant).unwrap();
        assert_eq!(as_host.len(), 1);
        assert_eq!(as_applicant.len(), 1);
        assert_eq!(as_host[0].id, conv.id);
        assert_eq!(as_applicant[0].id, conv.id);
    }

    #[test]
    fn list_for_unknown_user_fails() {
        let (repo, _, _) = setup();
        let result = repo.list_for_participant(&UserId::from_raw("user_missing"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn delete_removes_conversation_and_messages() {
        let (repo, host, applicant) = setup();
        let conv = repo.create_or_fetch(&host, &applicant).unwrap();
        repo.append_message(&ChatPayload::text(host.clone(), applicant.clone(), "bye"))
            .unwrap();

        repo.delete(&conv.id).unwrap();
        assert!(matches!(repo.get(&conv.id), Err(StoreError::NotFound(_))));
        assert!(repo.messages(&conv.id).unwrap().is_empty());
    }

    #[test]
    fn message_payload_projection_matches_wire_shape() {
        let (repo, host, applicant) = setup();
        repo.create_or_fetch(&host, &applicant).unwrap();
        let row = repo
            .append_message(&ChatPayload::text(host.clone(), applicant.clone(), "hello"))
            .unwrap();

        let json = serde_json::to_value(row.payload()).unwrap();
        assert_eq!(json["sender"], host.as_str());
        assert_eq!(json["recipient"], applicant.as_str());
        assert_eq!(json["text"], "hello");
        assert!(json.get("file").is_none());
    }
}
