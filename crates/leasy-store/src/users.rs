use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use leasy_core::ids::UserId;

use crate::database::Database;
use crate::error::StoreError;

/// Display identity resolved from the user directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Identity {
    pub id: UserId,
    pub firstname: String,
    pub lastname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_picture: Option<String>,
}

/// Identity plus the notification state the chat core maintains for it:
/// the set of counterparties with unacknowledged messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(flatten)]
    pub identity: Identity,
    pub unread_from: Vec<UserId>,
}

pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a user with a generated id.
    #[instrument(skip(self), fields(firstname, lastname))]
    pub fn create(
        &self,
        firstname: &str,
        lastname: &str,
        profile_picture: Option<&str>,
    ) -> Result<Identity, StoreError> {
        let id = UserId::new();
        self.insert(&id, firstname, lastname, profile_picture)?;
        Ok(Identity {
            id,
            firstname: firstname.to_string(),
            lastname: lastname.to_string(),
            profile_picture: profile_picture.map(str::to_string),
        })
    }

    /// Insert a user under an externally-issued id.
    pub fn insert(
        &self,
        id: &UserId,
        firstname: &str,
        lastname: &str,
        profile_picture: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, firstname, lastname, profile_picture, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id.as_str(), firstname, lastname, profile_picture, now],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::Conflict(format!("user {id} already exists"))
                }
                other => StoreError::from(other),
            })?;
            Ok(())
        })
    }

    /// Resolve a user id to its display identity.
    #[instrument(skip(self), fields(user_id = %id))]
    pub fn get(&self, id: &UserId) -> Result<Identity, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, firstname, lastname, profile_picture FROM users WHERE id = ?1",
                [id.as_str()],
                |row| {
                    Ok(Identity {
                        id: UserId::from_raw(row.get::<_, String>(0)?),
                        firstname: row.get(1)?,
                        lastname: row.get(2)?,
                        profile_picture: row.get(3)?,
                    })
                },
            )
            .map_err(|_| StoreError::NotFound(format!("user {id}")))
        })
    }

    pub fn exists(&self, id: &UserId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM users WHERE id = ?1",
                [id.as_str()],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    /// Identity plus unread counterparties, for profile fetches.
    #[instrument(skip(self), fields(user_id = %id))]
    pub fn profile(&self, id: &UserId) -> Result<UserProfile, StoreError> {
        let identity = self.get(id)?;
        let unread_from = self.unread_from(id)?;
        Ok(UserProfile {
            identity,
            unread_from,
        })
    }

    /// Mark that `recipient` has unread messages from `sender`.
    /// Set semantics: marking twice is the same as marking once.
    #[instrument(skip(self), fields(recipient = %recipient, sender = %sender))]
    pub fn add_unread(&self, recipient: &UserId, sender: &UserId) -> Result<(), StoreError> {
        if !self.exists(recipient)? {
            return Err(StoreError::NotFound(format!("user {recipient}")));
        }
        if !self.exists(sender)? {
            return Err(StoreError::NotFound(format!("user {sender}")));
        }
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO unread_markers (user_id, counterparty_id, created_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![recipient.as_str(), sender.as_str(), now],
            )?;
            Ok(())
        })
    }

    /// Clear the unread marker for `sender`'s messages to `recipient`.
    /// Clearing an absent marker is a no-op.
    #[instrument(skip(self), fields(recipient = %recipient, sender = %sender))]
    pub fn remove_unread(&self, recipient: &UserId, sender: &UserId) -> Result<(), StoreError> {
        if !self.exists(recipient)? {
            return Err(StoreError::NotFound(format!("user {recipient}")));
        }
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM unread_markers WHERE user_id = ?1 AND counterparty_id = ?2",
                rusqlite::params![recipient.as_str(), sender.as_str()],
            )?;
            Ok(())
        })
    }

    /// Counterparties with unacknowledged messages for this user.
    pub fn unread_from(&self, recipient: &UserId) -> Result<Vec<UserId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT counterparty_id FROM unread_markers
                 WHERE user_id = ?1 ORDER BY created_at ASC",
            )?;
            let ids = stmt
                .query_map([recipient.as_str()], |row| {
                    Ok(UserId::from_raw(row.get::<_, String>(0)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }
}
