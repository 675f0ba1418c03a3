use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use crate::souk::database::utils::{parse_timestamp, parse_uuid};
use crate::souk::database::{Database, DatabaseError};
use crate::types::MessageDomain;

/// Optional attachment on a general message. Listing messages never
/// carry media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPayload {
    pub url: String,
    pub mime_type: String,
    pub thumbnail_url: Option<String>,
}

/// A direct message between two users, from either domain.
///
/// `listing_id` being present means the row lives in `listing_messages`;
/// absent means `messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    pub listing_id: Option<i64>,
    pub media: Option<MediaPayload>,
}

/// Input for a not-yet-persisted message. Id and timestamp are assigned
/// on insert.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub listing_id: Option<i64>,
    pub media: Option<MediaPayload>,
}

impl Message {
    pub fn domain(&self) -> MessageDomain {
        if self.listing_id.is_some() {
            MessageDomain::Listing
        } else {
            MessageDomain::General
        }
    }

    /// The conversation participant other than `viewer`.
    pub fn counterpart(&self, viewer: &Uuid) -> Uuid {
        if self.sender_id == *viewer {
            self.receiver_id
        } else {
            self.sender_id
        }
    }

    pub fn involves(&self, user: &Uuid) -> bool {
        self.sender_id == *user || self.receiver_id == *user
    }
}

// Both tables decode through the same normalized projection: general
// queries select `NULL AS listing_id`, listing queries select NULL for
// the media columns.
impl<'r, R> sqlx::FromRow<'r, R> for Message
where
    R: Row,
    &'r str: sqlx::ColumnIndex<R>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    Option<String>: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    Option<i64>: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    bool: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    fn from_row(row: &'r R) -> std::result::Result<Self, sqlx::Error> {
        let media_url: Option<String> = row.try_get("media_url")?;
        let media = match media_url {
            Some(url) => {
                let mime_type: Option<String> = row.try_get("media_type")?;
                Some(MediaPayload {
                    url,
                    mime_type: mime_type.unwrap_or_else(|| "application/octet-stream".to_string()),
                    thumbnail_url: row.try_get("media_thumbnail_url")?,
                })
            }
            None => None,
        };

        Ok(Message {
            id: parse_uuid(row, "id")?,
            sender_id: parse_uuid(row, "sender_id")?,
            receiver_id: parse_uuid(row, "receiver_id")?,
            content: row.try_get("content")?,
            created_at: parse_timestamp(row, "created_at")?,
            is_read: row.try_get("is_read")?,
            listing_id: row.try_get("listing_id")?,
            media,
        })
    }
}

const GENERAL_PROJECTION: &str = "SELECT id, sender_id, receiver_id, content, created_at, is_read, \
     NULL AS listing_id, media_url, media_type, media_thumbnail_url FROM messages";

const LISTING_PROJECTION: &str = "SELECT id, sender_id, receiver_id, content, created_at, is_read, \
     listing_id, NULL AS media_url, NULL AS media_type, NULL AS media_thumbnail_url FROM listing_messages";

impl Message {
    /// Persists a draft into its domain table, assigning id and
    /// timestamp. Unread on arrival.
    ///
    /// Timestamps are monotonic within a domain: a message never gets a
    /// `created_at` at or before the domain's current maximum, even when
    /// the wall clock hasn't advanced.
    pub(crate) async fn append(
        draft: MessageDraft,
        database: &Database,
    ) -> Result<Message, DatabaseError> {
        let id = Uuid::new_v4();
        let now_ms = Utc::now().timestamp_millis();

        // The timestamp is computed inside the INSERT so two concurrent
        // appends cannot both observe the same domain maximum.
        let created_at_ms: i64 = match draft.listing_id {
            Some(listing_id) => {
                sqlx::query_scalar(
                    "INSERT INTO listing_messages (id, listing_id, sender_id, receiver_id, content, created_at, is_read) \
                     SELECT ?, ?, ?, ?, ?, MAX(?, COALESCE((SELECT MAX(created_at) + 1 FROM listing_messages), 0)), 0 \
                     RETURNING created_at",
                )
                .bind(id.to_string())
                .bind(listing_id)
                .bind(draft.sender_id.to_string())
                .bind(draft.receiver_id.to_string())
                .bind(&draft.content)
                .bind(now_ms)
                .fetch_one(&database.pool)
                .await?
            }
            None => {
                let (media_url, media_type, media_thumbnail_url) = match &draft.media {
                    Some(m) => (
                        Some(m.url.as_str()),
                        Some(m.mime_type.as_str()),
                        m.thumbnail_url.as_deref(),
                    ),
                    None => (None, None, None),
                };
                sqlx::query_scalar(
                    "INSERT INTO messages (id, sender_id, receiver_id, content, created_at, is_read, media_url, media_type, media_thumbnail_url) \
                     SELECT ?, ?, ?, ?, MAX(?, COALESCE((SELECT MAX(created_at) + 1 FROM messages), 0)), 0, ?, ?, ? \
                     RETURNING created_at",
                )
                .bind(id.to_string())
                .bind(draft.sender_id.to_string())
                .bind(draft.receiver_id.to_string())
                .bind(&draft.content)
                .bind(now_ms)
                .bind(media_url)
                .bind(media_type)
                .bind(media_thumbnail_url)
                .fetch_one(&database.pool)
                .await?
            }
        };
        let created_at = DateTime::from_timestamp_millis(created_at_ms)
            .ok_or_else(|| DatabaseError::InvalidColumn {
                column: "created_at".to_string(),
                reason: "timestamp out of range".to_string(),
            })?;

        let message = Message {
            id,
            sender_id: draft.sender_id,
            receiver_id: draft.receiver_id,
            content: draft.content,
            created_at,
            is_read: false,
            listing_id: draft.listing_id,
            media: draft.media,
        };

        tracing::debug!(
            target: "souk::database::messages::append",
            "Persisted {} message {} from {} to {}",
            message.domain(),
            message.id,
            message.sender_id,
            message.receiver_id
        );

        Ok(message)
    }

    /// Persists a row delivered by the change feed, inserting it or
    /// refreshing the existing row. The read flag only moves forward: a
    /// stale unread copy never flips a locally read row back.
    pub(crate) async fn save(&self, database: &Database) -> Result<(), DatabaseError> {
        match self.listing_id {
            Some(listing_id) => {
                sqlx::query(
                    "INSERT INTO listing_messages (id, listing_id, sender_id, receiver_id, content, created_at, is_read) \
                     VALUES (?, ?, ?, ?, ?, ?, ?) \
                     ON CONFLICT(id) DO UPDATE SET content = excluded.content, \
                     is_read = MAX(is_read, excluded.is_read)",
                )
                .bind(self.id.to_string())
                .bind(listing_id)
                .bind(self.sender_id.to_string())
                .bind(self.receiver_id.to_string())
                .bind(&self.content)
                .bind(self.created_at.timestamp_millis())
                .bind(self.is_read)
                .execute(&database.pool)
                .await?;
            }
            None => {
                let (media_url, media_type, media_thumbnail_url) = match &self.media {
                    Some(m) => (
                        Some(m.url.as_str()),
                        Some(m.mime_type.as_str()),
                        m.thumbnail_url.as_deref(),
                    ),
                    None => (None, None, None),
                };
                sqlx::query(
                    "INSERT INTO messages (id, sender_id, receiver_id, content, created_at, is_read, media_url, media_type, media_thumbnail_url) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
                     ON CONFLICT(id) DO UPDATE SET content = excluded.content, \
                     is_read = MAX(is_read, excluded.is_read)",
                )
                .bind(self.id.to_string())
                .bind(self.sender_id.to_string())
                .bind(self.receiver_id.to_string())
                .bind(&self.content)
                .bind(self.created_at.timestamp_millis())
                .bind(self.is_read)
                .bind(media_url)
                .bind(media_type)
                .bind(media_thumbnail_url)
                .execute(&database.pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Fetches one message by id from the given domain.
    pub(crate) async fn find(
        id: &Uuid,
        domain: MessageDomain,
        database: &Database,
    ) -> Result<Option<Message>, DatabaseError> {
        let query = match domain {
            MessageDomain::General => format!("{} WHERE id = ?", GENERAL_PROJECTION),
            MessageDomain::Listing => format!("{} WHERE id = ?", LISTING_PROJECTION),
        };
        let message = sqlx::query_as::<_, Message>(&query)
            .bind(id.to_string())
            .fetch_optional(&database.pool)
            .await?;
        Ok(message)
    }

    /// Every message the user sent or received, across both domains,
    /// oldest first with ids breaking timestamp ties.
    pub(crate) async fn all_for_user(
        user_id: &Uuid,
        database: &Database,
    ) -> Result<Vec<Message>, DatabaseError> {
        let query = format!(
            "SELECT * FROM ({} WHERE sender_id = ?1 OR receiver_id = ?1 \
             UNION ALL {} WHERE sender_id = ?1 OR receiver_id = ?1) \
             ORDER BY created_at ASC, id ASC",
            GENERAL_PROJECTION, LISTING_PROJECTION
        );
        let messages = sqlx::query_as::<_, Message>(&query)
            .bind(user_id.to_string())
            .fetch_all(&database.pool)
            .await?;
        Ok(messages)
    }

    /// Full history of one conversation, oldest first.
    pub(crate) async fn for_pair(
        viewer: &Uuid,
        other: &Uuid,
        listing_id: Option<i64>,
        database: &Database,
    ) -> Result<Vec<Message>, DatabaseError> {
        let messages = match listing_id {
            Some(listing) => {
                let query = format!(
                    "{} WHERE listing_id = ?3 AND \
                     ((sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1)) \
                     ORDER BY created_at ASC, id ASC",
                    LISTING_PROJECTION
                );
                sqlx::query_as::<_, Message>(&query)
                    .bind(viewer.to_string())
                    .bind(other.to_string())
                    .bind(listing)
                    .fetch_all(&database.pool)
                    .await?
            }
            None => {
                let query = format!(
                    "{} WHERE (sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1) \
                     ORDER BY created_at ASC, id ASC",
                    GENERAL_PROJECTION
                );
                sqlx::query_as::<_, Message>(&query)
                    .bind(viewer.to_string())
                    .bind(other.to_string())
                    .fetch_all(&database.pool)
                    .await?
            }
        };
        Ok(messages)
    }

    /// Ids of messages in one conversation that `viewer` has received
    /// but not yet read.
    pub(crate) async fn unread_ids_for_pair(
        viewer: &Uuid,
        other: &Uuid,
        listing_id: Option<i64>,
        database: &Database,
    ) -> Result<Vec<Uuid>, DatabaseError> {
        let rows: Vec<(String,)> = match listing_id {
            Some(listing) => {
                sqlx::query_as(
                    "SELECT id FROM listing_messages \
                     WHERE listing_id = ? AND receiver_id = ? AND sender_id = ? AND is_read = 0",
                )
                .bind(listing)
                .bind(viewer.to_string())
                .bind(other.to_string())
                .fetch_all(&database.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT id FROM messages \
                     WHERE receiver_id = ? AND sender_id = ? AND is_read = 0",
                )
                .bind(viewer.to_string())
                .bind(other.to_string())
                .fetch_all(&database.pool)
                .await?
            }
        };

        rows.iter()
            .map(|(raw,)| {
                Uuid::parse_str(raw).map_err(|e| DatabaseError::InvalidColumn {
                    column: "id".to_string(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    /// How many messages in one conversation the viewer has received
    /// but not read.
    pub(crate) async fn unread_count_for_pair(
        viewer: &Uuid,
        other: &Uuid,
        listing_id: Option<i64>,
        database: &Database,
    ) -> Result<u32, DatabaseError> {
        let (count,): (i64,) = match listing_id {
            Some(listing) => {
                sqlx::query_as(
                    "SELECT COUNT(*) FROM listing_messages \
                     WHERE listing_id = ? AND receiver_id = ? AND sender_id = ? AND is_read = 0",
                )
                .bind(listing)
                .bind(viewer.to_string())
                .bind(other.to_string())
                .fetch_one(&database.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT COUNT(*) FROM messages \
                     WHERE receiver_id = ? AND sender_id = ? AND is_read = 0",
                )
                .bind(viewer.to_string())
                .bind(other.to_string())
                .fetch_one(&database.pool)
                .await?
            }
        };
        Ok(count.max(0) as u32)
    }

    /// Flags the given messages read, but only rows addressed to
    /// `receiver`. Already-read rows are untouched, so the call is
    /// idempotent. Returns the number of rows that actually flipped.
    pub(crate) async fn mark_read(
        ids: &[Uuid],
        receiver: &Uuid,
        domain: MessageDomain,
        database: &Database,
    ) -> Result<u64, DatabaseError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let table = match domain {
            MessageDomain::General => "messages",
            MessageDomain::Listing => "listing_messages",
        };
        let placeholders = vec!["?"; ids.len()].join(", ");
        let query = format!(
            "UPDATE {} SET is_read = 1 WHERE receiver_id = ? AND is_read = 0 AND id IN ({})",
            table, placeholders
        );

        let mut q = sqlx::query(&query).bind(receiver.to_string());
        for id in ids {
            q = q.bind(id.to_string());
        }
        let result = q.execute(&database.pool).await?;
        Ok(result.rows_affected())
    }

    /// Flags every unread message addressed to `receiver` read, in both
    /// domains. Returns the number of rows flipped.
    pub(crate) async fn mark_all_read(
        receiver: &Uuid,
        database: &Database,
    ) -> Result<u64, DatabaseError> {
        let general = sqlx::query("UPDATE messages SET is_read = 1 WHERE receiver_id = ? AND is_read = 0")
            .bind(receiver.to_string())
            .execute(&database.pool)
            .await?;
        let listing = sqlx::query(
            "UPDATE listing_messages SET is_read = 1 WHERE receiver_id = ? AND is_read = 0",
        )
        .bind(receiver.to_string())
        .execute(&database.pool)
        .await?;
        Ok(general.rows_affected() + listing.rows_affected())
    }
}
