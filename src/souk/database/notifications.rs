use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use crate::souk::database::utils::{parse_timestamp, parse_uuid};
use crate::souk::database::{Database, DatabaseError};
use crate::souk::database::messages::Message;
use crate::types::MessageDomain;

/// Durable record that a message arrived for a recipient.
///
/// At most one row exists per (user, message), which is what lets the
/// dispatcher replay a change event without double-counting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub user_id: Uuid,
    pub message_id: Uuid,
    pub message_domain: MessageDomain,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl<'r, R> sqlx::FromRow<'r, R> for Notification
where
    R: Row,
    &'r str: sqlx::ColumnIndex<R>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    bool: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    fn from_row(row: &'r R) -> std::result::Result<Self, sqlx::Error> {
        let domain_raw: String = row.try_get("message_domain")?;
        let message_domain = domain_raw.parse().map_err(|reason: String| {
            sqlx::Error::ColumnDecode {
                index: "message_domain".to_string(),
                source: reason.into(),
            }
        })?;

        Ok(Notification {
            id: row.try_get("id")?,
            user_id: parse_uuid(row, "user_id")?,
            message_id: parse_uuid(row, "message_id")?,
            message_domain,
            is_read: row.try_get("is_read")?,
            created_at: parse_timestamp(row, "created_at")?,
        })
    }
}

impl Notification {
    /// Records the arrival of `message` for its receiver.
    ///
    /// Returns the new row, or `None` when a row for this (user,
    /// message) already exists. The unread state of an existing row is
    /// never touched.
    pub(crate) async fn record(
        message: &Message,
        database: &Database,
    ) -> Result<Option<Notification>, DatabaseError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO notifications (user_id, message_id, message_domain, is_read, created_at) \
             VALUES (?, ?, ?, 0, ?)",
        )
        .bind(message.receiver_id.to_string())
        .bind(message.id.to_string())
        .bind(message.domain().as_str())
        .bind(Utc::now().timestamp_millis())
        .execute(&database.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(
                target: "souk::database::notifications::record",
                "Notification for message {} already recorded for {}",
                message.id,
                message.receiver_id
            );
            return Ok(None);
        }

        let notification = sqlx::query_as::<_, Notification>(
            "SELECT * FROM notifications WHERE user_id = ? AND message_id = ?",
        )
        .bind(message.receiver_id.to_string())
        .bind(message.id.to_string())
        .fetch_one(&database.pool)
        .await?;

        Ok(Some(notification))
    }

    pub(crate) async fn exists(
        user_id: &Uuid,
        message_id: &Uuid,
        database: &Database,
    ) -> Result<bool, DatabaseError> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM notifications WHERE user_id = ? AND message_id = ?)",
        )
        .bind(user_id.to_string())
        .bind(message_id.to_string())
        .fetch_one(&database.pool)
        .await?;
        Ok(row.0)
    }

    /// Flags a single notification read, as when the user taps one
    /// banner. Returns whether the row actually flipped.
    pub async fn mark_read(id: i64, database: &Database) -> Result<bool, DatabaseError> {
        let result =
            sqlx::query("UPDATE notifications SET is_read = 1 WHERE id = ? AND is_read = 0")
                .bind(id)
                .execute(&database.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Flags the recipient's notifications for the given messages read.
    /// Rows already read stay read.
    pub(crate) async fn mark_read_many(
        user_id: &Uuid,
        message_ids: &[Uuid],
        database: &Database,
    ) -> Result<u64, DatabaseError> {
        if message_ids.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; message_ids.len()].join(", ");
        let query = format!(
            "UPDATE notifications SET is_read = 1 \
             WHERE user_id = ? AND is_read = 0 AND message_id IN ({})",
            placeholders
        );

        let mut q = sqlx::query(&query).bind(user_id.to_string());
        for id in message_ids {
            q = q.bind(id.to_string());
        }
        let result = q.execute(&database.pool).await?;
        Ok(result.rows_affected())
    }

    /// Flags every unread notification for the user read. Returns the
    /// number of rows flipped.
    pub(crate) async fn mark_all_read(
        user_id: &Uuid,
        database: &Database,
    ) -> Result<u64, DatabaseError> {
        let result =
            sqlx::query("UPDATE notifications SET is_read = 1 WHERE user_id = ? AND is_read = 0")
                .bind(user_id.to_string())
                .execute(&database.pool)
                .await?;
        Ok(result.rows_affected())
    }

    /// Count of unread notifications, the app badge's source of truth.
    pub async fn unread_count(
        user_id: &Uuid,
        database: &Database,
    ) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM notifications WHERE user_id = ? AND is_read = 0",
        )
        .bind(user_id.to_string())
        .fetch_one(&database.pool)
        .await?;
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::souk::database::messages::MessageDraft;
    use crate::souk::database::test_utils::test_database;

    async fn incoming(db: &Database, sender: Uuid, receiver: Uuid) -> Message {
        Message::append(
            MessageDraft {
                sender_id: sender,
                receiver_id: receiver,
                content: "hi".to_string(),
                listing_id: None,
                media: None,
            },
            db,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_record_is_idempotent() {
        let db = test_database().await;
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let message = incoming(&db, bob, alice).await;

        let first = Notification::record(&message, &db).await.unwrap();
        assert!(first.is_some());
        let notification = first.unwrap();
        assert_eq!(notification.user_id, alice);
        assert_eq!(notification.message_id, message.id);
        assert_eq!(notification.message_domain, MessageDomain::General);
        assert!(!notification.is_read);

        // Replay of the same event is absorbed.
        let second = Notification::record(&message, &db).await.unwrap();
        assert!(second.is_none());
        assert_eq!(Notification::unread_count(&alice, &db).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_replay_does_not_resurrect_read_row() {
        let db = test_database().await;
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let message = incoming(&db, bob, alice).await;

        Notification::record(&message, &db).await.unwrap();
        Notification::mark_read_many(&alice, &[message.id], &db).await.unwrap();
        assert_eq!(Notification::unread_count(&alice, &db).await.unwrap(), 0);

        Notification::record(&message, &db).await.unwrap();
        assert_eq!(Notification::unread_count(&alice, &db).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_read_single_flips_once() {
        let db = test_database().await;
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let message = incoming(&db, bob, alice).await;
        let notification = Notification::record(&message, &db).await.unwrap().unwrap();

        assert!(Notification::mark_read(notification.id, &db).await.unwrap());
        assert!(!Notification::mark_read(notification.id, &db).await.unwrap());
        assert_eq!(Notification::unread_count(&alice, &db).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_read_many_scoped_to_user() {
        let db = test_database().await;
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let to_alice = incoming(&db, bob, alice).await;
        let to_bob = incoming(&db, alice, bob).await;

        Notification::record(&to_alice, &db).await.unwrap();
        Notification::record(&to_bob, &db).await.unwrap();

        // Alice marking bob's message id does nothing to bob's row.
        let flipped = Notification::mark_read_many(&alice, &[to_alice.id, to_bob.id], &db)
            .await
            .unwrap();
        assert_eq!(flipped, 1);
        assert_eq!(Notification::unread_count(&bob, &db).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mark_all_read() {
        let db = test_database().await;
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        for _ in 0..3 {
            let m = incoming(&db, bob, alice).await;
            Notification::record(&m, &db).await.unwrap();
        }

        assert_eq!(Notification::unread_count(&alice, &db).await.unwrap(), 3);
        assert_eq!(Notification::mark_all_read(&alice, &db).await.unwrap(), 3);
        assert_eq!(Notification::unread_count(&alice, &db).await.unwrap(), 0);
        assert_eq!(Notification::mark_all_read(&alice, &db).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_exists() {
        let db = test_database().await;
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let message = incoming(&db, bob, alice).await;

        assert!(!Notification::exists(&alice, &message.id, &db).await.unwrap());
        Notification::record(&message, &db).await.unwrap();
        assert!(Notification::exists(&alice, &message.id, &db).await.unwrap());
    }
}
