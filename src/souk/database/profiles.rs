use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use crate::souk::database::utils::{parse_timestamp, parse_uuid};
use crate::souk::database::{Database, DatabaseError};

/// Display data for a conversation counterpart, synced from the profile
/// service into a local cache table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: Uuid,
    pub username: String,
    pub avatar_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    /// Stand-in shown while the real profile has not been fetched yet.
    /// Conversation assembly never fails on a missing profile.
    pub fn placeholder(user_id: Uuid) -> Self {
        Self {
            user_id,
            username: "Unknown user".to_string(),
            avatar_url: None,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.updated_at == DateTime::<Utc>::UNIX_EPOCH
    }
}

impl<'r, R> sqlx::FromRow<'r, R> for Profile
where
    R: Row,
    &'r str: sqlx::ColumnIndex<R>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    Option<String>: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    fn from_row(row: &'r R) -> std::result::Result<Self, sqlx::Error> {
        Ok(Profile {
            user_id: parse_uuid(row, "user_id")?,
            username: row.try_get("username")?,
            avatar_url: row.try_get("avatar_url")?,
            updated_at: parse_timestamp(row, "updated_at")?,
        })
    }
}

impl Profile {
    pub(crate) async fn find(
        user_id: &Uuid,
        database: &Database,
    ) -> Result<Option<Profile>, DatabaseError> {
        let profile = sqlx::query_as::<_, Profile>("SELECT * FROM profiles WHERE user_id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&database.pool)
            .await?;
        Ok(profile)
    }

    pub(crate) async fn upsert(&self, database: &Database) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO profiles (user_id, username, avatar_url, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(user_id) DO UPDATE SET username = excluded.username, \
             avatar_url = excluded.avatar_url, updated_at = excluded.updated_at",
        )
        .bind(self.user_id.to_string())
        .bind(&self.username)
        .bind(&self.avatar_url)
        .bind(self.updated_at.timestamp_millis())
        .execute(&database.pool)
        .await?;
        Ok(())
    }
}
