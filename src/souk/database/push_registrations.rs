use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::souk::database::utils::{parse_timestamp, parse_uuid};
use crate::souk::database::{Database, DatabaseError};

/// Current push token for a user's device. One row per user; signing in
/// on a new device replaces the old token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRegistration {
    pub user_id: Uuid,
    pub token: String,
    pub updated_at: DateTime<Utc>,
}

impl<'r, R> sqlx::FromRow<'r, R> for PushRegistration
where
    R: Row,
    &'r str: sqlx::ColumnIndex<R>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    fn from_row(row: &'r R) -> std::result::Result<Self, sqlx::Error> {
        Ok(PushRegistration {
            user_id: parse_uuid(row, "user_id")?,
            token: row.try_get("token")?,
            updated_at: parse_timestamp(row, "updated_at")?,
        })
    }
}

impl PushRegistration {
    pub(crate) async fn upsert(
        user_id: &Uuid,
        token: &str,
        database: &Database,
    ) -> Result<PushRegistration, DatabaseError> {
        sqlx::query(
            "INSERT INTO push_registrations (user_id, token, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(user_id) DO UPDATE SET token = excluded.token, updated_at = excluded.updated_at",
        )
        .bind(user_id.to_string())
        .bind(token)
        .bind(Utc::now().timestamp_millis())
        .execute(&database.pool)
        .await?;

        let registration = sqlx::query_as::<_, PushRegistration>(
            "SELECT * FROM push_registrations WHERE user_id = ?",
        )
        .bind(user_id.to_string())
        .fetch_one(&database.pool)
        .await?;

        Ok(registration)
    }

    pub(crate) async fn find(
        user_id: &Uuid,
        database: &Database,
    ) -> Result<Option<PushRegistration>, DatabaseError> {
        let registration = sqlx::query_as::<_, PushRegistration>(
            "SELECT * FROM push_registrations WHERE user_id = ?",
        )
        .bind(user_id.to_string())
        .fetch_optional(&database.pool)
        .await?;
        Ok(registration)
    }

    pub(crate) async fn remove(user_id: &Uuid, database: &Database) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM push_registrations WHERE user_id = ?")
            .bind(user_id.to_string())
            .execute(&database.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::souk::database::test_utils::test_database;

    #[tokio::test]
    async fn test_upsert_replaces_token() {
        let db = test_database().await;
        let user = Uuid::new_v4();

        let first = PushRegistration::upsert(&user, "token-a", &db).await.unwrap();
        assert_eq!(first.token, "token-a");

        let second = PushRegistration::upsert(&user, "token-b", &db).await.unwrap();
        assert_eq!(second.token, "token-b");

        let found = PushRegistration::find(&user, &db).await.unwrap().unwrap();
        assert_eq!(found.token, "token-b");
    }

    #[tokio::test]
    async fn test_find_missing_and_remove() {
        let db = test_database().await;
        let user = Uuid::new_v4();

        assert!(PushRegistration::find(&user, &db).await.unwrap().is_none());

        PushRegistration::upsert(&user, "token", &db).await.unwrap();
        PushRegistration::remove(&user, &db).await.unwrap();
        assert!(PushRegistration::find(&user, &db).await.unwrap().is_none());
    }
}
