use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::souk::database::Database;
use crate::souk::database::profiles::Profile;

/// Source of display profiles for conversation counterparts.
///
/// Lookups are infallible: a miss or storage failure yields a
/// placeholder so the conversation list can always render.
#[async_trait]
pub trait ProfileService: Send + Sync + 'static {
    async fn profile(&self, user_id: &Uuid) -> Profile;
}

/// Reads the locally synced profile cache table.
pub struct CachedProfileService {
    database: Arc<Database>,
}

impl CachedProfileService {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }
}

#[async_trait]
impl ProfileService for CachedProfileService {
    async fn profile(&self, user_id: &Uuid) -> Profile {
        match Profile::find(user_id, &self.database).await {
            Ok(Some(profile)) => profile,
            Ok(None) => Profile::placeholder(*user_id),
            Err(e) => {
                tracing::warn!(
                    target: "souk::profiles",
                    "Profile lookup for {} failed ({}), using placeholder",
                    user_id,
                    e
                );
                Profile::placeholder(*user_id)
            }
        }
    }
}
