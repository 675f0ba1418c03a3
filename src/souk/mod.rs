use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use uuid::Uuid;

pub mod conversations;
pub mod database;
pub mod dispatcher;
pub mod messages;
pub mod profiles;
pub mod push;

use crate::error::{Result, SoukError};
use crate::souk::conversations::Conversation;
use crate::souk::database::Database;
use crate::souk::database::push_registrations::PushRegistration;
use crate::souk::dispatcher::feed::{ChangeFeed, WebsocketFeed};
use crate::souk::dispatcher::{Dispatcher, LiveStatus, SessionHandle};
use crate::souk::profiles::{CachedProfileService, ProfileService};
use crate::souk::push::PushSender;
use crate::utils::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct SoukConfig {
    pub data_dir: PathBuf,
    pub logs_dir: PathBuf,
    /// Websocket url of the realtime gateway. Absent means sessions can
    /// only be started with an injected feed.
    pub realtime_url: Option<String>,
    /// HTTP endpoint of the push gateway. Absent disables push.
    pub push_endpoint: Option<String>,
    pub retry: RetryPolicy,
}

impl SoukConfig {
    pub fn new(data_dir: &std::path::Path, logs_dir: &std::path::Path) -> Self {
        let env_suffix = if cfg!(debug_assertions) { "dev" } else { "release" };
        let formatted_data_dir = data_dir.join(env_suffix);
        let formatted_logs_dir = logs_dir.join(env_suffix);

        dotenvy::dotenv().ok();

        Self {
            data_dir: formatted_data_dir,
            logs_dir: formatted_logs_dir,
            realtime_url: std::env::var("SOUK_REALTIME_URL").ok(),
            push_endpoint: std::env::var("SOUK_PUSH_URL").ok(),
            retry: RetryPolicy::default(),
        }
    }
}

/// The conversation and notification core, explicitly constructed and
/// handed to the UI layer. One instance per process; sessions within it
/// are per signed-in user.
pub struct Souk {
    pub config: SoukConfig,
    pub(crate) database: Arc<Database>,
    pub(crate) profiles: Arc<dyn ProfileService>,
    pub(crate) push: PushSender,
    pub(crate) sessions: DashMap<Uuid, SessionHandle>,
    pub(crate) read_guards: DashMap<Uuid, Arc<Semaphore>>,
}

impl Souk {
    /// Creates directories, wires logging, opens the database, and
    /// returns a ready service.
    pub async fn initialize(config: SoukConfig) -> Result<Souk> {
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.logs_dir)?;

        crate::init_tracing(&config.logs_dir)?;
        tracing::debug!(target: "souk::initialize", "Initializing souk core");

        let database = Arc::new(Database::new(&config.data_dir.join("souk.sqlite")).await?);
        let profiles: Arc<dyn ProfileService> =
            Arc::new(CachedProfileService::new(database.clone()));
        let push = PushSender::new(config.push_endpoint.clone(), config.retry.clone());

        Ok(Souk {
            config,
            database,
            profiles,
            push,
            sessions: DashMap::new(),
            read_guards: DashMap::new(),
        })
    }

    /// Starts a realtime session for the user against the configured
    /// gateway.
    pub async fn sign_in(&self, user_id: Uuid) -> Result<()> {
        let url = self.config.realtime_url.clone().ok_or_else(|| {
            SoukError::Configuration("no realtime gateway url configured".to_string())
        })?;
        self.start_session_with_feed(user_id, Arc::new(WebsocketFeed::new(url)))
    }

    /// Starts a session over an arbitrary feed. This is the seam tests
    /// use to drive sessions without a live gateway.
    pub fn start_session_with_feed(&self, user_id: Uuid, feed: Arc<dyn ChangeFeed>) -> Result<()> {
        if let Some((_, previous)) = self.sessions.remove(&user_id) {
            tracing::debug!(
                target: "souk::sign_in",
                "Replacing existing session for {}",
                user_id
            );
            previous.shutdown.try_send(()).ok();
        }

        let handle = Dispatcher::spawn(
            user_id,
            self.database.clone(),
            self.profiles.clone(),
            self.push.clone(),
            feed,
            self.config.retry.clone(),
        );
        self.sessions.insert(user_id, handle);
        Ok(())
    }

    /// Stops the user's session and forgets their push token. State for
    /// other signed-in users is untouched.
    pub async fn sign_out(&self, user_id: Uuid) -> Result<()> {
        if let Some((_, handle)) = self.sessions.remove(&user_id) {
            handle.shutdown.send(()).await.ok();
            handle.task.await.ok();
        }
        self.read_guards.remove(&user_id);
        PushRegistration::remove(&user_id, &self.database).await?;
        tracing::debug!(target: "souk::sign_out", "Session for {} ended", user_id);
        Ok(())
    }

    /// Live view of the user's conversation list, newest first.
    pub fn subscribe_conversations(&self, user_id: &Uuid) -> Result<watch::Receiver<Vec<Conversation>>> {
        let handle = self
            .sessions
            .get(user_id)
            .ok_or(SoukError::SessionNotActive)?;
        Ok(handle.conversations.clone())
    }

    /// Live app-wide unread badge count, derived from the notification
    /// ledger.
    pub fn subscribe_unread_count(&self, user_id: &Uuid) -> Result<watch::Receiver<u64>> {
        let handle = self
            .sessions
            .get(user_id)
            .ok_or(SoukError::SessionNotActive)?;
        Ok(handle.unread.clone())
    }

    /// Connection state of the user's realtime session.
    pub fn subscribe_live_status(&self, user_id: &Uuid) -> Result<watch::Receiver<LiveStatus>> {
        let handle = self
            .sessions
            .get(user_id)
            .ok_or(SoukError::SessionNotActive)?;
        Ok(handle.status.clone())
    }

    /// Ends every session and wipes local storage back to an empty
    /// schema.
    pub async fn delete_all_data(&self) -> Result<()> {
        let users: Vec<Uuid> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for user_id in users {
            if let Some((_, handle)) = self.sessions.remove(&user_id) {
                handle.shutdown.send(()).await.ok();
                handle.task.await.ok();
            }
        }
        self.read_guards.clear();
        self.database.delete_all_data().await?;
        Ok(())
    }

    /// Serializes read-marking per user so concurrent calls cannot race
    /// the unread counters.
    pub(crate) fn read_guard(&self, user_id: &Uuid) -> Arc<Semaphore> {
        self.read_guards
            .entry(*user_id)
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    pub(crate) async fn session_command(
        &self,
        user_id: &Uuid,
        command: dispatcher::SessionCommand,
    ) {
        if let Some(handle) = self.sessions.get(user_id) {
            if handle.commands.send(command).await.is_err() {
                tracing::warn!(
                    target: "souk::session_command",
                    "Session task for {} is gone",
                    user_id
                );
            }
        }
    }
}
