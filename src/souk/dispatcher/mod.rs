use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub mod feed;

use crate::souk::conversations::{Conversation, ConversationKey, ConversationList, rebuild};
use crate::souk::database::Database;
use crate::souk::database::messages::Message;
use crate::souk::database::notifications::Notification;
use crate::souk::database::profiles::Profile;
use crate::souk::database::push_registrations::PushRegistration;
use crate::souk::dispatcher::feed::{ChangeEvent, ChangeFeed, ChangeKind};
use crate::souk::profiles::ProfileService;
use crate::souk::push::{PushPayload, PushSender};
use crate::types::ReconnectSchedule;
use crate::utils::retry::{RetryPolicy, execute_with_retry};

/// Connection state of a realtime session, surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveStatus {
    /// First connection attempt in progress.
    Connecting,
    /// Subscribed and applying change events.
    Live,
    /// Transport lost, reconnect attempts running.
    Reconnecting,
    /// Reconnect attempts exhausted. Local reads and writes still work;
    /// the list refreshes again once a new session starts.
    Degraded,
}

/// Instructions from local operations to the session's event loop.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    /// Fold a just-persisted message into the list immediately instead
    /// of waiting for the feed to echo it back.
    Apply(Box<Message>),
    /// One conversation's messages were just marked read; re-derive its
    /// count from storage.
    Refresh(ConversationKey),
    /// Everything was marked read.
    RefreshAll,
}

/// Handle to a running session. Dropping it does not stop the task;
/// send on `shutdown` for an orderly stop.
pub(crate) struct SessionHandle {
    pub(crate) conversations: watch::Receiver<Vec<Conversation>>,
    pub(crate) unread: watch::Receiver<u64>,
    pub(crate) status: watch::Receiver<LiveStatus>,
    pub(crate) commands: mpsc::Sender<SessionCommand>,
    pub(crate) shutdown: mpsc::Sender<()>,
    pub(crate) task: JoinHandle<()>,
}

/// Bounded memory of recently applied events.
///
/// The feed delivers at least once; this plus the notification ledger
/// turns application into at most once. Keyed on (id, kind) so a read
/// update for a message is not mistaken for a replay of its insert.
struct RecentIds {
    order: VecDeque<(Uuid, ChangeKind)>,
    seen: HashSet<(Uuid, ChangeKind)>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    fn contains(&self, id: &Uuid, kind: ChangeKind) -> bool {
        self.seen.contains(&(*id, kind))
    }

    fn insert(&mut self, id: Uuid, kind: ChangeKind) {
        if !self.seen.insert((id, kind)) {
            return;
        }
        self.order.push_back((id, kind));
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }
}

const RECENT_IDS_CAPACITY: usize = 512;

/// A subscribe attempt that hasn't produced a live channel by now
/// counts as a failed attempt against the backoff schedule.
const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

/// Per-user realtime session: subscribes to the change feed, keeps the
/// conversation list and unread badge current, and records arrivals in
/// the notification ledger.
pub(crate) struct Dispatcher {
    user_id: Uuid,
    database: Arc<Database>,
    profiles: Arc<dyn ProfileService>,
    push: PushSender,
    feed: Arc<dyn ChangeFeed>,
    retry: RetryPolicy,
    list: ConversationList,
    recent: RecentIds,
    conversations_tx: watch::Sender<Vec<Conversation>>,
    unread_tx: watch::Sender<u64>,
    status_tx: watch::Sender<LiveStatus>,
}

impl Dispatcher {
    pub(crate) fn spawn(
        user_id: Uuid,
        database: Arc<Database>,
        profiles: Arc<dyn ProfileService>,
        push: PushSender,
        feed: Arc<dyn ChangeFeed>,
        retry: RetryPolicy,
    ) -> SessionHandle {
        let (conversations_tx, conversations_rx) = watch::channel(Vec::new());
        let (unread_tx, unread_rx) = watch::channel(0);
        let (status_tx, status_rx) = watch::channel(LiveStatus::Connecting);
        let (command_tx, command_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let dispatcher = Dispatcher {
            user_id,
            database,
            profiles,
            push,
            feed,
            retry,
            list: ConversationList::new(user_id, Vec::new()),
            recent: RecentIds::new(RECENT_IDS_CAPACITY),
            conversations_tx,
            unread_tx,
            status_tx,
        };

        let task = tokio::spawn(dispatcher.run(command_rx, shutdown_rx));

        SessionHandle {
            conversations: conversations_rx,
            unread: unread_rx,
            status: status_rx,
            commands: command_tx,
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut shutdown: mpsc::Receiver<()>,
    ) {
        let mut schedule = ReconnectSchedule::new(self.retry.max_attempts, self.retry.base_delay);

        loop {
            let subscribed = match tokio::time::timeout(
                CONNECT_TIMEOUT,
                self.feed.subscribe(self.user_id),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(feed::FeedError::Connect("connect timed out".to_string())),
            };

            match subscribed {
                Ok(mut events) => {
                    schedule.reset();
                    // Reconnects rebuild too: anything missed while
                    // offline is folded in from storage.
                    if let Err(e) = self.rebuild_from_storage().await {
                        tracing::error!(
                            target: "souk::dispatcher::run",
                            "Failed to rebuild conversation list for {}: {}",
                            self.user_id,
                            e
                        );
                    }
                    self.status_tx.send_replace(LiveStatus::Live);
                    tracing::debug!(
                        target: "souk::dispatcher::run",
                        "Session live for {}",
                        self.user_id
                    );

                    loop {
                        tokio::select! {
                            event = events.recv() => match event {
                                Some(event) => self.handle_event(event).await,
                                None => {
                                    tracing::warn!(
                                        target: "souk::dispatcher::run",
                                        "Change feed lost for {}",
                                        self.user_id
                                    );
                                    break;
                                }
                            },
                            command = commands.recv() => match command {
                                Some(command) => self.handle_command(command).await,
                                // All handles dropped; the session is orphaned.
                                None => return,
                            },
                            _ = shutdown.recv() => {
                                self.drain_commands(&mut commands).await;
                                tracing::debug!(
                                    target: "souk::dispatcher::run",
                                    "Session for {} shut down",
                                    self.user_id
                                );
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        target: "souk::dispatcher::run",
                        "Change feed subscribe failed for {}: {}",
                        self.user_id,
                        e
                    );
                }
            }

            match schedule.next_delay() {
                Some(delay) => {
                    self.status_tx.send_replace(LiveStatus::Reconnecting);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.recv() => {
                            self.drain_commands(&mut commands).await;
                            return;
                        }
                    }
                }
                None => {
                    tracing::error!(
                        target: "souk::dispatcher::run",
                        "Reconnect attempts exhausted for {}, session degraded",
                        self.user_id
                    );
                    self.status_tx.send_replace(LiveStatus::Degraded);
                    // Keep serving local operations until shutdown.
                    loop {
                        tokio::select! {
                            command = commands.recv() => match command {
                                Some(command) => self.handle_command(command).await,
                                None => return,
                            },
                            _ = shutdown.recv() => {
                                self.drain_commands(&mut commands).await;
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn drain_commands(&mut self, commands: &mut mpsc::Receiver<SessionCommand>) {
        while let Ok(command) = commands.try_recv() {
            self.handle_command(command).await;
        }
    }

    /// Rebuilds the conversation list from the message store.
    async fn rebuild_from_storage(&mut self) -> crate::Result<()> {
        let messages = Message::all_for_user(&self.user_id, &self.database).await?;

        let mut profiles: HashMap<Uuid, Profile> = HashMap::new();
        for message in &messages {
            let other = message.counterpart(&self.user_id);
            if !profiles.contains_key(&other) {
                let profile = self.profiles.profile(&other).await;
                profiles.insert(other, profile);
            }
        }

        let conversations = rebuild(&self.user_id, &messages, &profiles);
        self.list = ConversationList::new(self.user_id, conversations);
        self.publish().await;
        Ok(())
    }

    /// Applies one change event end to end: dedup, hydrate, persist,
    /// ledger, aggregate, recount, publish.
    async fn handle_event(&mut self, event: ChangeEvent) {
        if self.recent.contains(&event.message_id, event.kind) {
            tracing::debug!(
                target: "souk::dispatcher::handle_event",
                "Dropping replayed {:?} event for message {}",
                event.kind,
                event.message_id
            );
            return;
        }

        let (message, embedded) = match event.row {
            Some(row) => (row, true),
            None => {
                // Thin frame; fetch the row ourselves.
                let id = event.message_id;
                let domain = event.domain;
                let database = self.database.clone();
                let fetched = execute_with_retry("change event hydration", &self.retry, || {
                    let database = database.clone();
                    async move { Message::find(&id, domain, &database).await }
                })
                .await;
                match fetched {
                    Ok(Some(message)) => (message, false),
                    Ok(None) => {
                        tracing::warn!(
                            target: "souk::dispatcher::handle_event",
                            "Change event for unknown message {}, skipping",
                            event.message_id
                        );
                        return;
                    }
                    // Left out of the recent set so a redelivery can
                    // succeed later.
                    Err(e) => {
                        tracing::error!(
                            target: "souk::dispatcher::handle_event",
                            "Failed to hydrate message {}: {}",
                            event.message_id,
                            e
                        );
                        return;
                    }
                }
            }
        };

        if !message.involves(&self.user_id) {
            return;
        }

        // Rows the feed carries are authoritative; persist them so
        // rebuilds and the per-key counts below see the same state.
        if embedded {
            let to_save = message.clone();
            let database = self.database.clone();
            let saved = execute_with_retry("change event persistence", &self.retry, || {
                let to_save = to_save.clone();
                let database = database.clone();
                async move { to_save.save(&database).await }
            })
            .await;
            // Left out of the recent set so a redelivery can retry.
            if let Err(e) = saved {
                tracing::error!(
                    target: "souk::dispatcher::handle_event",
                    "Failed to persist message {} from change event: {}",
                    message.id,
                    e
                );
                return;
            }
        }

        match event.kind {
            ChangeKind::Insert => {
                if message.receiver_id == self.user_id && !message.is_read {
                    match Notification::record(&message, &self.database).await {
                        Ok(Some(_)) => self.dispatch_push(&message).await,
                        Ok(None) => {
                            // Ledger already had this arrival; a replay
                            // the recent set had forgotten about.
                        }
                        Err(e) => {
                            tracing::error!(
                                target: "souk::dispatcher::handle_event",
                                "Failed to record notification for message {}: {}",
                                message.id,
                                e
                            );
                            return;
                        }
                    }
                }
            }
            ChangeKind::Update => {
                // Read transitions made elsewhere reach the ledger here.
                if message.receiver_id == self.user_id && message.is_read {
                    if let Err(e) =
                        Notification::mark_read_many(&self.user_id, &[message.id], &self.database)
                            .await
                    {
                        tracing::error!(
                            target: "souk::dispatcher::handle_event",
                            "Failed to mark notification read for message {}: {}",
                            message.id,
                            e
                        );
                        return;
                    }
                }
            }
        }

        let other = message.counterpart(&self.user_id);
        let profile = self.profiles.profile(&other).await;
        self.list.apply_message(&message, profile);
        self.refresh_unread_for(&ConversationKey::for_message(&message)).await;
        self.recent.insert(event.message_id, event.kind);
        self.publish().await;
    }

    /// Re-derives one conversation's unread count from the store so the
    /// incremental path always agrees with a full rebuild.
    async fn refresh_unread_for(&mut self, key: &ConversationKey) {
        let other = key.other_user(&self.user_id);
        match Message::unread_count_for_pair(&self.user_id, &other, key.listing_id, &self.database)
            .await
        {
            Ok(count) => self.list.set_unread(key, count),
            Err(e) => {
                tracing::warn!(
                    target: "souk::dispatcher::refresh_unread_for",
                    "Unread recount failed for {}: {}",
                    self.user_id,
                    e
                );
            }
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Apply(message) => {
                // Pre-mark the feed's echo of this insert as seen.
                self.recent.insert(message.id, ChangeKind::Insert);
                let other = message.counterpart(&self.user_id);
                let profile = self.profiles.profile(&other).await;
                self.list.apply_message(&message, profile);
                self.refresh_unread_for(&ConversationKey::for_message(&message)).await;
                self.publish().await;
            }
            SessionCommand::Refresh(key) => {
                self.refresh_unread_for(&key).await;
                self.publish().await;
            }
            SessionCommand::RefreshAll => {
                self.list.mark_all_read();
                self.publish().await;
            }
        }
    }

    async fn dispatch_push(&self, message: &Message) {
        let registration = match PushRegistration::find(&message.receiver_id, &self.database).await
        {
            Ok(Some(registration)) => registration,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(
                    target: "souk::dispatcher::dispatch_push",
                    "Push registration lookup failed for {}: {}",
                    message.receiver_id,
                    e
                );
                return;
            }
        };

        let sender_profile = self.profiles.profile(&message.sender_id).await;
        let payload = PushPayload::for_message(message, &sender_profile.username, registration.token);
        self.push.deliver_in_background(payload);
    }

    /// Publishes the current list and the ledger-derived unread badge.
    async fn publish(&self) {
        self.conversations_tx.send_replace(self.list.snapshot());

        let unread = match Notification::unread_count(&self.user_id, &self.database).await {
            Ok(count) => count.max(0) as u64,
            Err(e) => {
                tracing::warn!(
                    target: "souk::dispatcher::publish",
                    "Unread count query failed for {}: {}",
                    self.user_id,
                    e
                );
                self.list.total_unread()
            }
        };
        self.unread_tx.send_replace(unread);
    }
}
