use uuid::Uuid;

use crate::error::{Result, SoukError};
use crate::souk::Souk;
use crate::souk::conversations::ConversationKey;
use crate::souk::database::messages::{MediaPayload, Message, MessageDraft};
use crate::souk::database::notifications::Notification;
use crate::souk::database::push_registrations::PushRegistration;
use crate::souk::dispatcher::SessionCommand;
use crate::souk::push::PushPayload;
use crate::types::MessageDomain;
use crate::utils::retry::execute_with_retry;

impl Souk {
    /// Persists a new message and records the receiver's notification.
    ///
    /// The message and its notification are written before this
    /// returns; push delivery and session updates happen off this path.
    /// A `listing_id` scopes the message to that listing's conversation
    /// and such messages cannot carry media.
    pub async fn send_message(
        &self,
        sender_id: Uuid,
        receiver_id: Uuid,
        content: String,
        listing_id: Option<i64>,
        media: Option<MediaPayload>,
    ) -> Result<Message> {
        if sender_id == receiver_id {
            return Err(SoukError::Validation(
                "cannot send a message to yourself".to_string(),
            ));
        }
        if content.trim().is_empty() && media.is_none() {
            return Err(SoukError::Validation(
                "message needs text content or a media payload".to_string(),
            ));
        }
        if listing_id.is_some() && media.is_some() {
            return Err(SoukError::Validation(
                "listing messages cannot carry media".to_string(),
            ));
        }

        let draft = MessageDraft {
            sender_id,
            receiver_id,
            content,
            listing_id,
            media,
        };
        let database = self.database.clone();
        let message = execute_with_retry("message append", &self.config.retry, || {
            let draft = draft.clone();
            let database = database.clone();
            async move { Message::append(draft, &database).await }
        })
        .await?;

        let recorded = execute_with_retry("notification record", &self.config.retry, || {
            let message = message.clone();
            let database = database.clone();
            async move { Notification::record(&message, &database).await }
        })
        .await?;

        if recorded.is_some() {
            self.push_to_receiver(&message).await;
        }

        // Update both participants' live sessions immediately; the feed
        // echo of this insert is absorbed when it arrives.
        self.session_command(&sender_id, SessionCommand::Apply(Box::new(message.clone())))
            .await;
        self.session_command(&receiver_id, SessionCommand::Apply(Box::new(message.clone())))
            .await;

        Ok(message)
    }

    async fn push_to_receiver(&self, message: &Message) {
        let registration = match PushRegistration::find(&message.receiver_id, &self.database).await
        {
            Ok(Some(registration)) => registration,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(
                    target: "souk::messages::push_to_receiver",
                    "Push registration lookup failed for {}: {}",
                    message.receiver_id,
                    e
                );
                return;
            }
        };
        let sender = self.profiles.profile(&message.sender_id).await;
        let payload = PushPayload::for_message(message, &sender.username, registration.token);
        self.push.deliver_in_background(payload);
    }

    /// Marks every unread message the viewer received in one
    /// conversation as read, in both the store and the ledger. Returns
    /// the number of messages that flipped. Safe to call repeatedly.
    pub async fn mark_conversation_read(
        &self,
        user_id: Uuid,
        key: ConversationKey,
    ) -> Result<u64> {
        let guard = self.read_guard(&user_id);
        let _permit = guard
            .acquire()
            .await
            .map_err(|e| SoukError::Other(anyhow::anyhow!("read guard closed: {}", e)))?;

        let other = key.other_user(&user_id);
        let domain = if key.listing_id.is_some() {
            MessageDomain::Listing
        } else {
            MessageDomain::General
        };

        let unread_ids =
            Message::unread_ids_for_pair(&user_id, &other, key.listing_id, &self.database).await?;
        if unread_ids.is_empty() {
            return Ok(0);
        }

        let flipped = Message::mark_read(&unread_ids, &user_id, domain, &self.database).await?;
        Notification::mark_read_many(&user_id, &unread_ids, &self.database).await?;

        self.session_command(&user_id, SessionCommand::Refresh(key)).await;

        tracing::debug!(
            target: "souk::messages::mark_conversation_read",
            "Marked {} messages read for {}",
            flipped,
            user_id
        );
        Ok(flipped)
    }

    /// Marks everything unread for the user as read, across both
    /// domains and the ledger. Returns the number of notifications that
    /// flipped.
    pub async fn mark_all_read(&self, user_id: Uuid) -> Result<u64> {
        let guard = self.read_guard(&user_id);
        let _permit = guard
            .acquire()
            .await
            .map_err(|e| SoukError::Other(anyhow::anyhow!("read guard closed: {}", e)))?;

        Message::mark_all_read(&user_id, &self.database).await?;
        let flipped = Notification::mark_all_read(&user_id, &self.database).await?;

        self.session_command(&user_id, SessionCommand::RefreshAll).await;
        Ok(flipped)
    }

    /// Full history of one conversation, oldest first.
    pub async fn conversation_messages(
        &self,
        user_id: Uuid,
        other_user: Uuid,
        listing_id: Option<i64>,
    ) -> Result<Vec<Message>> {
        let database = self.database.clone();
        let messages = execute_with_retry("conversation fetch", &self.config.retry, || {
            let database = database.clone();
            async move { Message::for_pair(&user_id, &other_user, listing_id, &database).await }
        })
        .await?;
        Ok(messages)
    }

    /// Registers (or replaces) the user's device push token.
    pub async fn register_push_token(&self, user_id: Uuid, token: String) -> Result<()> {
        if token.trim().is_empty() {
            return Err(SoukError::Validation("push token is empty".to_string()));
        }
        PushRegistration::upsert(&user_id, &token, &self.database).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::souk::database::notifications::Notification;
    use crate::souk::dispatcher::LiveStatus;
    use crate::souk::dispatcher::feed::{ChangeEvent, ChangeFeed, FeedError};
    use crate::souk::test_utils::create_test_souk;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Feed that stays connected and never produces events; local
    /// echoes drive the sessions in these tests.
    struct SilentFeed;

    #[async_trait]
    impl ChangeFeed for SilentFeed {
        async fn subscribe(
            &self,
            _user_id: Uuid,
        ) -> std::result::Result<mpsc::Receiver<ChangeEvent>, FeedError> {
            let (tx, rx) = mpsc::channel(8);
            // Keep the channel open for the session's lifetime.
            tokio::spawn(async move {
                tx.closed().await;
            });
            Ok(rx)
        }
    }

    async fn start_session(souk: &crate::Souk, user: Uuid) {
        souk.start_session_with_feed(user, Arc::new(SilentFeed)).unwrap();
        let mut status = souk.subscribe_live_status(&user).unwrap();
        for _ in 0..200 {
            if *status.borrow_and_update() == LiveStatus::Live {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session never went live");
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_send_message_validations() {
        let (souk, _data, _logs) = create_test_souk().await;
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        let self_send = souk
            .send_message(alice, alice, "hi me".to_string(), None, None)
            .await;
        assert!(matches!(self_send, Err(SoukError::Validation(_))));

        let empty = souk
            .send_message(alice, bob, "   ".to_string(), None, None)
            .await;
        assert!(matches!(empty, Err(SoukError::Validation(_))));

        let listing_media = souk
            .send_message(
                alice,
                bob,
                "look".to_string(),
                Some(3),
                Some(MediaPayload {
                    url: "https://cdn.example/x.jpg".to_string(),
                    mime_type: "image/jpeg".to_string(),
                    thumbnail_url: None,
                }),
            )
            .await;
        assert!(matches!(listing_media, Err(SoukError::Validation(_))));
    }

    #[tokio::test]
    async fn test_send_message_persists_and_records_notification() {
        let (souk, _data, _logs) = create_test_souk().await;
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        let message = souk
            .send_message(alice, bob, "hi".to_string(), None, None)
            .await
            .unwrap();

        let stored = Message::find(&message.id, MessageDomain::General, &souk.database)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.content, "hi");
        assert!(Notification::exists(&bob, &message.id, &souk.database).await.unwrap());
        assert_eq!(Notification::unread_count(&bob, &souk.database).await.unwrap(), 1);
    }

    // Scenario: A sends "hi" to B. B's list shows one conversation with
    // one unread and that message as the preview.
    #[tokio::test]
    async fn test_first_message_creates_conversation_for_receiver() {
        let (souk, _data, _logs) = create_test_souk().await;
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        start_session(&souk, bob).await;

        souk.send_message(alice, bob, "hi".to_string(), None, None)
            .await
            .unwrap();
        settle().await;

        let conversations = souk.subscribe_conversations(&bob).unwrap().borrow().clone();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].last_message.content, "hi");
        assert_eq!(conversations[0].unread_count, 1);
        assert_eq!(*souk.subscribe_unread_count(&bob).unwrap().borrow(), 1);
    }

    // Scenario: B replies in the same key. A's preview updates and the
    // conversation leads the list; B's own unread count stays zero.
    #[tokio::test]
    async fn test_reply_updates_preview_and_order() {
        let (souk, _data, _logs) = create_test_souk().await;
        let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        start_session(&souk, alice).await;
        start_session(&souk, bob).await;

        souk.send_message(alice, bob, "hi".to_string(), None, None)
            .await
            .unwrap();
        // A second conversation so reordering is observable.
        souk.send_message(carol, alice, "unrelated".to_string(), None, None)
            .await
            .unwrap();
        souk.send_message(bob, alice, "re: hi".to_string(), None, None)
            .await
            .unwrap();
        settle().await;

        let for_alice = souk.subscribe_conversations(&alice).unwrap().borrow().clone();
        assert_eq!(for_alice.len(), 2);
        assert_eq!(for_alice[0].last_message.content, "re: hi");
        assert_eq!(for_alice[0].other_user.user_id, bob);

        let for_bob = souk.subscribe_conversations(&bob).unwrap().borrow().clone();
        let bobs = for_bob.iter().find(|c| c.other_user.user_id == alice).unwrap();
        assert_eq!(bobs.last_message.content, "re: hi");
        assert_eq!(bobs.unread_count, 1);
        // Bob's own reply is not unread for him.
        assert_eq!(*souk.subscribe_unread_count(&bob).unwrap().borrow(), 1);
    }

    // Scenario: a listing-scoped and a general message between the same
    // pair yield two distinct conversations.
    #[tokio::test]
    async fn test_listing_scope_splits_conversations() {
        let (souk, _data, _logs) = create_test_souk().await;
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        start_session(&souk, bob).await;

        souk.send_message(alice, bob, "about the bike".to_string(), Some(42), None)
            .await
            .unwrap();
        souk.send_message(alice, bob, "hey".to_string(), None, None)
            .await
            .unwrap();
        settle().await;

        let conversations = souk.subscribe_conversations(&bob).unwrap().borrow().clone();
        assert_eq!(conversations.len(), 2);
        let listing = conversations.iter().find(|c| c.key.listing_id == Some(42)).unwrap();
        assert_eq!(listing.last_message.content, "about the bike");
        assert_eq!(*souk.subscribe_unread_count(&bob).unwrap().borrow(), 2);
    }

    // Scenario: mark_all_read clears the badge and every conversation
    // count without touching message contents.
    #[tokio::test]
    async fn test_mark_all_read_clears_everything() {
        let (souk, _data, _logs) = create_test_souk().await;
        let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        start_session(&souk, bob).await;

        let first = souk
            .send_message(alice, bob, "hi".to_string(), None, None)
            .await
            .unwrap();
        souk.send_message(carol, bob, "yo".to_string(), None, None)
            .await
            .unwrap();
        settle().await;

        let flipped = souk.mark_all_read(bob).await.unwrap();
        assert_eq!(flipped, 2);
        settle().await;

        assert_eq!(*souk.subscribe_unread_count(&bob).unwrap().borrow(), 0);
        let conversations = souk.subscribe_conversations(&bob).unwrap().borrow().clone();
        assert!(conversations.iter().all(|c| c.unread_count == 0));

        let stored = Message::find(&first.id, MessageDomain::General, &souk.database)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.content, "hi");
        assert_eq!(stored.created_at, first.created_at);

        // Second call is a no-op.
        assert_eq!(souk.mark_all_read(bob).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_conversation_read_is_scoped_and_idempotent() {
        let (souk, _data, _logs) = create_test_souk().await;
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        start_session(&souk, bob).await;

        let general = souk
            .send_message(alice, bob, "general".to_string(), None, None)
            .await
            .unwrap();
        souk.send_message(alice, bob, "listing".to_string(), Some(7), None)
            .await
            .unwrap();
        settle().await;

        let key = ConversationKey::for_message(&general);
        assert_eq!(souk.mark_conversation_read(bob, key).await.unwrap(), 1);
        assert_eq!(souk.mark_conversation_read(bob, key).await.unwrap(), 0);
        settle().await;

        // The listing conversation is untouched.
        assert_eq!(Notification::unread_count(&bob, &souk.database).await.unwrap(), 1);
        let conversations = souk.subscribe_conversations(&bob).unwrap().borrow().clone();
        let listing = conversations.iter().find(|c| c.key.listing_id == Some(7)).unwrap();
        assert_eq!(listing.unread_count, 1);
    }

    // Per-conversation counts and the ledger badge stay equal through
    // sends and reads.
    #[tokio::test]
    async fn test_unread_counts_stay_consistent() {
        let (souk, _data, _logs) = create_test_souk().await;
        let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        start_session(&souk, bob).await;

        souk.send_message(alice, bob, "one".to_string(), None, None).await.unwrap();
        souk.send_message(alice, bob, "two".to_string(), None, None).await.unwrap();
        let from_carol = souk
            .send_message(carol, bob, "three".to_string(), Some(9), None)
            .await
            .unwrap();
        settle().await;

        let check = |conversations: Vec<crate::Conversation>, badge: u64| {
            let sum: u64 = conversations.iter().map(|c| c.unread_count as u64).sum();
            assert_eq!(sum, badge);
        };

        check(
            souk.subscribe_conversations(&bob).unwrap().borrow().clone(),
            *souk.subscribe_unread_count(&bob).unwrap().borrow(),
        );

        souk.mark_conversation_read(bob, ConversationKey::for_message(&from_carol))
            .await
            .unwrap();
        settle().await;

        check(
            souk.subscribe_conversations(&bob).unwrap().borrow().clone(),
            *souk.subscribe_unread_count(&bob).unwrap().borrow(),
        );
        assert_eq!(*souk.subscribe_unread_count(&bob).unwrap().borrow(), 2);
    }

    #[tokio::test]
    async fn test_conversation_messages_ordering() {
        let (souk, _data, _logs) = create_test_souk().await;
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        souk.send_message(alice, bob, "first".to_string(), None, None).await.unwrap();
        souk.send_message(bob, alice, "second".to_string(), None, None).await.unwrap();
        souk.send_message(alice, bob, "third".to_string(), None, None).await.unwrap();

        let history = souk.conversation_messages(alice, bob, None).await.unwrap();
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_register_push_token_validates() {
        let (souk, _data, _logs) = create_test_souk().await;
        let user = Uuid::new_v4();

        assert!(matches!(
            souk.register_push_token(user, "  ".to_string()).await,
            Err(SoukError::Validation(_))
        ));
        souk.register_push_token(user, "device-token".to_string()).await.unwrap();

        let registration = PushRegistration::find(&user, &souk.database).await.unwrap().unwrap();
        assert_eq!(registration.token, "device-token");
    }

    #[tokio::test]
    async fn test_sign_out_cleans_up_session() {
        let (souk, _data, _logs) = create_test_souk().await;
        let bob = Uuid::new_v4();
        start_session(&souk, bob).await;
        souk.register_push_token(bob, "tok".to_string()).await.unwrap();

        souk.sign_out(bob).await.unwrap();

        assert!(matches!(
            souk.subscribe_conversations(&bob),
            Err(SoukError::SessionNotActive)
        ));
        assert!(PushRegistration::find(&bob, &souk.database).await.unwrap().is_none());
    }
}
