use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::souk::database::messages::Message;
use crate::souk::database::profiles::Profile;

/// Identity of one conversation: the unordered pair of participants
/// plus the listing scope, if any.
///
/// The pair is stored ordered so both participants derive the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub user_a: Uuid,
    pub user_b: Uuid,
    pub listing_id: Option<i64>,
}

impl ConversationKey {
    pub fn new(first: Uuid, second: Uuid, listing_id: Option<i64>) -> Self {
        let (user_a, user_b) = if first <= second {
            (first, second)
        } else {
            (second, first)
        };
        Self {
            user_a,
            user_b,
            listing_id,
        }
    }

    pub fn for_message(message: &Message) -> Self {
        Self::new(message.sender_id, message.receiver_id, message.listing_id)
    }

    /// The participant that is not `viewer`.
    pub fn other_user(&self, viewer: &Uuid) -> Uuid {
        if self.user_a == *viewer {
            self.user_b
        } else {
            self.user_a
        }
    }
}

/// One row of the user's conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub key: ConversationKey,
    pub other_user: Profile,
    pub last_message: Message,
    pub unread_count: u32,
}

/// Outcome of feeding one message into a [`ConversationList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationDelta {
    /// A new conversation appeared.
    Created,
    /// An existing conversation changed (preview, position, or unread).
    Updated,
    /// The message added nothing the list didn't already show.
    Unchanged,
}

/// Total order on messages used everywhere a winner must be picked:
/// later timestamp wins, ids break exact ties.
fn message_order(message: &Message) -> (chrono::DateTime<chrono::Utc>, Uuid) {
    (message.created_at, message.id)
}

/// Groups a user's full message history into conversations.
///
/// Each conversation shows its latest message and the count of messages
/// the viewer has received but not read. Missing profiles fall back to
/// a placeholder rather than dropping the conversation.
pub(crate) fn rebuild(
    viewer: &Uuid,
    messages: &[Message],
    profiles: &HashMap<Uuid, Profile>,
) -> Vec<Conversation> {
    let mut grouped: HashMap<ConversationKey, (Message, u32)> = HashMap::new();

    for message in messages {
        if !message.involves(viewer) {
            continue;
        }
        let key = ConversationKey::for_message(message);
        let unread_here = (message.receiver_id == *viewer && !message.is_read) as u32;

        match grouped.get_mut(&key) {
            Some((last, unread)) => {
                if message_order(message) > message_order(last) {
                    *last = message.clone();
                }
                *unread += unread_here;
            }
            None => {
                grouped.insert(key, (message.clone(), unread_here));
            }
        }
    }

    let mut conversations: Vec<Conversation> = grouped
        .into_iter()
        .map(|(key, (last_message, unread_count))| {
            let other = key.other_user(viewer);
            let other_user = profiles
                .get(&other)
                .cloned()
                .unwrap_or_else(|| Profile::placeholder(other));
            Conversation {
                key,
                other_user,
                last_message,
                unread_count,
            }
        })
        .collect();

    sort_conversations(&mut conversations);
    conversations
}

/// Newest conversation first; ties on timestamp fall back to message id
/// so the order is stable across rebuilds.
pub(crate) fn sort_conversations(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| {
        message_order(&b.last_message).cmp(&message_order(&a.last_message))
    });
}

/// The viewer's conversation list, kept current incrementally between
/// full rebuilds.
#[derive(Debug, Clone)]
pub(crate) struct ConversationList {
    viewer: Uuid,
    conversations: Vec<Conversation>,
}

impl ConversationList {
    pub(crate) fn new(viewer: Uuid, conversations: Vec<Conversation>) -> Self {
        Self {
            viewer,
            conversations,
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<Conversation> {
        self.conversations.clone()
    }

    pub(crate) fn total_unread(&self) -> u64 {
        self.conversations.iter().map(|c| c.unread_count as u64).sum()
    }

    /// Folds one message into the list, updating the preview and the
    /// conversation's position.
    ///
    /// Unread counts are not touched here; callers re-derive them from
    /// storage through [`set_unread`](Self::set_unread) so replays and
    /// full rebuilds can never disagree about them.
    pub(crate) fn apply_message(
        &mut self,
        message: &Message,
        other_profile: Profile,
    ) -> ConversationDelta {
        if !message.involves(&self.viewer) {
            return ConversationDelta::Unchanged;
        }

        let key = ConversationKey::for_message(message);
        let position = self.conversations.iter().position(|c| c.key == key);

        match position {
            Some(index) => {
                let conversation = &mut self.conversations[index];
                let mut changed = false;

                if message.id == conversation.last_message.id {
                    // Same message redelivered, possibly with updated
                    // fields such as the read flag.
                    if *message != conversation.last_message {
                        conversation.last_message = message.clone();
                        changed = true;
                    }
                } else if message_order(message) > message_order(&conversation.last_message) {
                    conversation.last_message = message.clone();
                    changed = true;
                }

                if changed {
                    sort_conversations(&mut self.conversations);
                    ConversationDelta::Updated
                } else {
                    ConversationDelta::Unchanged
                }
            }
            None => {
                self.conversations.push(Conversation {
                    key,
                    other_user: other_profile,
                    last_message: message.clone(),
                    unread_count: 0,
                });
                sort_conversations(&mut self.conversations);
                ConversationDelta::Created
            }
        }
    }

    /// Replaces one conversation's unread counter with the
    /// storage-derived value. Unknown keys are ignored.
    pub(crate) fn set_unread(&mut self, key: &ConversationKey, count: u32) {
        if let Some(conversation) = self.conversations.iter_mut().find(|c| c.key == *key) {
            conversation.unread_count = count;
        }
    }

    pub(crate) fn mark_all_read(&mut self) {
        for conversation in &mut self.conversations {
            conversation.unread_count = 0;
        }
    }
}
