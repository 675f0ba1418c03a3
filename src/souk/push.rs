use serde::Serialize;
use uuid::Uuid;

use crate::souk::database::messages::Message;
use crate::utils::retry::{RetryPolicy, execute_with_retry};

/// Body posted to the push gateway for one new-message notification.
#[derive(Debug, Clone, Serialize)]
pub struct PushPayload {
    pub token: String,
    pub title: String,
    pub body: String,
    pub message_id: Uuid,
    pub sender_id: Uuid,
    pub listing_id: Option<i64>,
}

impl PushPayload {
    pub(crate) fn for_message(message: &Message, sender_name: &str, token: String) -> Self {
        let body = if message.content.is_empty() && message.media.is_some() {
            "Sent you a photo".to_string()
        } else {
            message.content.clone()
        };
        Self {
            token,
            title: sender_name.to_string(),
            body,
            message_id: message.id,
            sender_id: message.sender_id,
            listing_id: message.listing_id,
        }
    }
}

/// Posts push payloads to the configured gateway endpoint.
///
/// Delivery is best effort and runs off the caller's path; a push that
/// never lands only costs a banner, the message itself is already
/// persisted.
#[derive(Debug, Clone)]
pub struct PushSender {
    client: reqwest::Client,
    endpoint: Option<String>,
    retry: RetryPolicy,
}

impl PushSender {
    pub fn new(endpoint: Option<String>, retry: RetryPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            retry,
        }
    }

    /// Fire-and-forget delivery. Exhausted retries are logged, never
    /// surfaced to the sender of the message.
    pub(crate) fn deliver_in_background(&self, payload: PushPayload) {
        let Some(endpoint) = self.endpoint.clone() else {
            tracing::debug!(
                target: "souk::push",
                "No push endpoint configured, skipping push for message {}",
                payload.message_id
            );
            return;
        };

        let client = self.client.clone();
        let retry = self.retry.clone();
        tokio::spawn(async move {
            let result = execute_with_retry("push delivery", &retry, || {
                let client = client.clone();
                let endpoint = endpoint.clone();
                let payload = &payload;
                async move {
                    client
                        .post(&endpoint)
                        .json(payload)
                        .send()
                        .await?
                        .error_for_status()?;
                    Ok::<_, reqwest::Error>(())
                }
            })
            .await;

            if let Err(e) = result {
                tracing::warn!(
                    target: "souk::push",
                    "Giving up on push for message {}: {}",
                    payload.message_id,
                    e
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::souk::database::messages::MediaPayload;
    use chrono::Utc;
    use std::time::Duration;

    fn test_message(content: &str, media: Option<MediaPayload>) -> Message {
        Message {
            id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            receiver_id: Uuid::new_v4(),
            content: content.to_string(),
            created_at: Utc::now(),
            is_read: false,
            listing_id: None,
            media,
        }
    }

    #[test]
    fn test_payload_uses_content_as_body() {
        let message = test_message("see you at 5", None);
        let payload = PushPayload::for_message(&message, "amal", "tok".to_string());
        assert_eq!(payload.title, "amal");
        assert_eq!(payload.body, "see you at 5");
        assert_eq!(payload.message_id, message.id);
    }

    #[test]
    fn test_payload_media_only_body() {
        let media = MediaPayload {
            url: "https://cdn.example/p.jpg".to_string(),
            mime_type: "image/jpeg".to_string(),
            thumbnail_url: None,
        };
        let message = test_message("", Some(media));
        let payload = PushPayload::for_message(&message, "amal", "tok".to_string());
        assert_eq!(payload.body, "Sent you a photo");
    }

    #[tokio::test]
    async fn test_delivery_posts_payload() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/push")
            .match_header("content-type", "application/json")
            .with_status(200)
            .create_async()
            .await;

        let sender = PushSender::new(
            Some(format!("{}/push", server.url())),
            RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::from_millis(1),
            },
        );
        let payload =
            PushPayload::for_message(&test_message("hello", None), "amal", "tok".to_string());
        sender.deliver_in_background(payload);

        // The spawned task has no handle, poll the mock instead.
        for _ in 0..50 {
            if mock.matched_async().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_delivery_retries_until_exhausted() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/push")
            .with_status(500)
            .expect(3)
            .create_async()
            .await;

        let sender = PushSender::new(
            Some(format!("{}/push", server.url())),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
        );
        let payload =
            PushPayload::for_message(&test_message("hello", None), "amal", "tok".to_string());
        sender.deliver_in_background(payload);

        for _ in 0..100 {
            if mock.matched_async().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_no_endpoint_is_a_noop() {
        let sender = PushSender::new(None, RetryPolicy::default());
        let payload =
            PushPayload::for_message(&test_message("hello", None), "amal", "tok".to_string());
        // Must not panic or spawn anything that errors.
        sender.deliver_in_background(payload);
    }
}
