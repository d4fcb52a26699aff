//! Outbound delivery of OneBot messages to QQ conversations.
//!
//! Each element is sent as its own vendor message. Replies reuse the most
//! recent vendor message id of the conversation as `msg_id`, which is what
//! makes them passive replies on the platform side.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use qbridge_core::BoundedQueue;
use qbridge_onebot::Element;
use qbridge_store::{CorrelationStore, DIRECT_CONVERSATION_GROUP_ID};

use crate::api::{describe, ApiError, MessageScope, QqApiClient};
use crate::credential::CredentialManager;
use crate::dto::{
    MediaReference, MediaUploadRequest, MessageToCreate, FILE_TYPE_IMAGE, MSG_TYPE_MEDIA,
    MSG_TYPE_TEXT,
};
use crate::translator::GuildDirectory;

const BASE64_PREFIX: &str = "base64://";
const MEDIA_PLACEHOLDER_CONTENT: &str = " ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundTarget {
    Group { group_id: i64, user_id: i64 },
    Private { user_id: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub target: OutboundTarget,
    pub message: Vec<Element>,
}

/// Vendor-side address of one conversation.
#[derive(Debug, Clone)]
struct Route {
    scope: MessageScope,
    openid: String,
    reply_to: String,
}

pub struct Delivery {
    api: Arc<QqApiClient>,
    credential: Arc<CredentialManager>,
    store: Arc<dyn CorrelationStore>,
    msg_seq: AtomicU64,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("msg_seq", &self.msg_seq.load(Ordering::Relaxed))
            .finish()
    }
}

impl Delivery {
    pub fn new(
        api: Arc<QqApiClient>,
        credential: Arc<CredentialManager>,
        store: Arc<dyn CorrelationStore>,
    ) -> Self {
        Self {
            api,
            credential,
            store,
            msg_seq: AtomicU64::new(0),
        }
    }

    /// Sends every deliverable element; returns how many vendor messages went out.
    ///
    /// Correlation misses fail the whole message. Per-element send failures are
    /// logged and the remaining elements are still attempted.
    pub async fn deliver(&self, message: &OutboundMessage) -> Result<usize> {
        let route = self.resolve_route(message.target).await?;
        let mut sent = 0;
        for element in &message.message {
            match self.deliver_element(&route, element).await {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(error) => tracing::error!(
                    openid = %route.openid,
                    kind = element.kind(),
                    error = %format!("{error:#}"),
                    "failed to deliver message element"
                ),
            }
        }
        Ok(sent)
    }

    fn next_seq(&self) -> u64 {
        self.msg_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn resolve_route(&self, target: OutboundTarget) -> Result<Route> {
        match target {
            OutboundTarget::Group { group_id, user_id } => {
                let group_local_id = i32::try_from(group_id)
                    .with_context(|| format!("group id {group_id} is out of range"))?;
                let openid = self
                    .store
                    .vendor_group_token(group_local_id)
                    .await
                    .context("failed to resolve group")?;
                let reply_to = self
                    .store
                    .latest_vendor_message_token(group_local_id, user_id)
                    .await
                    .context("failed to resolve reply target")?;
                Ok(Route {
                    scope: MessageScope::Group,
                    openid,
                    reply_to,
                })
            }
            OutboundTarget::Private { user_id } => {
                let openid = self
                    .store
                    .vendor_sender_token(user_id)
                    .await
                    .context("failed to resolve user")?;
                let reply_to = self
                    .store
                    .latest_vendor_message_token(DIRECT_CONVERSATION_GROUP_ID, user_id)
                    .await
                    .context("failed to resolve reply target")?;
                Ok(Route {
                    scope: MessageScope::User,
                    openid,
                    reply_to,
                })
            }
        }
    }

    async fn deliver_element(&self, route: &Route, element: &Element) -> Result<bool> {
        let body = match element {
            Element::Text { text } => {
                let text = text.trim();
                if text.is_empty() {
                    return Ok(false);
                }
                MessageToCreate {
                    content: text.to_string(),
                    msg_type: MSG_TYPE_TEXT,
                    media: None,
                    msg_id: Some(route.reply_to.clone()),
                    msg_seq: self.next_seq(),
                }
            }
            Element::Image { file, url } => {
                let source = if file.trim().is_empty() {
                    url.as_deref().unwrap_or_default()
                } else {
                    file.as_str()
                };
                let upload = &media_upload_request(source)?;
                let uploaded = self
                    .with_token(move |token| async move {
                        self.api
                            .upload_media(&token, route.scope, &route.openid, upload)
                            .await
                    })
                    .await?;
                tracing::debug!(file_info = %uploaded.file_info, "media uploaded");
                MessageToCreate {
                    content: MEDIA_PLACEHOLDER_CONTENT.to_string(),
                    msg_type: MSG_TYPE_MEDIA,
                    media: Some(MediaReference {
                        file_info: uploaded.file_info,
                    }),
                    msg_id: Some(route.reply_to.clone()),
                    msg_seq: self.next_seq(),
                }
            }
            other => {
                tracing::debug!(kind = other.kind(), "element kind not deliverable, skipped");
                return Ok(false);
            }
        };

        tracing::debug!(openid = %route.openid, body = %describe(&body), "sending qq message");
        let body = &body;
        self.with_token(move |token| async move {
            self.api
                .send_message(&token, route.scope, &route.openid, body)
                .await
        })
        .await?;
        Ok(true)
    }

    /// Runs `call` with the current token; a 401 forces one refresh and a single retry.
    async fn with_token<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let token = self.credential.current_token().await?;
        match call(token.clone()).await {
            Err(error) if error.is_unauthorized() => {
                tracing::warn!(error = %error, "qq api rejected access token, refreshing");
                let fresh = self.credential.force_refresh(&token).await?;
                Ok(call(fresh).await?)
            }
            result => Ok(result?),
        }
    }
}

#[async_trait]
impl GuildDirectory for Delivery {
    async fn guild_name(&self, guild_id: &str) -> Result<String> {
        let guild = self
            .with_token(move |token| async move { self.api.get_guild(&token, guild_id).await })
            .await?;
        Ok(guild.name)
    }

    async fn channel_name(&self, channel_id: &str) -> Result<String> {
        let channel = self
            .with_token(move |token| async move { self.api.get_channel(&token, channel_id).await })
            .await?;
        Ok(channel.name)
    }
}

/// Upload body for an image reference: http(s) URLs by reference, anything else as base64.
fn media_upload_request(source: &str) -> Result<MediaUploadRequest> {
    let source = source.trim();
    if source.is_empty() {
        bail!("image element has no file");
    }
    if source.starts_with("http://") || source.starts_with("https://") {
        return Ok(MediaUploadRequest {
            file_type: FILE_TYPE_IMAGE,
            url: Some(source.to_string()),
            file_data: None,
            srv_send_msg: false,
        });
    }

    let data = source.strip_prefix(BASE64_PREFIX).unwrap_or(source);
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .context("image file is neither an http(s) url nor valid base64")?;
    Ok(MediaUploadRequest {
        file_type: FILE_TYPE_IMAGE,
        url: None,
        file_data: Some(data.to_string()),
        srv_send_msg: false,
    })
}

/// Delivers outbound messages until the outbound queue closes.
pub async fn run_delivery_loop(delivery: Arc<Delivery>, outbound: Arc<BoundedQueue<OutboundMessage>>) {
    while let Some(message) = outbound.pop().await {
        match delivery.deliver(&message).await {
            Ok(sent) => tracing::info!(target_kind = ?message.target, sent, "outbound message delivered"),
            Err(error) => tracing::warn!(
                target_kind = ?message.target,
                error = %format!("{error:#}"),
                "outbound message dropped"
            ),
        }
    }
    tracing::debug!("delivery loop stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use httpmock::prelude::*;
    use qbridge_onebot::Element;
    use qbridge_store::{CorrelationStore, InMemoryCorrelationStore};
    use serde_json::json;

    use super::{media_upload_request, Delivery, OutboundMessage, OutboundTarget};
    use crate::api::{QqApiClient, QqApiConfig};
    use crate::credential::tests::{token_for, ScriptedTokenSource};
    use crate::credential::CredentialManager;
    use crate::translator::GuildDirectory;

    async fn delivery_for(
        server: &MockServer,
        source: Arc<ScriptedTokenSource>,
        store: Arc<dyn CorrelationStore>,
    ) -> Delivery {
        let mut config = QqApiConfig::new("1024", "secret", false);
        config.api_base = server.base_url();
        let api = Arc::new(QqApiClient::new(config).expect("client"));
        let credential = CredentialManager::init(source).await.expect("credential");
        Delivery::new(api, credential, store)
    }

    #[test]
    fn unit_media_request_distinguishes_urls_and_base64() {
        let by_url = media_upload_request("https://img.example/a.png").expect("url");
        assert_eq!(by_url.url.as_deref(), Some("https://img.example/a.png"));
        assert!(by_url.file_data.is_none());

        let inline = media_upload_request("base64://aGVsbG8=").expect("base64");
        assert_eq!(inline.file_data.as_deref(), Some("aGVsbG8="));
        assert!(inline.url.is_none());
        assert!(!inline.srv_send_msg);

        assert!(media_upload_request("base64://not base64!").is_err());
        assert!(media_upload_request("").is_err());
    }

    #[tokio::test]
    async fn functional_group_reply_sends_text_and_uploaded_image() {
        let server = MockServer::start();
        let store: Arc<dyn CorrelationStore> = Arc::new(InMemoryCorrelationStore::new());
        let group_id = store.get_or_create_group("G_OPEN").await.expect("group");
        let user_id = store.get_or_create_sender("U_OPEN").await.expect("sender");
        store
            .record_message("m-1", group_id, user_id)
            .await
            .expect("record");

        let text = server.mock(|when, then| {
            when.method(POST)
                .path("/v2/groups/G_OPEN/messages")
                .header("authorization", "QQBot tok-1")
                .json_body(json!({"content": "hi", "msg_type": 0, "msg_id": "m-1", "msg_seq": 1}));
            then.status(200).json_body(json!({"id": "out-1"}));
        });
        let upload = server.mock(|when, then| {
            when.method(POST).path("/v2/groups/G_OPEN/files").json_body(json!({
                "file_type": 1,
                "url": "http://img.example/x.png",
                "srv_send_msg": false
            }));
            then.status(200).json_body(json!({"file_info": "FI-1", "ttl": 0}));
        });
        let media = server.mock(|when, then| {
            when.method(POST).path("/v2/groups/G_OPEN/messages").json_body(json!({
                "content": " ",
                "msg_type": 7,
                "media": {"file_info": "FI-1"},
                "msg_id": "m-1",
                "msg_seq": 2
            }));
            then.status(200).json_body(json!({"id": "out-2"}));
        });

        let delivery = delivery_for(
            &server,
            Arc::new(ScriptedTokenSource::always("tok-1", 7200)),
            store,
        )
        .await;
        let sent = delivery
            .deliver(&OutboundMessage {
                target: OutboundTarget::Group {
                    group_id: i64::from(group_id),
                    user_id,
                },
                message: vec![
                    Element::text("hi"),
                    Element::text("   "),
                    Element::Face {
                        id: "14".to_string(),
                    },
                    Element::image_url("http://img.example/x.png"),
                ],
            })
            .await
            .expect("deliver");

        assert_eq!(sent, 2);
        text.assert();
        upload.assert();
        media.assert();
    }

    #[tokio::test]
    async fn regression_text_is_trimmed_before_send() {
        let server = MockServer::start();
        let store: Arc<dyn CorrelationStore> = Arc::new(InMemoryCorrelationStore::new());
        let group_id = store.get_or_create_group("G_TRIM").await.expect("group");
        let user_id = store.get_or_create_sender("U_TRIM").await.expect("sender");
        store
            .record_message("m-trim", group_id, user_id)
            .await
            .expect("record");

        let trimmed = server.mock(|when, then| {
            when.method(POST)
                .path("/v2/groups/G_TRIM/messages")
                .json_body_includes(json!({"content": "hi"}).to_string());
            then.status(200).json_body(json!({"id": "out-1"}));
        });
        let untrimmed = server.mock(|when, then| {
            when.method(POST)
                .path("/v2/groups/G_TRIM/messages")
                .json_body_includes(json!({"content": "  hi  "}).to_string());
            then.status(200).json_body(json!({"id": "out-2"}));
        });

        let delivery = delivery_for(
            &server,
            Arc::new(ScriptedTokenSource::always("tok-1", 7200)),
            store,
        )
        .await;
        let sent = delivery
            .deliver(&OutboundMessage {
                target: OutboundTarget::Group {
                    group_id: i64::from(group_id),
                    user_id,
                },
                message: vec![Element::text("  hi  ")],
            })
            .await
            .expect("deliver");

        assert_eq!(sent, 1);
        trimmed.assert_hits(1);
        untrimmed.assert_hits(0);
    }

    #[tokio::test]
    async fn regression_unauthorized_send_refreshes_token_and_retries_once() {
        let server = MockServer::start();
        let store: Arc<dyn CorrelationStore> = Arc::new(InMemoryCorrelationStore::new());
        let user_id = store.get_or_create_sender("U_C2C").await.expect("sender");
        store.record_message("c-1", 0, user_id).await.expect("record");

        let rejected = server.mock(|when, then| {
            when.method(POST)
                .path("/v2/users/U_C2C/messages")
                .header("authorization", "QQBot tok-1");
            then.status(401).body("{\"message\":\"token invalid\"}");
        });
        let accepted = server.mock(|when, then| {
            when.method(POST)
                .path("/v2/users/U_C2C/messages")
                .header("authorization", "QQBot tok-2")
                .json_body_includes(json!({"msg_id": "c-1"}).to_string());
            then.status(200).json_body(json!({"id": "out-1"}));
        });

        let source = Arc::new(ScriptedTokenSource::new(
            vec![Some(token_for("tok-1", 7200))],
            Some(token_for("tok-2", 7200)),
        ));
        let delivery = delivery_for(&server, source.clone(), store).await;
        let sent = delivery
            .deliver(&OutboundMessage {
                target: OutboundTarget::Private { user_id },
                message: vec![Element::text("pong")],
            })
            .await
            .expect("deliver");

        assert_eq!(sent, 1);
        assert_eq!(rejected.calls(), 1);
        assert_eq!(accepted.calls(), 1);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn regression_failed_send_is_not_retried_and_correlation_miss_fails() {
        let server = MockServer::start();
        let store: Arc<dyn CorrelationStore> = Arc::new(InMemoryCorrelationStore::new());
        let group_id = store.get_or_create_group("G_OPEN").await.expect("group");
        let user_id = store.get_or_create_sender("U_OPEN").await.expect("sender");
        store
            .record_message("m-1", group_id, user_id)
            .await
            .expect("record");

        let failing = server.mock(|when, then| {
            when.method(POST).path("/v2/groups/G_OPEN/messages");
            then.status(500).body("internal");
        });
        let delivery = delivery_for(
            &server,
            Arc::new(ScriptedTokenSource::always("tok-1", 7200)),
            store,
        )
        .await;

        let sent = delivery
            .deliver(&OutboundMessage {
                target: OutboundTarget::Group {
                    group_id: i64::from(group_id),
                    user_id,
                },
                message: vec![Element::text("hi")],
            })
            .await
            .expect("deliver");
        assert_eq!(sent, 0);
        assert_eq!(failing.calls(), 1);

        let error = delivery
            .deliver(&OutboundMessage {
                target: OutboundTarget::Group {
                    group_id: 42,
                    user_id,
                },
                message: vec![Element::text("hi")],
            })
            .await
            .expect_err("unknown group should fail");
        assert!(format!("{error:#}").contains("failed to resolve group"));
        assert_eq!(failing.calls(), 1);
    }

    #[tokio::test]
    async fn functional_guild_directory_resolves_names() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/guilds/g-1");
            then.status(200).json_body(json!({"id": "g-1", "name": "Rustaceans"}));
        });
        server.mock(|when, then| {
            when.method(GET).path("/channels/c-1");
            then.status(200)
                .json_body(json!({"id": "c-1", "name": "general", "guild_id": "g-1"}));
        });
        let delivery = delivery_for(
            &server,
            Arc::new(ScriptedTokenSource::always("tok-1", 7200)),
            Arc::new(InMemoryCorrelationStore::new()),
        )
        .await;

        assert_eq!(delivery.guild_name("g-1").await.expect("guild"), "Rustaceans");
        assert_eq!(delivery.channel_name("c-1").await.expect("channel"), "general");
    }
}
