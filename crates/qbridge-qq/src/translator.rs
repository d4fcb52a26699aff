//! Vendor events to OneBot events.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use qbridge_core::BoundedQueue;
use qbridge_onebot::{render_message, Element, MessageEvent};
use qbridge_store::{CorrelationStore, DIRECT_CONVERSATION_GROUP_ID};
use regex::Regex;
use serde::de::DeserializeOwned;

use crate::dto::{Attachment, C2cMessage, FriendNotice, GroupMessage, GroupNotice, GuildMessage};
use crate::events::{handler_for, EventHandlerKind, VendorEvent};

const TAG_SPLITTER: &str = r"(<[^>]+>|[^<]+)";
const IMAGE_TAG: &str = r#"^<faceType=(\d+),faceId="([^"]+)",ext="([^"]+)">$"#;

/// Resolves guild and channel display names for log lines.
#[async_trait]
pub trait GuildDirectory: Send + Sync {
    async fn guild_name(&self, guild_id: &str) -> Result<String>;
    async fn channel_name(&self, channel_id: &str) -> Result<String>;
}

pub struct Translator {
    store: Arc<dyn CorrelationStore>,
    directory: Option<Arc<dyn GuildDirectory>>,
    tag_splitter: Regex,
    image_tag: Regex,
}

impl std::fmt::Debug for Translator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Translator")
            .field("has_directory", &self.directory.is_some())
            .finish()
    }
}

impl Translator {
    pub fn new(
        store: Arc<dyn CorrelationStore>,
        directory: Option<Arc<dyn GuildDirectory>>,
    ) -> Result<Self> {
        Ok(Self {
            store,
            directory,
            tag_splitter: Regex::new(TAG_SPLITTER).context("invalid content splitter pattern")?,
            image_tag: Regex::new(IMAGE_TAG).context("invalid image tag pattern")?,
        })
    }

    /// Translates one event. `Ok(None)` means the event is accepted but has no OneBot form.
    pub async fn translate(&self, event: &VendorEvent) -> Result<Option<MessageEvent>> {
        let Some(kind) = handler_for(&event.event_type) else {
            tracing::debug!(event_type = %event.event_type, "no handler registered for event");
            return Ok(None);
        };

        match kind {
            EventHandlerKind::GroupMessage => {
                let message: GroupMessage = decode(event)?;
                self.group_message(message).await.map(Some)
            }
            EventHandlerKind::C2cMessage => {
                let message: C2cMessage = decode(event)?;
                self.c2c_message(message).await.map(Some)
            }
            EventHandlerKind::GuildAtMessage => {
                let message: GuildMessage = decode(event)?;
                self.log_guild_message(&message).await;
                Ok(None)
            }
            EventHandlerKind::GuildDirectMessage => {
                let message: GuildMessage = decode(event)?;
                tracing::info!(
                    guild_id = %message.guild_id,
                    "[direct] {}: {}",
                    message.author.username,
                    describe_guild_content(&message)
                );
                Ok(None)
            }
            EventHandlerKind::GroupNotice => {
                let notice: GroupNotice = decode(event)?;
                tracing::info!(
                    event_type = %event.event_type,
                    group = %notice.group_openid,
                    operator = %notice.op_member_openid,
                    timestamp = %notice.timestamp,
                    "group notice received"
                );
                Ok(None)
            }
            EventHandlerKind::FriendNotice => {
                let notice: FriendNotice = decode(event)?;
                tracing::info!(
                    event_type = %event.event_type,
                    user = %notice.openid,
                    timestamp = %notice.timestamp,
                    "friend notice received"
                );
                Ok(None)
            }
        }
    }

    /// Splits vendor content into text and image segments, pairing image tags
    /// with attachments in arrival order.
    pub fn split_content(&self, content: &str, attachments: &[Attachment]) -> Vec<Element> {
        let content = content.strip_prefix(' ').unwrap_or(content);
        let mut remaining = attachments.iter();
        let mut elements = Vec::new();

        for piece in self.tag_splitter.find_iter(content) {
            let piece = piece.as_str();
            if self.image_tag.is_match(piece) {
                match remaining.next().and_then(Attachment::resolved_url) {
                    Some(url) => elements.push(Element::image_url(url)),
                    None => tracing::warn!(tag = piece, "image tag without attachment dropped"),
                }
                continue;
            }
            elements.push(Element::text(piece));
        }
        elements
    }

    async fn group_message(&self, message: GroupMessage) -> Result<MessageEvent> {
        let group_id = self
            .store
            .get_or_create_group(message.group_token())
            .await
            .context("failed to correlate group")?;
        let user_id = self
            .store
            .get_or_create_sender(message.sender_token())
            .await
            .context("failed to correlate sender")?;
        let message_id = self
            .store
            .record_message(&message.id, group_id, user_id)
            .await
            .context("failed to record group message")?;

        let elements = self.split_content(&message.content, &message.attachments);
        tracing::info!(group_id, user_id, message_id, "group message translated");
        Ok(MessageEvent::group(
            i64::from(group_id),
            user_id,
            message_id,
            elements,
        ))
    }

    async fn c2c_message(&self, message: C2cMessage) -> Result<MessageEvent> {
        let user_id = self
            .store
            .get_or_create_sender(message.sender_token())
            .await
            .context("failed to correlate sender")?;
        let message_id = self
            .store
            .record_message(&message.id, DIRECT_CONVERSATION_GROUP_ID, user_id)
            .await
            .context("failed to record direct message")?;

        let elements = self.split_content(&message.content, &message.attachments);
        tracing::info!(user_id, message_id, "direct message translated");
        Ok(MessageEvent::private(user_id, message_id, elements))
    }

    async fn log_guild_message(&self, message: &GuildMessage) {
        let (guild, channel) = match &self.directory {
            Some(directory) => (
                lookup_name(directory.guild_name(&message.guild_id).await, &message.guild_id),
                lookup_name(
                    directory.channel_name(&message.channel_id).await,
                    &message.channel_id,
                ),
            ),
            None => (message.guild_id.clone(), message.channel_id.clone()),
        };
        tracing::info!(
            "[{guild}][{channel}] {}: {}",
            message.author.username,
            describe_guild_content(message)
        );
    }
}

fn decode<T: DeserializeOwned>(event: &VendorEvent) -> Result<T> {
    serde_json::from_value(event.payload.clone()).with_context(|| {
        format!(
            "failed to decode {} payload for event '{}'",
            event.event_type, event.event_id
        )
    })
}

fn lookup_name(result: Result<String>, fallback: &str) -> String {
    match result {
        Ok(name) if !name.trim().is_empty() => name,
        Ok(_) => fallback.to_string(),
        Err(error) => {
            tracing::debug!(id = fallback, error = %error, "guild directory lookup failed");
            fallback.to_string()
        }
    }
}

/// Content followed by CQ image codes for every attachment.
fn describe_guild_content(message: &GuildMessage) -> String {
    let mut elements = vec![Element::text(message.content.clone())];
    elements.extend(
        message
            .attachments
            .iter()
            .filter_map(Attachment::resolved_url)
            .map(Element::image_url),
    );
    render_message(&elements)
}

/// Translates inbound events until the inbound queue closes.
pub async fn run_translator_loop(
    translator: Arc<Translator>,
    inbound: Arc<BoundedQueue<VendorEvent>>,
    broadcast: Arc<BoundedQueue<MessageEvent>>,
) {
    while let Some(event) = inbound.pop().await {
        match translator.translate(&event).await {
            Ok(Some(message)) => {
                broadcast.push(message);
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(
                    event_type = %event.event_type,
                    event_id = %event.event_id,
                    error = %format!("{error:#}"),
                    "dropping event that failed to translate"
                );
            }
        }
    }
    tracing::debug!("translator loop stopped");
}
