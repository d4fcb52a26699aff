//! QQ event catalog and the handler lookup table.
//!
//! Every dispatch type the platform documents is a variant of [`EventType`].
//! Only the handful that have a OneBot representation (or are worth logging)
//! map to an [`EventHandlerKind`]; everything else is accepted and ignored.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::dto::WebhookPayload;

macro_rules! event_types {
    ($($variant:ident => $name:literal $(| $alias:literal)*,)+) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum EventType {
            $($variant,)+
            /// Dispatch type missing from the catalog.
            Unknown(String),
        }

        impl EventType {
            pub const ALL: &'static [EventType] = &[$(EventType::$variant,)+];

            pub fn as_str(&self) -> &str {
                match self {
                    $(EventType::$variant => $name,)+
                    EventType::Unknown(name) => name.as_str(),
                }
            }
        }

        impl FromStr for EventType {
            type Err = std::convert::Infallible;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Ok(match raw.trim() {
                    $($name $(| $alias)* => EventType::$variant,)+
                    other => EventType::Unknown(other.to_string()),
                })
            }
        }
    };
}

event_types! {
    GuildCreate => "GUILD_CREATE",
    GuildUpdate => "GUILD_UPDATE",
    GuildDelete => "GUILD_DELETE",
    ChannelCreate => "CHANNEL_CREATE",
    ChannelUpdate => "CHANNEL_UPDATE",
    ChannelDelete => "CHANNEL_DELETE",
    GuildMemberAdd => "GUILD_MEMBER_ADD",
    GuildMemberUpdate => "GUILD_MEMBER_UPDATE",
    GuildMemberRemove => "GUILD_MEMBER_REMOVE",
    MessageCreate => "MESSAGE_CREATE",
    MessageReactionAdd => "MESSAGE_REACTION_ADD",
    MessageReactionRemove => "MESSAGE_REACTION_REMOVE",
    AtMessageCreate => "AT_MESSAGE_CREATE",
    PublicMessageDelete => "PUBLIC_MESSAGE_DELETE",
    DirectMessageCreate => "DIRECT_MESSAGE_CREATE",
    DirectMessageDelete => "DIRECT_MESSAGE_DELETE",
    AudioStart => "AUDIO_START",
    AudioFinish => "AUDIO_FINISH",
    AudioOnMic => "AUDIO_ON_MIC",
    AudioOffMic => "AUDIO_OFF_MIC",
    MessageAuditPass => "MESSAGE_AUDIT_PASS",
    MessageAuditReject => "MESSAGE_AUDIT_REJECT",
    MessageDelete => "MESSAGE_DELETE",
    ForumThreadCreate => "FORUM_THREAD_CREATE",
    ForumThreadUpdate => "FORUM_THREAD_UPDATE",
    ForumThreadDelete => "FORUM_THREAD_DELETE",
    ForumPostCreate => "FORUM_POST_CREATE",
    ForumPostDelete => "FORUM_POST_DELETE",
    ForumReplyCreate => "FORUM_REPLY_CREATE",
    ForumReplyDelete => "FORUM_REPLY_DELETE",
    ForumPublishAuditResult => "FORUM_PUBLISH_AUDIT_RESULT",
    InteractionCreate => "INTERACTION_CREATE",
    C2cMessageCreate => "C2C_MESSAGE_CREATE",
    GroupAtMessageCreate => "GROUP_AT_MESSAGE_CREATE",
    GroupMessageCreate => "GROUP_MESSAGE_CREATE",
    GroupAddRobot => "GROUP_ADD_ROBOT" | "GROUP_ADD_ROBBOT",
    GroupDelRobot => "GROUP_DEL_ROBOT" | "GROUP_DEL_ROBBOT",
    GroupMsgReject => "GROUP_MSG_REJECT",
    GroupMsgReceive => "GROUP_MSG_RECEIVE",
    FriendAdd => "FRIEND_ADD",
    FriendDel => "FRIEND_DEL",
    C2cMsgReject => "C2C_MSG_REJECT",
    C2cMsgReceive => "C2C_MSG_RECEIVE",
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoder/handler pair selected for an event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventHandlerKind {
    /// Group message addressed to the bot; becomes a OneBot group message.
    GroupMessage,
    /// One-to-one message; becomes a OneBot private message.
    C2cMessage,
    /// Guild channel @-mention; logged with guild and channel names.
    GuildAtMessage,
    /// Guild direct message; logged.
    GuildDirectMessage,
    /// Robot added to or removed from a group; logged.
    GroupNotice,
    /// Friend added/removed or proactive-message policy change; logged.
    FriendNotice,
}

pub fn handler_for(event_type: &EventType) -> Option<EventHandlerKind> {
    use EventType::*;
    match event_type {
        GroupAtMessageCreate | GroupMessageCreate => Some(EventHandlerKind::GroupMessage),
        C2cMessageCreate => Some(EventHandlerKind::C2cMessage),
        AtMessageCreate => Some(EventHandlerKind::GuildAtMessage),
        DirectMessageCreate => Some(EventHandlerKind::GuildDirectMessage),
        GroupAddRobot | GroupDelRobot | GroupMsgReject | GroupMsgReceive => {
            Some(EventHandlerKind::GroupNotice)
        }
        FriendAdd | FriendDel | C2cMsgReject | C2cMsgReceive => Some(EventHandlerKind::FriendNotice),
        _ => None,
    }
}

/// A verified webhook dispatch awaiting translation.
#[derive(Debug, Clone, PartialEq)]
pub struct VendorEvent {
    pub op: i32,
    pub event_id: String,
    pub sequence: u32,
    pub event_type: EventType,
    pub payload: Value,
}

impl From<WebhookPayload> for VendorEvent {
    fn from(payload: WebhookPayload) -> Self {
        let event_type = payload
            .t
            .parse()
            .unwrap_or_else(|never| match never {});
        Self {
            op: payload.op,
            event_id: payload.id,
            sequence: payload.s,
            event_type,
            payload: payload.d,
        }
    }
}
