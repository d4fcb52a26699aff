//! Wire shapes for QQ webhook payloads and OpenAPI requests.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Webhook envelope `{op, id, s, t, d}`.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub op: i32,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub s: u32,
    #[serde(default)]
    pub t: String,
    #[serde(default)]
    pub d: Value,
}

/// `op = 13` callback address validation body.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationRequest {
    pub plain_token: String,
    pub event_ts: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ValidationResponse {
    pub plain_token: String,
    pub signature: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Attachment {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

impl Attachment {
    /// Attachment URLs are sometimes delivered without a scheme. `None` when
    /// the attachment carries no URL at all.
    pub fn resolved_url(&self) -> Option<String> {
        let url = self.url.trim();
        if url.is_empty() {
            None
        } else if url.starts_with("http://") || url.starts_with("https://") {
            Some(url.to_string())
        } else {
            Some(format!("https://{url}"))
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupAuthor {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub member_openid: String,
    #[serde(default)]
    pub union_openid: Option<String>,
}

/// `GROUP_AT_MESSAGE_CREATE` / `GROUP_MESSAGE_CREATE` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupMessage {
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub group_openid: String,
    #[serde(default)]
    pub author: GroupAuthor,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl GroupMessage {
    pub fn group_token(&self) -> &str {
        first_non_empty(&self.group_openid, &self.group_id)
    }

    pub fn sender_token(&self) -> &str {
        first_non_empty(&self.author.member_openid, &self.author.id)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct C2cAuthor {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub user_openid: String,
}

/// `C2C_MESSAGE_CREATE` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct C2cMessage {
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub author: C2cAuthor,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl C2cMessage {
    pub fn sender_token(&self) -> &str {
        first_non_empty(&self.author.user_openid, &self.author.id)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GuildUser {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub bot: bool,
}

/// Guild channel message (`AT_MESSAGE_CREATE`, `DIRECT_MESSAGE_CREATE`).
#[derive(Debug, Clone, Deserialize)]
pub struct GuildMessage {
    pub id: String,
    #[serde(default)]
    pub guild_id: String,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub author: GuildUser,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Group robot membership and proactive-message policy events.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupNotice {
    #[serde(default)]
    pub group_openid: String,
    #[serde(default)]
    pub op_member_openid: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub timestamp: String,
}

/// Friend membership and proactive-message policy events.
#[derive(Debug, Clone, Deserialize)]
pub struct FriendNotice {
    #[serde(default)]
    pub openid: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub timestamp: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Guild {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub guild_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccessTokenRequest<'a> {
    #[serde(rename = "appId")]
    pub app_id: &'a str,
    #[serde(rename = "clientSecret")]
    pub client_secret: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessTokenResponse {
    pub access_token: String,
    #[serde(deserialize_with = "string_or_number")]
    pub expires_in: String,
}

impl AccessTokenResponse {
    pub fn expires_in_secs(&self) -> Option<u64> {
        self.expires_in.trim().parse().ok()
    }
}

/// Media upload body for `/v2/{groups|users}/{openid}/files`.
#[derive(Debug, Clone, Serialize)]
pub struct MediaUploadRequest {
    pub file_type: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_data: Option<String>,
    pub srv_send_msg: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaUploadResponse {
    pub file_info: String,
    #[serde(default)]
    pub file_uuid: Option<String>,
    #[serde(default)]
    pub ttl: Option<u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MediaReference {
    pub file_info: String,
}

pub const MSG_TYPE_TEXT: u8 = 0;
pub const MSG_TYPE_MEDIA: u8 = 7;
pub const FILE_TYPE_IMAGE: u8 = 1;

/// Body for `/v2/{groups|users}/{openid}/messages`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MessageToCreate {
    pub content: String,
    pub msg_type: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    pub msg_seq: u64,
}

fn first_non_empty<'a>(preferred: &'a str, fallback: &'a str) -> &'a str {
    if preferred.trim().is_empty() {
        fallback
    } else {
        preferred
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(value) => Ok(value),
        Value::Number(value) => Ok(value.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, found {other}"
        ))),
    }
}
