//! Event frames pushed to reverse connections.

use serde::{Deserialize, Serialize};

use crate::cqcode::render_message;
use crate::element::Element;
use qbridge_core::current_unix_timestamp;

/// Nickname reported for senders whose profile the vendor does not expose.
pub const UNKNOWN_NICKNAME: &str = "UNKNOWN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Group,
    Private,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub user_id: i64,
    pub nickname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl Sender {
    pub fn anonymous(user_id: i64) -> Self {
        Self {
            user_id,
            nickname: UNKNOWN_NICKNAME.to_string(),
            card: None,
            role: None,
        }
    }
}

/// `post_type = "message"` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub time: i64,
    pub self_id: i64,
    pub post_type: String,
    pub message_type: MessageType,
    pub sub_type: String,
    pub message_id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
    pub user_id: i64,
    pub message: Vec<Element>,
    pub raw_message: String,
    pub font: i32,
    pub sender: Sender,
}

impl MessageEvent {
    pub fn group(group_id: i64, user_id: i64, message_id: i32, message: Vec<Element>) -> Self {
        Self::build(MessageType::Group, Some(group_id), user_id, message_id, message)
    }

    pub fn private(user_id: i64, message_id: i32, message: Vec<Element>) -> Self {
        Self::build(MessageType::Private, None, user_id, message_id, message)
    }

    fn build(
        message_type: MessageType,
        group_id: Option<i64>,
        user_id: i64,
        message_id: i32,
        message: Vec<Element>,
    ) -> Self {
        let sub_type = match message_type {
            MessageType::Group => "normal",
            MessageType::Private => "friend",
        };
        Self {
            time: current_unix_timestamp(),
            self_id: 0,
            post_type: "message".to_string(),
            message_type,
            sub_type: sub_type.to_string(),
            message_id,
            group_id,
            user_id,
            raw_message: render_message(&message),
            message,
            font: 0,
            sender: Sender::anonymous(user_id),
        }
    }

    /// Copy of this event addressed from `self_id`.
    pub fn with_self_id(&self, self_id: i64) -> Self {
        Self {
            self_id,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatStatus {
    pub online: bool,
    pub good: bool,
}

/// `post_type = "meta_event"` frame (lifecycle or heartbeat).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaEvent {
    pub time: i64,
    pub self_id: i64,
    pub post_type: String,
    pub meta_event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<HeartbeatStatus>,
}

impl MetaEvent {
    /// Announcement sent once right after a reverse connection is established.
    pub fn lifecycle_connect(self_id: i64) -> Self {
        Self {
            time: current_unix_timestamp(),
            self_id,
            post_type: "meta_event".to_string(),
            meta_event_type: "lifecycle".to_string(),
            sub_type: Some("connect".to_string()),
            interval: None,
            status: None,
        }
    }

    pub fn heartbeat(self_id: i64, interval_ms: u64) -> Self {
        Self {
            time: current_unix_timestamp(),
            self_id,
            post_type: "meta_event".to_string(),
            meta_event_type: "heartbeat".to_string(),
            sub_type: None,
            interval: Some(interval_ms),
            status: Some(HeartbeatStatus {
                online: true,
                good: true,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{MessageEvent, MetaEvent};
    use crate::element::Element;

    #[test]
    fn unit_group_message_event_carries_onebot_fields() {
        let event = MessageEvent::group(
            3,
            7,
            11,
            vec![Element::text("hi"), Element::image_url("https://x/a.png")],
        )
        .with_self_id(42);
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["post_type"], "message");
        assert_eq!(value["message_type"], "group");
        assert_eq!(value["sub_type"], "normal");
        assert_eq!(value["self_id"], 42);
        assert_eq!(value["group_id"], 3);
        assert_eq!(value["user_id"], 7);
        assert_eq!(value["message_id"], 11);
        assert_eq!(value["sender"], json!({"user_id": 7, "nickname": "UNKNOWN"}));
        assert_eq!(
            value["raw_message"],
            "hi[CQ:image,file=https://x/a.png,url=https://x/a.png]"
        );
        assert_eq!(value["message"][0], json!({"type": "text", "data": {"text": "hi"}}));
    }

    #[test]
    fn unit_private_message_event_omits_group_id() {
        let value = serde_json::to_value(MessageEvent::private(9, 1, vec![Element::text("yo")]))
            .expect("serialize");
        assert_eq!(value["message_type"], "private");
        assert!(value.get("group_id").is_none());
    }

    #[test]
    fn regression_heartbeat_frame_reports_heartbeat_type_and_good_status() {
        let value = serde_json::to_value(MetaEvent::heartbeat(5, 5000)).expect("serialize");
        assert_eq!(value["meta_event_type"], "heartbeat");
        assert_eq!(value["interval"], 5000);
        assert_eq!(value["status"], json!({"online": true, "good": true}));
        assert!(value.get("sub_type").is_none());

        let lifecycle = serde_json::to_value(MetaEvent::lifecycle_connect(5)).expect("serialize");
        assert_eq!(lifecycle["meta_event_type"], "lifecycle");
        assert_eq!(lifecycle["sub_type"], "connect");
    }
}
