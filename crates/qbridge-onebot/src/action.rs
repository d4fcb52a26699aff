//! Action requests received from reverse connections and their replies.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::cqcode::CqCodec;
use crate::element::Element;
use crate::event::MessageType;

/// Errors raised while decoding an inbound action frame.
#[derive(Debug, Error)]
pub enum ActionDecodeError {
    #[error("invalid action frame: {0}")]
    Frame(#[from] serde_json::Error),
    #[error("action params are missing '{0}'")]
    MissingField(&'static str),
    #[error("action param '{field}' has invalid value {value}")]
    InvalidField { field: &'static str, value: String },
}

/// `{action, params, echo}` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub echo: Option<Value>,
}

pub fn decode_action_frame(text: &str) -> Result<ActionRequest, ActionDecodeError> {
    Ok(serde_json::from_str(text)?)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub status: String,
    pub retcode: i64,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub echo: Option<Value>,
}

impl ActionResponse {
    /// Reply for a request accepted onto the delivery queue.
    pub fn queued(echo: Option<Value>) -> Self {
        Self {
            status: "async".to_string(),
            retcode: 1,
            data: Value::Null,
            message: None,
            echo,
        }
    }

    pub fn failed(retcode: i64, message: impl Into<String>, echo: Option<Value>) -> Self {
        Self {
            status: "failed".to_string(),
            retcode,
            data: Value::Null,
            message: Some(message.into()),
            echo,
        }
    }
}

/// Parameters of `send_msg` / `send_group_msg` / `send_private_msg`.
#[derive(Debug, Clone, PartialEq)]
pub struct MessagePostParams {
    pub message_type: Option<MessageType>,
    pub group_id: Option<i64>,
    pub user_id: Option<i64>,
    pub message: Vec<Element>,
}

impl MessagePostParams {
    /// Decodes `params`, falling back to CQ-code text when `message` is not a
    /// segment array.
    pub fn decode(params: &Value, codec: &CqCodec) -> Result<Self, ActionDecodeError> {
        let message_type = match params.get("message_type").and_then(Value::as_str) {
            Some("group") => Some(MessageType::Group),
            Some("private") => Some(MessageType::Private),
            Some(other) => {
                return Err(ActionDecodeError::InvalidField {
                    field: "message_type",
                    value: other.to_string(),
                })
            }
            None => None,
        };
        let auto_escape = match params.get("auto_escape") {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(flag)) => flag.eq_ignore_ascii_case("true"),
            _ => false,
        };
        let message = match params.get("message") {
            Some(Value::Array(items)) => decode_segment_array(items, codec),
            Some(Value::String(text)) if auto_escape => vec![Element::text(text.clone())],
            Some(Value::String(text)) => codec.parse(text),
            Some(segment @ Value::Object(_)) => vec![serde_json::from_value(segment.clone())?],
            Some(other) => {
                return Err(ActionDecodeError::InvalidField {
                    field: "message",
                    value: other.to_string(),
                })
            }
            None => return Err(ActionDecodeError::MissingField("message")),
        };

        Ok(Self {
            message_type,
            group_id: read_id(params, "group_id")?,
            user_id: read_id(params, "user_id")?,
            message,
        })
    }
}

fn decode_segment_array(items: &[Value], codec: &CqCodec) -> Vec<Element> {
    let mut elements = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::String(text) => elements.extend(codec.parse(text)),
            Value::Object(_) => match serde_json::from_value::<Element>(item.clone()) {
                Ok(element) => elements.push(element),
                Err(_) => {
                    if let Some(text) = item.get("text").and_then(Value::as_str) {
                        elements.extend(codec.parse(text));
                    }
                }
            },
            _ => {}
        }
    }
    elements
}

fn read_id(params: &Value, field: &'static str) -> Result<Option<i64>, ActionDecodeError> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => number
            .as_i64()
            .map(Some)
            .ok_or_else(|| ActionDecodeError::InvalidField {
                field,
                value: number.to_string(),
            }),
        Some(Value::String(text)) => {
            text.trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| ActionDecodeError::InvalidField {
                    field,
                    value: text.clone(),
                })
        }
        Some(other) => Err(ActionDecodeError::InvalidField {
            field,
            value: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{decode_action_frame, ActionDecodeError, ActionResponse, MessagePostParams};
    use crate::cqcode::CqCodec;
    use crate::element::Element;
    use crate::event::MessageType;

    #[test]
    fn functional_decodes_segment_array_params() {
        let frame = decode_action_frame(
            &json!({
                "action": "send_group_msg",
                "params": {
                    "group_id": 1,
                    "message": [
                        {"type": "text", "data": {"text": "hello"}},
                        {"type": "image", "data": {"file": "https://x/a.png"}}
                    ]
                },
                "echo": "e-1"
            })
            .to_string(),
        )
        .expect("frame");
        assert_eq!(frame.action, "send_group_msg");
        assert_eq!(frame.echo, Some(json!("e-1")));

        let codec = CqCodec::new().expect("codec");
        let params = MessagePostParams::decode(&frame.params, &codec).expect("params");
        assert_eq!(params.group_id, Some(1));
        assert_eq!(params.user_id, None);
        assert_eq!(params.message.len(), 2);
        assert_eq!(params.message[0], Element::text("hello"));
    }

    #[test]
    fn functional_string_message_falls_back_to_cq_codes() {
        let codec = CqCodec::new().expect("codec");
        let params = MessagePostParams::decode(
            &json!({
                "message_type": "private",
                "user_id": "42",
                "message": "hey[CQ:face,id=14]"
            }),
            &codec,
        )
        .expect("params");
        assert_eq!(params.message_type, Some(MessageType::Private));
        assert_eq!(params.user_id, Some(42));
        assert_eq!(
            params.message,
            vec![
                Element::text("hey"),
                Element::Face {
                    id: "14".to_string()
                }
            ]
        );
    }

    #[test]
    fn unit_auto_escape_keeps_codes_as_text() {
        let codec = CqCodec::new().expect("codec");
        let params = MessagePostParams::decode(
            &json!({"group_id": 1, "message": "[CQ:face,id=1]", "auto_escape": true}),
            &codec,
        )
        .expect("params");
        assert_eq!(params.message, vec![Element::text("[CQ:face,id=1]")]);
    }

    #[test]
    fn regression_missing_message_and_bad_ids_are_rejected() {
        let codec = CqCodec::new().expect("codec");
        assert!(matches!(
            MessagePostParams::decode(&json!({"group_id": 1}), &codec),
            Err(ActionDecodeError::MissingField("message"))
        ));
        assert!(matches!(
            MessagePostParams::decode(&json!({"group_id": "abc", "message": "x"}), &codec),
            Err(ActionDecodeError::InvalidField {
                field: "group_id",
                ..
            })
        ));
        assert!(decode_action_frame("not json").is_err());
    }

    #[test]
    fn unit_queued_response_echoes_request() {
        let value =
            serde_json::to_value(ActionResponse::queued(Some(json!(7)))).expect("serialize");
        assert_eq!(
            value,
            json!({"status": "async", "retcode": 1, "data": null, "echo": 7})
        );
    }
}
