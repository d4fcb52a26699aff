//! Inbound OneBot action frames.

use anyhow::{bail, Result};
use qbridge_core::{BoundedQueue, PushOutcome};
use qbridge_onebot::{decode_action_frame, ActionResponse, CqCodec, MessagePostParams, MessageType};
use qbridge_qq::{OutboundMessage, OutboundTarget};

pub const RETCODE_BAD_REQUEST: i64 = 100;
pub const RETCODE_UNSUPPORTED_ACTION: i64 = 1404;

/// Handles one text frame from a downstream connection.
///
/// Message-sending actions are queued for delivery. The returned response is
/// written back to the connection; frames without an `echo` get none.
pub fn handle_action_frame(
    endpoint_id: &str,
    text: &str,
    codec: &CqCodec,
    outbound: &BoundedQueue<OutboundMessage>,
) -> Option<ActionResponse> {
    let request = match decode_action_frame(text) {
        Ok(request) => request,
        Err(error) => {
            tracing::warn!(endpoint = endpoint_id, error = %error, "dropping undecodable action frame");
            return None;
        }
    };
    let echo = request.echo.clone();

    let response = match request.action.as_str() {
        "send_group_msg" | "send_private_msg" | "send_msg" => {
            match outbound_message(&request.action, &request.params, codec) {
                Ok(message) => {
                    tracing::debug!(
                        endpoint = endpoint_id,
                        action = %request.action,
                        target = ?message.target,
                        "action queued for delivery"
                    );
                    match outbound.push(message) {
                        PushOutcome::Closed => {
                            ActionResponse::failed(RETCODE_BAD_REQUEST, "bridge is shutting down", echo)
                        }
                        PushOutcome::Queued | PushOutcome::DroppedOldest => {
                            ActionResponse::queued(echo)
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        endpoint = endpoint_id,
                        action = %request.action,
                        error = %format!("{error:#}"),
                        "rejecting malformed action"
                    );
                    ActionResponse::failed(RETCODE_BAD_REQUEST, error.to_string(), echo)
                }
            }
        }
        other => {
            tracing::debug!(endpoint = endpoint_id, action = other, "unsupported action");
            ActionResponse::failed(RETCODE_UNSUPPORTED_ACTION, "unsupported action", echo)
        }
    };

    response.echo.is_some().then_some(response)
}

fn outbound_message(
    action: &str,
    params: &serde_json::Value,
    codec: &CqCodec,
) -> Result<OutboundMessage> {
    let params = MessagePostParams::decode(params, codec)?;
    let message_type = match action {
        "send_group_msg" => MessageType::Group,
        "send_private_msg" => MessageType::Private,
        _ => params.message_type.unwrap_or(if params.group_id.is_some() {
            MessageType::Group
        } else {
            MessageType::Private
        }),
    };

    let target = match message_type {
        MessageType::Group => {
            let Some(group_id) = params.group_id else {
                bail!("group_id is required for group messages");
            };
            let Some(user_id) = params.user_id else {
                bail!("user_id is required to reply in a group");
            };
            OutboundTarget::Group { group_id, user_id }
        }
        MessageType::Private => {
            let Some(user_id) = params.user_id else {
                bail!("user_id is required for private messages");
            };
            OutboundTarget::Private { user_id }
        }
    };
    Ok(OutboundMessage {
        target,
        message: params.message,
    })
}

#[cfg(test)]
mod tests {
    use qbridge_core::BoundedQueue;
    use qbridge_onebot::{CqCodec, Element};
    use qbridge_qq::{OutboundMessage, OutboundTarget};
    use serde_json::json;

    use super::handle_action_frame;

    fn fixture() -> (CqCodec, BoundedQueue<OutboundMessage>) {
        (CqCodec::new().expect("codec"), BoundedQueue::new("outbound", 8))
    }

    #[test]
    fn functional_group_send_is_queued_and_acknowledged() {
        let (codec, outbound) = fixture();
        let frame = json!({
            "action": "send_group_msg",
            "params": {"group_id": 3, "user_id": "7", "message": "hi[CQ:image,file=https://x/a.png]"},
            "echo": {"seq": 9}
        });

        let response = handle_action_frame("nb", &frame.to_string(), &codec, &outbound)
            .expect("response");
        assert_eq!(
            serde_json::to_value(&response).expect("json"),
            json!({"status": "async", "retcode": 1, "data": null, "echo": {"seq": 9}})
        );

        let queued = outbound.try_pop().expect("queued");
        assert_eq!(
            queued.target,
            OutboundTarget::Group {
                group_id: 3,
                user_id: 7
            }
        );
        assert_eq!(
            queued.message,
            vec![Element::text("hi"), Element::Image {
                file: "https://x/a.png".to_string(),
                url: None
            }]
        );
    }

    #[test]
    fn functional_send_msg_infers_private_target_and_skips_reply_without_echo() {
        let (codec, outbound) = fixture();
        let frame = json!({
            "action": "send_msg",
            "params": {"user_id": 5, "message": [{"type": "text", "data": {"text": "yo"}}]}
        });
        assert!(handle_action_frame("nb", &frame.to_string(), &codec, &outbound).is_none());
        assert_eq!(
            outbound.try_pop().expect("queued").target,
            OutboundTarget::Private { user_id: 5 }
        );
    }

    #[test]
    fn regression_unknown_and_malformed_actions_are_not_queued() {
        let (codec, outbound) = fixture();

        let unknown = json!({"action": "get_login_info", "params": {}, "echo": "e-1"});
        let response = handle_action_frame("nb", &unknown.to_string(), &codec, &outbound)
            .expect("response");
        assert_eq!(response.status, "failed");
        assert_eq!(response.retcode, 1404);

        let missing_group = json!({"action": "send_group_msg", "params": {"message": "x"}, "echo": 1});
        let response = handle_action_frame("nb", &missing_group.to_string(), &codec, &outbound)
            .expect("response");
        assert_eq!(response.retcode, 100);

        assert!(handle_action_frame("nb", "{not json", &codec, &outbound).is_none());
        assert!(outbound.is_empty());
    }
}
