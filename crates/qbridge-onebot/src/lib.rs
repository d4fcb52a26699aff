//! OneBot v11 data model used on the downstream side of the bridge.
//!
//! Covers message segments, message and meta event frames, the action
//! request envelope received from reverse connections, and the CQ-code text
//! encoding used by older producers.

pub mod action;
pub mod cqcode;
pub mod element;
pub mod event;

pub use action::{
    decode_action_frame, ActionDecodeError, ActionRequest, ActionResponse, MessagePostParams,
};
pub use cqcode::{escape, escape_param, render_message, unescape, CqCodec};
pub use element::{Element, Message, RawSegment};
pub use event::{HeartbeatStatus, MessageEvent, MessageType, MetaEvent, Sender};
