//! OneBot v11 reverse WebSocket client side of the bridge.
//!
//! The bridge dials out to each configured OneBot implementation, keeps the
//! connection alive with heartbeats, fans translated message events out to
//! every live connection, and turns `send_*_msg` actions into outbound
//! deliveries.

pub mod actions;
pub mod config;
pub mod connector;
pub mod endpoint;
pub mod manager;

pub use actions::{handle_action_frame, RETCODE_BAD_REQUEST, RETCODE_UNSUPPORTED_ACTION};
pub use config::{EndpointConfig, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_RETRY_DELAY_MS};
pub use connector::{build_connect_request, TungsteniteConnector, WsConnector, WsTransport};
pub use endpoint::{should_retry, ConnectionState, Endpoint, EndpointContext, EndpointStatus};
pub use manager::{run_broadcast_loop, ReverseWsManager};
