//! QQ official bot platform side of the bridge.
//!
//! Hosts webhook ingress with ed25519 verification, the event catalog and
//! translator into OneBot events, the OpenAPI REST client, the access-token
//! lifecycle, and outbound delivery of OneBot messages back to QQ.

pub mod api;
pub mod credential;
pub mod delivery;
pub mod dto;
pub mod events;
pub mod signature;
pub mod translator;
pub mod webhook;

pub use api::{
    ApiError, MessageScope, QqApiClient, QqApiConfig, PRODUCTION_API_BASE, SANDBOX_API_BASE,
    TOKEN_ENDPOINT,
};
pub use credential::{
    refresh_delay, run_refresh_loop, AccessToken, Credential, CredentialManager, CredentialState,
    TokenSource,
};
pub use delivery::{run_delivery_loop, Delivery, OutboundMessage, OutboundTarget};
pub use events::{handler_for, EventHandlerKind, EventType, VendorEvent};
pub use signature::{derive_seed, SignatureError, WebhookSigner};
pub use translator::{run_translator_loop, GuildDirectory, Translator};
pub use webhook::{build_webhook_router, serve_webhook, WebhookState};
