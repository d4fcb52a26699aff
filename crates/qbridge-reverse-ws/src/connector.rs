//! Dialing reverse connections.

use std::pin::Pin;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{Sink, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

use crate::config::EndpointConfig;

pub type FrameSink = Pin<Box<dyn Sink<WsMessage, Error = WsError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<WsMessage, WsError>> + Send>>;

/// Both halves of an established connection.
pub struct WsTransport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WsTransport")
    }
}

#[async_trait]
pub trait WsConnector: Send + Sync {
    async fn connect(&self, config: &EndpointConfig) -> Result<WsTransport>;
}

/// Connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl WsConnector for TungsteniteConnector {
    async fn connect(&self, config: &EndpointConfig) -> Result<WsTransport> {
        let request = build_connect_request(config)?;
        let (socket, _response) = connect_async(request)
            .await
            .with_context(|| format!("failed to connect reverse websocket '{}'", config.url))?;
        let (sink, stream) = socket.split();
        Ok(WsTransport {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Handshake request carrying the OneBot reverse-connection headers.
pub fn build_connect_request(config: &EndpointConfig) -> Result<Request> {
    let mut request = config
        .url
        .trim()
        .into_client_request()
        .with_context(|| format!("invalid reverse websocket url '{}'", config.url))?;
    let headers = request.headers_mut();
    headers.insert(
        "x-self-id",
        HeaderValue::from_str(&config.self_id.to_string()).context("invalid self id header")?,
    );
    headers.insert("x-client-role", HeaderValue::from_static("Universal"));
    if let Some(token) = config.bearer_token() {
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))
                .context("access token is not a valid header value")?,
        );
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::build_connect_request;
    use crate::config::EndpointConfig;

    #[test]
    fn unit_connect_request_carries_onebot_headers() {
        let mut config = EndpointConfig::new("nb", "ws://127.0.0.1:9000/onebot", 10001);
        let request = build_connect_request(&config).expect("request");
        assert_eq!(request.headers()["x-self-id"], "10001");
        assert_eq!(request.headers()["x-client-role"], "Universal");
        assert!(request.headers().get("authorization").is_none());

        config.access_token = Some("s3cret".to_string());
        let request = build_connect_request(&config).expect("request");
        assert_eq!(request.headers()["authorization"], "Bearer s3cret");
    }
}
