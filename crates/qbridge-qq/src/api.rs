//! QQ OpenAPI REST client.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::credential::{AccessToken, TokenSource};
use crate::dto::{
    AccessTokenRequest, AccessTokenResponse, Channel, Guild, MediaUploadRequest,
    MediaUploadResponse, MessageToCreate,
};

pub const PRODUCTION_API_BASE: &str = "https://api.sgroup.qq.com";
pub const SANDBOX_API_BASE: &str = "https://sandbox.api.sgroup.qq.com";
pub const TOKEN_ENDPOINT: &str = "https://bots.qq.com/app/getAppAccessToken";

pub const UNION_APP_ID_HEADER: &str = "x-union-appid";

const ERROR_BODY_MAX_CHARS: usize = 800;

/// Failures surfaced by [`QqApiClient`]; callers branch on `is_unauthorized`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("qq api {operation} request failed: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("qq api {operation} failed with status {status}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[error("failed to decode qq api {operation} response: {source}")]
    Decode {
        operation: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Status { status: 401, .. })
    }
}

/// Conversation kind addressed by the v2 messaging endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageScope {
    Group,
    User,
}

impl MessageScope {
    fn path_segment(self) -> &'static str {
        match self {
            Self::Group => "groups",
            Self::User => "users",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QqApiConfig {
    pub app_id: String,
    pub app_secret: String,
    pub api_base: String,
    pub token_endpoint: String,
    pub request_timeout_ms: u64,
}

impl QqApiConfig {
    pub fn new(app_id: impl Into<String>, app_secret: impl Into<String>, sandbox: bool) -> Self {
        Self {
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            api_base: if sandbox {
                SANDBOX_API_BASE.to_string()
            } else {
                PRODUCTION_API_BASE.to_string()
            },
            token_endpoint: TOKEN_ENDPOINT.to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QqApiClient {
    http: reqwest::Client,
    config: QqApiConfig,
}

impl QqApiClient {
    pub fn new(config: QqApiConfig) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("qbridge"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()
            .context("failed to create qq api client")?;

        Ok(Self {
            http,
            config: QqApiConfig {
                api_base: config.api_base.trim_end_matches('/').to_string(),
                app_id: config.app_id.trim().to_string(),
                ..config
            },
        })
    }

    pub fn config(&self) -> &QqApiConfig {
        &self.config
    }

    pub async fn fetch_access_token(&self) -> Result<AccessTokenResponse, ApiError> {
        let body = AccessTokenRequest {
            app_id: &self.config.app_id,
            client_secret: &self.config.app_secret,
        };
        self.request_json(
            "getAppAccessToken",
            self.http.post(&self.config.token_endpoint).json(&body),
        )
        .await
    }

    pub async fn get_guild(&self, token: &str, guild_id: &str) -> Result<Guild, ApiError> {
        let url = format!("{}/guilds/{guild_id}", self.config.api_base);
        self.request_json("get guild", self.authorized(self.http.get(url), token))
            .await
    }

    pub async fn get_channel(&self, token: &str, channel_id: &str) -> Result<Channel, ApiError> {
        let url = format!("{}/channels/{channel_id}", self.config.api_base);
        self.request_json("get channel", self.authorized(self.http.get(url), token))
            .await
    }

    /// Registers media with the platform and returns its `file_info` handle.
    pub async fn upload_media(
        &self,
        token: &str,
        scope: MessageScope,
        openid: &str,
        request: &MediaUploadRequest,
    ) -> Result<MediaUploadResponse, ApiError> {
        let url = format!(
            "{}/v2/{}/{openid}/files",
            self.config.api_base,
            scope.path_segment()
        );
        self.request_json(
            "upload media",
            self.authorized(self.http.post(url), token).json(request),
        )
        .await
    }

    pub async fn send_message(
        &self,
        token: &str,
        scope: MessageScope,
        openid: &str,
        message: &MessageToCreate,
    ) -> Result<Value, ApiError> {
        let url = format!(
            "{}/v2/{}/{openid}/messages",
            self.config.api_base,
            scope.path_segment()
        );
        self.request_json(
            "send message",
            self.authorized(self.http.post(url), token).json(message),
        )
        .await
    }

    fn authorized(&self, builder: reqwest::RequestBuilder, token: &str) -> reqwest::RequestBuilder {
        builder
            .header(reqwest::header::AUTHORIZATION, format!("QQBot {token}"))
            .header(UNION_APP_ID_HEADER, &self.config.app_id)
    }

    async fn request_json<T>(
        &self,
        operation: &'static str,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let response = builder
            .send()
            .await
            .map_err(|source| ApiError::Transport { operation, source })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| ApiError::Transport { operation, source })?;
        if !status.is_success() {
            return Err(ApiError::Status {
                operation,
                status: status.as_u16(),
                body: truncate_for_error(&body, ERROR_BODY_MAX_CHARS),
            });
        }
        let body = if body.trim().is_empty() { "null" } else { &body };
        serde_json::from_str(body).map_err(|source| ApiError::Decode { operation, source })
    }
}

#[async_trait]
impl TokenSource for QqApiClient {
    async fn fetch_token(&self) -> Result<AccessToken> {
        let response = self.fetch_access_token().await?;
        let expires_in = response.expires_in_secs().with_context(|| {
            format!(
                "qq access token response has invalid expires_in '{}'",
                response.expires_in
            )
        })?;
        Ok(AccessToken {
            token: response.access_token,
            expires_in: Duration::from_secs(expires_in),
        })
    }
}

fn truncate_for_error(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated = text.chars().take(max_chars).collect::<String>();
    truncated.push_str("...");
    truncated
}

/// Serializes a request body for debug logging.
pub(crate) fn describe<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "<unserializable>".to_string())
}
