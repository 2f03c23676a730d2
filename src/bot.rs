//! Chat-bot bridge used to pull a fresh upstream cookie.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::BotConnectionConfig;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BotError {
    #[error("bot transport error: {0}")]
    Transport(String),
    #[error("bot api error (retcode {retcode}): {message}")]
    Api { retcode: i64, message: String },
    #[error("bot returned no cookies")]
    Empty,
}

impl From<reqwest::Error> for BotError {
    fn from(e: reqwest::Error) -> Self {
        BotError::Transport(e.to_string())
    }
}

/// One connected chat-bot account.
#[async_trait]
pub trait BotConnection: Send + Sync {
    fn id(&self) -> i64;
    /// Raw `k=v; k=v` cookie jar of the bot account for `domain`.
    async fn get_cookies(&self, domain: &str) -> Result<String, BotError>;
}

/// OneBot v11 HTTP API client.
pub struct OneBotHttp {
    id: i64,
    base_url: String,
    access_token: String,
    http: Client,
}

#[derive(Deserialize)]
struct OneBotResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    retcode: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    wording: String,
    data: Option<CookiesData>,
}

#[derive(Deserialize)]
struct CookiesData {
    #[serde(default)]
    cookies: String,
}

impl OneBotHttp {
    pub fn new(cfg: &BotConnectionConfig, timeout: Duration) -> Result<Self, BotError> {
        Ok(Self {
            id: cfg.id,
            base_url: cfg.url.trim_end_matches('/').to_string(),
            access_token: cfg.access_token.clone(),
            http: Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl BotConnection for OneBotHttp {
    fn id(&self) -> i64 {
        self.id
    }

    async fn get_cookies(&self, domain: &str) -> Result<String, BotError> {
        let mut req = self
            .http
            .post(format!("{}/get_cookies", self.base_url))
            .json(&json!({ "domain": domain }));
        if !self.access_token.is_empty() {
            req = req.bearer_auth(&self.access_token);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(BotError::Transport(format!("http {}", resp.status())));
        }
        let body: OneBotResponse = resp.json().await?;
        if body.status != "ok" || body.retcode != 0 {
            let message = if body.wording.is_empty() { body.message } else { body.wording };
            return Err(BotError::Api { retcode: body.retcode, message });
        }
        let cookies = body.data.map(|d| d.cookies).unwrap_or_default();
        if cookies.trim().is_empty() {
            return Err(BotError::Empty);
        }
        debug!(bot = self.id, domain, "fetched cookies from bot");
        Ok(cookies)
    }
}
