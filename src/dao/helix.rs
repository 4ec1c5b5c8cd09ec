// src/dao/helix.rs - Twitch Helix status client (app access token, users, streams, follows)

use async_trait::async_trait;
use log::{debug, info};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::RwLock;
use url::Url;

use crate::dao::StatusApi;
use crate::types::BotError;

const HELIX_BASE_URL: &str = "https://api.twitch.tv/helix/";
const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
const PAGE_SIZE: &str = "100";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct HelixPage<T> {
    data: Vec<T>,
    #[serde(default)]
    pagination: Option<HelixCursor>,
}

#[derive(Debug, Deserialize)]
struct HelixCursor {
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelixUser {
    id: String,
}

#[derive(Debug, Deserialize)]
struct HelixStream {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct HelixFollow {
    broadcaster_login: String,
}

pub struct HelixClient {
    http: reqwest::Client,
    base_url: Url,
    client_id: String,
    client_secret: String,
    token: RwLock<Option<String>>,
}

impl HelixClient {
    pub fn new(client_id: String, client_secret: String) -> anyhow::Result<Self> {
        use anyhow::Context;

        let http = reqwest::Client::builder()
            .user_agent(concat!("nambot/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build reqwest client")?;
        let base_url = Url::parse(HELIX_BASE_URL).context("parse helix base url")?;

        Ok(Self {
            http,
            base_url,
            client_id,
            client_secret,
            token: RwLock::new(None),
        })
    }

    async fn bearer(&self) -> Result<String, BotError> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        self.acquire_token().await?;
        self.token
            .read()
            .await
            .clone()
            .ok_or_else(|| BotError::status_api("no access token after acquisition", None))
    }

    async fn get_page<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<HelixPage<T>, BotError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| BotError::status_api(format!("join helix url: {}", e), None))?;
        let bearer = self.bearer().await?;

        let resp = self
            .http
            .get(url)
            .query(query)
            .header("Client-Id", &self.client_id)
            .header("Authorization", format!("Bearer {}", bearer))
            .send()
            .await
            .map_err(|e| BotError::status_api(format!("helix GET {} send: {}", path, e), None))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            // Token expired or revoked; the next call acquires a fresh one.
            *self.token.write().await = None;
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BotError::status_api(
                format!("helix GET {} failed: {}", path, body),
                Some(i64::from(status.as_u16())),
            ));
        }

        resp.json::<HelixPage<T>>()
            .await
            .map_err(|e| BotError::status_api(format!("helix GET {} parse json: {}", path, e), None))
    }
}

#[async_trait]
impl StatusApi for HelixClient {
    async fn acquire_token(&self) -> Result<(), BotError> {
        let resp = self
            .http
            .post(TOKEN_URL)
            .query(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(|e| BotError::status_api(format!("token request send: {}", e), None))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(BotError::status_api(
                "token request rejected",
                Some(i64::from(status.as_u16())),
            ));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| BotError::status_api(format!("token response parse: {}", e), None))?;

        info!("Acquired Helix app token, expires in {}s", token.expires_in);
        *self.token.write().await = Some(token.access_token);
        Ok(())
    }

    async fn resolve_user_id(&self, login: &str) -> Result<Option<String>, BotError> {
        let page: HelixPage<HelixUser> = self.get_page("users", &[("login", login)]).await?;
        Ok(page.data.into_iter().next().map(|u| u.id))
    }

    async fn is_live(&self, channel: &str) -> Result<bool, BotError> {
        let page: HelixPage<HelixStream> = self
            .get_page("streams", &[("user_login", channel)])
            .await?;
        Ok(page.data.iter().any(|s| s.kind == "live"))
    }

    async fn follow_list(&self, login: &str) -> Result<Option<Vec<String>>, BotError> {
        let user_id = match self.resolve_user_id(login).await? {
            Some(id) => id,
            None => return Ok(None),
        };

        let mut follows = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut query = vec![("user_id", user_id.as_str()), ("first", PAGE_SIZE)];
            if let Some(after) = cursor.as_deref() {
                query.push(("after", after));
            }

            let page: HelixPage<HelixFollow> = self.get_page("channels/followed", &query).await?;
            let fetched = page.data.len();
            follows.extend(page.data.into_iter().map(|f| f.broadcaster_login));

            cursor = page.pagination.and_then(|p| p.cursor);
            if cursor.is_none() || fetched == 0 {
                break;
            }
        }

        debug!("Fetched {} follows for {}", follows.len(), login);
        Ok(Some(follows))
    }
}
