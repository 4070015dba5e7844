use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::ConversationId,
    error::{ApiError, ApiException, ErrorCode},
    protocol::{ConversationPage, NewMessage, StoredMessage},
};
use tracing::debug;

#[async_trait]
pub trait MessageApi: Send + Sync {
    fn is_configured(&self) -> bool {
        true
    }

    async fn persist_message(&self, message: &NewMessage) -> Result<StoredMessage>;

    async fn fetch_conversation_page(
        &self,
        conversation_id: &ConversationId,
        page: u32,
    ) -> Result<ConversationPage>;
}

pub struct MissingMessageApi;

#[async_trait]
impl MessageApi for MissingMessageApi {
    fn is_configured(&self) -> bool {
        false
    }

    async fn persist_message(&self, _message: &NewMessage) -> Result<StoredMessage> {
        Err(anyhow!("message api is not configured"))
    }

    async fn fetch_conversation_page(
        &self,
        _conversation_id: &ConversationId,
        _page: u32,
    ) -> Result<ConversationPage> {
        Err(anyhow!("message api is not configured"))
    }
}

pub struct HttpMessageApi {
    http: Client,
    server_url: String,
    auth_token: Option<String>,
}

impl HttpMessageApi {
    pub fn new(server_url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            auth_token,
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl MessageApi for HttpMessageApi {
    async fn persist_message(&self, message: &NewMessage) -> Result<StoredMessage> {
        let res = self
            .authorize(self.http.post(format!("{}/api/messages", self.server_url)))
            .json(message)
            .send()
            .await?;
        debug!(status = %res.status(), conversation_id = %message.conversation_id, "api: persist message");
        decode(res).await
    }

    async fn fetch_conversation_page(
        &self,
        conversation_id: &ConversationId,
        page: u32,
    ) -> Result<ConversationPage> {
        let res = self
            .authorize(self.http.get(format!(
                "{}/api/messages/conversation/{}",
                self.server_url, conversation_id
            )))
            .query(&[("page", page)])
            .send()
            .await?;
        debug!(status = %res.status(), %conversation_id, page, "api: fetch conversation");
        decode(res).await
    }
}

async fn decode<T: DeserializeOwned>(res: Response) -> Result<T> {
    let status = res.status();
    if status.is_success() {
        return Ok(res.json().await?);
    }
    let body = res.text().await.unwrap_or_default();
    let exception = match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => ApiException::from(api_error),
        Err(_) => ApiException::new(
            ErrorCode::from_status(status.as_u16()),
            if body.is_empty() {
                status.to_string()
            } else {
                body
            },
        ),
    };
    Err(exception.into())
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
