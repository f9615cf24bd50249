//! `ChatApi` over HTTP+JSON.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use shared::{
    domain::ConversationId,
    error::ApiResponse,
    protocol::{
        ConversationRecord, CreateConversationRequest, CreateMessageRequest, MarkReadRequest,
        Message, SetReactionRequest, UserSearchResult,
    },
};
use tracing::debug;

use crate::transport::ChatApi;

pub struct HttpChatApi {
    http: Client,
    server_url: String,
    token: Option<String>,
}

impl HttpChatApi {
    pub fn new(server_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server_url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn envelope<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<ApiResponse<T>> {
        let response = self
            .authorize(request)
            .send()
            .await
            .with_context(|| format!("failed to {what}"))?;
        let status = response.status();
        debug!(%status, "api: {what}");
        response
            .json::<ApiResponse<T>>()
            .await
            .with_context(|| format!("invalid response to {what} (status {status})"))
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        Ok(self.envelope::<T>(request, what).await?.into_result()?)
    }

    async fn execute(&self, request: RequestBuilder, what: &str) -> Result<()> {
        Ok(self
            .envelope::<serde_json::Value>(request, what)
            .await?
            .into_status()?)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_conversations(&self) -> Result<Vec<ConversationRecord>> {
        self.fetch(self.http.get(self.url("/conversations")), "list conversations")
            .await
    }

    async fn list_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        self.fetch(
            self.http
                .get(self.url(&format!("/conversations/{conversation_id}/messages"))),
            "list messages",
        )
        .await
    }

    async fn create_message(&self, request: CreateMessageRequest) -> Result<Message> {
        self.fetch(
            self.http.post(self.url("/messages")).json(&request),
            "create message",
        )
        .await
    }

    async fn set_reaction(&self, request: SetReactionRequest) -> Result<()> {
        self.execute(
            self.http.post(self.url("/reactions")).json(&request),
            "set reaction",
        )
        .await
    }

    async fn mark_read(&self, request: MarkReadRequest) -> Result<()> {
        self.execute(
            self.http
                .post(self.url(&format!("/messages/{}/read", request.message_id)))
                .json(&request),
            "mark message read",
        )
        .await
    }

    async fn search_users(&self, query: &str) -> Result<Vec<UserSearchResult>> {
        self.fetch(
            self.http
                .get(self.url("/users/search"))
                .query(&[("q", query)]),
            "search users",
        )
        .await
    }

    async fn create_conversation(
        &self,
        request: CreateConversationRequest,
    ) -> Result<ConversationRecord> {
        self.fetch(
            self.http.post(self.url("/conversations")).json(&request),
            "create conversation",
        )
        .await
    }
}
