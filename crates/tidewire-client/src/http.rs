//! REST fallback and history over HTTP (reqwest).

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tidewire_core::{ConversationKey, SendError};

use crate::{channel::RestApi, transport::SESSION_HEADER};

/// HTTP client for the message endpoints.
#[derive(Debug)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    credential: RwLock<Option<String>>,
}

impl HttpApi {
    /// Client against `base_url` (no trailing slash needed).
    pub fn new(base_url: impl Into<String>, credential: Option<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client: reqwest::Client::new(), base_url, credential: RwLock::new(credential) }
    }

    /// `POST`/`GET` target for a conversation's messages.
    pub fn messages_url(&self, conversation: &ConversationKey) -> String {
        match conversation {
            ConversationKey::Room(id) => format!("{}/rooms/{id}/messages", self.base_url),
            ConversationKey::Direct(id) => format!("{}/dm/threads/{id}/messages", self.base_url),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.credential.read().unwrap_or_else(PoisonError::into_inner).as_deref() {
            Some(credential) => request.header(SESSION_HEADER, credential),
            None => request,
        }
    }
}

#[async_trait]
impl RestApi for HttpApi {
    async fn append_message(
        &self,
        conversation: &ConversationKey,
        body: &Value,
    ) -> Result<Value, SendError> {
        let request = self.authorize(self.client.post(self.messages_url(conversation)).json(body));
        let response = send(request).await?;
        response.json::<Value>().await.map_err(rest_error)
    }

    fn set_credential(&self, credential: Option<String>) {
        *self.credential.write().unwrap_or_else(PoisonError::into_inner) = credential;
    }

    async fn list_messages(
        &self,
        conversation: &ConversationKey,
        limit: usize,
    ) -> Result<Vec<Value>, SendError> {
        let url = self.messages_url(conversation);
        let request = self.authorize(self.client.get(url).query(&[("limit", limit)]));
        let response = send(request).await?;
        let body = response.json::<Value>().await.map_err(rest_error)?;
        Ok(message_page(body))
    }
}

/// Either a bare array or `{ "messages": [...] }`.
fn message_page(body: Value) -> Vec<Value> {
    match body {
        Value::Array(items) => items,
        Value::Object(mut object) => match object.remove("messages") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// Send and map non-2xx statuses to errors.
async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response, SendError> {
    request.send().await.and_then(reqwest::Response::error_for_status).map_err(rest_error)
}

fn rest_error(err: reqwest::Error) -> SendError {
    SendError::Rest(err.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn message_urls_per_conversation_kind() {
        let api = HttpApi::new("http://localhost:8080/", None);
        assert_eq!(
            api.messages_url(&ConversationKey::room("r1")),
            "http://localhost:8080/rooms/r1/messages"
        );
        assert_eq!(
            api.messages_url(&ConversationKey::direct("t1")),
            "http://localhost:8080/dm/threads/t1/messages"
        );
    }

    #[test]
    fn rotated_credential_replaces_session_header() {
        let api = HttpApi::new("http://localhost:8080", Some("k1".into()));
        let header = |api: &HttpApi| {
            let builder = api.authorize(api.client.get("http://localhost:8080/ping"));
            let request = builder.build().unwrap();
            request.headers().get(SESSION_HEADER).map(|v| v.to_str().unwrap().to_string())
        };
        assert_eq!(header(&api).as_deref(), Some("k1"));

        api.set_credential(Some("k2".into()));
        assert_eq!(header(&api).as_deref(), Some("k2"));

        api.set_credential(None);
        assert_eq!(header(&api), None);
    }

    #[test]
    fn history_page_shapes() {
        assert_eq!(message_page(json!([{ "id": "m1" }])).len(), 1);
        assert_eq!(message_page(json!({ "messages": [{ "id": "m1" }, { "id": "m2" }] })).len(), 2);
        assert!(message_page(json!({ "error": "nope" })).is_empty());
    }
}
