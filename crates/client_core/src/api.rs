use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::{
    domain::{ConversationKey, MessageId, UserId},
    error::ApiError,
    protocol::{FileUploadResponse, MessageRecord, SendMessagePayload},
};

use crate::{error::ClientError, types::Session};

const AUTH_TOKEN_HEADER: &str = "x-auth-token";
const MAX_HISTORY_PAGE: u32 = 100;

/// Binary payload handed to the upload endpoint before the message itself is
/// posted.
#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Pull-side server interface. Everything the engine fetches or submits goes
/// through this seam; the live push channel is owned elsewhere.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn history(
        &self,
        session: &Session,
        conversation: ConversationKey,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessageRecord>, ClientError>;

    async fn send_message(
        &self,
        session: &Session,
        payload: SendMessagePayload,
    ) -> Result<MessageRecord, ClientError>;

    async fn upload_file(
        &self,
        session: &Session,
        upload: AttachmentUpload,
    ) -> Result<FileUploadResponse, ClientError>;

    async fn online_users(&self, session: &Session) -> Result<Vec<UserId>, ClientError>;
}

pub struct HttpChatApi {
    http: Client,
    server_url: String,
}

#[derive(Serialize)]
struct HistoryQuery {
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<i64>,
}

impl HttpChatApi {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
        }
    }

    fn history_url(&self, conversation: ConversationKey) -> String {
        match conversation {
            ConversationKey::Direct(user_id) => {
                format!("{}/messages/direct/{}", self.server_url, user_id.0)
            }
            ConversationKey::Group(group_id) => {
                format!("{}/messages/group/{}", self.server_url, group_id.0)
            }
        }
    }
}

async fn decode_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => Err(ClientError::RequestFailed(format!("{status}: {api_error}"))),
        Err(_) => Err(ClientError::RequestFailed(format!("{status}: {body}"))),
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn history(
        &self,
        session: &Session,
        conversation: ConversationKey,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessageRecord>, ClientError> {
        let limit = limit.clamp(1, MAX_HISTORY_PAGE);
        let response = self
            .http
            .get(self.history_url(conversation))
            .header(AUTH_TOKEN_HEADER, &session.auth_token)
            .query(&HistoryQuery {
                limit,
                before: before.map(|id| id.0),
            })
            .send()
            .await?;
        decode_response(response).await
    }

    async fn send_message(
        &self,
        session: &Session,
        payload: SendMessagePayload,
    ) -> Result<MessageRecord, ClientError> {
        let response = self
            .http
            .post(format!("{}/messages", self.server_url))
            .header(AUTH_TOKEN_HEADER, &session.auth_token)
            .json(&payload)
            .send()
            .await?;
        decode_response(response).await
    }

    async fn upload_file(
        &self,
        session: &Session,
        upload: AttachmentUpload,
    ) -> Result<FileUploadResponse, ClientError> {
        let response = self
            .http
            .post(format!("{}/files/upload", self.server_url))
            .header(AUTH_TOKEN_HEADER, &session.auth_token)
            .query(&[
                ("filename", upload.filename.clone()),
                (
                    "mime_type",
                    upload
                        .mime_type
                        .clone()
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                ),
            ])
            .body(upload.bytes)
            .send()
            .await?;
        decode_response(response).await
    }

    async fn online_users(&self, session: &Session) -> Result<Vec<UserId>, ClientError> {
        let response = self
            .http
            .get(format!("{}/presence/online", self.server_url))
            .header(AUTH_TOKEN_HEADER, &session.auth_token)
            .send()
            .await?;
        decode_response(response).await
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
