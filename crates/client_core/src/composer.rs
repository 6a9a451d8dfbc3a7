use std::sync::Arc;

use chrono::Utc;
use shared::{
    domain::{ContentKind, ConversationKey},
    protocol::SendMessagePayload,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    api::{AttachmentUpload, ChatApi},
    error::ClientError,
    store::ConversationStore,
    sync::ClientEvent,
    types::{DeliveryState, Message, Session},
};

/// Builds outgoing messages: validates, appends the optimistic echo, submits,
/// and reconciles the outcome back into the store.
pub struct MessageComposer {
    api: Arc<dyn ChatApi>,
    store: Arc<Mutex<ConversationStore>>,
    events: broadcast::Sender<ClientEvent>,
}

impl MessageComposer {
    pub(crate) fn new(
        api: Arc<dyn ChatApi>,
        store: Arc<Mutex<ConversationStore>>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self { api, store, events }
    }

    pub async fn send_text(
        &self,
        session: &Session,
        conversation: ConversationKey,
        text: &str,
    ) -> Result<Message, ClientError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ClientError::Validation(
                "message text must not be empty".into(),
            ));
        }
        self.submit(
            session,
            conversation,
            text.to_string(),
            ContentKind::Text,
            None,
            Uuid::new_v4().to_string(),
        )
        .await
    }

    /// Two-phase: the binary goes to the upload endpoint first; only a
    /// successful upload produces an optimistic echo and a message post.
    pub async fn send_attachment(
        &self,
        session: &Session,
        conversation: ConversationKey,
        upload: AttachmentUpload,
    ) -> Result<Message, ClientError> {
        if upload.filename.trim().is_empty() {
            return Err(ClientError::Validation(
                "attachment filename must not be empty".into(),
            ));
        }
        if upload.bytes.is_empty() {
            return Err(ClientError::Validation(
                "attachment payload must not be empty".into(),
            ));
        }

        let filename = upload.filename.clone();
        let content_kind = ContentKind::for_mime_type(upload.mime_type.as_deref());
        let uploaded = self
            .api
            .upload_file(session, upload)
            .await
            .map_err(|err| ClientError::Upload(err.to_string()))?;

        self.submit(
            session,
            conversation,
            uploaded.file_url,
            content_kind,
            Some(filename),
            Uuid::new_v4().to_string(),
        )
        .await
    }

    /// Re-submits a failed send under its original client ref, with a fresh
    /// timestamp. Explicit user action only.
    pub async fn retry_failed(
        &self,
        session: &Session,
        conversation: ConversationKey,
        client_ref: &str,
    ) -> Result<Message, ClientError> {
        let failed = {
            let mut store = self.store.lock().await;
            store.take_failed(conversation, client_ref)
        };
        let Some(failed) = failed else {
            return Err(ClientError::Validation(format!(
                "no failed message {client_ref} to retry"
            )));
        };

        let client_ref = failed
            .client_ref
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.submit(
            session,
            conversation,
            failed.content,
            failed.content_kind,
            failed.file_name,
            client_ref,
        )
        .await
    }

    pub async fn discard_failed(&self, conversation: ConversationKey, client_ref: &str) -> bool {
        let removed = {
            let mut store = self.store.lock().await;
            store.discard_failed(conversation, client_ref)
        };
        if removed {
            let _ = self
                .events
                .send(ClientEvent::TimelineUpdated { conversation });
        }
        removed
    }

    async fn submit(
        &self,
        session: &Session,
        conversation: ConversationKey,
        content: String,
        content_kind: ContentKind,
        file_name: Option<String>,
        client_ref: String,
    ) -> Result<Message, ClientError> {
        let echo = Message {
            server_id: None,
            conversation,
            sender_id: session.user_id,
            sender_name: None,
            sender_avatar: None,
            content: content.clone(),
            content_kind,
            file_name: file_name.clone(),
            sent_at: Utc::now(),
            delivery: DeliveryState::Pending,
            client_ref: Some(client_ref.clone()),
        };
        {
            let mut store = self.store.lock().await;
            store.append_or_merge(echo);
        }
        let _ = self
            .events
            .send(ClientEvent::TimelineUpdated { conversation });

        let payload = SendMessagePayload {
            conversation,
            content,
            content_kind,
            file_name,
            client_ref: Some(client_ref.clone()),
        };
        match self.api.send_message(session, payload).await {
            Ok(record) => {
                let confirmed = Message::from_record(record);
                {
                    let mut store = self.store.lock().await;
                    store.append_or_merge(confirmed.clone());
                }
                let _ = self
                    .events
                    .send(ClientEvent::TimelineUpdated { conversation });
                Ok(confirmed)
            }
            Err(err) => {
                warn!(error = %err, "message send failed");
                let still_pending = {
                    let mut store = self.store.lock().await;
                    store.mark_send_failed(conversation, &client_ref)
                };
                if still_pending {
                    let _ = self.events.send(ClientEvent::SendFailed {
                        conversation,
                        client_ref: client_ref.clone(),
                        reason: err.to_string(),
                    });
                    let _ = self
                        .events
                        .send(ClientEvent::TimelineUpdated { conversation });
                } else {
                    debug!(client_ref, "send reported failure after live confirmation");
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/composer_tests.rs"]
mod tests;
