use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use shared::{
    domain::{ConversationKey, UserId},
    protocol::{MessageRecord, ServerEvent},
};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_stream::{wrappers::IntervalStream, StreamExt};
use tracing::{debug, info, warn};

use crate::{
    api::{AttachmentUpload, ChatApi, HttpChatApi},
    composer::MessageComposer,
    connection::{ConnectionEvent, ConnectionManager, ConnectionStatus},
    error::ClientError,
    presence::PresenceTracker,
    settings::ClientSettings,
    store::{ConversationStore, ConversationTimeline, MergeResult},
    types::{Message, Session},
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Notifications for the rendering collaborator.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    TimelineUpdated {
        conversation: ConversationKey,
    },
    PresenceUpdated,
    SendFailed {
        conversation: ConversationKey,
        client_ref: String,
        reason: String,
    },
    HydrationFailed {
        conversation: ConversationKey,
        reason: String,
    },
    /// Live-channel retries exhausted; call `reconnect` to re-arm.
    ConnectionLost,
    ServerError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Hydrating,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSelection {
    pub conversation: Option<ConversationKey>,
    /// Bumped on every switch; in-flight history results carry the epoch they
    /// were issued under and are discarded on mismatch.
    pub epoch: u64,
}

struct EngineState {
    session: Option<Session>,
    selection: ActiveSelection,
    conversation_states: HashMap<ConversationKey, SyncState>,
    route_task: Option<JoinHandle<()>>,
    poll_task: Option<JoinHandle<()>>,
}

/// Reconciles the pull-based history API with the push-based live channel
/// into per-conversation timelines, and owns the presence poll cycle.
///
/// Lock order: `inner` before the store; the presence set is independent.
pub struct SyncEngine {
    api: Arc<dyn ChatApi>,
    connection: Arc<ConnectionManager>,
    composer: MessageComposer,
    store: Arc<Mutex<ConversationStore>>,
    presence: Arc<RwLock<PresenceTracker>>,
    settings: ClientSettings,
    inner: Mutex<EngineState>,
    events: broadcast::Sender<ClientEvent>,
}

impl SyncEngine {
    pub fn new(
        api: Arc<dyn ChatApi>,
        connection: Arc<ConnectionManager>,
        settings: ClientSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let store = Arc::new(Mutex::new(ConversationStore::new()));
        let composer = MessageComposer::new(Arc::clone(&api), Arc::clone(&store), events.clone());
        Arc::new(Self {
            api,
            connection,
            composer,
            store,
            presence: Arc::new(RwLock::new(PresenceTracker::new())),
            settings,
            inner: Mutex::new(EngineState {
                session: None,
                selection: ActiveSelection {
                    conversation: None,
                    epoch: 0,
                },
                conversation_states: HashMap::new(),
                route_task: None,
                poll_task: None,
            }),
            events,
        })
    }

    /// Wires the engine against a real server from settings alone.
    pub fn with_server(settings: ClientSettings) -> Arc<Self> {
        let api = Arc::new(HttpChatApi::new(settings.server_url.clone()));
        let connection =
            ConnectionManager::new(settings.server_url.clone(), settings.reconnect_policy());
        Self::new(api, connection, settings)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Binds the engine to a session: connects the live channel and spawns
    /// the routing and presence-poll tasks. A different session replaces the
    /// previous one wholesale.
    pub async fn start(self: &Arc<Self>, session: Session) -> Result<(), ClientError> {
        {
            let mut guard = self.inner.lock().await;
            if guard.session.as_ref() == Some(&session) && guard.route_task.is_some() {
                drop(guard);
                return self.connection.connect(session).await;
            }
            abort_tasks(&mut guard);
            guard.session = Some(session.clone());
            guard.selection.conversation = None;
            guard.selection.epoch += 1;
            guard.conversation_states.clear();
        }
        self.store.lock().await.clear();
        self.presence
            .write()
            .await
            .reconcile_full_snapshot(Vec::new());

        let connection_events = self.connection.subscribe();
        self.connection.connect(session.clone()).await?;

        let route_task = {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                engine.run_event_routing(connection_events).await;
            })
        };
        let poll_task = {
            let engine = Arc::clone(self);
            let session = session.clone();
            tokio::spawn(async move {
                engine.run_presence_poll(session).await;
            })
        };

        let mut guard = self.inner.lock().await;
        guard.route_task = Some(route_task);
        guard.poll_task = Some(poll_task);
        info!(user_id = session.user_id.0, "sync engine started");
        Ok(())
    }

    /// Tears everything down and drops all session-scoped state. The epoch
    /// bump invalidates any history fetch still in flight.
    pub async fn stop(&self) {
        {
            let mut guard = self.inner.lock().await;
            abort_tasks(&mut guard);
            guard.session = None;
            guard.selection.conversation = None;
            guard.selection.epoch += 1;
            guard.conversation_states.clear();
        }
        self.connection.disconnect().await;
        self.store.lock().await.clear();
        self.presence
            .write()
            .await
            .reconcile_full_snapshot(Vec::new());
        info!("sync engine stopped");
    }

    /// Re-arms the live channel after a terminal `ConnectionLost`.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        let session = self.session().await?;
        self.connection.connect(session).await
    }

    /// Makes `conversation` the active selection and starts its hydration.
    /// Any previous in-flight hydration is logically cancelled via the epoch.
    pub async fn select_conversation(
        self: &Arc<Self>,
        conversation: ConversationKey,
    ) -> Result<(), ClientError> {
        let session = self.session().await?;

        let (epoch, previous) = {
            let mut guard = self.inner.lock().await;
            let previous = guard.selection.conversation;
            guard.selection.epoch += 1;
            guard.selection.conversation = Some(conversation);
            if let Some(previous) = previous {
                if previous != conversation
                    && guard.conversation_states.get(&previous) == Some(&SyncState::Hydrating)
                {
                    guard.conversation_states.insert(previous, SyncState::Idle);
                }
            }
            guard
                .conversation_states
                .insert(conversation, SyncState::Hydrating);
            (guard.selection.epoch, previous)
        };

        {
            let mut store = self.store.lock().await;
            if let Some(previous) = previous {
                if previous != conversation {
                    store.abort_hydration(previous);
                }
            }
            store.begin_hydration(conversation);
            store.set_active(Some(conversation));
            store.mark_read(conversation);
        }
        let _ = self
            .events
            .send(ClientEvent::TimelineUpdated { conversation });

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let result = engine
                .api
                .history(
                    &session,
                    conversation,
                    engine.settings.history_page_size,
                    None,
                )
                .await;
            engine
                .apply_history_result(epoch, conversation, result)
                .await;
        });
        Ok(())
    }

    /// Pulls the page before the oldest confirmed message (scrollback) and
    /// merges it in place. Returns how many records were new.
    pub async fn load_older_messages(
        &self,
        conversation: ConversationKey,
    ) -> Result<usize, ClientError> {
        let session = self.session().await?;
        let epoch = { self.inner.lock().await.selection.epoch };
        let before = { self.store.lock().await.oldest_confirmed_id(conversation) };
        let Some(before) = before else {
            return Ok(0);
        };

        let page = self
            .api
            .history(
                &session,
                conversation,
                self.settings.history_page_size,
                Some(before),
            )
            .await?;

        let guard = self.inner.lock().await;
        if guard.selection.epoch != epoch {
            let stale = ClientError::Stale { epoch };
            debug!(?conversation, error = %stale, "discarding scrollback page");
            return Ok(0);
        }
        let inserted = {
            let mut store = self.store.lock().await;
            store.merge_history_page(
                conversation,
                page.into_iter().map(Message::from_record).collect(),
            )
        };
        drop(guard);

        if inserted > 0 {
            let _ = self
                .events
                .send(ClientEvent::TimelineUpdated { conversation });
        }
        Ok(inserted)
    }

    pub async fn send_text(
        &self,
        conversation: ConversationKey,
        text: &str,
    ) -> Result<Message, ClientError> {
        let session = self.session().await?;
        self.composer.send_text(&session, conversation, text).await
    }

    pub async fn send_attachment(
        &self,
        conversation: ConversationKey,
        upload: AttachmentUpload,
    ) -> Result<Message, ClientError> {
        let session = self.session().await?;
        self.composer
            .send_attachment(&session, conversation, upload)
            .await
    }

    pub async fn retry_failed_send(
        &self,
        conversation: ConversationKey,
        client_ref: &str,
    ) -> Result<Message, ClientError> {
        let session = self.session().await?;
        self.composer
            .retry_failed(&session, conversation, client_ref)
            .await
    }

    pub async fn discard_failed_send(
        &self,
        conversation: ConversationKey,
        client_ref: &str,
    ) -> bool {
        self.composer.discard_failed(conversation, client_ref).await
    }

    pub async fn timeline(&self, conversation: ConversationKey) -> ConversationTimeline {
        self.store.lock().await.snapshot(conversation)
    }

    pub async fn online_users(&self) -> HashSet<UserId> {
        self.presence.read().await.current_online_set()
    }

    pub async fn connection_status(&self) -> ConnectionStatus {
        self.connection.status().await
    }

    pub async fn active_conversation(&self) -> Option<ConversationKey> {
        self.inner.lock().await.selection.conversation
    }

    pub async fn selection(&self) -> ActiveSelection {
        self.inner.lock().await.selection
    }

    pub async fn conversation_state(&self, conversation: ConversationKey) -> SyncState {
        self.inner
            .lock()
            .await
            .conversation_states
            .get(&conversation)
            .copied()
            .unwrap_or(SyncState::Idle)
    }

    async fn session(&self) -> Result<Session, ClientError> {
        self.inner
            .lock()
            .await
            .session
            .clone()
            .ok_or_else(|| ClientError::Validation("no active session".into()))
    }

    async fn run_event_routing(self: Arc<Self>, mut events: broadcast::Receiver<ConnectionEvent>) {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Server(event)) => self.route_server_event(event).await,
                Ok(ConnectionEvent::ConnectionLost) => {
                    let _ = self.events.send(ClientEvent::ConnectionLost);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event routing lagged behind live channel");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn route_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::MessageReceived { message } => self.apply_live_message(message).await,
            ServerEvent::PresenceChanged { user_id, status } => {
                let changed = {
                    let mut presence = self.presence.write().await;
                    presence.apply_push_event(user_id, status)
                };
                if changed {
                    let _ = self.events.send(ClientEvent::PresenceUpdated);
                }
            }
            ServerEvent::Error(api_error) => {
                warn!(error = %api_error, "server reported error on live channel");
                let _ = self
                    .events
                    .send(ClientEvent::ServerError(api_error.to_string()));
            }
        }
    }

    /// Live messages apply in arrival order regardless of hydration state;
    /// the store's side buffer keeps them safe from a concurrent
    /// `replace_history`.
    async fn apply_live_message(&self, record: MessageRecord) {
        let conversation = record.conversation;
        let result = {
            let mut store = self.store.lock().await;
            store.append_or_merge(Message::from_record(record))
        };
        match result {
            MergeResult::Duplicate => {
                debug!(?conversation, "duplicate live message dropped");
            }
            MergeResult::Inserted | MergeResult::Confirmed => {
                let _ = self
                    .events
                    .send(ClientEvent::TimelineUpdated { conversation });
            }
        }
    }

    async fn apply_history_result(
        &self,
        epoch: u64,
        conversation: ConversationKey,
        result: Result<Vec<MessageRecord>, ClientError>,
    ) {
        let mut guard = self.inner.lock().await;
        if guard.selection.epoch != epoch {
            let stale = ClientError::Stale { epoch };
            debug!(?conversation, error = %stale, "discarding history response");
            return;
        }

        match result {
            Ok(records) => {
                {
                    let mut store = self.store.lock().await;
                    store.replace_history(
                        conversation,
                        records.into_iter().map(Message::from_record).collect(),
                    );
                    store.mark_read(conversation);
                }
                guard
                    .conversation_states
                    .insert(conversation, SyncState::Live);
                drop(guard);
                let _ = self
                    .events
                    .send(ClientEvent::TimelineUpdated { conversation });
            }
            Err(err) => {
                {
                    let mut store = self.store.lock().await;
                    store.abort_hydration(conversation);
                }
                guard
                    .conversation_states
                    .insert(conversation, SyncState::Idle);
                drop(guard);
                warn!(?conversation, error = %err, "history hydration failed");
                let _ = self.events.send(ClientEvent::HydrationFailed {
                    conversation,
                    reason: err.to_string(),
                });
            }
        }
    }

    async fn run_presence_poll(self: Arc<Self>, session: Session) {
        let interval = tokio::time::interval(self.settings.presence_poll_interval());
        let mut ticks = IntervalStream::new(interval);
        while ticks.next().await.is_some() {
            match self.api.online_users(&session).await {
                Ok(user_ids) => {
                    {
                        let mut presence = self.presence.write().await;
                        presence.reconcile_full_snapshot(user_ids);
                    }
                    let _ = self.events.send(ClientEvent::PresenceUpdated);
                }
                Err(err) => {
                    warn!(error = %err, "presence poll failed");
                }
            }
        }
    }
}

fn abort_tasks(state: &mut EngineState) {
    if let Some(task) = state.route_task.take() {
        task.abort();
    }
    if let Some(task) = state.poll_task.take() {
        task.abort();
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
