//! WebSocket client for a site's collaboration channel.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - Presence updates with cursor throttling, and a live [`PresenceView`]
//! - Best-effort edit broadcast, dropped while offline
//! - Commits that wait for the server's correlated reply

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::conflict::CommitRequest;
use crate::model::{CollaborativeEdit, EditConflict, PresencePatch, PresenceRecord, VersionToken};
use crate::presence::{CursorThrottle, PresenceView, DEFAULT_CURSOR_INTERVAL};
use crate::protocol::{ClientFrame, ErrorCode, JoinProfile, ProtocolError, ServerFrame};

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_secs(15);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The connection dropped without `disconnect`.
    Offline,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum CollabEvent {
    Connected { connection_id: Uuid, user_id: Uuid },
    Disconnected,
    Offline,
    PresenceList(Vec<PresenceRecord>),
    PresenceUpdated(PresenceRecord),
    UserLeft(Uuid),
    RemoteEdit(CollaborativeEdit),
    ElementCommitted {
        element_id: String,
        language: String,
        variant: String,
        content: String,
        version: VersionToken,
        user_id: Uuid,
    },
    /// A server error not tied to a commit.
    Error { code: ErrorCode, message: String },
}

/// Server answer to [`CollabClient::commit`].
#[derive(Debug, Clone, PartialEq)]
pub enum CommitReply {
    Committed {
        element_id: String,
        content: String,
        version: VersionToken,
    },
    Conflict(EditConflict),
}

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Not connected")]
    NotConnected,
    #[error("Rejected by server ({code:?}): {message}")]
    Rejected {
        code: ErrorCode,
        message: String,
        retryable: bool,
    },
    #[error("Timed out waiting for the server")]
    Timeout,
    #[error("Connection lost before the server replied")]
    ConnectionLost,
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Rejected { retryable, .. } => *retryable,
            ClientError::Protocol(_) => false,
            _ => true,
        }
    }
}

type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type PendingCommits = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Result<CommitReply, ClientError>>>>>;

/// Identity assigned by the server at join.
#[derive(Debug, Clone, Copy)]
struct Identity {
    connection_id: Uuid,
    user_id: Uuid,
}

/// The collaboration client.
pub struct CollabClient {
    server_url: String,
    site_id: Uuid,
    session_token: String,
    profile: JoinProfile,
    commit_timeout: Duration,

    state: Arc<RwLock<ConnectionState>>,
    identity: Option<Identity>,
    presence: Arc<RwLock<PresenceView>>,
    throttle: Mutex<CursorThrottle>,
    pending: PendingCommits,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,

    event_tx: mpsc::Sender<CollabEvent>,
    event_rx: Option<mpsc::Receiver<CollabEvent>>,
}

impl CollabClient {
    pub fn new(server_url: impl Into<String>, site_id: Uuid, session_token: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            site_id,
            session_token: session_token.into(),
            profile: JoinProfile::default(),
            commit_timeout: DEFAULT_COMMIT_TIMEOUT,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            identity: None,
            presence: Arc::new(RwLock::new(PresenceView::new(Uuid::nil()))),
            throttle: Mutex::new(CursorThrottle::new(DEFAULT_CURSOR_INTERVAL)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            outgoing_tx: None,
            writer: None,
            reader: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    pub fn with_profile(mut self, profile: JoinProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_cursor_interval(mut self, interval: Duration) -> Self {
        self.throttle = Mutex::new(CursorThrottle::new(interval));
        self
    }

    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<CollabEvent>> {
        self.event_rx.take()
    }

    /// Open the socket and join the site.
    ///
    /// Resolves once the server has accepted the session; the initial
    /// presence list follows as a [`CollabEvent::PresenceList`].
    pub async fn connect(&mut self) -> Result<Uuid, ClientError> {
        self.shutdown_tasks().await;
        *self.state.write().await = ConnectionState::Connecting;

        match self.open().await {
            Ok(identity) => {
                self.identity = Some(identity);
                emit(
                    &self.event_tx,
                    CollabEvent::Connected {
                        connection_id: identity.connection_id,
                        user_id: identity.user_id,
                    },
                );
                log::info!(
                    "Joined site {} as {} (connection {})",
                    self.site_id,
                    identity.user_id,
                    identity.connection_id
                );
                Ok(identity.user_id)
            }
            Err(e) => {
                self.shutdown_tasks().await;
                *self.state.write().await = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn open(&mut self) -> Result<Identity, ClientError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.server_url.as_str())
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.writer = Some(tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if ws_writer.send(message).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        }));
        self.outgoing_tx = Some(out_tx);

        let join = ClientFrame::Join {
            site_id: self.site_id,
            session_token: self.session_token.clone(),
            profile: self.profile.clone(),
        };
        self.send_frame(&join).await?;

        let identity = tokio::time::timeout(JOIN_TIMEOUT, await_joined(&mut ws_reader))
            .await
            .map_err(|_| ClientError::Protocol(ProtocolError::Timeout))??;

        *self.presence.write().await = PresenceView::new(identity.user_id);
        self.throttle.lock().await.reset();
        *self.state.write().await = ConnectionState::Connected;

        // Reader task: process incoming frames
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let presence = self.presence.clone();
        let pending = self.pending.clone();
        self.reader = Some(tokio::spawn(async move {
            while let Some(message) = ws_reader.next().await {
                match message {
                    Ok(Message::Text(text)) => match ServerFrame::decode(text.as_str()) {
                        Ok(frame) => dispatch(frame, &presence, &pending, &event_tx).await,
                        Err(e) => log::warn!("Undecodable frame from server: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            for (_, reply) in pending.lock().await.drain() {
                let _ = reply.send(Err(ClientError::ConnectionLost));
            }
            let mut state = state.write().await;
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Offline;
                presence.write().await.clear();
                log::warn!("Connection lost; client is offline");
                emit(&event_tx, CollabEvent::Offline);
            }
        }));

        Ok(identity)
    }

    /// Leave the site and close the socket.
    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        let was_connected = {
            let mut state = self.state.write().await;
            let was = *state == ConnectionState::Connected;
            *state = ConnectionState::Disconnected;
            was
        };
        if was_connected {
            let _ = self.send_frame(&ClientFrame::Leave).await;
        }
        self.shutdown_tasks().await;
        self.presence.write().await.clear();
        self.identity = None;
        emit(&self.event_tx, CollabEvent::Disconnected);
        Ok(())
    }

    /// Drop whatever is left of the old connection and join again.
    ///
    /// The presence view starts over from the server's full list.
    pub async fn reconnect(&mut self) -> Result<Uuid, ClientError> {
        log::info!("Reconnecting to site {}", self.site_id);
        *self.state.write().await = ConnectionState::Disconnected;
        self.presence.write().await.clear();
        self.connect().await
    }

    async fn shutdown_tasks(&mut self) {
        self.outgoing_tx = None;
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }
    }

    /// Merge a presence patch. Cursor-only moves are throttled.
    ///
    /// Returns `false` when the update was dropped (throttled or offline).
    pub async fn update_presence(&self, patch: PresencePatch) -> Result<bool, ClientError> {
        if !self.is_connected().await {
            return Ok(false);
        }
        if patch.is_cursor_only() && !self.throttle.lock().await.admit(Instant::now()) {
            log::trace!("cursor update throttled");
            return Ok(false);
        }
        self.send_frame(&ClientFrame::UpdatePresence { patch }).await?;
        Ok(true)
    }

    /// Ask the server for the full presence list again.
    pub async fn request_presence(&self) -> Result<(), ClientError> {
        self.send_frame(&ClientFrame::RequestPresence).await
    }

    /// Relay an in-progress edit to the other editors.
    ///
    /// Best effort: returns `false` without error while offline.
    pub async fn broadcast_edit(&self, mut edit: CollaborativeEdit) -> Result<bool, ClientError> {
        if !self.is_connected().await {
            log::trace!("dropping edit on {} while offline", edit.element_id);
            return Ok(false);
        }
        if edit.session_token.is_empty() {
            edit.session_token = self.session_token.clone();
        }
        if let Some(identity) = self.identity {
            edit.user_id = identity.user_id;
        }
        self.send_frame(&ClientFrame::Edit { edit }).await?;
        Ok(true)
    }

    /// Commit content and wait for the server's verdict.
    pub async fn commit(&self, commit: CommitRequest) -> Result<CommitReply, ClientError> {
        if !self.is_connected().await {
            return Err(ClientError::NotConnected);
        }
        let request_id = Uuid::new_v4();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, reply_tx);

        if let Err(e) = self.send_frame(&ClientFrame::Commit { request_id, commit }).await {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.commit_timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ClientError::ConnectionLost),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(ClientError::Timeout)
            }
        }
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.send_frame(&ClientFrame::Ping).await
    }

    async fn send_frame(&self, frame: &ClientFrame) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(Message::text(frame.encode()?))
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Snapshot of the other users on the site.
    pub async fn presence(&self) -> PresenceView {
        self.presence.read().await.clone()
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.identity.map(|i| i.user_id)
    }

    pub fn connection_id(&self) -> Option<Uuid> {
        self.identity.map(|i| i.connection_id)
    }

    pub fn site_id(&self) -> Uuid {
        self.site_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

/// Read frames until the server accepts or refuses the join.
async fn await_joined(ws_reader: &mut WsStream) -> Result<Identity, ClientError> {
    while let Some(message) = ws_reader.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        match ServerFrame::decode(text.as_str())? {
            ServerFrame::Joined {
                connection_id,
                user_id,
            } => {
                return Ok(Identity {
                    connection_id,
                    user_id,
                })
            }
            ServerFrame::Error {
                code,
                message,
                retryable,
                ..
            } => {
                return Err(ClientError::Rejected {
                    code,
                    message,
                    retryable,
                })
            }
            other => log::debug!("ignoring {other:?} before join completed"),
        }
    }
    Err(ClientError::Protocol(ProtocolError::ConnectionClosed))
}

async fn dispatch(
    frame: ServerFrame,
    presence: &RwLock<PresenceView>,
    pending: &PendingCommits,
    event_tx: &mpsc::Sender<CollabEvent>,
) {
    let event = match frame {
        ServerFrame::PresenceList { .. }
        | ServerFrame::PresenceUpdated { .. }
        | ServerFrame::UserLeft { .. } => {
            if !presence.write().await.apply(&frame) {
                return;
            }
            match frame {
                ServerFrame::PresenceList { records } => CollabEvent::PresenceList(records),
                ServerFrame::PresenceUpdated { record } => CollabEvent::PresenceUpdated(record),
                ServerFrame::UserLeft { user_id } => CollabEvent::UserLeft(user_id),
                _ => return,
            }
        }
        ServerFrame::Edit { edit } => CollabEvent::RemoteEdit(edit),
        ServerFrame::ElementCommitted {
            element_id,
            language,
            variant,
            content,
            version,
            user_id,
        } => CollabEvent::ElementCommitted {
            element_id,
            language,
            variant,
            content,
            version,
            user_id,
        },
        ServerFrame::Committed {
            request_id,
            element_id,
            content,
            version,
        } => {
            let reply = CommitReply::Committed {
                element_id,
                content,
                version,
            };
            resolve(pending, request_id, Ok(reply)).await;
            return;
        }
        ServerFrame::Conflict {
            request_id,
            conflict,
        } => {
            resolve(pending, request_id, Ok(CommitReply::Conflict(conflict))).await;
            return;
        }
        ServerFrame::Error {
            request_id: Some(request_id),
            code,
            message,
            retryable,
        } => {
            let error = ClientError::Rejected {
                code,
                message,
                retryable,
            };
            resolve(pending, request_id, Err(error)).await;
            return;
        }
        ServerFrame::Error {
            request_id: None,
            code,
            message,
            ..
        } => {
            log::warn!("Server error ({code:?}): {message}");
            CollabEvent::Error { code, message }
        }
        ServerFrame::Joined { .. } | ServerFrame::Pong => return,
    };
    emit(event_tx, event);
}

async fn resolve(
    pending: &PendingCommits,
    request_id: Uuid,
    reply: Result<CommitReply, ClientError>,
) {
    match pending.lock().await.remove(&request_id) {
        Some(waiter) => {
            let _ = waiter.send(reply);
        }
        None => log::debug!("reply for unknown or expired commit {request_id}"),
    }
}

fn emit(event_tx: &mpsc::Sender<CollabEvent>, event: CollabEvent) {
    if let Err(e) = event_tx.try_send(event) {
        log::trace!("dropping client event: {e}");
    }
}
