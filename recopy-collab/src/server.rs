//! WebSocket collaboration server with per-site routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                 ┌── PresenceTracker (site → connection → record)
//!            ├── site channel ─┤
//! Client B ──┘   (broadcast)   └── ConflictDetector ── ContentStore
//!                     │                    │
//!          ┌──────────┼──────────┐         └── CommitListener (webhooks)
//!          ▼          ▼          ▼
//!       Client A   Client B   Client C
//! ```
//!
//! A connection's first frame must be `join`. The session it names is
//! validated (with the peer address) before the connection is registered,
//! and again before every presence update, edit relay and commit, and on
//! every heartbeat. A member whose session stops authorizing is closed on
//! its next presence update or heartbeat.

use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{ChannelRegistry, Envelope, SiteChannel};
use crate::config::ServerConfig;
use crate::conflict::{CommitError, CommitOutcome, CommitRequest, ConflictDetector};
use crate::model::{CollaborativeEdit, PresencePatch, PresenceRecord};
use crate::presence::{PresenceError, PresenceTracker};
use crate::protocol::{ClientFrame, ErrorCode, JoinProfile, ProtocolError, ServerFrame};
use crate::session::{EditSession, SessionRequest};

/// Editors silent this long lose their element focus.
pub const IDLE_FOCUS_TIMEOUT: Duration = Duration::from_secs(5 * 60);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub rejected_joins: u64,
    pub relayed_edits: u64,
    pub commits: u64,
    pub conflicts: u64,
    pub active_sites: usize,
}

struct ServerState {
    config: ServerConfig,
    presence: PresenceTracker,
    channels: ChannelRegistry,
    detector: Arc<ConflictDetector>,
    stats: RwLock<ServerStats>,
}

/// A connection that completed its `join`.
struct Membership {
    site_id: Uuid,
    session: EditSession,
    channel: Arc<SiteChannel>,
}

/// A `join` frame with where it came from.
struct Joining {
    connection_id: Uuid,
    addr: SocketAddr,
    site_id: Uuid,
    session_token: String,
    profile: JoinProfile,
}

enum Flow {
    Continue,
    Close,
}

/// The collaboration server. Cheap to clone.
#[derive(Clone)]
pub struct CollabServer {
    state: Arc<ServerState>,
}

impl CollabServer {
    pub fn new(config: ServerConfig, detector: Arc<ConflictDetector>) -> Self {
        let state = ServerState {
            presence: PresenceTracker::new(config.max_peers_per_site),
            channels: ChannelRegistry::new(config.broadcast_capacity),
            detector,
            stats: RwLock::new(ServerStats::default()),
            config,
        };
        Self {
            state: Arc::new(state),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.state.presence
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.state.channels
    }

    pub async fn stats(&self) -> ServerStats {
        self.state.stats.read().await.clone()
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Collaboration server listening on {}", listener.local_addr()?);

        let janitor = tokio::spawn(Self::blur_idle_editors(self.state.clone()));
        let result = self.accept_loop(&listener).await;
        janitor.abort();
        result
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(state, stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn blur_idle_editors(state: Arc<ServerState>) {
        let period = Duration::from_secs(state.config.heartbeat_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            for blur in state.presence.prune_idle(Utc::now(), IDLE_FOCUS_TIMEOUT).await {
                if let Some(channel) = state.channels.get(&blur.site_id).await {
                    let frame = ServerFrame::PresenceUpdated {
                        record: blur.record,
                    };
                    if let Err(e) = channel.publish(blur.connection_id, &frame) {
                        log::warn!("failed to publish idle blur: {e}");
                    }
                }
            }
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        state: Arc<ServerState>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let connection_id = Uuid::new_v4();

        log::info!("WebSocket connection {connection_id} established from {addr}");
        {
            let mut s = state.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let period = Duration::from_secs(state.config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        let mut membership: Option<Membership> = None;
        let mut channel_rx: Option<broadcast::Receiver<Envelope>> = None;

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                state.stats.write().await.total_frames += 1;
                                let frame = match ClientFrame::decode(text.as_str()) {
                                    Ok(frame) => frame,
                                    Err(e) => {
                                        log::warn!("Bad frame from {addr}: {e}");
                                        send(&mut ws_sender, &ServerFrame::error(ErrorCode::InvalidFrame, e.to_string(), false)).await?;
                                        continue;
                                    }
                                };
                                let flow = state
                                    .handle_frame(
                                        frame,
                                        connection_id,
                                        addr,
                                        &mut membership,
                                        &mut channel_rx,
                                        &mut ws_sender,
                                    )
                                    .await?;
                                if let Flow::Close = flow {
                                    break;
                                }
                            }
                            Some(Ok(Message::Binary(_))) => {
                                send(&mut ws_sender, &ServerFrame::error(ErrorCode::InvalidFrame, "binary frames are not supported", false)).await?;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection {connection_id} closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }

                    envelope = async {
                        match channel_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match envelope {
                            Ok(envelope) => {
                                // Self-filter on receive
                                if envelope.is_for(connection_id) {
                                    ws_sender.send(Message::text(envelope.frame.to_string())).await?;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Connection {connection_id} lagged by {n} frames");
                                if let Some(m) = &membership {
                                    m.channel.record_lag(n);
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }

                    _ = heartbeat.tick() => {
                        // Silent members whose session lapsed are dropped here
                        if let Some(m) = &membership {
                            if let Err(e) = state.reauthorize(addr, m) {
                                if !e.is_retryable() {
                                    log::info!("Closing connection {connection_id}: {e}");
                                    send(&mut ws_sender, &error_frame(None, &e)).await?;
                                    break;
                                }
                                log::warn!("Session check for {connection_id} failed: {e}");
                            }
                        }
                        ws_sender.send(Message::Ping(Default::default())).await?;
                    }
                }
            }
            Ok::<(), ServerError>(())
        }
        .await;

        drop(channel_rx);
        if let Some(membership) = membership {
            state.depart(connection_id, membership).await;
        }
        let _ = ws_sender.close().await;
        state.stats.write().await.active_connections -= 1;

        result
    }
}

impl ServerState {
    async fn handle_frame(
        &self,
        frame: ClientFrame,
        connection_id: Uuid,
        addr: SocketAddr,
        membership: &mut Option<Membership>,
        channel_rx: &mut Option<broadcast::Receiver<Envelope>>,
        ws_sender: &mut WsSink,
    ) -> Result<Flow, ServerError> {
        log::trace!("{} frame from {connection_id}", frame.kind());

        let Some(m) = membership.as_ref() else {
            return match frame {
                ClientFrame::Join {
                    site_id,
                    session_token,
                    profile,
                } => {
                    let joining = Joining {
                        connection_id,
                        addr,
                        site_id,
                        session_token,
                        profile,
                    };
                    self.join(joining, membership, channel_rx, ws_sender).await
                }
                ClientFrame::Ping => {
                    send(ws_sender, &ServerFrame::Pong).await?;
                    Ok(Flow::Continue)
                }
                ClientFrame::Leave => Ok(Flow::Close),
                other => {
                    let request_id = match other {
                        ClientFrame::Commit { request_id, .. } => Some(request_id),
                        _ => None,
                    };
                    let error = ServerFrame::Error {
                        request_id,
                        code: ErrorCode::NotJoined,
                        message: "join a site first".into(),
                        retryable: false,
                    };
                    send(ws_sender, &error).await?;
                    Ok(Flow::Continue)
                }
            };
        };

        match frame {
            ClientFrame::Join { .. } => {
                send(
                    ws_sender,
                    &ServerFrame::error(ErrorCode::InvalidFrame, "already joined", false),
                )
                .await?;
            }
            ClientFrame::UpdatePresence { patch } => {
                return self
                    .update_presence(connection_id, addr, m, &patch, ws_sender)
                    .await;
            }
            ClientFrame::RequestPresence => {
                let records = self.presence.list(m.site_id, Some(connection_id)).await;
                send(ws_sender, &ServerFrame::PresenceList { records }).await?;
            }
            ClientFrame::Edit { edit } => {
                self.relay_edit(connection_id, addr, m, edit, ws_sender).await?;
            }
            ClientFrame::Commit { request_id, commit } => {
                self.commit(connection_id, addr, m, request_id, commit, ws_sender)
                    .await?;
            }
            ClientFrame::Leave => return Ok(Flow::Close),
            ClientFrame::Ping => send(ws_sender, &ServerFrame::Pong).await?,
        }
        Ok(Flow::Continue)
    }

    async fn join(
        &self,
        joining: Joining,
        membership: &mut Option<Membership>,
        channel_rx: &mut Option<broadcast::Receiver<Envelope>>,
        ws_sender: &mut WsSink,
    ) -> Result<Flow, ServerError> {
        let Joining {
            connection_id,
            addr,
            site_id,
            session_token,
            profile,
        } = joining;
        let request = SessionRequest::new(session_token, site_id).from_ip(addr.ip().to_string());
        let session = match self.detector.authorize(&request) {
            Ok(session) => session,
            Err(e) => {
                log::warn!("Rejected join of {addr} to site {site_id}: {e}");
                self.stats.write().await.rejected_joins += 1;
                send(ws_sender, &error_frame(None, &e)).await?;
                return Ok(if e.is_retryable() { Flow::Continue } else { Flow::Close });
            }
        };

        let mut record = PresenceRecord::new(session.user_id, session.user_email.clone());
        record.user_name = profile.user_name.or_else(|| session.user_name.clone());
        record.user_avatar = profile.user_avatar;

        let channel = self.channels.get_or_create(site_id).await;
        let rx = channel.subscribe();
        let others = match self.presence.join(site_id, connection_id, record.clone()).await {
            Ok(others) => others,
            Err(e) => {
                drop(rx);
                drop(channel);
                self.channels.remove_if_empty(&site_id).await;
                self.stats.write().await.rejected_joins += 1;
                log::warn!("Rejected join of {addr} to site {site_id}: {e}");
                let frame = match e {
                    PresenceError::SiteFull { .. } => {
                        ServerFrame::error(ErrorCode::SiteFull, e.to_string(), true)
                    }
                    PresenceError::AlreadyJoined(_) => {
                        ServerFrame::error(ErrorCode::InvalidFrame, e.to_string(), false)
                    }
                };
                send(ws_sender, &frame).await?;
                return Ok(Flow::Close);
            }
        };

        send(
            ws_sender,
            &ServerFrame::Joined {
                connection_id,
                user_id: session.user_id,
            },
        )
        .await?;
        send(ws_sender, &ServerFrame::PresenceList { records: others }).await?;
        channel.publish(connection_id, &ServerFrame::PresenceUpdated { record })?;

        log::info!(
            "User {} joined site {site_id} as connection {connection_id}",
            session.user_id
        );
        *channel_rx = Some(rx);
        *membership = Some(Membership {
            site_id,
            session,
            channel,
        });
        self.stats.write().await.active_sites = self.channels.channel_count().await;
        Ok(Flow::Continue)
    }

    /// Re-validate the session the connection joined with.
    fn reauthorize(
        &self,
        addr: SocketAddr,
        membership: &Membership,
    ) -> Result<EditSession, CommitError> {
        let request = SessionRequest::new(membership.session.token.clone(), membership.site_id)
            .from_ip(addr.ip().to_string());
        self.detector.authorize(&request)
    }

    /// Re-check the session, then publish the merged record.
    ///
    /// A session that no longer authorizes closes the connection, so
    /// its presence is torn down and peers see the user leave.
    async fn update_presence(
        &self,
        connection_id: Uuid,
        addr: SocketAddr,
        membership: &Membership,
        patch: &PresencePatch,
        ws_sender: &mut WsSink,
    ) -> Result<Flow, ServerError> {
        if let Err(e) = self.reauthorize(addr, membership) {
            log::warn!("Dropped presence update from {connection_id}: {e}");
            send(ws_sender, &error_frame(None, &e)).await?;
            return Ok(if e.is_retryable() { Flow::Continue } else { Flow::Close });
        }

        if let Some(record) = self
            .presence
            .update(membership.site_id, connection_id, patch, Utc::now())
            .await
        {
            membership
                .channel
                .publish(connection_id, &ServerFrame::PresenceUpdated { record })?;
        }
        Ok(Flow::Continue)
    }

    /// Re-check the session, then fan the edit out without its token.
    async fn relay_edit(
        &self,
        connection_id: Uuid,
        addr: SocketAddr,
        membership: &Membership,
        mut edit: CollaborativeEdit,
        ws_sender: &mut WsSink,
    ) -> Result<(), ServerError> {
        let token = if edit.session_token.is_empty() {
            membership.session.token.clone()
        } else {
            std::mem::take(&mut edit.session_token)
        };
        let request =
            SessionRequest::new(token, membership.site_id).from_ip(addr.ip().to_string());
        let session = match self.detector.authorize(&request) {
            Ok(session) => session,
            Err(e) => {
                log::warn!("Dropped edit from {connection_id}: {e}");
                send(ws_sender, &error_frame(None, &e)).await?;
                return Ok(());
            }
        };

        edit.user_id = session.user_id;
        log::trace!(
            "edit on {} from {connection_id} ({} bytes)",
            edit.element_id,
            edit.content.len()
        );
        let frame = ServerFrame::Edit {
            edit: edit.redacted(),
        };
        membership.channel.publish(connection_id, &frame)?;
        self.stats.write().await.relayed_edits += 1;
        Ok(())
    }

    async fn commit(
        &self,
        connection_id: Uuid,
        addr: SocketAddr,
        membership: &Membership,
        request_id: Uuid,
        commit: CommitRequest,
        ws_sender: &mut WsSink,
    ) -> Result<(), ServerError> {
        let session_request = SessionRequest::new(membership.session.token.clone(), membership.site_id)
            .from_ip(addr.ip().to_string());

        let outcome = self.detector.commit(&session_request, &commit);
        let reply = match outcome {
            Ok(CommitOutcome::Committed { element, .. }) => {
                self.stats.write().await.commits += 1;
                let version = element.version();
                membership.channel.publish(
                    connection_id,
                    &ServerFrame::ElementCommitted {
                        element_id: element.element_id.clone(),
                        language: element.language.clone(),
                        variant: element.variant.clone(),
                        content: element.current_content.clone(),
                        version,
                        user_id: membership.session.user_id,
                    },
                )?;
                ServerFrame::Committed {
                    request_id,
                    element_id: element.element_id,
                    content: element.current_content,
                    version,
                }
            }
            Ok(CommitOutcome::Conflict(conflict)) => {
                self.stats.write().await.conflicts += 1;
                ServerFrame::Conflict {
                    request_id,
                    conflict,
                }
            }
            Ok(CommitOutcome::Deleted { element }) => {
                log::error!("commit of {} reported a deletion", element.key());
                ServerFrame::Error {
                    request_id: Some(request_id),
                    code: ErrorCode::Internal,
                    message: "unexpected commit outcome".into(),
                    retryable: false,
                }
            }
            Err(e) => {
                if matches!(e, CommitError::Persistence(_)) {
                    log::error!("Commit from {connection_id} failed: {e}");
                } else {
                    log::warn!("Commit from {connection_id} rejected: {e}");
                }
                error_frame(Some(request_id), &e)
            }
        };
        send(ws_sender, &reply).await
    }

    /// Tear down a connection's presence and tell the rest of the site.
    async fn depart(&self, connection_id: Uuid, membership: Membership) {
        let Membership {
            site_id, channel, ..
        } = membership;

        if let Some(departure) = self.presence.leave(site_id, connection_id).await {
            let user_id = departure.record.user_id;
            let frame = if departure.user_gone {
                Some(ServerFrame::UserLeft { user_id })
            } else {
                // Another tab of the same user is still open
                self.presence
                    .list(site_id, None)
                    .await
                    .into_iter()
                    .rfind(|r| r.user_id == user_id)
                    .map(|record| ServerFrame::PresenceUpdated { record })
            };
            if let Some(frame) = frame {
                if let Err(e) = channel.publish(connection_id, &frame) {
                    log::warn!("failed to announce departure of {user_id}: {e}");
                }
            }
            log::info!("User {user_id} left site {site_id} (connection {connection_id})");
        }

        drop(channel);
        if self.channels.remove_if_empty(&site_id).await {
            log::debug!("Site channel {site_id} removed (empty)");
        }
        self.stats.write().await.active_sites = self.channels.channel_count().await;
    }
}

async fn send(sink: &mut WsSink, frame: &ServerFrame) -> Result<(), ServerError> {
    sink.send(Message::text(frame.encode()?)).await?;
    Ok(())
}

fn error_frame(request_id: Option<Uuid>, error: &CommitError) -> ServerFrame {
    let code = match error {
        CommitError::Unauthorized(_) => ErrorCode::Unauthorized,
        CommitError::ElementNotFound(_) => ErrorCode::NotFound,
        CommitError::Session(_) => ErrorCode::Internal,
        CommitError::Persistence(_) => ErrorCode::Persistence,
    };
    ServerFrame::Error {
        request_id,
        code,
        message: error.to_string(),
        retryable: error.is_retryable(),
    }
}
