//! # recopy-collab: Real-time collaborative editing core for ReCopyFast
//!
//! Lets several editors work on one site's content at the same time:
//! everyone sees who is editing what, in-progress edits are relayed live,
//! concurrent commits are detected instead of silently overwritten, and
//! committed changes are pushed to external systems through signed webhooks.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄─────────────────► │ CollabServer │
//! │ (per editor) │     JSON frames     │  (central)   │
//! └──────────────┘                     └──────┬───────┘
//!                          ┌──────────────────┼──────────────────┐
//!                          ▼                  ▼                  ▼
//!                  ┌───────────────┐  ┌───────────────┐  ┌────────────────┐
//!                  │PresenceTracker│  │ SiteChannel   │  │ConflictDetector│
//!                  │               │  │ (fan-out)     │  │ (CAS commits)  │
//!                  └───────────────┘  └───────────────┘  └───────┬────────┘
//!                                                                │ committed
//!                                                        ┌───────┴────────┐
//!                                                        │WebhookDispatcher│
//!                                                        └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`]: Presence records, edits, content elements, version tokens
//! - [`protocol`]: JSON frames spoken over a site channel
//! - [`presence`]: Who is connected to which site, and what they focus
//! - [`broadcast`]: Per-site fan-out with self-filtering
//! - [`session`]: Edit-session tokens and their validation
//! - [`conflict`]: Version-checked commits and merge suggestions
//! - [`webhook`]: Registration, signed delivery, retries, circuit breaker
//! - [`storage`]: In-memory and RocksDB persistence
//! - [`server`]: WebSocket collaboration server
//! - [`client`]: WebSocket client with presence view and cursor throttling
//! - [`config`]: Environment-driven settings

pub mod broadcast;
pub mod client;
pub mod config;
pub mod conflict;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod webhook;

// Re-exports for convenience
pub use broadcast::{ChannelRegistry, ChannelStats, Envelope, SiteChannel};
pub use client::{ClientError, CollabClient, CollabEvent, CommitReply, ConnectionState};
pub use config::{ConfigError, DispatcherConfig, ServerConfig};
pub use conflict::{
    CommitError, CommitEvent, CommitListener, CommitOutcome, CommitRequest, ConflictDetector,
    DisjointRangeMerge, ElementChange, ManualOnly, MergePolicy,
};
pub use model::{
    ActivityStatus, CollaborativeEdit, ContentElement, EditConflict, EditDelta, ElementKey,
    PresencePatch, PresenceRecord, Resolution, Selection, VersionToken,
};
pub use presence::{CursorThrottle, PresenceError, PresenceTracker, PresenceView};
pub use protocol::{ClientFrame, ErrorCode, JoinProfile, ProtocolError, ServerFrame};
pub use server::{CollabServer, ServerError, ServerStats};
pub use session::{EditSession, EditSessionValidator, InMemorySessions, SessionError, SessionRequest};
pub use storage::{
    CasOutcome, CompressedBody, ContentStore, InMemoryStore, RocksStore, StoreConfig, StoreError,
    WebhookStore,
};
pub use webhook::{
    Backoff, NewWebhook, RetryJob, RetryScheduler, Webhook, WebhookDelivery, WebhookDispatcher,
    WebhookError, WebhookEvent, WebhookPayload, WebhookRegistry, WebhookUpdate,
};
