//! Presence: who is connected to a site and which element they are on.
//!
//! ## Architecture
//!
//! ```text
//! Client A                      Server                         Client B
//!    │ update-presence(patch)      │                                │
//!    │ ──────────────────────────► │ PresenceTracker::update()      │
//!    │  (cursor moves throttled)   │        │                       │
//!    │                             │        ▼                       │
//!    │                             │ SiteChannel::publish(origin=A) │
//!    │ ◄── presence-updated(A) ─── │ ───── presence-updated(A) ───► │
//!    │  dropped: origin == self    │                   PresenceView::apply()
//! ```
//!
//! The tracker is the authoritative server-side registry, keyed by site
//! and then by connection. Every record is owned by exactly one
//! connection and disappears with it. Clients keep a [`PresenceView`] of
//! the *other* users only; their own record is filtered on receive.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::model::{ActivityStatus, PresencePatch, PresenceRecord};
use crate::protocol::ServerFrame;

/// Minimum spacing of cursor-only presence updates sent by a client.
pub const DEFAULT_CURSOR_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresenceError {
    #[error("Site {site_id} already has {limit} connected peers")]
    SiteFull { site_id: Uuid, limit: usize },
    #[error("Connection {0} is already registered")]
    AlreadyJoined(Uuid),
}

/// A record removed from the tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct Departure {
    pub record: PresenceRecord,
    /// No other connection of the same user remains on the site.
    pub user_gone: bool,
}

/// An idle editor whose focus was dropped by [`PresenceTracker::prune_idle`].
#[derive(Debug, Clone, PartialEq)]
pub struct IdleBlur {
    pub site_id: Uuid,
    pub connection_id: Uuid,
    pub record: PresenceRecord,
}

// ───────────────────────────────────────────────────────────────────
// Server-side registry
// ───────────────────────────────────────────────────────────────────

/// Process-wide presence registry: site id → connection id → record.
pub struct PresenceTracker {
    sites: RwLock<HashMap<Uuid, HashMap<Uuid, PresenceRecord>>>,
    max_peers_per_site: usize,
}

impl PresenceTracker {
    pub fn new(max_peers_per_site: usize) -> Self {
        Self {
            sites: RwLock::new(HashMap::new()),
            max_peers_per_site: max_peers_per_site.max(1),
        }
    }

    pub fn max_peers_per_site(&self) -> usize {
        self.max_peers_per_site
    }

    /// Register a connection on a site.
    ///
    /// Returns the records of everybody else already there, which is the
    /// initial `presence-list` for the new connection.
    pub async fn join(
        &self,
        site_id: Uuid,
        connection_id: Uuid,
        record: PresenceRecord,
    ) -> Result<Vec<PresenceRecord>, PresenceError> {
        let mut sites = self.sites.write().await;
        let site = sites.entry(site_id).or_default();
        if site.contains_key(&connection_id) {
            return Err(PresenceError::AlreadyJoined(connection_id));
        }
        if site.len() >= self.max_peers_per_site {
            return Err(PresenceError::SiteFull {
                site_id,
                limit: self.max_peers_per_site,
            });
        }

        let others = site.values().cloned().collect();
        log::debug!(
            "presence: user {} joined site {site_id} ({} connected)",
            record.user_id,
            site.len() + 1
        );
        site.insert(connection_id, record);
        Ok(others)
    }

    /// Merge a patch into a connection's record. `None` if not registered.
    pub async fn update(
        &self,
        site_id: Uuid,
        connection_id: Uuid,
        patch: &PresencePatch,
        now: DateTime<Utc>,
    ) -> Option<PresenceRecord> {
        let mut sites = self.sites.write().await;
        let record = sites.get_mut(&site_id)?.get_mut(&connection_id)?;
        record.apply(patch, now);
        log::trace!(
            "presence: user {} on {:?} cursor {:?}",
            record.user_id,
            record.element_id,
            record.cursor_position
        );
        Some(record.clone())
    }

    /// Remove a connection's record; empty sites are torn down.
    pub async fn leave(&self, site_id: Uuid, connection_id: Uuid) -> Option<Departure> {
        let mut sites = self.sites.write().await;
        let site = sites.get_mut(&site_id)?;
        let record = site.remove(&connection_id)?;
        let user_gone = !site.values().any(|r| r.user_id == record.user_id);
        if site.is_empty() {
            sites.remove(&site_id);
        }
        log::debug!("presence: user {} left site {site_id}", record.user_id);
        Some(Departure { record, user_gone })
    }

    /// Records on a site, minus the given connection's own.
    pub async fn list(&self, site_id: Uuid, excluding: Option<Uuid>) -> Vec<PresenceRecord> {
        let sites = self.sites.read().await;
        let Some(site) = sites.get(&site_id) else {
            return Vec::new();
        };
        let mut records: Vec<PresenceRecord> = site
            .iter()
            .filter(|(conn, _)| Some(**conn) != excluding)
            .map(|(_, record)| record.clone())
            .collect();
        records.sort_by_key(|r| r.last_activity);
        records
    }

    pub async fn get(&self, site_id: Uuid, connection_id: Uuid) -> Option<PresenceRecord> {
        let sites = self.sites.read().await;
        sites.get(&site_id)?.get(&connection_id).cloned()
    }

    pub async fn site_count(&self, site_id: Uuid) -> usize {
        self.sites.read().await.get(&site_id).map_or(0, HashMap::len)
    }

    /// Open connections of one user on a site.
    pub async fn user_connections(&self, site_id: Uuid, user_id: Uuid) -> usize {
        self.sites
            .read()
            .await
            .get(&site_id)
            .map_or(0, |site| site.values().filter(|r| r.user_id == user_id).count())
    }

    pub async fn active_sites(&self) -> usize {
        self.sites.read().await.len()
    }

    /// Drop element focus of editors silent for longer than `max_idle`.
    ///
    /// The connection stays registered; only its focus, cursor and
    /// selection are cleared.
    pub async fn prune_idle(&self, now: DateTime<Utc>, max_idle: Duration) -> Vec<IdleBlur> {
        let max_idle = ChronoDuration::from_std(max_idle).unwrap_or(ChronoDuration::MAX);
        let blur = PresencePatch::blur();
        let mut blurred = Vec::new();

        let mut sites = self.sites.write().await;
        for (site_id, site) in sites.iter_mut() {
            for (connection_id, record) in site.iter_mut() {
                if record.element_id.is_some()
                    && now.signed_duration_since(record.last_activity) > max_idle
                {
                    let last_activity = record.last_activity;
                    record.apply(&blur, now);
                    record.last_activity = last_activity;
                    blurred.push(IdleBlur {
                        site_id: *site_id,
                        connection_id: *connection_id,
                        record: record.clone(),
                    });
                }
            }
        }
        if !blurred.is_empty() {
            log::debug!("presence: cleared focus of {} idle editors", blurred.len());
        }
        blurred
    }
}

// ───────────────────────────────────────────────────────────────────
// Client-side view
// ───────────────────────────────────────────────────────────────────

/// A client's picture of the other users on its site.
#[derive(Debug, Clone)]
pub struct PresenceView {
    local_user_id: Uuid,
    peers: HashMap<Uuid, PresenceRecord>,
}

impl PresenceView {
    pub fn new(local_user_id: Uuid) -> Self {
        Self {
            local_user_id,
            peers: HashMap::new(),
        }
    }

    pub fn local_user_id(&self) -> Uuid {
        self.local_user_id
    }

    /// Apply a presence frame. Returns `true` if the view changed.
    ///
    /// Records of the local user are ignored.
    pub fn apply(&mut self, frame: &ServerFrame) -> bool {
        match frame {
            ServerFrame::PresenceList { records } => {
                self.replace_all(records.iter().cloned());
                true
            }
            ServerFrame::PresenceUpdated { record } => self.upsert(record.clone()),
            ServerFrame::UserLeft { user_id } => self.peers.remove(user_id).is_some(),
            _ => false,
        }
    }

    /// Replace everything, as after a (re)connect.
    pub fn replace_all(&mut self, records: impl IntoIterator<Item = PresenceRecord>) {
        self.peers.clear();
        for record in records {
            self.upsert(record);
        }
    }

    fn upsert(&mut self, record: PresenceRecord) -> bool {
        if record.user_id == self.local_user_id {
            return false;
        }
        self.peers.insert(record.user_id, record);
        true
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn peer(&self, user_id: &Uuid) -> Option<&PresenceRecord> {
        self.peers.get(user_id)
    }

    /// Peers ordered by user id.
    pub fn peers(&self) -> Vec<&PresenceRecord> {
        let mut peers: Vec<&PresenceRecord> = self.peers.values().collect();
        peers.sort_by_key(|r| r.user_id);
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Peers focused on `element_id`.
    pub fn peers_on_element(&self, element_id: &str) -> Vec<&PresenceRecord> {
        let mut peers: Vec<&PresenceRecord> = self
            .peers
            .values()
            .filter(|r| r.element_id.as_deref() == Some(element_id))
            .collect();
        peers.sort_by_key(|r| r.user_id);
        peers
    }

    /// Activity status of every peer.
    pub fn classify(&self, now: DateTime<Utc>) -> Vec<(Uuid, ActivityStatus)> {
        let mut statuses: Vec<(Uuid, ActivityStatus)> = self
            .peers
            .values()
            .map(|r| (r.user_id, ActivityStatus::classify(r.last_activity, now)))
            .collect();
        statuses.sort_by_key(|(id, _)| *id);
        statuses
    }
}

/// Rate limiter for cursor-only updates.
#[derive(Debug, Clone)]
pub struct CursorThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
}

impl Default for CursorThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_CURSOR_INTERVAL)
    }
}

impl CursorThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
        }
    }

    /// Whether an update may go out at `now`; records it if so.
    pub fn admit(&mut self, now: Instant) -> bool {
        match self.last_sent {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.last_sent = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Selection;

    fn record(user: Uuid) -> PresenceRecord {
        PresenceRecord::new(user, format!("{user}@example.com"))
    }

    // ── Tracker ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_join_returns_others_only() {
        let tracker = PresenceTracker::new(10);
        let site = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (conn_a, conn_b) = (Uuid::new_v4(), Uuid::new_v4());

        let first = tracker.join(site, conn_a, record(a)).await.unwrap();
        assert!(first.is_empty());

        let second = tracker.join(site, conn_b, record(b)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].user_id, a);

        let seen_by_a = tracker.list(site, Some(conn_a)).await;
        assert_eq!(seen_by_a.len(), 1);
        assert_eq!(seen_by_a[0].user_id, b);
        assert_eq!(tracker.site_count(site).await, 2);
    }

    #[tokio::test]
    async fn test_site_full() {
        let tracker = PresenceTracker::new(1);
        let site = Uuid::new_v4();
        tracker.join(site, Uuid::new_v4(), record(Uuid::new_v4())).await.unwrap();
        let err = tracker
            .join(site, Uuid::new_v4(), record(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(err, PresenceError::SiteFull { site_id: site, limit: 1 });
    }

    #[tokio::test]
    async fn test_duplicate_connection_rejected() {
        let tracker = PresenceTracker::new(10);
        let (site, conn) = (Uuid::new_v4(), Uuid::new_v4());
        tracker.join(site, conn, record(Uuid::new_v4())).await.unwrap();
        assert_eq!(
            tracker.join(site, conn, record(Uuid::new_v4())).await,
            Err(PresenceError::AlreadyJoined(conn))
        );
    }

    #[tokio::test]
    async fn test_update_merges_patch() {
        let tracker = PresenceTracker::new(10);
        let (site, conn, user) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        tracker.join(site, conn, record(user)).await.unwrap();

        let now = Utc::now();
        let updated = tracker
            .update(site, conn, &PresencePatch::focus("hero-title"), now)
            .await
            .unwrap();
        assert_eq!(updated.element_id.as_deref(), Some("hero-title"));
        assert_eq!(updated.last_activity, now);

        let updated = tracker
            .update(
                site,
                conn,
                &PresencePatch::cursor(4).with_selection(Selection::new(2, 4)),
                now,
            )
            .await
            .unwrap();
        assert_eq!(updated.cursor_position, Some(4));
        assert!(updated.is_editing());

        let blurred = tracker
            .update(site, conn, &PresencePatch::blur(), now)
            .await
            .unwrap();
        assert!(blurred.element_id.is_none());
        assert!(blurred.cursor_position.is_none());
        assert!(blurred.selection.is_none());

        assert!(tracker
            .update(site, Uuid::new_v4(), &PresencePatch::cursor(1), now)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_leave_reports_last_connection_of_user() {
        let tracker = PresenceTracker::new(10);
        let (site, user) = (Uuid::new_v4(), Uuid::new_v4());
        let (tab1, tab2) = (Uuid::new_v4(), Uuid::new_v4());
        tracker.join(site, tab1, record(user)).await.unwrap();
        tracker.join(site, tab2, record(user)).await.unwrap();
        assert_eq!(tracker.user_connections(site, user).await, 2);

        let first = tracker.leave(site, tab1).await.unwrap();
        assert!(!first.user_gone);
        let second = tracker.leave(site, tab2).await.unwrap();
        assert!(second.user_gone);

        assert_eq!(tracker.site_count(site).await, 0);
        assert_eq!(tracker.active_sites().await, 0);
        assert!(tracker.leave(site, tab2).await.is_none());
    }

    #[tokio::test]
    async fn test_prune_idle_blurs_stale_editors() {
        let tracker = PresenceTracker::new(10);
        let site = Uuid::new_v4();
        let (stale, fresh) = (Uuid::new_v4(), Uuid::new_v4());
        tracker.join(site, stale, record(Uuid::new_v4())).await.unwrap();
        tracker.join(site, fresh, record(Uuid::new_v4())).await.unwrap();

        let now = Utc::now();
        let long_ago = now - ChronoDuration::minutes(10);
        tracker
            .update(site, stale, &PresencePatch::focus("footer"), long_ago)
            .await;
        tracker
            .update(site, fresh, &PresencePatch::focus("footer"), now)
            .await;

        let blurred = tracker.prune_idle(now, Duration::from_secs(300)).await;
        assert_eq!(blurred.len(), 1);
        assert_eq!(blurred[0].connection_id, stale);
        assert!(blurred[0].record.element_id.is_none());
        assert_eq!(blurred[0].record.last_activity, long_ago);

        assert!(tracker.prune_idle(now, Duration::from_secs(300)).await.is_empty());
        assert_eq!(tracker.site_count(site).await, 2);
    }

    // ── View ─────────────────────────────────────────────────────────

    #[test]
    fn test_view_filters_own_record() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut view = PresenceView::new(me);

        assert!(view.apply(&ServerFrame::PresenceList {
            records: vec![record(me), record(other)],
        }));
        assert_eq!(view.len(), 1);
        assert!(view.peer(&me).is_none());

        assert!(!view.apply(&ServerFrame::PresenceUpdated { record: record(me) }));
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn test_view_tracks_updates_and_departures() {
        let mut view = PresenceView::new(Uuid::new_v4());
        let peer = Uuid::new_v4();

        let mut focused = record(peer);
        focused.apply(&PresencePatch::focus("hero-title"), Utc::now());
        view.apply(&ServerFrame::PresenceUpdated { record: focused });
        assert_eq!(view.peers_on_element("hero-title").len(), 1);
        assert!(view.peers_on_element("footer").is_empty());

        assert!(view.apply(&ServerFrame::UserLeft { user_id: peer }));
        assert!(view.is_empty());
        assert!(!view.apply(&ServerFrame::UserLeft { user_id: peer }));
        assert!(!view.apply(&ServerFrame::Pong));
    }

    #[test]
    fn test_view_classify() {
        let mut view = PresenceView::new(Uuid::new_v4());
        let now = Utc::now();
        let mut active = record(Uuid::new_v4());
        active.last_activity = now - ChronoDuration::seconds(10);
        let mut recent = record(Uuid::new_v4());
        recent.last_activity = now - ChronoDuration::minutes(3);
        let mut idle = record(Uuid::new_v4());
        idle.last_activity = now - ChronoDuration::minutes(30);
        let ids = (active.user_id, recent.user_id, idle.user_id);
        view.replace_all([active, recent, idle]);

        let statuses: HashMap<Uuid, ActivityStatus> = view.classify(now).into_iter().collect();
        assert_eq!(statuses[&ids.0], ActivityStatus::Active);
        assert_eq!(statuses[&ids.1], ActivityStatus::Recent);
        assert_eq!(statuses[&ids.2], ActivityStatus::Idle);
    }

    // ── Throttle ─────────────────────────────────────────────────────

    #[test]
    fn test_cursor_throttle() {
        let mut throttle = CursorThrottle::new(Duration::from_millis(50));
        let start = Instant::now();
        assert!(throttle.admit(start));
        assert!(!throttle.admit(start + Duration::from_millis(10)));
        assert!(!throttle.admit(start + Duration::from_millis(49)));
        assert!(throttle.admit(start + Duration::from_millis(50)));

        throttle.reset();
        assert!(throttle.admit(start + Duration::from_millis(51)));
    }
}
