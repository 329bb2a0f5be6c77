//! Optimistic-concurrency commit path for content elements.
//!
//! A commit names the version token its editor last observed. The
//! detector re-reads the element and hands the store a compare-and-swap
//! against that token. A stale token and a lost race look the same to
//! the caller: a [`CommitOutcome::Conflict`] carrying the content that
//! won, plus a merge suggestion when the [`MergePolicy`] found one.
//! Nothing is ever overwritten silently.

pub mod merge;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub use merge::{DisjointRangeMerge, ManualOnly, MergeError, MergePolicy, TextChange};

use crate::model::{
    CollaborativeEdit, ContentElement, EditConflict, ElementKey, Resolution, VersionToken,
};
use crate::session::{EditSession, EditSessionValidator, SessionError, SessionRequest};
use crate::storage::{CasOutcome, ContentStore, StoreError};

/// A request to persist new content for one element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    pub element_id: String,
    pub language: String,
    pub variant: String,
    pub content: String,
    /// Version the editor last observed; `None` to create the element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<VersionToken>,
    /// Content at `base_version`, used to compute merge suggestions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_content: Option<String>,
    /// CSS selector, recorded when the element is created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
}

impl CommitRequest {
    pub fn new(key: &ElementKey, content: impl Into<String>) -> Self {
        Self {
            element_id: key.element_id.clone(),
            language: key.language.clone(),
            variant: key.variant.clone(),
            content: content.into(),
            base_version: None,
            base_content: None,
            selector: None,
        }
    }

    pub fn based_on(mut self, version: VersionToken) -> Self {
        self.base_version = Some(version);
        self
    }

    pub fn with_base_content(mut self, content: impl Into<String>) -> Self {
        self.base_content = Some(content.into());
        self
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn key(&self, site_id: Uuid) -> ElementKey {
        ElementKey {
            site_id,
            element_id: self.element_id.clone(),
            language: self.language.clone(),
            variant: self.variant.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed { element: ContentElement, created: bool },
    Deleted { element: ContentElement },
    Conflict(EditConflict),
}

impl CommitOutcome {
    pub fn is_conflict(&self) -> bool {
        matches!(self, CommitOutcome::Conflict(_))
    }
}

#[derive(Debug, Clone, Error)]
pub enum CommitError {
    #[error("Not authorized to edit site {0}")]
    Unauthorized(Uuid),
    #[error("Element not found: {0}")]
    ElementNotFound(ElementKey),
    #[error("Session check failed: {0}")]
    Session(#[from] SessionError),
    #[error("Persistence failed: {0}")]
    Persistence(#[from] StoreError),
}

impl CommitError {
    pub fn is_retryable(&self) -> bool {
        match self {
            CommitError::Unauthorized(_) | CommitError::ElementNotFound(_) => false,
            CommitError::Session(e) => e.is_retryable(),
            CommitError::Persistence(e) => e.is_retryable(),
        }
    }
}

/// What a successful write changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementChange {
    Created,
    Updated,
    Deleted,
}

/// Emitted after every successful write.
#[derive(Debug, Clone)]
pub struct CommitEvent {
    pub change: ElementChange,
    /// State after the write (before it, for deletions).
    pub element: ContentElement,
    pub previous_content: Option<String>,
    pub user_id: Uuid,
}

/// Reacts to persisted changes. Must not block.
pub trait CommitListener: Send + Sync {
    fn on_commit(&self, event: &CommitEvent);
}

pub struct ConflictDetector {
    store: Arc<dyn ContentStore>,
    sessions: Arc<dyn EditSessionValidator>,
    policy: Box<dyn MergePolicy>,
    listeners: Vec<Arc<dyn CommitListener>>,
}

impl ConflictDetector {
    /// Uses [`DisjointRangeMerge`] for suggestions.
    pub fn new(store: Arc<dyn ContentStore>, sessions: Arc<dyn EditSessionValidator>) -> Self {
        Self {
            store,
            sessions,
            policy: Box::new(DisjointRangeMerge),
            listeners: Vec::new(),
        }
    }

    pub fn with_policy(mut self, policy: impl MergePolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn CommitListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    /// Resolve the caller's session, then commit on its behalf.
    pub fn commit(
        &self,
        session_request: &SessionRequest,
        request: &CommitRequest,
    ) -> Result<CommitOutcome, CommitError> {
        let session = self.authorize(session_request)?;
        self.attempt_commit(&session, request)
    }

    pub fn authorize(&self, session_request: &SessionRequest) -> Result<EditSession, CommitError> {
        self.sessions
            .validate_edit_session(session_request)?
            .ok_or(CommitError::Unauthorized(session_request.site_id))
    }

    /// Persist `request` if the element is still at its base version.
    pub fn attempt_commit(
        &self,
        session: &EditSession,
        request: &CommitRequest,
    ) -> Result<CommitOutcome, CommitError> {
        let key = request.key(session.site_id);
        let current = self.store.get_element(&key)?;

        let outcome = match (current, request.base_version) {
            (None, None) => {
                let mut element = ContentElement::new(
                    &key,
                    request.selector.clone().unwrap_or_default(),
                    request.content.clone(),
                );
                element.last_edited_by = Some(session.user_id);
                self.swap(&key, None, element, None, session, request)?
            }
            (None, Some(_)) => return Err(CommitError::ElementNotFound(key)),
            (Some(current), Some(base)) if current.version() == base => {
                let mut element = current.clone();
                element.current_content = request.content.clone();
                element.last_edited_by = Some(session.user_id);
                element.updated_at = VersionToken::next_timestamp(current.updated_at, Utc::now());
                let previous = Some(current.current_content);
                self.swap(&key, Some(base), element, previous, session, request)?
            }
            (Some(current), _) => self.conflict(session, request, &current),
        };

        match &outcome {
            CommitOutcome::Committed { element, created } => {
                log::info!(
                    "{} {key} at version {} by {}",
                    if *created { "created" } else { "committed" },
                    element.version(),
                    session.user_id
                );
            }
            CommitOutcome::Conflict(conflict) => {
                log::debug!(
                    "conflict on {key}: base {:?}, current {} ({:?})",
                    request.base_version,
                    conflict.current_version,
                    conflict.resolution
                );
            }
            CommitOutcome::Deleted { .. } => {}
        }
        Ok(outcome)
    }

    /// Delete an element if it is still at `base_version`.
    pub fn delete_element(
        &self,
        session: &EditSession,
        key: &ElementKey,
        base_version: VersionToken,
    ) -> Result<CommitOutcome, CommitError> {
        if key.site_id != session.site_id {
            return Err(CommitError::Unauthorized(key.site_id));
        }
        let current = self
            .store
            .get_element(key)?
            .ok_or_else(|| CommitError::ElementNotFound(key.clone()))?;

        let request = CommitRequest::new(key, "").based_on(base_version);
        if current.version() != base_version {
            return Ok(self.conflict(session, &request, &current));
        }

        match self.store.compare_and_swap(key, Some(base_version), None)? {
            CasOutcome::Swapped => {
                log::info!("deleted {key} by {}", session.user_id);
                self.notify(CommitEvent {
                    change: ElementChange::Deleted,
                    previous_content: Some(current.current_content.clone()),
                    element: current.clone(),
                    user_id: session.user_id,
                });
                Ok(CommitOutcome::Deleted { element: current })
            }
            CasOutcome::Mismatch { current: Some(winner) } => {
                Ok(self.conflict(session, &request, &winner))
            }
            CasOutcome::Mismatch { current: None } => Err(CommitError::ElementNotFound(key.clone())),
        }
    }

    fn swap(
        &self,
        key: &ElementKey,
        expected: Option<VersionToken>,
        element: ContentElement,
        previous: Option<String>,
        session: &EditSession,
        request: &CommitRequest,
    ) -> Result<CommitOutcome, CommitError> {
        let created = expected.is_none();
        match self.store.compare_and_swap(key, expected, Some(element.clone()))? {
            CasOutcome::Swapped => {
                self.notify(CommitEvent {
                    change: if created {
                        ElementChange::Created
                    } else {
                        ElementChange::Updated
                    },
                    element: element.clone(),
                    previous_content: previous,
                    user_id: session.user_id,
                });
                Ok(CommitOutcome::Committed { element, created })
            }
            // lost the race
            CasOutcome::Mismatch { current: Some(winner) } => {
                Ok(self.conflict(session, request, &winner))
            }
            CasOutcome::Mismatch { current: None } => Err(CommitError::ElementNotFound(key.clone())),
        }
    }

    fn conflict(
        &self,
        session: &EditSession,
        request: &CommitRequest,
        current: &ContentElement,
    ) -> CommitOutcome {
        let mine = CollaborativeEdit::new(
            request.element_id.clone(),
            request.content.clone(),
            session.user_id,
            "",
        );
        let mut theirs = CollaborativeEdit::new(
            current.element_id.clone(),
            current.current_content.clone(),
            current.last_edited_by.unwrap_or_else(Uuid::nil),
            "",
        );
        theirs.timestamp = current.updated_at;

        let merged = request.base_content.as_deref().and_then(|base| {
            match self
                .policy
                .merge(base, &current.current_content, &request.content)
            {
                Ok(merged) => merged,
                Err(e) => {
                    log::warn!("{} merge failed for {}: {e}", self.policy.name(), request.element_id);
                    None
                }
            }
        });

        CommitOutcome::Conflict(EditConflict {
            element_id: request.element_id.clone(),
            conflicting_edits: vec![mine, theirs],
            base_content: current.current_content.clone(),
            current_version: current.version(),
            resolution: Some(if merged.is_some() {
                Resolution::Auto
            } else {
                Resolution::Manual
            }),
            merged_content: merged,
        })
    }

    fn notify(&self, event: CommitEvent) {
        for listener in &self.listeners {
            listener.on_commit(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InMemorySessions;
    use crate::storage::InMemoryStore;
    use chrono::Duration;
    use std::sync::{Barrier, Mutex};

    struct Fixture {
        store: Arc<InMemoryStore>,
        sessions: Arc<InMemorySessions>,
        detector: Arc<ConflictDetector>,
        site: Uuid,
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(ElementChange, String)>>);

    impl CommitListener for Recorder {
        fn on_commit(&self, event: &CommitEvent) {
            self.0
                .lock()
                .unwrap()
                .push((event.change, event.element.current_content.clone()));
        }
    }

    fn fixture_with(listener: Option<Arc<Recorder>>) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let sessions = Arc::new(InMemorySessions::new());
        let mut detector = ConflictDetector::new(store.clone(), sessions.clone());
        if let Some(listener) = listener {
            detector = detector.with_listener(listener);
        }
        Fixture {
            store,
            sessions,
            detector: Arc::new(detector),
            site: Uuid::new_v4(),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(None)
    }

    impl Fixture {
        fn session(&self, email: &str) -> EditSession {
            self.sessions
                .issue(self.site, Uuid::new_v4(), email, Duration::hours(1))
                .unwrap()
        }

        fn seed(&self, element_id: &str, content: &str) -> ContentElement {
            let element = ContentElement::new(&ElementKey::new(self.site, element_id), "h1", content);
            self.store.insert_element(element.clone()).unwrap();
            element
        }
    }

    #[test]
    fn test_commit_with_current_token_succeeds() {
        let fx = fixture();
        let seeded = fx.seed("hero-title", "Welcome");
        let alice = fx.session("alice@example.com");

        let request = CommitRequest::new(&seeded.key(), "Welcome!").based_on(seeded.version());
        match fx.detector.attempt_commit(&alice, &request).unwrap() {
            CommitOutcome::Committed { element, created } => {
                assert!(!created);
                assert_eq!(element.current_content, "Welcome!");
                assert_eq!(element.original_content, "Welcome");
                assert_eq!(element.last_edited_by, Some(alice.user_id));
                assert!(element.version() > seeded.version());
            }
            other => panic!("expected commit, got {other:?}"),
        }
    }

    #[test]
    fn test_stale_token_yields_conflict_with_winning_content() {
        // B commits first from T0, then A's commit from T0 is stale.
        let fx = fixture();
        let t0 = fx.seed("hero-title", "Hello");
        let alice = fx.session("alice@example.com");
        let bob = fx.session("bob@example.com");

        let b = CommitRequest::new(&t0.key(), "Hi there").based_on(t0.version());
        let t1 = match fx.detector.attempt_commit(&bob, &b).unwrap() {
            CommitOutcome::Committed { element, .. } => element.version(),
            other => panic!("expected commit, got {other:?}"),
        };

        let a = CommitRequest::new(&t0.key(), "Welcome!")
            .based_on(t0.version())
            .with_base_content("Hello");
        match fx.detector.attempt_commit(&alice, &a).unwrap() {
            CommitOutcome::Conflict(conflict) => {
                assert_eq!(conflict.base_content, "Hi there");
                assert_eq!(conflict.current_version, t1);
                assert_eq!(conflict.conflicting_edits.len(), 2);
                assert_eq!(conflict.conflicting_edits[0].content, "Welcome!");
                assert_eq!(conflict.conflicting_edits[1].user_id, bob.user_id);
                assert_eq!(conflict.resolution, Some(Resolution::Manual));
                assert!(conflict.merged_content.is_none());
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        let stored = fx.store.get_element(&t0.key()).unwrap().unwrap();
        assert_eq!(stored.current_content, "Hi there");
    }

    #[test]
    fn test_disjoint_conflict_carries_auto_merge() {
        let fx = fixture();
        let t0 = fx.seed("intro", "Welcome to our site");
        let alice = fx.session("alice@example.com");
        let bob = fx.session("bob@example.com");

        let b = CommitRequest::new(&t0.key(), "Welcome to our new site").based_on(t0.version());
        fx.detector.attempt_commit(&bob, &b).unwrap();

        let a = CommitRequest::new(&t0.key(), "Hello, welcome to our site")
            .based_on(t0.version())
            .with_base_content("Welcome to our site");
        match fx.detector.attempt_commit(&alice, &a).unwrap() {
            CommitOutcome::Conflict(conflict) => {
                assert_eq!(conflict.resolution, Some(Resolution::Auto));
                assert_eq!(
                    conflict.merged_content.as_deref(),
                    Some("Hello, welcome to our new site")
                );
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        // suggestion only
        let stored = fx.store.get_element(&t0.key()).unwrap().unwrap();
        assert_eq!(stored.current_content, "Welcome to our new site");
    }

    #[test]
    fn test_manual_only_policy_never_suggests() {
        let store = Arc::new(InMemoryStore::new());
        let sessions = Arc::new(InMemorySessions::new());
        let detector = ConflictDetector::new(store.clone(), sessions.clone()).with_policy(ManualOnly);
        let site = Uuid::new_v4();
        let t0 = ContentElement::new(&ElementKey::new(site, "intro"), "p", "a b");
        store.insert_element(t0.clone()).unwrap();
        let session = sessions
            .issue(site, Uuid::new_v4(), "a@example.com", Duration::hours(1))
            .unwrap();

        let first = CommitRequest::new(&t0.key(), "a c").based_on(t0.version());
        detector.attempt_commit(&session, &first).unwrap();
        let second = CommitRequest::new(&t0.key(), "d b")
            .based_on(t0.version())
            .with_base_content("a b");
        match detector.attempt_commit(&session, &second).unwrap() {
            CommitOutcome::Conflict(conflict) => {
                assert_eq!(conflict.resolution, Some(Resolution::Manual))
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_concurrent_commits_with_same_token_at_most_one_wins() {
        for _ in 0..20 {
            let fx = fixture();
            let t0 = fx.seed("hero-title", "Hello");
            let writers = 4;
            let barrier = Arc::new(Barrier::new(writers));

            let handles: Vec<_> = (0..writers)
                .map(|i| {
                    let detector = fx.detector.clone();
                    let barrier = barrier.clone();
                    let session = fx.session(&format!("user{i}@example.com"));
                    let request =
                        CommitRequest::new(&t0.key(), format!("v{i}")).based_on(t0.version());
                    std::thread::spawn(move || {
                        barrier.wait();
                        detector.attempt_commit(&session, &request).unwrap()
                    })
                })
                .collect();

            let outcomes: Vec<CommitOutcome> =
                handles.into_iter().map(|h| h.join().unwrap()).collect();
            let wins = outcomes
                .iter()
                .filter(|o| matches!(o, CommitOutcome::Committed { .. }))
                .count();
            assert_eq!(wins, 1);
            assert_eq!(outcomes.iter().filter(|o| o.is_conflict()).count(), writers - 1);
        }
    }

    #[test]
    fn test_create_then_duplicate_create_conflicts() {
        let recorder = Arc::new(Recorder::default());
        let fx = fixture_with(Some(recorder.clone()));
        let alice = fx.session("alice@example.com");
        let key = ElementKey::new(fx.site, "footer").with_variant("b");

        let request = CommitRequest::new(&key, "© 2026").with_selector("footer p");
        match fx.detector.attempt_commit(&alice, &request).unwrap() {
            CommitOutcome::Committed { element, created } => {
                assert!(created);
                assert_eq!(element.selector, "footer p");
                assert_eq!(element.variant, "b");
            }
            other => panic!("expected create, got {other:?}"),
        }
        assert!(fx.detector.attempt_commit(&alice, &request).unwrap().is_conflict());
        assert_eq!(
            recorder.0.lock().unwrap().as_slice(),
            &[(ElementChange::Created, "© 2026".to_string())]
        );
    }

    #[test]
    fn test_token_on_missing_element_is_not_found() {
        let fx = fixture();
        let alice = fx.session("alice@example.com");
        let key = ElementKey::new(fx.site, "ghost");
        let request = CommitRequest::new(&key, "boo").based_on(VersionToken(1));
        let err = fx.detector.attempt_commit(&alice, &request).unwrap_err();
        assert!(matches!(err, CommitError::ElementNotFound(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_unreachable_store_is_retryable_error() {
        let fx = fixture();
        let t0 = fx.seed("hero-title", "Hello");
        let alice = fx.session("alice@example.com");
        fx.store.set_unavailable(true);

        let request = CommitRequest::new(&t0.key(), "Hi").based_on(t0.version());
        let err = fx.detector.attempt_commit(&alice, &request).unwrap_err();
        assert!(matches!(err, CommitError::Persistence(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_commit_requires_valid_session() {
        let fx = fixture();
        let t0 = fx.seed("hero-title", "Hello");
        let request = CommitRequest::new(&t0.key(), "Hi").based_on(t0.version());

        let forged = SessionRequest::new("not-a-token", fx.site);
        let err = fx.detector.commit(&forged, &request).unwrap_err();
        assert!(matches!(err, CommitError::Unauthorized(_)));

        let alice = fx.session("alice@example.com");
        let valid = SessionRequest::new(&alice.token, fx.site);
        assert!(matches!(
            fx.detector.commit(&valid, &request).unwrap(),
            CommitOutcome::Committed { .. }
        ));
    }

    #[test]
    fn test_delete_element_is_version_checked() {
        let recorder = Arc::new(Recorder::default());
        let fx = fixture_with(Some(recorder.clone()));
        let t0 = fx.seed("hero-title", "Hello");
        let alice = fx.session("alice@example.com");

        let stale = VersionToken(t0.version().0 - 1);
        assert!(fx.detector.delete_element(&alice, &t0.key(), stale).unwrap().is_conflict());

        match fx.detector.delete_element(&alice, &t0.key(), t0.version()).unwrap() {
            CommitOutcome::Deleted { element } => assert_eq!(element.current_content, "Hello"),
            other => panic!("expected delete, got {other:?}"),
        }
        assert!(fx.store.get_element(&t0.key()).unwrap().is_none());
        assert_eq!(recorder.0.lock().unwrap()[0].0, ElementChange::Deleted);

        let foreign = ElementKey::new(Uuid::new_v4(), "hero-title");
        assert!(matches!(
            fx.detector.delete_element(&alice, &foreign, t0.version()),
            Err(CommitError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_commit_request_wire_shape() {
        let key = ElementKey::new(Uuid::new_v4(), "hero-title");
        let json = serde_json::to_value(CommitRequest::new(&key, "Hi").based_on(VersionToken(7)))
            .unwrap();
        assert_eq!(json["elementId"], "hero-title");
        assert_eq!(json["language"], "en");
        assert_eq!(json["variant"], "default");
        assert_eq!(json["baseVersion"], 7);
        assert!(json.get("baseContent").is_none());
    }
}
