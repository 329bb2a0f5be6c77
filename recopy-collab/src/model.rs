//! Data model shared by the presence, edit broadcast and commit paths.
//!
//! Shapes that cross the client boundary serialize as camelCase JSON
//! (`userId`, `elementId`, `lastActivity`, ...). Persisted shapes keep
//! the snake_case column names of the backing tables.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Default language for a content element.
pub const DEFAULT_LANGUAGE: &str = "en";
/// Default A/B variant for a content element.
pub const DEFAULT_VARIANT: &str = "default";

// ───────────────────────────────────────────────────────────────────
// Presence
// ───────────────────────────────────────────────────────────────────

/// Text selection inside a content element (byte offsets, `start <= end`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub start: usize,
    pub end: usize,
}

impl Selection {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start: start.min(end),
            end: start.max(end),
        }
    }

    pub fn is_collapsed(&self) -> bool {
        self.start == self.end
    }
}

/// Live state of one user connected to a site.
///
/// Owned by the connection that created it; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: Uuid,
    pub user_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_avatar: Option<String>,
    /// Element currently focused; `None` while merely viewing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
    pub last_activity: DateTime<Utc>,
}

impl PresenceRecord {
    pub fn new(user_id: Uuid, user_email: impl Into<String>) -> Self {
        Self {
            user_id,
            user_email: user_email.into(),
            user_name: None,
            user_avatar: None,
            element_id: None,
            cursor_position: None,
            selection: None,
            last_activity: Utc::now(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = Some(name.into());
        self
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.user_avatar = Some(avatar.into());
        self
    }

    /// Merge a partial update and stamp `last_activity`.
    ///
    /// Cursor and selection only survive while an element is focused;
    /// moving focus to a different element resets both.
    pub fn apply(&mut self, patch: &PresencePatch, now: DateTime<Utc>) {
        if let Some(name) = &patch.user_name {
            self.user_name = Some(name.clone());
        }
        if let Some(avatar) = &patch.user_avatar {
            self.user_avatar = Some(avatar.clone());
        }

        if patch.clear_focus {
            self.element_id = None;
        }
        if let Some(element_id) = &patch.element_id {
            if self.element_id.as_deref() != Some(element_id.as_str()) {
                self.cursor_position = None;
                self.selection = None;
            }
            self.element_id = Some(element_id.clone());
        }

        if self.element_id.is_some() {
            if let Some(cursor) = patch.cursor_position {
                self.cursor_position = Some(cursor);
            }
            if let Some(selection) = patch.selection {
                self.selection = Some(selection);
            }
        } else {
            self.cursor_position = None;
            self.selection = None;
        }

        self.last_activity = now;
    }

    /// Whether the user is actively editing (focused with a caret).
    pub fn is_editing(&self) -> bool {
        self.element_id.is_some() && (self.cursor_position.is_some() || self.selection.is_some())
    }
}

/// Partial presence update sent by a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
    /// Drop element focus (and with it cursor and selection).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub clear_focus: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
}

impl PresencePatch {
    pub fn focus(element_id: impl Into<String>) -> Self {
        Self {
            element_id: Some(element_id.into()),
            ..Self::default()
        }
    }

    pub fn blur() -> Self {
        Self {
            clear_focus: true,
            ..Self::default()
        }
    }

    pub fn cursor(position: usize) -> Self {
        Self {
            cursor_position: Some(position),
            ..Self::default()
        }
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = Some(selection);
        self
    }

    /// Only a cursor move; these are throttled client-side.
    pub fn is_cursor_only(&self) -> bool {
        self.cursor_position.is_some()
            && self.user_name.is_none()
            && self.user_avatar.is_none()
            && self.element_id.is_none()
            && !self.clear_focus
            && self.selection.is_none()
    }
}

/// Display classification of how recently a peer did something.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Active,
    Recent,
    Idle,
}

impl ActivityStatus {
    /// `<1min` active, `<5min` recent, otherwise idle.
    pub fn classify(last_activity: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let elapsed = now.signed_duration_since(last_activity);
        if elapsed < Duration::minutes(1) {
            ActivityStatus::Active
        } else if elapsed < Duration::minutes(5) {
            ActivityStatus::Recent
        } else {
            ActivityStatus::Idle
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Edits
// ───────────────────────────────────────────────────────────────────

/// Operational-transform payload attached to an edit.
///
/// The broadcast path never looks inside; only merge logic decodes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", content = "data", rename_all = "kebab-case")]
pub enum EditDelta {
    /// A `yrs` v1 update against the element's text document.
    YrsUpdate(#[serde(with = "hex_bytes")] Vec<u8>),
    /// Any other client-defined encoding.
    Opaque(#[serde(with = "hex_bytes")] Vec<u8>),
}

impl EditDelta {
    pub fn bytes(&self) -> &[u8] {
        match self {
            EditDelta::YrsUpdate(b) | EditDelta::Opaque(b) => b,
        }
    }
}

/// One in-progress edit relayed to the other editors of a site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborativeEdit {
    pub element_id: String,
    /// Full content (or the client's rendering of it after the delta).
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<EditDelta>,
    pub user_id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Stripped before the edit leaves the server.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_token: String,
}

impl CollaborativeEdit {
    pub fn new(
        element_id: impl Into<String>,
        content: impl Into<String>,
        user_id: Uuid,
        session_token: impl Into<String>,
    ) -> Self {
        Self {
            element_id: element_id.into(),
            content: content.into(),
            delta: None,
            user_id,
            timestamp: Utc::now(),
            session_token: session_token.into(),
        }
    }

    pub fn with_delta(mut self, delta: EditDelta) -> Self {
        self.delta = Some(delta);
        self
    }

    /// Copy safe to hand to other peers.
    pub fn redacted(&self) -> Self {
        Self {
            session_token: String::new(),
            ..self.clone()
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Content elements
// ───────────────────────────────────────────────────────────────────

/// Unique key of a persisted content element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementKey {
    pub site_id: Uuid,
    pub element_id: String,
    pub language: String,
    pub variant: String,
}

impl ElementKey {
    pub fn new(site_id: Uuid, element_id: impl Into<String>) -> Self {
        Self {
            site_id,
            element_id: element_id.into(),
            language: DEFAULT_LANGUAGE.to_string(),
            variant: DEFAULT_VARIANT.to_string(),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = variant.into();
        self
    }
}

impl fmt::Display for ElementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}[{}:{}]",
            self.site_id, self.element_id, self.language, self.variant
        )
    }
}

/// Version marker of an element: its `updated_at` in microseconds.
///
/// Stores guarantee the token strictly increases on every write of
/// the same element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(pub i64);

impl VersionToken {
    pub fn from_timestamp(ts: DateTime<Utc>) -> Self {
        Self(ts.timestamp_micros())
    }

    /// Timestamp for the next write: `now`, bumped past `previous` if the
    /// clock has not moved on.
    pub fn next_timestamp(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        let floor = previous + Duration::microseconds(1);
        if now.timestamp_micros() < floor.timestamp_micros() {
            floor
        } else {
            now
        }
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A persisted editable element of a site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentElement {
    pub site_id: Uuid,
    pub element_id: String,
    pub selector: String,
    pub original_content: String,
    pub current_content: String,
    pub language: String,
    pub variant: String,
    pub metadata: BTreeMap<String, String>,
    pub last_edited_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContentElement {
    pub fn new(key: &ElementKey, selector: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        let now = Utc::now();
        Self {
            site_id: key.site_id,
            element_id: key.element_id.clone(),
            selector: selector.into(),
            original_content: content.clone(),
            current_content: content,
            language: key.language.clone(),
            variant: key.variant.clone(),
            metadata: BTreeMap::new(),
            last_edited_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> ElementKey {
        ElementKey {
            site_id: self.site_id,
            element_id: self.element_id.clone(),
            language: self.language.clone(),
            variant: self.variant.clone(),
        }
    }

    pub fn version(&self) -> VersionToken {
        VersionToken::from_timestamp(self.updated_at)
    }
}

// ───────────────────────────────────────────────────────────────────
// Conflicts
// ───────────────────────────────────────────────────────────────────

/// How a conflict can be settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// The edits touch disjoint ranges; `merged_content` holds the merge.
    Auto,
    /// Both versions must be shown to the user.
    Manual,
}

/// Result of a commit whose base version was stale.
///
/// Consumed once by the committing client; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditConflict {
    pub element_id: String,
    /// The rejected edit first, then the edit that currently holds the element.
    pub conflicting_edits: Vec<CollaborativeEdit>,
    /// Content currently persisted for the element.
    pub base_content: String,
    /// Token to commit against after resolving.
    pub current_version: VersionToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_content: Option<String>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
