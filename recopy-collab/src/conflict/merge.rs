//! Merge suggestions for stale commits.
//!
//! A policy sees three texts: the `base` both editors started from,
//! `theirs` (what is persisted now) and `mine` (the rejected commit).
//! It either proposes merged content or declines, leaving the choice to
//! the user.

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

#[derive(Debug, Clone, Error)]
pub enum MergeError {
    #[error("CRDT error: {0}")]
    Crdt(String),
    #[error("Content too large to merge ({0} bytes)")]
    TooLarge(usize),
}

impl From<yrs::encoding::read::Error> for MergeError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        MergeError::Crdt(e.to_string())
    }
}

/// Decides whether two diverging edits can be combined automatically.
pub trait MergePolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` when the edits must be resolved by hand.
    fn merge(&self, base: &str, theirs: &str, mine: &str) -> Result<Option<String>, MergeError>;
}

/// Never merges.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualOnly;

impl MergePolicy for ManualOnly {
    fn name(&self) -> &'static str {
        "manual-only"
    }

    fn merge(&self, _base: &str, _theirs: &str, _mine: &str) -> Result<Option<String>, MergeError> {
        Ok(None)
    }
}

/// Merges when each side changed a single byte range of `base` and the
/// two ranges are separated by at least one untouched character.
///
/// Both edits are replayed as concurrent transactions on a shared `yrs`
/// text, so the result is whatever the CRDT converges to.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisjointRangeMerge;

impl MergePolicy for DisjointRangeMerge {
    fn name(&self) -> &'static str {
        "disjoint-range"
    }

    fn merge(&self, base: &str, theirs: &str, mine: &str) -> Result<Option<String>, MergeError> {
        if theirs == mine || mine == base {
            return Ok(Some(theirs.to_string()));
        }
        if theirs == base {
            return Ok(Some(mine.to_string()));
        }

        let their_change = TextChange::between(base, theirs);
        let my_change = TextChange::between(base, mine);
        if !their_change.is_disjoint_from(&my_change) {
            return Ok(None);
        }

        let base_update = seed_update(base)?;
        let theirs_update = fork_update(&base_update, &their_change)?;
        let mine_update = fork_update(&base_update, &my_change)?;

        let doc = text_doc();
        {
            let mut txn = doc.transact_mut();
            for update in [&base_update, &theirs_update, &mine_update] {
                txn.apply_update(Update::decode_v1(update)?)
                    .map_err(|e| MergeError::Crdt(e.to_string()))?;
            }
        }
        let txn = doc.transact();
        Ok(txn.get_text(TEXT_NAME).map(|text| text.get_string(&txn)))
    }
}

const TEXT_NAME: &str = "content";

/// Replacement of `base[start..end]` by `replacement`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChange {
    pub start: usize,
    pub end: usize,
    pub replacement: String,
}

impl TextChange {
    /// Smallest single range replacement turning `base` into `other`.
    pub fn between(base: &str, other: &str) -> Self {
        let prefix = base
            .char_indices()
            .zip(other.chars())
            .take_while(|((_, a), b)| a == b)
            .last()
            .map(|((i, c), _)| i + c.len_utf8())
            .unwrap_or(0);

        let suffix: usize = base[prefix..]
            .chars()
            .rev()
            .zip(other[prefix..].chars().rev())
            .take_while(|(a, b)| a == b)
            .map(|(a, _)| a.len_utf8())
            .sum();

        Self {
            start: prefix,
            end: base.len() - suffix,
            replacement: other[prefix..other.len() - suffix].to_string(),
        }
    }

    /// At least one character of `base` lies between the two ranges.
    pub fn is_disjoint_from(&self, other: &TextChange) -> bool {
        self.end < other.start || other.end < self.start
    }
}

fn text_doc() -> Doc {
    Doc::with_options(Options {
        offset_kind: OffsetKind::Bytes,
        ..Options::default()
    })
}

fn to_index(n: usize) -> Result<u32, MergeError> {
    u32::try_from(n).map_err(|_| MergeError::TooLarge(n))
}

fn seed_update(base: &str) -> Result<Vec<u8>, MergeError> {
    let doc = text_doc();
    {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text(TEXT_NAME);
        text.insert(&mut txn, 0, base);
    }
    let txn = doc.transact();
    Ok(txn.encode_state_as_update_v1(&StateVector::default()))
}

/// Apply `change` on a fresh replica of `base` and return just that edit.
fn fork_update(base_update: &[u8], change: &TextChange) -> Result<Vec<u8>, MergeError> {
    let doc = text_doc();
    {
        let mut txn = doc.transact_mut();
        txn.apply_update(Update::decode_v1(base_update)?)
            .map_err(|e| MergeError::Crdt(e.to_string()))?;
    }
    let before = doc.transact().state_vector();
    {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text(TEXT_NAME);
        let start = to_index(change.start)?;
        let removed = to_index(change.end - change.start)?;
        if removed > 0 {
            text.remove_range(&mut txn, start, removed);
        }
        if !change.replacement.is_empty() {
            text.insert(&mut txn, start, &change.replacement);
        }
    }
    let txn = doc.transact();
    Ok(txn.encode_state_as_update_v1(&before))
}
