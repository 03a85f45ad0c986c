use serde::{Deserialize, Serialize};

use crate::rank::{RankError, RankKey};
use crate::GroupKey;

/// Which end of a group a new record should land on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Top,
    Bottom,
}

impl Edge {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Top => "top",
            Self::Bottom => "bottom",
        }
    }
}

/// Rank for the first record of a group that has none yet.
#[must_use]
pub fn assign_initial(group: &GroupKey) -> RankKey {
    let rank = RankKey::for_empty_sequence();
    tracing::trace!(group = %group, rank = %rank, "assigned initial rank");
    rank
}

/// Rank placing a record after the last known record of a group.
///
/// # Errors
/// Propagates [`RankKey::after`] failures.
pub fn insert_after(last_known: &RankKey) -> Result<RankKey, RankError> {
    RankKey::after(last_known)
}

/// Rank placing a record before the first known record of a group.
///
/// # Errors
/// Propagates [`RankKey::before`] failures.
pub fn insert_before(first_known: &RankKey) -> Result<RankKey, RankError> {
    RankKey::before(first_known)
}

/// Rank placing a record between two neighbours, the common drag-and-drop case.
///
/// # Errors
/// Propagates [`RankKey::between`] failures, including unordered neighbours.
pub fn insert_between(prev: &RankKey, next: &RankKey) -> Result<RankKey, RankError> {
    RankKey::between(prev, next)
}

/// Resolve a drop target from whichever neighbours are known.
///
/// `prev` is the record that ends up directly above, `next` the one directly
/// below. With neither known the key for an empty sequence is returned.
///
/// # Errors
/// Propagates failures of the underlying rank operation.
pub fn position_between(
    prev: Option<&RankKey>,
    next: Option<&RankKey>,
) -> Result<RankKey, RankError> {
    match (prev, next) {
        (Some(prev), Some(next)) => RankKey::between(prev, next),
        (Some(prev), None) => RankKey::after(prev),
        (None, Some(next)) => RankKey::before(next),
        (None, None) => Ok(RankKey::for_empty_sequence()),
    }
}

/// Rank for a record appended at one edge of a group.
///
/// Missing and malformed stored ranks are skipped, the same way a board query
/// filters out `NULL` positions before picking the first or last card.
///
/// # Errors
/// Propagates failures of [`RankKey::before`] or [`RankKey::after`].
pub fn position_at_edge<'a, I>(edge: Edge, stored_ranks: I) -> Result<RankKey, RankError>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let valid = stored_ranks.into_iter().flatten().filter_map(|raw| RankKey::validate(raw).ok());
    let bound = match edge {
        Edge::Top => valid.min(),
        Edge::Bottom => valid.max(),
    };

    match (edge, bound) {
        (Edge::Top, Some(first)) => RankKey::before(&first),
        (Edge::Bottom, Some(last)) => RankKey::after(&last),
        (_, None) => Ok(RankKey::for_empty_sequence()),
    }
}

/// Generator of strictly increasing ranks with explicit cursor state.
///
/// A fresh sequence starts at [`RankKey::for_empty_sequence`] and continues
/// with [`RankKey::after`]. An upper bound keeps every generated key below it.
#[derive(Debug, Clone, Default)]
pub struct RankSequence {
    cursor: Option<RankKey>,
    upper: Option<RankKey>,
    exhausted: bool,
}

impl RankSequence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence whose first key is strictly greater than `lower`.
    #[must_use]
    pub fn starting_after(lower: RankKey) -> Self {
        Self { cursor: Some(lower), upper: None, exhausted: false }
    }

    /// Sequence confined to the open interval `(lower, upper)`.
    ///
    /// # Errors
    /// Returns [`RankError::PrevGreaterThanOrEquals`] when both bounds are
    /// present and not strictly increasing.
    pub fn within(lower: Option<RankKey>, upper: Option<RankKey>) -> Result<Self, RankError> {
        if let (Some(lower), Some(upper)) = (&lower, &upper) {
            if lower >= upper {
                return Err(RankError::PrevGreaterThanOrEquals {
                    prev: lower.to_string(),
                    next: upper.to_string(),
                });
            }
        }
        Ok(Self { cursor: lower, upper, exhausted: false })
    }

    /// Last key handed out, or the lower bound before the first call.
    #[must_use]
    pub fn cursor(&self) -> Option<&RankKey> {
        self.cursor.as_ref()
    }

    /// Produce the next key and advance the cursor.
    ///
    /// # Errors
    /// Returns the rank error raised when the key space is exhausted; the
    /// cursor does not move in that case.
    pub fn next_key(&mut self) -> Result<RankKey, RankError> {
        let key = position_between(self.cursor.as_ref(), self.upper.as_ref())?;
        self.cursor = Some(key.clone());
        Ok(key)
    }
}

impl Iterator for RankSequence {
    type Item = Result<RankKey, RankError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        let item = self.next_key();
        self.exhausted = item.is_err();
        Some(item)
    }
}
