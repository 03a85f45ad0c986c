//! Fractional ranks for grouped, user-reorderable records.
//!
//! [`RankKey`] values sort by raw bytes and leave room for an unbounded number
//! of insertions between any two neighbours. The [`repair`] module turns a
//! snapshot of `(id, group, rank)` rows into a deterministic [`RepairPlan`]
//! when ranks have gone missing, become malformed, or collided.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub mod position;
pub mod rank;
pub mod repair;

pub use position::{
    assign_initial, insert_after, insert_before, insert_between, position_at_edge,
    position_between, Edge, RankSequence,
};
pub use rank::{RankError, RankKey, MAX_CHAR, MAX_RANK_LEN, MIN_CHAR};
pub use repair::{
    analyze, compute_group_plan, compute_repair_plan, Assignment, GroupAnalysis, RecordPosition,
    RepairAnalysis, RepairError, RepairPlan, RepairStrategy,
};

/// Identity of a collaborator record. Ascending order breaks every tie.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Bucket within which ranks are compared, e.g. one board column.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct GroupKey(String);

impl GroupKey {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for GroupKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for GroupKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}
