use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::position::RankSequence;
use crate::rank::{RankError, RankKey};
use crate::{GroupKey, RecordId};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RepairStrategy {
    /// Ignore stored ranks and renumber every record of each group.
    Regenerate,
    /// Only records without a usable rank receive one.
    FixMissing,
    /// Only records sharing a rank value with a sibling receive a new one.
    FixDuplicates,
    /// Missing and duplicated ranks together.
    #[default]
    FixAll,
}

impl RepairStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regenerate => "regenerate",
            Self::FixMissing => "fix_missing",
            Self::FixDuplicates => "fix_duplicates",
            Self::FixAll => "fix_all",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "regenerate" => Some(Self::Regenerate),
            "fix_missing" => Some(Self::FixMissing),
            "fix_duplicates" => Some(Self::FixDuplicates),
            "fix_all" => Some(Self::FixAll),
            _ => None,
        }
    }

    fn fixes_missing(self) -> bool {
        matches!(self, Self::Regenerate | Self::FixMissing | Self::FixAll)
    }

    fn fixes_duplicates(self) -> bool {
        matches!(self, Self::Regenerate | Self::FixDuplicates | Self::FixAll)
    }
}

/// One row of a repair snapshot. `rank` is the raw stored value and may be
/// malformed; the engine validates it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordPosition {
    pub id: RecordId,
    pub group: GroupKey,
    pub rank: Option<String>,
}

impl RecordPosition {
    #[must_use]
    pub fn new(id: impl Into<RecordId>, group: impl Into<GroupKey>, rank: Option<&str>) -> Self {
        Self { id: id.into(), group: group.into(), rank: rank.map(str::to_string) }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RepairError {
    #[error("rank computation failed: {0}")]
    Rank(#[from] RankError),
    #[error("record id {0} appears more than once in the repair input")]
    DuplicateRecordId(RecordId),
    #[error("record id {0} is assigned by both plans being merged")]
    OverlappingPlan(RecordId),
}

/// New rank for one record, with the raw value the snapshot held before.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Assignment {
    pub id: RecordId,
    pub group: GroupKey,
    pub previous: Option<String>,
    pub rank: RankKey,
}

impl Assignment {
    /// Whether applying this assignment alters the stored value.
    #[must_use]
    pub fn is_change(&self) -> bool {
        self.previous.as_deref() != Some(self.rank.as_str())
    }
}

/// Reassignment of ranks computed for one strategy and not yet applied.
///
/// Assignments are kept sorted by record id and ids are unique.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(try_from = "PlanDocument")]
pub struct RepairPlan {
    strategy: RepairStrategy,
    assignments: Vec<Assignment>,
}

#[derive(Deserialize)]
struct PlanDocument {
    strategy: RepairStrategy,
    assignments: Vec<Assignment>,
}

impl TryFrom<PlanDocument> for RepairPlan {
    type Error = RepairError;

    fn try_from(document: PlanDocument) -> Result<Self, Self::Error> {
        let mut plan = Self::empty(document.strategy);
        plan.insert_all(document.assignments, RepairError::DuplicateRecordId)?;
        Ok(plan)
    }
}

impl RepairPlan {
    #[must_use]
    pub fn empty(strategy: RepairStrategy) -> Self {
        Self { strategy, assignments: Vec::new() }
    }

    #[must_use]
    pub fn strategy(&self) -> RepairStrategy {
        self.strategy
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Assignment> {
        self.assignments.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: RecordId) -> Option<&RankKey> {
        self.assignments
            .binary_search_by_key(&id, |assignment| assignment.id)
            .ok()
            .map(|index| &self.assignments[index].rank)
    }

    /// Number of assignments that alter the stored value.
    #[must_use]
    pub fn change_count(&self) -> usize {
        self.assignments.iter().filter(|assignment| assignment.is_change()).count()
    }

    /// Assignment counts per group, for previews.
    #[must_use]
    pub fn group_counts(&self) -> BTreeMap<GroupKey, usize> {
        let mut counts = BTreeMap::new();
        for assignment in &self.assignments {
            *counts.entry(assignment.group.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Merge a plan computed for other groups into this one.
    ///
    /// # Errors
    /// Returns [`RepairError::OverlappingPlan`] when both plans assign the same
    /// record; `self` is left unchanged in that case.
    pub fn extend(&mut self, other: Self) -> Result<(), RepairError> {
        let mut merged = self.clone();
        merged.insert_all(other.assignments, RepairError::OverlappingPlan)?;
        *self = merged;
        Ok(())
    }

    fn insert_all(
        &mut self,
        assignments: Vec<Assignment>,
        conflict: fn(RecordId) -> RepairError,
    ) -> Result<(), RepairError> {
        self.assignments.extend(assignments);
        self.assignments.sort_by_key(|assignment| assignment.id);
        if let Some(window) = self.assignments.windows(2).find(|pair| pair[0].id == pair[1].id) {
            return Err(conflict(window[0].id));
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a RepairPlan {
    type Item = &'a Assignment;
    type IntoIter = std::slice::Iter<'a, Assignment>;

    fn into_iter(self) -> Self::IntoIter {
        self.assignments.iter()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct GroupAnalysis {
    pub records: usize,
    pub missing: usize,
    pub malformed: usize,
    pub duplicate_values: usize,
    pub duplicate_records: usize,
}

impl GroupAnalysis {
    #[must_use]
    pub fn needs_repair(&self) -> bool {
        self.missing > 0 || self.malformed > 0 || self.duplicate_values > 0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RepairAnalysis {
    pub total: usize,
    pub missing: usize,
    pub malformed: usize,
    pub duplicate_values: usize,
    pub duplicate_records: usize,
    pub groups: BTreeMap<GroupKey, GroupAnalysis>,
}

impl RepairAnalysis {
    #[must_use]
    pub fn needs_repair(&self) -> bool {
        self.groups.values().any(GroupAnalysis::needs_repair)
    }
}

/// Count missing, malformed, and duplicated ranks per group.
#[must_use]
pub fn analyze(records: &[RecordPosition]) -> RepairAnalysis {
    let mut per_group: BTreeMap<&GroupKey, Vec<&RecordPosition>> = BTreeMap::new();
    for record in records {
        per_group.entry(&record.group).or_default().push(record);
    }

    let mut analysis = RepairAnalysis { total: records.len(), ..RepairAnalysis::default() };
    for (group, members) in per_group {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        let mut group_analysis = GroupAnalysis { records: members.len(), ..GroupAnalysis::default() };

        for record in members {
            match record.rank.as_deref() {
                None => group_analysis.missing += 1,
                Some(raw) if RankKey::validate(raw).is_err() => group_analysis.malformed += 1,
                Some(raw) => *counts.entry(raw).or_insert(0) += 1,
            }
        }

        for count in counts.values().filter(|count| **count > 1) {
            group_analysis.duplicate_values += 1;
            group_analysis.duplicate_records += count;
        }

        analysis.missing += group_analysis.missing;
        analysis.malformed += group_analysis.malformed;
        analysis.duplicate_values += group_analysis.duplicate_values;
        analysis.duplicate_records += group_analysis.duplicate_records;
        analysis.groups.insert(group.clone(), group_analysis);
    }

    analysis
}

/// Compute a deterministic repair plan for every group in `records`.
///
/// Groups are planned independently in ascending key order and records within
/// a group in ascending id order, so the input order never affects the result.
///
/// # Errors
/// Returns [`RepairError::DuplicateRecordId`] when an id occurs twice, or
/// [`RepairError::Rank`] when rank generation fails; no partial plan is
/// returned in either case.
pub fn compute_repair_plan(
    records: &[RecordPosition],
    strategy: RepairStrategy,
) -> Result<RepairPlan, RepairError> {
    ensure_unique_ids(records)?;

    let mut per_group: BTreeMap<&GroupKey, Vec<&RecordPosition>> = BTreeMap::new();
    for record in records {
        per_group.entry(&record.group).or_default().push(record);
    }

    let mut assignments = Vec::new();
    for (group, mut members) in per_group {
        members.sort_by_key(|record| record.id);
        assignments.extend(plan_group(group, &members, strategy)?);
    }

    let mut plan = RepairPlan::empty(strategy);
    plan.insert_all(assignments, RepairError::DuplicateRecordId)?;
    Ok(plan)
}

/// Compute the plan for a single group, ignoring records of other groups.
///
/// Running this per group and merging with [`RepairPlan::extend`] yields the
/// same plan as [`compute_repair_plan`] over the whole snapshot.
///
/// # Errors
/// Same as [`compute_repair_plan`].
pub fn compute_group_plan(
    group: &GroupKey,
    records: &[RecordPosition],
    strategy: RepairStrategy,
) -> Result<RepairPlan, RepairError> {
    let members: Vec<RecordPosition> =
        records.iter().filter(|record| &record.group == group).cloned().collect();
    compute_repair_plan(&members, strategy)
}

fn ensure_unique_ids(records: &[RecordPosition]) -> Result<(), RepairError> {
    let mut seen = BTreeSet::new();
    for record in records {
        if !seen.insert(record.id) {
            return Err(RepairError::DuplicateRecordId(record.id));
        }
    }
    Ok(())
}

fn stored_rank(record: &RecordPosition) -> Option<RankKey> {
    let raw = record.rank.as_deref()?;
    match RankKey::validate(raw) {
        Ok(rank) => Some(rank),
        Err(err) => {
            tracing::warn!(
                record_id = %record.id,
                group = %record.group,
                error = %err,
                "malformed stored rank treated as missing"
            );
            None
        }
    }
}

fn plan_group(
    group: &GroupKey,
    members: &[&RecordPosition],
    strategy: RepairStrategy,
) -> Result<Vec<Assignment>, RankError> {
    let ranked: Vec<(&RecordPosition, Option<RankKey>)> =
        members.iter().map(|record| (*record, stored_rank(record))).collect();

    let mut occurrences: BTreeMap<&RankKey, usize> = BTreeMap::new();
    for rank in ranked.iter().filter_map(|(_, rank)| rank.as_ref()) {
        *occurrences.entry(rank).or_insert(0) += 1;
    }

    let needs_fix = |rank: Option<&RankKey>| match rank {
        _ if strategy == RepairStrategy::Regenerate => true,
        None => strategy.fixes_missing(),
        Some(rank) => {
            strategy.fixes_duplicates() && occurrences.get(rank).copied().unwrap_or(0) > 1
        }
    };

    let floor = ranked
        .iter()
        .filter(|(_, rank)| !needs_fix(rank.as_ref()))
        .filter_map(|(_, rank)| rank.clone())
        .max();
    let targets: Vec<&RecordPosition> = ranked
        .iter()
        .filter(|(_, rank)| needs_fix(rank.as_ref()))
        .map(|(record, _)| *record)
        .collect();

    tracing::debug!(
        group = %group,
        strategy = strategy.as_str(),
        records = members.len(),
        targets = targets.len(),
        floor = floor.as_ref().map_or("", RankKey::as_str),
        "planned group repair"
    );

    let mut sequence = floor.map_or_else(RankSequence::new, RankSequence::starting_after);
    targets
        .into_iter()
        .map(|record| {
            Ok(Assignment {
                id: record.id,
                group: group.clone(),
                previous: record.rank.clone(),
                rank: sequence.next_key()?,
            })
        })
        .collect()
}
