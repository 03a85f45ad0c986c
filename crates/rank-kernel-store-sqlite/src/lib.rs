//! `SQLite` adapter for the rank repair engine.
//!
//! The store never owns a schema. A [`TableBinding`] names the collaborator's
//! table and columns; the store reads snapshots from it and applies
//! [`RepairPlan`]s back to it in a single transaction.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rank_kernel_core::{GroupKey, RecordId, RecordPosition, RepairPlan};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};

/// Store failures a caller may want to match on after downcasting the
/// returned [`anyhow::Error`].
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("invalid {role} identifier {value:?}; expected [A-Za-z_][A-Za-z0-9_]*")]
    InvalidIdentifier { role: &'static str, value: String },
    #[error("record {id} no longer holds the rank the plan was computed from; nothing was written")]
    StalePlan { id: RecordId },
}

/// Where the ranked records live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableBinding {
    pub table: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    pub group_column: String,
    #[serde(default = "default_rank_column")]
    pub rank_column: String,
}

fn default_id_column() -> String {
    "id".to_string()
}

fn default_rank_column() -> String {
    "position".to_string()
}

impl TableBinding {
    /// Build a binding and validate every identifier.
    ///
    /// # Errors
    /// Returns [`StoreError::InvalidIdentifier`] for a name that cannot be
    /// interpolated into SQL safely.
    pub fn new(
        table: impl Into<String>,
        id_column: impl Into<String>,
        group_column: impl Into<String>,
        rank_column: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let binding = Self {
            table: table.into(),
            id_column: id_column.into(),
            group_column: group_column.into(),
            rank_column: rank_column.into(),
        };
        binding.validate()?;
        Ok(binding)
    }

    /// Parse a YAML binding document.
    ///
    /// # Errors
    /// Returns an error when the YAML is malformed or an identifier is invalid.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let binding: Self = serde_yaml::from_str(raw).context("failed to parse table binding")?;
        binding.validate()?;
        Ok(binding)
    }

    /// Read and parse a YAML binding file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read table binding {}", path.display()))?;
        Self::from_yaml_str(&raw)
            .with_context(|| format!("invalid table binding in {}", path.display()))
    }

    /// Check every identifier against `[A-Za-z_][A-Za-z0-9_]*`.
    ///
    /// # Errors
    /// Returns [`StoreError::InvalidIdentifier`] naming the first bad field.
    pub fn validate(&self) -> Result<(), StoreError> {
        for (role, value) in [
            ("table", &self.table),
            ("id column", &self.id_column),
            ("group column", &self.group_column),
            ("rank column", &self.rank_column),
        ] {
            if !is_identifier(value) {
                return Err(StoreError::InvalidIdentifier { role, value: value.clone() });
            }
        }
        Ok(())
    }

    fn table_sql(&self) -> String {
        quote(&self.table)
    }

    fn id_sql(&self) -> String {
        quote(&self.id_column)
    }

    fn rank_sql(&self) -> String {
        quote(&self.rank_column)
    }

    /// Group value as text with `NULL` folded to the empty group.
    fn group_sql(&self) -> String {
        format!("COALESCE(CAST({} AS TEXT), '')", quote(&self.group_column))
    }
}

fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    chars.next().is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn quote(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

/// Optional restriction of a snapshot. Empty lists mean no restriction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub ids: Vec<RecordId>,
    pub groups: Vec<GroupKey>,
}

impl RecordFilter {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.groups.is_empty()
    }

    fn where_clause(&self, binding: &TableBinding) -> (String, Vec<Value>) {
        let mut conditions = Vec::new();
        let mut values = Vec::new();

        if !self.ids.is_empty() {
            conditions.push(format!("{} IN ({})", binding.id_sql(), placeholders(self.ids.len())));
            values.extend(self.ids.iter().map(|id| Value::Integer(id.0)));
        }
        if !self.groups.is_empty() {
            conditions.push(format!(
                "{} IN ({})",
                binding.group_sql(),
                placeholders(self.groups.len())
            ));
            values.extend(self.groups.iter().map(|group| Value::Text(group.to_string())));
        }

        if conditions.is_empty() {
            (String::new(), values)
        } else {
            (format!(" WHERE {}", conditions.join(" AND ")), values)
        }
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// Outcome of comparing the database's rank ordering with byte order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ByteOrderReport {
    pub consistent: bool,
    pub groups_checked: usize,
    pub ranked_records: usize,
    pub mismatched_groups: Vec<GroupKey>,
}

/// Connection to the database holding the collaborator's ranked table.
pub struct RankStore {
    conn: Connection,
}

/// Stored rank as the engine sees it. Non-text storage classes and invalid
/// UTF-8 decode to a string the rank validator rejects rather than failing
/// the read.
fn decode_rank(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(number) => Some(number.to_string()),
        ValueRef::Real(number) => Some(number.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn decode_group(value: ValueRef<'_>) -> GroupKey {
    decode_rank(value).map(GroupKey::from).unwrap_or_default()
}

impl RankStore {
    /// Open a `SQLite` database and configure the workspace runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Read `(id, group, rank)` rows inside one read transaction, ordered by
    /// group then id.
    ///
    /// # Errors
    /// Returns an error when the binding is invalid or the query fails.
    pub fn load_positions(
        &mut self,
        binding: &TableBinding,
        filter: &RecordFilter,
    ) -> Result<Vec<RecordPosition>> {
        binding.validate()?;
        let (clause, values) = filter.where_clause(binding);
        let sql = format!(
            "SELECT {id}, {group}, {rank} FROM {table}{clause} ORDER BY 2, 1",
            id = binding.id_sql(),
            group = binding.group_sql(),
            rank = binding.rank_sql(),
            table = binding.table_sql(),
        );

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .context("failed to start snapshot transaction")?;
        let positions = {
            let mut stmt = tx
                .prepare(&sql)
                .with_context(|| format!("failed to prepare snapshot of {}", binding.table))?;
            let rows = stmt.query_map(params_from_iter(values), |row| {
                Ok(RecordPosition {
                    id: RecordId(row.get(0)?),
                    group: decode_group(row.get_ref(1)?),
                    rank: decode_rank(row.get_ref(2)?),
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .with_context(|| format!("failed to read positions from {}", binding.table))?
        };
        tx.commit().context("failed to close snapshot transaction")?;

        tracing::debug!(
            table = %binding.table,
            records = positions.len(),
            filtered = !filter.is_empty(),
            "loaded rank snapshot"
        );
        Ok(positions)
    }

    /// Apply every assignment of `plan` in one transaction and return the
    /// number of updated rows.
    ///
    /// Before each update the row is read back and decoded the same way as
    /// [`RankStore::load_positions`]; it must still sit in the assignment's
    /// group and hold its previous rank. A row that moved, changed, or
    /// disappeared aborts the whole transaction.
    ///
    /// # Errors
    /// Returns [`StoreError::StalePlan`] when a row no longer matches, or an
    /// error when a read or write fails. Nothing is written in either case.
    pub fn apply_plan(&mut self, binding: &TableBinding, plan: &RepairPlan) -> Result<usize> {
        binding.validate()?;
        if plan.is_empty() {
            return Ok(0);
        }

        let current_sql = format!(
            "SELECT {group}, {rank} FROM {table} WHERE {id} = ?1",
            group = binding.group_sql(),
            rank = binding.rank_sql(),
            table = binding.table_sql(),
            id = binding.id_sql(),
        );
        let update_sql = format!(
            "UPDATE {table} SET {rank} = ?1 WHERE {id} = ?2",
            table = binding.table_sql(),
            rank = binding.rank_sql(),
            id = binding.id_sql(),
        );

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start repair transaction")?;
        let mut updated = 0;
        {
            let mut current = tx.prepare(&current_sql).context("failed to prepare rank lookup")?;
            let mut update = tx.prepare(&update_sql).context("failed to prepare rank update")?;
            for assignment in plan {
                let stored = current
                    .query_row(params![assignment.id.0], |row| {
                        Ok((decode_group(row.get_ref(0)?), decode_rank(row.get_ref(1)?)))
                    })
                    .optional()
                    .with_context(|| format!("failed to read rank of record {}", assignment.id))?;
                let unchanged = stored.is_some_and(|(group, rank)| {
                    group == assignment.group && rank == assignment.previous
                });
                if !unchanged {
                    tracing::warn!(
                        record_id = %assignment.id,
                        group = %assignment.group,
                        "stale repair plan; rolling back"
                    );
                    return Err(StoreError::StalePlan { id: assignment.id }.into());
                }
                updated += update
                    .execute(params![assignment.rank.as_str(), assignment.id.0])
                    .with_context(|| format!("failed to update rank of record {}", assignment.id))?;
            }
        }
        tx.commit().context("failed to commit repair transaction")?;

        tracing::info!(
            table = %binding.table,
            strategy = plan.strategy().as_str(),
            updated,
            "applied repair plan"
        );
        Ok(updated)
    }

    /// Compare the database's own `ORDER BY` on the rank column with byte
    /// order, group by group.
    ///
    /// # Errors
    /// Returns an error when the binding is invalid or the query fails.
    pub fn verify_byte_order(&self, binding: &TableBinding) -> Result<ByteOrderReport> {
        binding.validate()?;
        let sql = format!(
            "SELECT {group}, {rank} FROM {table}
             WHERE {rank} IS NOT NULL
             ORDER BY 1, {rank}, {id}",
            group = binding.group_sql(),
            rank = binding.rank_sql(),
            table = binding.table_sql(),
            id = binding.id_sql(),
        );

        let mut stmt = self.conn.prepare(&sql).context("failed to prepare order check")?;
        let rows = stmt.query_map([], |row| {
            Ok((decode_group(row.get_ref(0)?), decode_rank(row.get_ref(1)?).unwrap_or_default()))
        })?;

        let mut per_group: BTreeMap<GroupKey, Vec<String>> = BTreeMap::new();
        let mut ranked_records = 0;
        for row in rows {
            let (group, rank) = row.context("failed to read rank for order check")?;
            per_group.entry(group).or_default().push(rank);
            ranked_records += 1;
        }

        let mismatched_groups: Vec<GroupKey> = per_group
            .iter()
            .filter(|(_, ranks)| ranks.windows(2).any(|pair| pair[0] > pair[1]))
            .map(|(group, _)| group.clone())
            .collect();

        if !mismatched_groups.is_empty() {
            tracing::warn!(
                table = %binding.table,
                column = %binding.rank_column,
                groups = mismatched_groups.len(),
                "rank column does not sort by raw bytes"
            );
        }

        Ok(ByteOrderReport {
            consistent: mismatched_groups.is_empty(),
            groups_checked: per_group.len(),
            ranked_records,
            mismatched_groups,
        })
    }
}
