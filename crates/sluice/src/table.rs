//! Destination table model
//!
//! [`Table`] is the in-memory descriptor the engine reconciles against the
//! warehouse: an ordered column map plus primary key, partitioning and
//! lifetime hints. A `Table` with no columns stands for "does not exist".

use crate::datatype::DataType;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Prefix of engine-managed primary key constraint names.
pub const PK_CONSTRAINT_PREFIX: &str = "sluice_pk_";

/// One destination column: the dialect SQL type it is declared with, the
/// logical type it was derived from, and whether the dialect type was forced
/// by a caller override (overridden columns get a cast on insert).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlColumn {
    pub sql_type: String,
    pub data_type: DataType,
    #[serde(default)]
    pub is_override: bool,
}

impl SqlColumn {
    pub fn new(sql_type: impl Into<String>, data_type: DataType) -> Self {
        Self {
            sql_type: sql_type.into(),
            data_type,
            is_override: false,
        }
    }

    pub fn with_override(sql_type: impl Into<String>, data_type: DataType) -> Self {
        Self {
            sql_type: sql_type.into(),
            data_type,
            is_override: true,
        }
    }
}

/// Time-partitioning granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Granularity {
    All,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Granularity::All => "ALL",
            Granularity::Hour => "HOUR",
            Granularity::Day => "DAY",
            Granularity::Week => "WEEK",
            Granularity::Month => "MONTH",
            Granularity::Quarter => "QUARTER",
            Granularity::Year => "YEAR",
        };
        f.write_str(s)
    }
}

/// Time partitioning of a destination table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablePartition {
    pub field: String,
    pub granularity: Granularity,
}

/// In-memory descriptor of a destination table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: IndexMap<String, SqlColumn>,
    pub pk_fields: IndexSet<String>,
    pub primary_key_name: Option<String>,
    pub partition: Option<TablePartition>,
    pub timestamp_column: Option<String>,
    #[serde(default)]
    pub temporary: bool,
    /// Patch flag: the existing primary key must be dropped before the new
    /// one (if any) is installed.
    #[serde(default)]
    pub delete_pk: bool,
}

impl Table {
    /// An empty descriptor standing for a table that does not exist.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Whether the table exists in the warehouse (has at least one column).
    pub fn exists(&self) -> bool {
        !self.columns.is_empty()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.keys().cloned().collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Deterministic engine-managed primary key constraint name.
    pub fn constraint_name(table_name: &str) -> String {
        let digest = Sha256::digest(table_name.as_bytes());
        let hash: String = digest[..5].iter().map(|b| format!("{b:02x}")).collect();
        format!("{PK_CONSTRAINT_PREFIX}{hash}")
    }

    /// Same descriptor under a different name. Constraint names follow the
    /// new table name.
    pub fn renamed(&self, name: impl Into<String>) -> Table {
        let name = name.into();
        let primary_key_name = if self.pk_fields.is_empty() {
            None
        } else {
            Some(Table::constraint_name(&name))
        };
        Table {
            name,
            primary_key_name,
            ..self.clone()
        }
    }

    /// Compute the patch that brings `actual` up to this desired shape.
    ///
    /// The patch contains columns missing from `actual` and columns whose
    /// logical type must widen; it never drops a column and never narrows a
    /// type. A changed primary key set shows up as `delete_pk` plus the new
    /// `pk_fields`/`primary_key_name`.
    pub fn diff(&self, actual: &Table) -> Table {
        let mut patch = Table::named(actual.name.clone());

        for (name, desired) in &self.columns {
            match actual.columns.get(name) {
                None => {
                    patch.columns.insert(name.clone(), desired.clone());
                }
                Some(existing) => {
                    // Widen only: the existing column must be able to hold
                    // every value of the desired type, otherwise patch it.
                    if !desired.data_type.fits_into(existing.data_type)
                        && !existing.is_override
                        && !desired.is_override
                    {
                        patch.columns.insert(name.clone(), desired.clone());
                    }
                }
            }
        }

        if self.pk_fields != actual.pk_fields {
            patch.delete_pk = !actual.pk_fields.is_empty();
            patch.pk_fields = self.pk_fields.clone();
            if !self.pk_fields.is_empty() {
                patch.primary_key_name = Some(Table::constraint_name(&patch.name));
            }
        }

        patch
    }

    /// Whether a patch produced by [`Table::diff`] carries any work.
    pub fn is_empty_patch(&self) -> bool {
        self.columns.is_empty() && !self.delete_pk && self.pk_fields.is_empty()
    }

    /// Merge a patch into this descriptor (the cache-side mirror of a
    /// successful `patch_table_schema`).
    pub fn apply_patch(&mut self, patch: &Table) {
        for (name, column) in &patch.columns {
            self.columns.insert(name.clone(), column.clone());
        }
        if patch.delete_pk {
            self.pk_fields.clear();
            self.primary_key_name = None;
        }
        if !patch.pk_fields.is_empty() {
            self.pk_fields = patch.pk_fields.clone();
            self.primary_key_name = patch.primary_key_name.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(name: &str, cols: &[(&str, &str, DataType)]) -> Table {
        let mut t = Table::named(name);
        for (col, sql, dt) in cols {
            t.columns
                .insert(col.to_string(), SqlColumn::new(*sql, *dt));
        }
        t
    }

    #[test]
    fn test_exists() {
        assert!(!Table::named("t").exists());
        assert!(table_with("t", &[("a", "bigint", DataType::Int64)]).exists());
    }

    #[test]
    fn test_constraint_name_deterministic() {
        let a = Table::constraint_name("events");
        let b = Table::constraint_name("events");
        assert_eq!(a, b);
        assert!(a.starts_with(PK_CONSTRAINT_PREFIX));
        assert_ne!(a, Table::constraint_name("users"));
    }

    #[test]
    fn test_diff_adds_missing_columns() {
        let desired = table_with(
            "t",
            &[("a", "bigint", DataType::Int64), ("b", "text", DataType::String)],
        );
        let actual = table_with("t", &[("a", "bigint", DataType::Int64)]);

        let patch = desired.diff(&actual);
        assert_eq!(patch.column_names(), vec!["b"]);
        assert!(!patch.is_empty_patch());
    }

    #[test]
    fn test_diff_never_drops() {
        let desired = table_with("t", &[("a", "bigint", DataType::Int64)]);
        let actual = table_with(
            "t",
            &[("a", "bigint", DataType::Int64), ("legacy", "text", DataType::String)],
        );

        let patch = desired.diff(&actual);
        assert!(patch.is_empty_patch());
    }

    #[test]
    fn test_diff_widens_types() {
        let desired = table_with("t", &[("a", "double precision", DataType::Float64)]);
        let actual = table_with("t", &[("a", "bigint", DataType::Int64)]);

        let patch = desired.diff(&actual);
        assert_eq!(patch.columns["a"].data_type, DataType::Float64);
    }

    #[test]
    fn test_diff_never_narrows() {
        let desired = table_with("t", &[("a", "bigint", DataType::Int64)]);
        let actual = table_with("t", &[("a", "text", DataType::String)]);

        let patch = desired.diff(&actual);
        assert!(patch.is_empty_patch());
    }

    #[test]
    fn test_diff_primary_key_change() {
        let mut desired = table_with("t", &[("id", "bigint", DataType::Int64)]);
        desired.pk_fields.insert("id".to_string());
        let mut actual = table_with("t", &[("id", "bigint", DataType::Int64)]);
        actual.pk_fields.insert("old_id".to_string());
        actual.primary_key_name = Some("legacy_pk".to_string());

        let patch = desired.diff(&actual);
        assert!(patch.delete_pk);
        assert!(patch.pk_fields.contains("id"));
        assert_eq!(
            patch.primary_key_name.as_deref(),
            Some(Table::constraint_name("t").as_str())
        );
    }

    #[test]
    fn test_apply_patch() {
        let mut actual = table_with("t", &[("a", "bigint", DataType::Int64)]);
        let desired = {
            let mut t = table_with(
                "t",
                &[("a", "bigint", DataType::Int64), ("b", "text", DataType::String)],
            );
            t.pk_fields.insert("a".to_string());
            t
        };

        let patch = desired.diff(&actual);
        actual.apply_patch(&patch);
        assert!(actual.has_column("b"));
        assert!(actual.pk_fields.contains("a"));
        assert!(actual.primary_key_name.is_some());
    }

    #[test]
    fn test_renamed_rebuilds_constraint_name() {
        let mut t = table_with("t", &[("id", "bigint", DataType::Int64)]);
        t.pk_fields.insert("id".to_string());
        t.primary_key_name = Some(Table::constraint_name("t"));

        let r = t.renamed("t_tmp");
        assert_eq!(r.name, "t_tmp");
        assert_eq!(
            r.primary_key_name.as_deref(),
            Some(Table::constraint_name("t_tmp").as_str())
        );
    }
}
