//! Feature-column contract declared by the artifact bundle.
//!
//! Completion fills every declared column that a row does not carry with the
//! column's default, so that encoding always sees the full contract.

use serde::Serialize;
use std::collections::BTreeSet;

use crate::error::ArtifactLoadError;
use crate::types::{FeatureRow, FeatureValue};

/// Default category injected for a missing genotype column.
pub const DEFAULT_CATEGORY: &str = "SS";

/// Default window length when the bundle does not declare one.
pub const DEFAULT_SEQ_LENGTH: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Numeric,
    Categorical,
}

/// A declared input column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
    pub default: FeatureValue,
}

/// Ordered input columns plus the window length of the sequence model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureContract {
    columns: Vec<ColumnSpec>,
    window_length: usize,
}

/// Rows with every contract column present, in contract order.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<FeatureValue>>,
    /// Contract columns that were defaulted on at least one row
    pub defaulted: BTreeSet<String>,
}

impl CompletedTable {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

impl FeatureContract {
    /// Build the contract from the bundle's column lists.
    ///
    /// Columns in neither `numeric` nor `categorical` are numeric.
    pub fn from_lists(
        input_cols: &[String],
        numeric: &[String],
        categorical: &[String],
        categorical_default: &str,
        window_length: usize,
    ) -> Result<Self, ArtifactLoadError> {
        if input_cols.is_empty() {
            return Err(ArtifactLoadError::invalid("feature_input_cols is empty"));
        }
        if window_length == 0 {
            return Err(ArtifactLoadError::invalid("seq_length must be at least 1"));
        }

        let mut seen = BTreeSet::new();
        for name in input_cols {
            if !seen.insert(name.as_str()) {
                return Err(ArtifactLoadError::invalid(format!(
                    "duplicate feature column '{}'",
                    name
                )));
            }
            if name == "date" {
                return Err(ArtifactLoadError::invalid("'date' cannot be a feature column"));
            }
        }

        for name in numeric.iter().chain(categorical) {
            if !seen.contains(name.as_str()) {
                return Err(ArtifactLoadError::invalid(format!(
                    "column '{}' is typed but not in feature_input_cols",
                    name
                )));
            }
        }
        if let Some(both) = numeric.iter().find(|n| categorical.contains(n)) {
            return Err(ArtifactLoadError::invalid(format!(
                "column '{}' is both numeric and categorical",
                both
            )));
        }

        let columns = input_cols
            .iter()
            .map(|name| {
                if categorical.contains(name) {
                    ColumnSpec {
                        name: name.clone(),
                        kind: ColumnKind::Categorical,
                        default: FeatureValue::Text(categorical_default.to_string()),
                    }
                } else {
                    ColumnSpec {
                        name: name.clone(),
                        kind: ColumnKind::Numeric,
                        default: FeatureValue::Number(0.0),
                    }
                }
            })
            .collect();

        Ok(Self {
            columns,
            window_length,
        })
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn window_length(&self) -> usize {
        self.window_length
    }

    pub fn names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn names_of(&self, kind: ColumnKind) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.name.clone())
            .collect()
    }

    /// Project rows onto the contract, defaulting absent or null values.
    ///
    /// Never fails and never touches the input rows.
    pub fn complete(&self, rows: &[FeatureRow]) -> CompletedTable {
        let mut defaulted = BTreeSet::new();
        let completed = rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .map(|spec| match row.get(&spec.name) {
                        Some(v) => v.clone(),
                        None => {
                            defaulted.insert(spec.name.clone());
                            spec.default.clone()
                        }
                    })
                    .collect()
            })
            .collect();

        CompletedTable {
            columns: self.names(),
            rows: completed,
            defaulted,
        }
    }
}
