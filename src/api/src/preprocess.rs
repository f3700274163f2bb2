//! Fitted column preprocessor.
//!
//! Mirrors a column transformer: each transformer reads named columns from the
//! completed table and the outputs are concatenated in declaration order.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::contract::{ColumnKind, CompletedTable, FeatureContract};
use crate::error::{ArtifactLoadError, InferenceError};
use crate::types::FeatureValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleUnknown {
    #[default]
    Ignore,
    Error,
}

/// One fitted transformer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transformer {
    StandardScaler {
        columns: Vec<String>,
        mean: Vec<f64>,
        scale: Vec<f64>,
    },
    OneHot {
        columns: Vec<String>,
        categories: Vec<Vec<String>>,
        #[serde(default)]
        handle_unknown: HandleUnknown,
    },
    Passthrough {
        columns: Vec<String>,
    },
}

impl Transformer {
    fn columns(&self) -> &[String] {
        match self {
            Transformer::StandardScaler { columns, .. }
            | Transformer::OneHot { columns, .. }
            | Transformer::Passthrough { columns } => columns,
        }
    }

    fn output_width(&self) -> usize {
        match self {
            Transformer::StandardScaler { columns, .. } | Transformer::Passthrough { columns } => {
                columns.len()
            }
            Transformer::OneHot { categories, .. } => categories.iter().map(Vec::len).sum(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preprocessor {
    pub transformers: Vec<Transformer>,
}

impl Preprocessor {
    /// Check the fitted state against the contract.
    pub fn validate(&self, contract: &FeatureContract) -> Result<(), ArtifactLoadError> {
        if self.transformers.is_empty() {
            return Err(ArtifactLoadError::invalid("preprocessor has no transformers"));
        }

        for t in &self.transformers {
            for name in t.columns() {
                let spec = contract.column(name).ok_or_else(|| {
                    ArtifactLoadError::invalid(format!(
                        "preprocessor column '{}' is not in the feature contract",
                        name
                    ))
                })?;
                let wants_numeric = !matches!(t, Transformer::OneHot { .. });
                if wants_numeric && spec.kind == ColumnKind::Categorical {
                    return Err(ArtifactLoadError::invalid(format!(
                        "categorical column '{}' routed to a numeric transformer",
                        name
                    )));
                }
            }

            match t {
                Transformer::StandardScaler {
                    columns,
                    mean,
                    scale,
                } => {
                    if mean.len() != columns.len() || scale.len() != columns.len() {
                        return Err(ArtifactLoadError::invalid(format!(
                            "standard_scaler has {} columns but {} means and {} scales",
                            columns.len(),
                            mean.len(),
                            scale.len()
                        )));
                    }
                }
                Transformer::OneHot {
                    columns,
                    categories,
                    ..
                } => {
                    if categories.len() != columns.len() {
                        return Err(ArtifactLoadError::invalid(format!(
                            "one_hot has {} columns but {} category lists",
                            columns.len(),
                            categories.len()
                        )));
                    }
                }
                Transformer::Passthrough { .. } => {}
            }
        }

        if self.output_width() == 0 {
            return Err(ArtifactLoadError::invalid("preprocessor produces no features"));
        }
        Ok(())
    }

    /// Number of encoded feature columns.
    pub fn output_width(&self) -> usize {
        self.transformers.iter().map(Transformer::output_width).sum()
    }

    /// Encode a completed table into one row per input date.
    pub fn transform(&self, table: &CompletedTable) -> Result<Array2<f32>, InferenceError> {
        let width = self.output_width();
        let mut out = Array2::<f32>::zeros((table.rows.len(), width));

        let mut offset = 0;
        for t in &self.transformers {
            let indices = t
                .columns()
                .iter()
                .map(|name| {
                    table.column_index(name).ok_or_else(|| {
                        InferenceError::Encoding(format!("column '{}' missing from table", name))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            for (i, row) in table.rows.iter().enumerate() {
                match t {
                    Transformer::StandardScaler {
                        columns,
                        mean,
                        scale,
                    } => {
                        for (k, &idx) in indices.iter().enumerate() {
                            let x = numeric_value(&row[idx], &columns[k])?;
                            let s = if scale[k] == 0.0 { 1.0 } else { scale[k] };
                            out[[i, offset + k]] = ((x - mean[k]) / s) as f32;
                        }
                    }
                    Transformer::Passthrough { columns } => {
                        for (k, &idx) in indices.iter().enumerate() {
                            out[[i, offset + k]] = numeric_value(&row[idx], &columns[k])? as f32;
                        }
                    }
                    Transformer::OneHot {
                        columns,
                        categories,
                        handle_unknown,
                    } => {
                        let mut col_offset = offset;
                        for (k, &idx) in indices.iter().enumerate() {
                            let value = category_value(&row[idx]);
                            match categories[k].iter().position(|c| *c == value) {
                                Some(pos) => out[[i, col_offset + pos]] = 1.0,
                                None if *handle_unknown == HandleUnknown::Error => {
                                    return Err(InferenceError::Encoding(format!(
                                        "unknown category '{}' in column '{}'",
                                        value, columns[k]
                                    )));
                                }
                                None => {}
                            }
                            col_offset += categories[k].len();
                        }
                    }
                }
            }
            offset += t.output_width();
        }

        Ok(out)
    }
}

fn numeric_value(value: &FeatureValue, column: &str) -> Result<f64, InferenceError> {
    match value {
        FeatureValue::Number(v) => Ok(*v),
        FeatureValue::Text(s) => s.trim().parse::<f64>().map_err(|_| {
            InferenceError::Encoding(format!("non-numeric value '{}' in column '{}'", s, column))
        }),
        FeatureValue::Missing => Ok(0.0),
    }
}

fn category_value(value: &FeatureValue) -> String {
    match value {
        FeatureValue::Text(s) => s.clone(),
        FeatureValue::Number(v) => v.to_string(),
        FeatureValue::Missing => String::new(),
    }
}
