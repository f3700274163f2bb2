//! Gradient-boosted tree ensemble evaluated natively from its JSON dump.

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::{ArtifactLoadError, InferenceError};
use crate::model::{TabularModel, TabularOutput};

/// Learning objective, which decides how the summed margin is exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Objective {
    /// Sigmoid of the margin as class probabilities
    #[serde(rename = "binary:logistic")]
    BinaryLogistic,
    /// Margin exposed as-is
    #[serde(rename = "binary:logitraw")]
    BinaryLogitRaw,
    #[serde(rename = "reg:squarederror")]
    SquaredError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
        /// Branch taken for NaN inputs
        #[serde(default = "default_missing_left")]
        missing_left: bool,
    },
    Leaf {
        value: f64,
    },
}

fn default_missing_left() -> bool {
    true
}

/// Nodes in array form; node 0 is the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<TreeNode>,
}

impl Tree {
    fn evaluate(&self, row: &[f32]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                TreeNode::Leaf { value } => return *value,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    missing_left,
                } => {
                    let x = row[*feature];
                    idx = if x.is_nan() {
                        if *missing_left {
                            *left
                        } else {
                            *right
                        }
                    } else if f64::from(x) < *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEnsemble {
    pub objective: Objective,
    #[serde(default)]
    pub base_score: f64,
    pub trees: Vec<Tree>,
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

impl TreeEnsemble {
    /// Check structure against the encoded feature width.
    ///
    /// Children must come after their parent, which rules out cycles.
    pub fn validate(&self, n_features: usize) -> Result<(), ArtifactLoadError> {
        if self.trees.is_empty() {
            return Err(ArtifactLoadError::invalid("tree ensemble has no trees"));
        }
        for (t, tree) in self.trees.iter().enumerate() {
            if tree.nodes.is_empty() {
                return Err(ArtifactLoadError::invalid(format!("tree {} has no nodes", t)));
            }
            for (i, node) in tree.nodes.iter().enumerate() {
                if let TreeNode::Split {
                    feature,
                    left,
                    right,
                    ..
                } = node
                {
                    if *feature >= n_features {
                        return Err(ArtifactLoadError::invalid(format!(
                            "tree {} node {} splits on feature {} but only {} are encoded",
                            t, i, feature, n_features
                        )));
                    }
                    for child in [left, right] {
                        if *child <= i || *child >= tree.nodes.len() {
                            return Err(ArtifactLoadError::invalid(format!(
                                "tree {} node {} has invalid child {}",
                                t, i, child
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn margin(&self, row: &[f32]) -> f64 {
        self.base_score + self.trees.iter().map(|t| t.evaluate(row)).sum::<f64>()
    }
}

impl TabularModel for TreeEnsemble {
    fn predict(&self, rows: ArrayView2<'_, f32>) -> Result<TabularOutput, InferenceError> {
        let max_feature = self
            .trees
            .iter()
            .flat_map(|t| &t.nodes)
            .filter_map(|n| match n {
                TreeNode::Split { feature, .. } => Some(*feature),
                TreeNode::Leaf { .. } => None,
            })
            .max();
        if let Some(f) = max_feature {
            if f >= rows.ncols() {
                return Err(InferenceError::Shape(format!(
                    "tree splits on feature {} but rows have {} columns",
                    f,
                    rows.ncols()
                )));
            }
        }

        let margins: Vec<f64> = rows
            .rows()
            .into_iter()
            .map(|r| {
                let row = r.to_vec();
                self.margin(&row)
            })
            .collect();

        match self.objective {
            Objective::BinaryLogistic => {
                let mut probs = Array2::<f64>::zeros((margins.len(), 2));
                for (i, m) in margins.iter().enumerate() {
                    let p = sigmoid(*m);
                    probs[[i, 0]] = 1.0 - p;
                    probs[[i, 1]] = p;
                }
                Ok(TabularOutput::Probabilities(probs))
            }
            Objective::BinaryLogitRaw | Objective::SquaredError => Ok(TabularOutput::Raw(margins)),
        }
    }

    fn kind(&self) -> &'static str {
        "gradient_boosted_trees"
    }
}
