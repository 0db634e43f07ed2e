//! # Gradient-Boosted Tree Classifier
//!
//! A binary classifier built from depth-limited regression trees fit to
//! logistic pseudo-residuals. The raw score starts at the log-odds of the
//! base rate; each round adds a shrunken tree whose leaf values are Newton
//! steps (gradient sum over hessian sum, L2-regularized).
//!
//! The ensemble sits behind a `fit` / `predict_proba` interface and is
//! deliberately swappable: nothing upstream depends on how the scores are
//! produced.

use ndarray::{Array1, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// L2 regularization added to every leaf's hessian sum.
const REG_LAMBDA: f64 = 1.0;

/// Probability floor/ceiling guard when converting the base rate to
/// log-odds.
const PROBABILITY_GUARD: f64 = 1e-6;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("Feature matrix has {rows} rows but the label vector has {labels}.")]
    ShapeMismatch { rows: usize, labels: usize },
    #[error("Cannot fit a classifier on an empty feature matrix.")]
    EmptyMatrix,
}

/// One node of a regression tree, arena-indexed. Leaves carry the Newton
/// leaf value; interior nodes route on `feature <= threshold`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    pub feature: usize,
    pub threshold: f64,
    pub left: usize,
    pub right: usize,
    pub value: f64,
    pub leaf: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<TreeNode>,
}

impl RegressionTree {
    fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        let mut node = &self.nodes[0];
        while !node.leaf {
            node = if row[node.feature] <= node.threshold {
                &self.nodes[node.left]
            } else {
                &self.nodes[node.right]
            };
        }
        node.value
    }
}

/// Gradient boosting with logistic loss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientBoosting {
    n_rounds: usize,
    learning_rate: f64,
    max_depth: usize,
    min_leaf: usize,
    init_score: f64,
    trees: Vec<RegressionTree>,
}

impl Default for GradientBoosting {
    fn default() -> Self {
        Self::new()
    }
}

impl GradientBoosting {
    /// Defaults tuned for mid-sized tabular cohorts.
    pub fn new() -> Self {
        GradientBoosting {
            n_rounds: 200,
            learning_rate: 0.1,
            max_depth: 3,
            min_leaf: 20,
            init_score: 0.0,
            trees: Vec::new(),
        }
    }

    pub fn with_rounds(mut self, n_rounds: usize) -> Self {
        self.n_rounds = n_rounds;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_min_leaf(mut self, min_leaf: usize) -> Self {
        self.min_leaf = min_leaf;
        self
    }

    fn sigmoid(x: f64) -> f64 {
        1.0 / (1.0 + (-x).exp())
    }

    /// Fits the ensemble on a feature matrix and 0/1 label vector.
    pub fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), TrainError> {
        let n = x.nrows();
        if n == 0 {
            return Err(TrainError::EmptyMatrix);
        }
        if n != y.len() {
            return Err(TrainError::ShapeMismatch {
                rows: n,
                labels: y.len(),
            });
        }

        let base_rate = (y.sum() / n as f64).clamp(PROBABILITY_GUARD, 1.0 - PROBABILITY_GUARD);
        self.init_score = (base_rate / (1.0 - base_rate)).ln();
        self.trees = Vec::with_capacity(self.n_rounds);

        let mut raw = vec![self.init_score; n];
        let all_rows: Vec<usize> = (0..n).collect();

        for round in 0..self.n_rounds {
            let mut residuals = vec![0.0; n];
            let mut hessians = vec![0.0; n];
            for i in 0..n {
                let p = Self::sigmoid(raw[i]);
                residuals[i] = y[i] - p;
                hessians[i] = p * (1.0 - p);
            }

            let tree = internal::grow_tree(
                x,
                &all_rows,
                &residuals,
                &hessians,
                self.max_depth,
                self.min_leaf,
            );
            for i in 0..n {
                raw[i] += self.learning_rate * tree.predict_row(x.row(i));
            }
            if round == 0 {
                log::debug!("First boosting round grew {} nodes", tree.nodes.len());
            }
            self.trees.push(tree);
        }

        log::info!(
            "Fitted gradient boosting: {} rounds, depth {}, learning rate {}",
            self.trees.len(),
            self.max_depth,
            self.learning_rate
        );
        Ok(())
    }

    /// Claim probability per row of the feature matrix.
    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Array1<f64> {
        Array1::from_shape_fn(x.nrows(), |i| {
            let row = x.row(i);
            let mut score = self.init_score;
            for tree in &self.trees {
                score += self.learning_rate * tree.predict_row(row);
            }
            Self::sigmoid(score)
        })
    }
}

mod internal {
    use super::*;

    struct BestSplit {
        feature: usize,
        threshold: f64,
        gain: f64,
    }

    fn leaf_value(gradient_sum: f64, hessian_sum: f64) -> f64 {
        gradient_sum / (hessian_sum + REG_LAMBDA)
    }

    fn split_score(gradient_sum: f64, hessian_sum: f64) -> f64 {
        gradient_sum * gradient_sum / (hessian_sum + REG_LAMBDA)
    }

    /// Exhaustive best-split search over all features. Candidates are the
    /// boundaries between distinct sorted feature values; the gain is the
    /// regularized variance-reduction score.
    fn find_best_split(
        x: ArrayView2<f64>,
        rows: &[usize],
        residuals: &[f64],
        hessians: &[f64],
        min_leaf: usize,
    ) -> Option<BestSplit> {
        let total_g: f64 = rows.iter().map(|&r| residuals[r]).sum();
        let total_h: f64 = rows.iter().map(|&r| hessians[r]).sum();
        let parent_score = split_score(total_g, total_h);

        let mut best: Option<BestSplit> = None;
        let mut sorted = rows.to_vec();

        for feature in 0..x.ncols() {
            sorted.sort_unstable_by(|&a, &b| {
                x[[a, feature]].total_cmp(&x[[b, feature]]).then(a.cmp(&b))
            });

            let mut left_g = 0.0;
            let mut left_h = 0.0;
            for (taken, pair) in sorted.windows(2).enumerate() {
                left_g += residuals[pair[0]];
                left_h += hessians[pair[0]];

                let here = x[[pair[0], feature]];
                let next = x[[pair[1], feature]];
                if here == next {
                    continue;
                }
                let left_count = taken + 1;
                let right_count = sorted.len() - left_count;
                if left_count < min_leaf || right_count < min_leaf {
                    continue;
                }

                let gain = split_score(left_g, left_h)
                    + split_score(total_g - left_g, total_h - left_h)
                    - parent_score;
                if gain > best.as_ref().map_or(0.0, |b| b.gain) {
                    best = Some(BestSplit {
                        feature,
                        threshold: (here + next) / 2.0,
                        gain,
                    });
                }
            }
        }
        best
    }

    pub(super) fn grow_tree(
        x: ArrayView2<f64>,
        rows: &[usize],
        residuals: &[f64],
        hessians: &[f64],
        max_depth: usize,
        min_leaf: usize,
    ) -> RegressionTree {
        let mut nodes = Vec::new();
        grow_node(x, rows, residuals, hessians, max_depth, min_leaf, &mut nodes);
        RegressionTree { nodes }
    }

    /// Recursively grows the subtree rooted at the next free arena slot and
    /// returns its index.
    fn grow_node(
        x: ArrayView2<f64>,
        rows: &[usize],
        residuals: &[f64],
        hessians: &[f64],
        depth_left: usize,
        min_leaf: usize,
        nodes: &mut Vec<TreeNode>,
    ) -> usize {
        let gradient_sum: f64 = rows.iter().map(|&r| residuals[r]).sum();
        let hessian_sum: f64 = rows.iter().map(|&r| hessians[r]).sum();

        let index = nodes.len();
        nodes.push(TreeNode {
            feature: 0,
            threshold: 0.0,
            left: 0,
            right: 0,
            value: leaf_value(gradient_sum, hessian_sum),
            leaf: true,
        });

        if depth_left == 0 || rows.len() < 2 * min_leaf {
            return index;
        }
        let Some(split) = find_best_split(x, rows, residuals, hessians, min_leaf) else {
            return index;
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .iter()
            .copied()
            .partition(|&r| x[[r, split.feature]] <= split.threshold);

        let left = grow_node(x, &left_rows, residuals, hessians, depth_left - 1, min_leaf, nodes);
        let right = grow_node(x, &right_rows, residuals, hessians, depth_left - 1, min_leaf, nodes);

        let node = &mut nodes[index];
        node.feature = split.feature;
        node.threshold = split.threshold;
        node.left = left;
        node.right = right;
        node.leaf = false;
        index
    }
}
