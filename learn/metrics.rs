//! # Ranking Metrics
//!
//! AUC via the Mann-Whitney rank statistic with average ranks on ties, and
//! the ROC curve points behind it. These are the evaluation surface of the
//! pipeline; they make no assumption about how the scores were produced.

use ndarray::Array1;

/// Area under the ROC curve.
///
/// Computed from the rank-sum of the positive class, with tied scores
/// assigned their average rank. Degenerate inputs (single-class labels)
/// return 0.5.
pub fn auc(y: &Array1<f64>, p: &Array1<f64>) -> f64 {
    assert_eq!(y.len(), p.len());
    let n = y.len();
    let n_pos = y.iter().filter(|&&t| t > 0.5).count() as f64;
    let n_neg = n as f64 - n_pos;
    if n_pos == 0.0 || n_neg == 0.0 {
        return 0.5;
    }

    // Sort indices by prediction score ascending.
    let mut idx: Vec<usize> = (0..n).collect();
    idx.sort_by(|&i, &j| p[i].partial_cmp(&p[j]).unwrap_or(std::cmp::Ordering::Equal));

    // Assign average ranks to tied score runs.
    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i + 1;
        while j < n && (p[idx[j]] - p[idx[i]]).abs() < 1e-10 {
            j += 1;
        }
        let avg_rank = (i + j - 1) as f64 / 2.0 + 1.0;
        for k in i..j {
            ranks[idx[k]] = avg_rank;
        }
        i = j;
    }

    let mut sum_ranks_pos = 0.0;
    for i in 0..n {
        if y[i] > 0.5 {
            sum_ranks_pos += ranks[i];
        }
    }

    // Mann-Whitney U converted to AUC.
    (sum_ranks_pos - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg)
}

/// One operating point of the ROC curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RocPoint {
    pub threshold: f64,
    pub false_positive_rate: f64,
    pub true_positive_rate: f64,
}

/// ROC curve points, one per distinct score threshold, from the strictest
/// threshold to the most permissive. Starts at (0, 0); the last point is
/// always (1, 1).
pub fn roc_points(y: &Array1<f64>, p: &Array1<f64>) -> Vec<RocPoint> {
    assert_eq!(y.len(), p.len());
    let n = y.len();
    let n_pos = y.iter().filter(|&&t| t > 0.5).count();
    let n_neg = n - n_pos;

    let mut idx: Vec<usize> = (0..n).collect();
    idx.sort_by(|&i, &j| p[j].partial_cmp(&p[i]).unwrap_or(std::cmp::Ordering::Equal));

    let mut points = vec![RocPoint {
        threshold: f64::INFINITY,
        false_positive_rate: 0.0,
        true_positive_rate: 0.0,
    }];

    let mut true_positives = 0usize;
    let mut false_positives = 0usize;
    let mut i = 0;
    while i < n {
        // Consume the whole run of rows tied at this score before emitting
        // a point, so ties never produce intermediate operating points.
        let score = p[idx[i]];
        while i < n && p[idx[i]] == score {
            if y[idx[i]] > 0.5 {
                true_positives += 1;
            } else {
                false_positives += 1;
            }
            i += 1;
        }
        points.push(RocPoint {
            threshold: score,
            false_positive_rate: if n_neg == 0 {
                0.0
            } else {
                false_positives as f64 / n_neg as f64
            },
            true_positive_rate: if n_pos == 0 {
                0.0
            } else {
                true_positives as f64 / n_pos as f64
            },
        });
    }
    points
}
