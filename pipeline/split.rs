//! # User-Level Cohort Splitting
//!
//! Policies are partitioned into train/holdout cohorts at the granularity
//! of the policyholder. A user's policies always land in the same cohort:
//! splitting at the policy level would let one user's claim history inform
//! predictions about their own held-out policies.
//!
//! The split is stratified on the per-user aggregate label (any policy
//! claimed) and driven by a fixed-seed RNG so that every run of the
//! pipeline reproduces the same cohorts.

use crate::enrich::EnrichedTable;
use ahash::{AHashMap, AHashSet};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;

/// Seed for the cohort shuffle. Fixed for reproducibility.
pub const SPLIT_SEED: u64 = 42;

/// Fraction of users assigned to the holdout cohort.
pub const HOLDOUT_FRACTION: f64 = 0.3;

/// Maximum allowed drift between the holdout and global positive-user
/// ratios, in absolute terms.
pub const STRATIFICATION_TOLERANCE: f64 = 0.03;

#[derive(Error, Debug)]
pub enum SplitError {
    #[error("Cohort splitting requires the 'claim' label column.")]
    LabelRequired,
    #[error(
        "Stratification drifted: holdout positive-user ratio {holdout:.4} vs global {global:.4} exceeds tolerance {tolerance}."
    )]
    StratificationDrift {
        holdout: f64,
        global: f64,
        tolerance: f64,
    },
    #[error(
        "Cohorts overlap or drop rows: {train} train + {holdout} holdout != {total} input rows."
    )]
    CohortMismatch {
        train: usize,
        holdout: usize,
        total: usize,
    },
}

/// The two cohorts produced by [`split_cohorts`].
#[derive(Debug)]
pub struct CohortSplit {
    pub train: EnrichedTable,
    pub holdout: EnrichedTable,
}

/// Groups row indices by user, in first-appearance order.
fn rows_by_user(user_ids: &[String]) -> (Vec<String>, AHashMap<String, Vec<usize>>) {
    let mut order: Vec<String> = Vec::new();
    let mut groups: AHashMap<String, Vec<usize>> = AHashMap::new();
    for (row, user) in user_ids.iter().enumerate() {
        let entry = groups.entry(user.clone()).or_default();
        if entry.is_empty() {
            order.push(user.clone());
        }
        entry.push(row);
    }
    (order, groups)
}

/// Aggregate label per user: positive if any of the user's policies is.
fn user_labels(
    order: &[String],
    groups: &AHashMap<String, Vec<usize>>,
    claims: &[f64],
) -> Vec<(String, bool)> {
    order
        .iter()
        .map(|user| {
            let positive = groups[user].iter().any(|&row| claims[row] > 0.5);
            (user.clone(), positive)
        })
        .collect()
}

/// Partitions the enriched table into train/holdout cohorts.
///
/// Positive and negative users are shuffled independently with the given
/// seed and each stratum is cut at [`HOLDOUT_FRACTION`]. The invariants
/// verified afterwards (disjoint user sets, conserved row count, bounded
/// stratification drift) are hard errors, not diagnostics.
pub fn split_cohorts(table: &EnrichedTable, seed: u64) -> Result<CohortSplit, SplitError> {
    let claims = table
        .policies
        .claim
        .as_ref()
        .ok_or(SplitError::LabelRequired)?;

    let (order, groups) = rows_by_user(&table.policies.user_id);
    let labels = user_labels(&order, &groups, claims);

    let mut positive: Vec<&String> = labels.iter().filter(|(_, l)| *l).map(|(u, _)| u).collect();
    let mut negative: Vec<&String> = labels.iter().filter(|(_, l)| !*l).map(|(u, _)| u).collect();

    let mut rng = StdRng::seed_from_u64(seed);
    positive.shuffle(&mut rng);
    negative.shuffle(&mut rng);

    let mut holdout_users: AHashSet<&String> = AHashSet::new();
    for stratum in [&positive, &negative] {
        let cut = (stratum.len() as f64 * HOLDOUT_FRACTION).round() as usize;
        holdout_users.extend(stratum.iter().take(cut));
    }

    let mut train_rows: Vec<usize> = Vec::new();
    let mut holdout_rows: Vec<usize> = Vec::new();
    for user in &order {
        let rows = &groups[user];
        if holdout_users.contains(user) {
            holdout_rows.extend_from_slice(rows);
        } else {
            train_rows.extend_from_slice(rows);
        }
    }

    if train_rows.len() + holdout_rows.len() != table.len() {
        return Err(SplitError::CohortMismatch {
            train: train_rows.len(),
            holdout: holdout_rows.len(),
            total: table.len(),
        });
    }

    let global_ratio = positive.len() as f64 / labels.len() as f64;
    let holdout_positive = positive.iter().filter(|u| holdout_users.contains(*u)).count();
    let holdout_ratio = if holdout_users.is_empty() {
        0.0
    } else {
        holdout_positive as f64 / holdout_users.len() as f64
    };
    if (holdout_ratio - global_ratio).abs() > STRATIFICATION_TOLERANCE {
        return Err(SplitError::StratificationDrift {
            holdout: holdout_ratio,
            global: global_ratio,
            tolerance: STRATIFICATION_TOLERANCE,
        });
    }

    log::info!(
        "Cohort split: {} train rows / {} holdout rows across {} users ({} positive); holdout positive-user ratio {:.4} vs global {:.4}",
        train_rows.len(),
        holdout_rows.len(),
        labels.len(),
        positive.len(),
        holdout_ratio,
        global_ratio
    );

    Ok(CohortSplit {
        train: table.take(&train_rows),
        holdout: table.take(&holdout_rows),
    })
}

/// Stratified user-level folds for cross-validation.
///
/// Returns `k` (validation-rows, train-rows) pairs. Users are shuffled per
/// stratum with the given seed and dealt round-robin across folds, so every
/// user appears in exactly one validation fold.
pub fn stratified_user_folds(
    table: &EnrichedTable,
    k: usize,
    seed: u64,
) -> Result<Vec<(Vec<usize>, Vec<usize>)>, SplitError> {
    let claims = table
        .policies
        .claim
        .as_ref()
        .ok_or(SplitError::LabelRequired)?;

    let (order, groups) = rows_by_user(&table.policies.user_id);
    let labels = user_labels(&order, &groups, claims);

    let mut positive: Vec<&String> = labels.iter().filter(|(_, l)| *l).map(|(u, _)| u).collect();
    let mut negative: Vec<&String> = labels.iter().filter(|(_, l)| !*l).map(|(u, _)| u).collect();

    let mut rng = StdRng::seed_from_u64(seed);
    positive.shuffle(&mut rng);
    negative.shuffle(&mut rng);

    let mut fold_of_user: AHashMap<&String, usize> = AHashMap::new();
    for stratum in [&positive, &negative] {
        for (i, &user) in stratum.iter().enumerate() {
            fold_of_user.insert(user, i % k);
        }
    }

    let mut folds = Vec::with_capacity(k);
    for fold in 0..k {
        let mut validation: Vec<usize> = Vec::new();
        let mut train: Vec<usize> = Vec::new();
        for user in &order {
            let rows = &groups[user];
            if fold_of_user[user] == fold {
                validation.extend_from_slice(rows);
            } else {
                train.extend_from_slice(rows);
            }
        }
        folds.push((validation, train));
    }
    Ok(folds)
}
