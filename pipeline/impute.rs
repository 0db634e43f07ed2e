//! # Missing-Value Imputation
//!
//! A fixed per-field plan, fit once against the training cohort and applied
//! identically (in place) to any record set. The fitted constants come only
//! from the training cohort: the holdout must never influence them.
//!
//! The per-field rules, from the offline missingness analysis:
//! - `age`: median of the training ages. Missingness looks administrative.
//! - `payment_method`: most frequent training category.
//! - `coast_km`: [`COAST_KM_FALLBACK`]. The upstream source leaves the
//!   field empty beyond the maximum recorded coastal distance.
//! - `covers_electronics`: [`ELECTRONICS_FALLBACK`]. Missingness itself
//!   correlates with the positive label, so the missing rows are collapsed
//!   onto the covered side rather than given a neutral value.
//! - `floor_area_sqft`: never imputed. The field is more than 97% missing
//!   and its observed values are statistically indistinguishable from
//!   noise, so the transformer drops it instead.

use crate::enrich::EnrichedTable;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Replacement for missing `coast_km`: the maximum coastal distance in the
/// reference data.
pub const COAST_KM_FALLBACK: f64 = 30.0;

/// Replacement for missing `covers_electronics`.
pub const ELECTRONICS_FALLBACK: f64 = 1.0;

#[derive(Error, Debug)]
pub enum ImputeError {
    #[error("Cannot fit the imputation plan: the training cohort has no '{0}' values at all.")]
    NoObservedValues(&'static str),
}

/// The fitted imputation plan. Part of the persisted pipeline artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImputationPlan {
    /// Median age of the training cohort.
    pub age_median: f64,
    /// Most frequent payment method in the training cohort.
    pub payment_fallback: String,
}

impl ImputationPlan {
    /// Fits the plan from the training cohort only.
    pub fn fit(train: &EnrichedTable) -> Result<ImputationPlan, ImputeError> {
        let mut ages: Vec<f64> = train.policies.age.iter().flatten().copied().collect();
        if ages.is_empty() {
            return Err(ImputeError::NoObservedValues("age"));
        }
        ages.sort_by(|a, b| a.total_cmp(b));
        let age_median = if ages.len() % 2 == 1 {
            ages[ages.len() / 2]
        } else {
            (ages[ages.len() / 2 - 1] + ages[ages.len() / 2]) / 2.0
        };

        let mut counts: AHashMap<&str, usize> = AHashMap::new();
        for method in train.policies.payment_method.iter().flatten() {
            *counts.entry(method.as_str()).or_insert(0) += 1;
        }
        // Deterministic tie-break on the category name.
        let payment_fallback = counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(name, _)| name.to_string())
            .ok_or(ImputeError::NoObservedValues("payment_method"))?;

        log::info!(
            "Imputation plan: age median {age_median:.1}, payment fallback '{payment_fallback}'"
        );
        Ok(ImputationPlan {
            age_median,
            payment_fallback,
        })
    }

    /// Fills missing values in place. Idempotent: a second application over
    /// the same table changes nothing.
    pub fn apply(&self, table: &mut EnrichedTable) {
        let policies = &mut table.policies;
        let mut filled = 0usize;
        for age in &mut policies.age {
            if age.is_none() {
                *age = Some(self.age_median);
                filled += 1;
            }
        }
        for method in &mut policies.payment_method {
            if method.is_none() {
                *method = Some(self.payment_fallback.clone());
                filled += 1;
            }
        }
        for coast in &mut policies.coast_km {
            if coast.is_none() {
                *coast = Some(COAST_KM_FALLBACK);
                filled += 1;
            }
        }
        for covered in &mut policies.covers_electronics {
            if covered.is_none() {
                *covered = Some(ELECTRONICS_FALLBACK);
                filled += 1;
            }
        }
        // floor_area_sqft is deliberately left untouched; the transformer
        // excludes it from the feature matrix.
        log::debug!("Imputation filled {filled} values over {} rows", policies.len());
    }
}
