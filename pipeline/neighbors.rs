//! # Training-Cohort Neighbour Index
//!
//! An exact nearest-neighbour index over the training cohort's (latitude,
//! longitude) pairs, built once per fitted pipeline and queried for the
//! spatial claim-ratio feature.
//!
//! The index always points into the training population, also when the
//! query comes from the holdout cohort. Same-user neighbours are discarded
//! from every retrieval: when the query row is itself a training row, that
//! exclusion also removes the row's own label from the estimate.
//!
//! Search is exact (selection over all training points with an index
//! tie-break), so identical queries against the same index always return
//! identical features. Approximate structures would be faster and are not
//! needed at this scale.

use serde::{Deserialize, Serialize};

/// Neighbours kept per query after same-user exclusion.
pub const NEIGHBOR_COUNT: usize = 15;

/// Upper bound for the claim-ratio feature. Proximity estimates are noisy
/// and must not dominate the model over-confidently.
pub const CLAIM_RATIO_CLAMP: f64 = 0.25;

/// Exact nearest-neighbour index over training coordinates.
///
/// Immutable once built; shared read-only by every transform call. Part of
/// the persisted pipeline artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborIndex {
    latitude: Vec<f64>,
    longitude: Vec<f64>,
    user_id: Vec<String>,
    label: Vec<f64>,
    /// Candidates retrieved per query: [`NEIGHBOR_COUNT`] plus head-room for
    /// the largest same-user policy block, so enough survivors remain after
    /// exclusion.
    retrieval: usize,
}

impl NeighborIndex {
    /// Builds the index from training-cohort columns.
    ///
    /// The retrieval size is `NEIGHBOR_COUNT + max policies per user`,
    /// guaranteeing that discarding one user's block still leaves
    /// `NEIGHBOR_COUNT` candidates whenever the cohort is large enough.
    pub fn build(
        latitude: &[f64],
        longitude: &[f64],
        user_id: &[String],
        label: &[f64],
    ) -> NeighborIndex {
        debug_assert_eq!(latitude.len(), longitude.len());
        debug_assert_eq!(latitude.len(), user_id.len());
        debug_assert_eq!(latitude.len(), label.len());

        let mut per_user: ahash::AHashMap<&str, usize> = ahash::AHashMap::new();
        for user in user_id {
            *per_user.entry(user.as_str()).or_insert(0) += 1;
        }
        let max_per_user = per_user.values().copied().max().unwrap_or(0);

        let index = NeighborIndex {
            latitude: latitude.to_vec(),
            longitude: longitude.to_vec(),
            user_id: user_id.to_vec(),
            label: label.to_vec(),
            retrieval: NEIGHBOR_COUNT + max_per_user,
        };
        log::info!(
            "Neighbor index: {} training points, retrieval size {} (max {} policies per user)",
            index.len(),
            index.retrieval,
            max_per_user
        );
        index
    }

    pub fn len(&self) -> usize {
        self.latitude.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latitude.is_empty()
    }

    /// Mean claim label among the query point's nearest training
    /// neighbours, excluding every policy of `query_user`, clamped to
    /// [`CLAIM_RATIO_CLAMP`].
    pub fn claim_ratio(&self, latitude: f64, longitude: f64, query_user: &str) -> f64 {
        // Squared Euclidean distance in coordinate space; ties broken by
        // training-row index so retrieval order is total and reproducible.
        let mut candidates: Vec<(f64, usize)> = (0..self.len())
            .map(|i| {
                let dlat = self.latitude[i] - latitude;
                let dlon = self.longitude[i] - longitude;
                (dlat * dlat + dlon * dlon, i)
            })
            .collect();

        let head = self.retrieval.min(candidates.len());
        if head < candidates.len() {
            candidates.select_nth_unstable_by(head, |a, b| {
                a.0.total_cmp(&b.0).then(a.1.cmp(&b.1))
            });
            candidates.truncate(head);
        }
        candidates.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut kept = 0usize;
        let mut positives = 0.0;
        for &(_, i) in &candidates {
            if self.user_id[i] == query_user {
                continue;
            }
            positives += self.label[i];
            kept += 1;
            if kept == NEIGHBOR_COUNT {
                break;
            }
        }

        if kept == 0 {
            return 0.0;
        }
        (positives / kept as f64).min(CLAIM_RATIO_CLAMP)
    }
}
