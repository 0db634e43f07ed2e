//! # Feature Engineering
//!
//! Derives the model's feature matrix from an enriched, imputed table. All
//! data-dependent statistics (age bin edges, categorical vocabularies, the
//! neighbour index) are fit once on the training cohort and then applied
//! unchanged to any record set; the policy constants below come from
//! one-time offline analysis and are fixed by name so the transform stays
//! auditable without re-running that analysis.
//!
//! The derivation order is fixed: age binning, ordinal clipping, the
//! per-user running claim count, density flags, the spatial claim ratio,
//! categorical one-hot materialization.

use crate::enrich::EnrichedTable;
use crate::neighbors::NeighborIndex;
use itertools::Itertools;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of quantile age buckets fit on the training cohort.
pub const AGE_BIN_COUNT: usize = 5;

/// Ceiling for the fire-station proximity ordinal. Higher ranks are rare
/// and statistically indistinguishable from the cap.
pub const FIRE_RANK_CAP: f64 = 9.0;

/// Density at or below this is flagged rural (bottom deciles of the
/// reference density distribution).
pub const RURAL_DENSITY_MAX: f64 = 100.0;

/// Density above this is flagged urban (top decile).
pub const URBAN_DENSITY_MIN: f64 = 3000.0;

/// Bucket for category values never seen in the training cohort.
pub const UNKNOWN_CATEGORY: &str = "__unknown__";

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Fitting the feature transform requires the 'claim' label column.")]
    LabelRequiredForFit,
    #[error("Cannot fit the feature transform on an empty table.")]
    EmptyTable,
    #[error(
        "Row {row} still has no '{field}' value. The imputation plan must be applied before the transform."
    )]
    UnimputedField { field: &'static str, row: usize },
}

/// The feature matrix handed to the classifier, with column names aligned
/// to the matrix columns.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub names: Vec<String>,
    pub x: Array2<f64>,
}

impl FeatureMatrix {
    pub fn n_rows(&self) -> usize {
        self.x.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.x.ncols()
    }
}

/// Fitted transform statistics. Immutable once fit; part of the persisted
/// pipeline artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureTransform {
    /// Interior quantile edges of the training age distribution
    /// (`AGE_BIN_COUNT - 1` cut points, ascending).
    pub age_edges: Vec<f64>,
    pub region_vocab: Vec<String>,
    pub product_vocab: Vec<String>,
    pub payment_vocab: Vec<String>,
    pub neighbors: NeighborIndex,
}

/// Linear-interpolation quantile over a sorted slice.
fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

/// Sorted unique category values observed in the training cohort.
fn fit_vocabulary<'a, I: Iterator<Item = &'a str>>(values: I) -> Vec<String> {
    values.map(str::to_string).sorted_unstable().dedup().collect()
}

/// Per-user running count of strictly-prior positive labels.
///
/// Records are ordered by (user, `prior_policies` ascending), the proxy
/// for temporal order, since no explicit timestamp exists. The accumulator
/// resets at every user boundary and the current row's own label only
/// reaches the accumulator after the row's count has been emitted. The
/// output is aligned to the input row order.
pub fn previous_claims(user_ids: &[String], prior_policies: &[f64], claims: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..user_ids.len()).collect();
    order.sort_unstable_by(|&a, &b| {
        user_ids[a]
            .cmp(&user_ids[b])
            .then(prior_policies[a].total_cmp(&prior_policies[b]))
            .then(a.cmp(&b))
    });

    let mut counts = vec![0.0; user_ids.len()];
    let mut current_user: Option<&str> = None;
    let mut accumulated = 0.0;
    for &row in &order {
        if current_user != Some(user_ids[row].as_str()) {
            current_user = Some(user_ids[row].as_str());
            accumulated = 0.0;
        }
        counts[row] = accumulated;
        accumulated += claims[row];
    }
    counts
}

impl FeatureTransform {
    /// Fits all data-dependent statistics from the training cohort. The
    /// table must already be imputed.
    pub fn fit(train: &EnrichedTable) -> Result<FeatureTransform, TransformError> {
        if train.is_empty() {
            return Err(TransformError::EmptyTable);
        }
        let claims = train
            .policies
            .claim
            .as_ref()
            .ok_or(TransformError::LabelRequiredForFit)?;

        let mut ages = required_column(&train.policies.age, "age")?;
        ages.sort_by(|a, b| a.total_cmp(b));
        let age_edges: Vec<f64> = (1..AGE_BIN_COUNT)
            .map(|i| quantile_sorted(&ages, i as f64 / AGE_BIN_COUNT as f64))
            .collect();

        let payments = required_string_column(&train.policies.payment_method, "payment_method")?;

        let transform = FeatureTransform {
            age_edges,
            region_vocab: fit_vocabulary(train.policies.region.iter().map(String::as_str)),
            product_vocab: fit_vocabulary(train.policies.product.iter().map(String::as_str)),
            payment_vocab: fit_vocabulary(payments.into_iter()),
            neighbors: NeighborIndex::build(
                &train.latitude,
                &train.longitude,
                &train.policies.user_id,
                claims,
            ),
        };
        log::info!(
            "Fitted feature transform: age edges {:?}, vocab sizes region={} product={} payment={}",
            transform.age_edges,
            transform.region_vocab.len(),
            transform.product_vocab.len(),
            transform.payment_vocab.len()
        );
        Ok(transform)
    }

    /// Bucket index for an age against the fitted edges. Values at or below
    /// an edge stay in the lower bucket, so the lowest edge is inclusive.
    pub fn age_bin(&self, age: f64) -> usize {
        self.age_edges.partition_point(|edge| age > *edge)
    }

    /// Applies the fitted transform to any record set. Deterministic: the
    /// same table and fitted statistics always produce the same matrix.
    pub fn transform(&self, table: &EnrichedTable) -> Result<FeatureMatrix, TransformError> {
        let n = table.len();
        let policies = &table.policies;

        let ages = required_column(&policies.age, "age")?;
        let coast = required_column(&policies.coast_km, "coast_km")?;
        let electronics =
            required_column(&policies.covers_electronics, "covers_electronics")?;
        let payments = required_string_column(&policies.payment_method, "payment_method")?;

        let history = match &policies.claim {
            Some(claims) => previous_claims(&policies.user_id, &policies.prior_policies, claims),
            None => {
                log::warn!(
                    "No 'claim' column: the previous_claims feature falls back to zero for all {n} rows"
                );
                vec![0.0; n]
            }
        };

        fn push(names: &mut Vec<String>, columns: &mut Vec<Vec<f64>>, name: &str, col: Vec<f64>) {
            names.push(name.to_string());
            columns.push(col);
        }
        let mut names: Vec<String> = Vec::new();
        let mut columns: Vec<Vec<f64>> = Vec::new();

        push(&mut names, &mut columns, "age_bin",
            ages.iter().map(|&a| self.age_bin(a) as f64).collect());
        push(&mut names, &mut columns, "fire_station_rank",
            policies.fire_station_rank.iter().map(|&r| r.min(FIRE_RANK_CAP)).collect());
        push(&mut names, &mut columns, "prior_policies", policies.prior_policies.clone());
        push(&mut names, &mut columns, "coast_km", coast);
        push(&mut names, &mut columns, "has_alarm", policies.has_alarm.clone());
        push(&mut names, &mut columns, "covers_electronics", electronics);
        push(&mut names, &mut columns, "population", table.population.clone());
        push(&mut names, &mut columns, "density", table.density.clone());
        push(&mut names, &mut columns, "is_rural",
            table.density.iter().map(|&d| f64::from(d <= RURAL_DENSITY_MAX)).collect());
        push(&mut names, &mut columns, "is_urban",
            table.density.iter().map(|&d| f64::from(d > URBAN_DENSITY_MIN)).collect());
        push(&mut names, &mut columns, "previous_claims", history);
        push(&mut names, &mut columns, "area_claim_ratio",
            (0..n)
                .map(|i| {
                    self.neighbors.claim_ratio(
                        table.latitude[i],
                        table.longitude[i],
                        &policies.user_id[i],
                    )
                })
                .collect());

        one_hot(&mut names, &mut columns, "region", &self.region_vocab,
            policies.region.iter().map(String::as_str));
        one_hot(&mut names, &mut columns, "product", &self.product_vocab,
            policies.product.iter().map(String::as_str));
        one_hot(&mut names, &mut columns, "payment_method", &self.payment_vocab,
            payments.into_iter());

        let x = Array2::from_shape_fn((n, columns.len()), |(row, col)| columns[col][row]);
        Ok(FeatureMatrix { names, x })
    }
}

/// Label vector aligned with the transform output, when labels are present.
pub fn label_vector(table: &EnrichedTable) -> Option<Array1<f64>> {
    table
        .policies
        .claim
        .as_ref()
        .map(|claims| Array1::from_vec(claims.clone()))
}

/// Materializes a categorical column against a fixed vocabulary, one
/// indicator column per category plus the explicit unknown bucket.
fn one_hot<'a, I: Iterator<Item = &'a str>>(
    names: &mut Vec<String>,
    columns: &mut Vec<Vec<f64>>,
    column: &str,
    vocab: &[String],
    values: I,
) {
    let values: Vec<&str> = values.collect();
    for category in vocab {
        names.push(format!("{column}={category}"));
        columns.push(
            values
                .iter()
                .map(|v| f64::from(*v == category.as_str()))
                .collect(),
        );
    }
    names.push(format!("{column}={UNKNOWN_CATEGORY}"));
    columns.push(
        values
            .iter()
            .map(|v| f64::from(!vocab.iter().any(|c| c == v)))
            .collect(),
    );
}

fn required_column(
    values: &[Option<f64>],
    field: &'static str,
) -> Result<Vec<f64>, TransformError> {
    values
        .iter()
        .enumerate()
        .map(|(row, v)| v.ok_or(TransformError::UnimputedField { field, row }))
        .collect()
}

fn required_string_column<'a>(
    values: &'a [Option<String>],
    field: &'static str,
) -> Result<Vec<&'a str>, TransformError> {
    values
        .iter()
        .enumerate()
        .map(|(row, v)| {
            v.as_deref()
                .ok_or(TransformError::UnimputedField { field, row })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PolicyTable;
    use approx::assert_abs_diff_eq;

    fn test_table(n: usize) -> EnrichedTable {
        EnrichedTable {
            policies: PolicyTable {
                policy_id: (0..n).map(|i| format!("P{i}")).collect(),
                user_id: (0..n).map(|i| format!("U{}", i / 2)).collect(),
                postal_code: vec!["28001".to_string(); n],
                region: (0..n).map(|i| format!("R{}", i % 3)).collect(),
                product: vec!["basic".to_string(); n],
                payment_method: vec![Some("card".to_string()); n],
                floor_area_sqft: vec![None; n],
                coast_km: (0..n).map(|i| Some(i as f64)).collect(),
                fire_station_rank: (0..n).map(|i| (i % 14) as f64).collect(),
                prior_policies: (0..n).map(|i| (i % 2) as f64).collect(),
                age: (0..n).map(|i| Some(20.0 + i as f64)).collect(),
                has_alarm: vec![0.0; n],
                covers_electronics: vec![Some(1.0); n],
                claim: Some((0..n).map(|i| f64::from(u8::from(i % 6 == 0))).collect()),
            },
            latitude: (0..n).map(|i| 40.0 + (i as f64) * 0.01).collect(),
            longitude: (0..n).map(|i| -3.0 - (i as f64) * 0.01).collect(),
            city: vec!["Madrid".to_string(); n],
            population: vec![10_000.0; n],
            density: (0..n).map(|i| 50.0 + (i as f64) * 100.0).collect(),
        }
    }

    #[test]
    fn previous_claims_counts_strictly_prior_positives() {
        // The documented two-policy example: (prior=1, claim) then
        // (prior=2, no claim) must yield 0 then 1.
        let users = vec!["A".to_string(), "A".to_string()];
        let priors = vec![1.0, 2.0];
        let claims = vec![1.0, 0.0];
        assert_eq!(previous_claims(&users, &priors, &claims), vec![0.0, 1.0]);
    }

    #[test]
    fn previous_claims_resets_at_user_boundaries() {
        let users: Vec<String> = ["A", "A", "A", "B", "B"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let priors = vec![0.0, 1.0, 2.0, 0.0, 1.0];
        let claims = vec![1.0, 1.0, 0.0, 1.0, 0.0];
        assert_eq!(
            previous_claims(&users, &priors, &claims),
            vec![0.0, 1.0, 2.0, 0.0, 1.0]
        );
    }

    #[test]
    fn previous_claims_ignores_input_row_order() {
        // Rows arrive shuffled; the count must follow prior_policies order
        // and stay aligned to the original positions.
        let users: Vec<String> = ["A", "A", "A"].iter().map(|s| s.to_string()).collect();
        let priors = vec![2.0, 0.0, 1.0];
        let claims = vec![0.0, 1.0, 1.0];
        assert_eq!(previous_claims(&users, &priors, &claims), vec![2.0, 0.0, 1.0]);
    }

    #[test]
    fn previous_claims_is_non_decreasing_per_user() {
        let table = test_table(60);
        let policies = &table.policies;
        let counts = previous_claims(
            &policies.user_id,
            &policies.prior_policies,
            policies.claim.as_ref().unwrap(),
        );
        for user in 0..30 {
            let first = counts[user * 2];
            let second = counts[user * 2 + 1];
            assert!(first <= second, "user U{user}: {first} > {second}");
            assert_abs_diff_eq!(first, 0.0);
        }
    }

    #[test]
    fn age_bins_use_fitted_quantile_edges() {
        let table = test_table(100);
        let transform = FeatureTransform::fit(&table).unwrap();
        assert_eq!(transform.age_edges.len(), AGE_BIN_COUNT - 1);

        // Ages are uniform over [20, 119]; the edges must be ascending and
        // every bucket must be reachable.
        for pair in transform.age_edges.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(transform.age_bin(0.0), 0);
        assert_eq!(transform.age_bin(transform.age_edges[0]), 0);
        assert_eq!(transform.age_bin(500.0), AGE_BIN_COUNT - 1);
    }

    #[test]
    fn fire_rank_is_clipped_at_cap() {
        let table = test_table(60);
        let transform = FeatureTransform::fit(&table).unwrap();
        let matrix = transform.transform(&table).unwrap();
        let rank_col = matrix.names.iter().position(|n| n == "fire_station_rank").unwrap();
        for row in 0..matrix.n_rows() {
            assert!(matrix.x[[row, rank_col]] <= FIRE_RANK_CAP);
        }
        // Raw ranks go up to 13, so the cap must actually bind somewhere.
        assert!(
            (0..matrix.n_rows()).any(|row| matrix.x[[row, rank_col]] == FIRE_RANK_CAP)
        );
    }

    #[test]
    fn density_flags_use_fixed_thresholds() {
        let table = test_table(60);
        let transform = FeatureTransform::fit(&table).unwrap();
        let matrix = transform.transform(&table).unwrap();
        let rural = matrix.names.iter().position(|n| n == "is_rural").unwrap();
        let urban = matrix.names.iter().position(|n| n == "is_urban").unwrap();
        for row in 0..matrix.n_rows() {
            let density = table.density[row];
            assert_abs_diff_eq!(matrix.x[[row, rural]], f64::from(density <= RURAL_DENSITY_MAX));
            assert_abs_diff_eq!(matrix.x[[row, urban]], f64::from(density > URBAN_DENSITY_MIN));
        }
    }

    #[test]
    fn claim_ratio_column_respects_clamp() {
        use crate::neighbors::CLAIM_RATIO_CLAMP;
        let table = test_table(80);
        let transform = FeatureTransform::fit(&table).unwrap();
        let matrix = transform.transform(&table).unwrap();
        let col = matrix.names.iter().position(|n| n == "area_claim_ratio").unwrap();
        for row in 0..matrix.n_rows() {
            let v = matrix.x[[row, col]];
            assert!((0.0..=CLAIM_RATIO_CLAMP).contains(&v));
        }
    }

    #[test]
    fn unknown_categories_map_to_the_unknown_bucket() {
        let train = test_table(60);
        let transform = FeatureTransform::fit(&train).unwrap();

        let mut query = test_table(20);
        query.policies.region[3] = "NEVER_SEEN".to_string();
        let matrix = transform.transform(&query).unwrap();

        let unknown = matrix
            .names
            .iter()
            .position(|n| n == &format!("region={UNKNOWN_CATEGORY}"))
            .unwrap();
        assert_abs_diff_eq!(matrix.x[[3, unknown]], 1.0);
        assert_abs_diff_eq!(matrix.x[[0, unknown]], 0.0);

        // The unseen value must not light up any known-region column.
        for (i, name) in matrix.names.iter().enumerate() {
            if name.starts_with("region=") && i != unknown {
                assert_abs_diff_eq!(matrix.x[[3, i]], 0.0);
            }
        }
    }

    #[test]
    fn transform_is_idempotent() {
        let table = test_table(60);
        let transform = FeatureTransform::fit(&table).unwrap();
        let first = transform.transform(&table).unwrap();
        let second = transform.transform(&table).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn transform_without_labels_zeroes_history() {
        let train = test_table(60);
        let transform = FeatureTransform::fit(&train).unwrap();

        let mut query = test_table(20);
        query.policies.claim = None;
        let matrix = transform.transform(&query).unwrap();
        let col = matrix.names.iter().position(|n| n == "previous_claims").unwrap();
        for row in 0..matrix.n_rows() {
            assert_abs_diff_eq!(matrix.x[[row, col]], 0.0);
        }
    }

    #[test]
    fn unimputed_field_is_an_explicit_error() {
        let train = test_table(60);
        let transform = FeatureTransform::fit(&train).unwrap();

        let mut query = test_table(20);
        query.policies.coast_km[5] = None;
        match transform.transform(&query) {
            Err(TransformError::UnimputedField { field, row }) => {
                assert_eq!(field, "coast_km");
                assert_eq!(row, 5);
            }
            other => panic!("Expected UnimputedField, got {other:?}"),
        }
    }
}
