//! End-to-end tests: synthetic CSV files through the full pipeline.

use claimcast::data::{load_geo_reference, load_training_policies};
use claimcast::enrich::{enrich, EnrichError};
use claimcast::learn::metrics::auc;
use claimcast::model::{FittedPipeline, TrainOptions};
use claimcast::split::{split_cohorts, SPLIT_SEED};
use std::collections::HashSet;
use std::io::Write;
use tempfile::NamedTempFile;

const USERS: usize = 150;

/// Writes a synthetic policy CSV: two policies per user, with claims
/// concentrated in the high-risk postal cluster so the model has signal.
fn write_policy_csv() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        "policy_id,user_id,postal_code,region,product,payment_method,floor_area_sqft,coast_km,fire_station_rank,prior_policies,age,has_alarm,covers_electronics,claim"
    )
    .unwrap();

    for user in 0..USERS {
        let risky = user % 3 == 0;
        let postal = if risky { 10000 + user % 5 } else { 20000 + user % 7 };
        for policy in 0..2 {
            let claim = u8::from(risky && policy == 0);
            // Sprinkle missing values over the imputable columns.
            let payment = if user % 11 == 0 && policy == 0 { "" } else { "card" };
            let coast = if user % 7 == 0 { String::new() } else { format!("{}", 3 + user % 20) };
            let age = if user % 13 == 0 { String::new() } else { format!("{}", 22 + user % 55) };
            let electronics = if user % 9 == 0 { "" } else { "1" };
            writeln!(
                file,
                "P{user}_{policy},U{user},{postal},{region},basic,{payment},,{coast},{rank},{policy},{age},{alarm},{electronics},{claim}",
                region = if risky { "R_HIGH" } else { "R_LOW" },
                rank = user % 12,
                alarm = user % 2,
            )
            .unwrap();
        }
    }
    file.flush().unwrap();
    file
}

/// Geographic reference covering both postal clusters, risky cluster far
/// from the safe one.
fn write_geo_csv() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "postal_code,latitude,longitude,city,population,density").unwrap();
    for code in 0..5 {
        writeln!(
            file,
            "{},41.{code},-3.{code},Northtown,8000,{}",
            10000 + code,
            50 + code * 10
        )
        .unwrap();
    }
    for code in 0..7 {
        writeln!(
            file,
            "{},39.{code},-1.{code},Southville,120000,{}",
            20000 + code,
            4000 + code * 100
        )
        .unwrap();
    }
    file.flush().unwrap();
    file
}

fn path(file: &NamedTempFile) -> &str {
    file.path().to_str().unwrap()
}

fn quick_options() -> TrainOptions {
    TrainOptions {
        rounds: 30,
        learning_rate: 0.2,
        max_depth: 3,
        min_leaf: 5,
    }
}

#[test]
fn full_pipeline_from_csv_to_holdout_auc() {
    let policy_file = write_policy_csv();
    let geo_file = write_geo_csv();

    let policies = load_training_policies(path(&policy_file)).unwrap();
    let geo = load_geo_reference(path(&geo_file)).unwrap();
    assert_eq!(policies.len(), USERS * 2);

    let enriched = enrich(policies, &geo).unwrap();
    assert_eq!(enriched.len(), USERS * 2);

    let cohorts = split_cohorts(&enriched, SPLIT_SEED).unwrap();

    // User-level leakage safety: no user straddles the cohorts.
    let train_users: HashSet<_> = cohorts.train.policies.user_id.iter().collect();
    let holdout_users: HashSet<_> = cohorts.holdout.policies.user_id.iter().collect();
    assert!(train_users.is_disjoint(&holdout_users));
    assert_eq!(train_users.len() + holdout_users.len(), USERS);

    let pipeline = FittedPipeline::fit(&cohorts.train, &quick_options()).unwrap();

    let (matrix, labels) = pipeline.apply(&cohorts.holdout).unwrap();
    let y = labels.unwrap();
    let p = pipeline.model.predict_proba(matrix.x.view());
    let holdout_auc = auc(&y, &p);
    assert!(
        holdout_auc > 0.8,
        "expected the planted signal to be recovered, holdout AUC {holdout_auc}"
    );
}

#[test]
fn unresolved_postal_code_aborts_enrichment() {
    let policy_file = write_policy_csv();
    let mut geo_file = NamedTempFile::new().unwrap();
    writeln!(geo_file, "postal_code,latitude,longitude,city,population,density").unwrap();
    // Only the safe cluster; every risky policy is unresolvable.
    for code in 0..7 {
        writeln!(
            geo_file,
            "{},39.{code},-1.{code},Southville,120000,4000",
            20000 + code
        )
        .unwrap();
    }
    geo_file.flush().unwrap();

    let policies = load_training_policies(path(&policy_file)).unwrap();
    let geo = load_geo_reference(path(&geo_file)).unwrap();
    match enrich(policies, &geo) {
        Err(EnrichError::UnresolvedPostalCodes { count, codes }) => {
            assert!(count > 0);
            assert!(codes.iter().all(|c| c.starts_with("1000")));
        }
        Ok(_) => panic!("enrichment must fail when postal codes are unresolved"),
    }
}

#[test]
fn artifact_round_trip_scores_identically() {
    let policy_file = write_policy_csv();
    let geo_file = write_geo_csv();

    let policies = load_training_policies(path(&policy_file)).unwrap();
    let geo = load_geo_reference(path(&geo_file)).unwrap();
    let enriched = enrich(policies, &geo).unwrap();
    let cohorts = split_cohorts(&enriched, SPLIT_SEED).unwrap();
    let pipeline = FittedPipeline::fit(&cohorts.train, &quick_options()).unwrap();

    let artifact = NamedTempFile::new().unwrap();
    pipeline.save(path(&artifact)).unwrap();
    let restored = FittedPipeline::load(path(&artifact)).unwrap();

    let before = pipeline.predict(&cohorts.holdout).unwrap();
    let after = restored.predict(&cohorts.holdout).unwrap();
    for (a, b) in before.iter().zip(after.iter()) {
        assert!((a - b).abs() < 1e-12);
    }
}

#[test]
fn transform_is_deterministic_across_calls() {
    let policy_file = write_policy_csv();
    let geo_file = write_geo_csv();

    let policies = load_training_policies(path(&policy_file)).unwrap();
    let geo = load_geo_reference(path(&geo_file)).unwrap();
    let enriched = enrich(policies, &geo).unwrap();
    let cohorts = split_cohorts(&enriched, SPLIT_SEED).unwrap();
    let pipeline = FittedPipeline::fit(&cohorts.train, &quick_options()).unwrap();

    let (first, _) = pipeline.apply(&cohorts.holdout).unwrap();
    let (second, _) = pipeline.apply(&cohorts.holdout).unwrap();
    assert_eq!(first, second);
}
