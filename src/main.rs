// The pipeline orchestrator. Owns the application lifecycle from argument
// parsing to artifact/score output; all modeling logic lives in the library
// crate. Phases run strictly forward: load, enrich, split, fit, evaluate,
// persist.

#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, Parser, Subcommand};
use std::process;
use thiserror::Error;

use claimcast::data::{self, DataError};
use claimcast::enrich::{enrich, EnrichError, EnrichedTable};
use claimcast::impute::ImputationPlan;
use claimcast::learn::chi2::chi2_independence;
use claimcast::learn::metrics::{auc, roc_points};
use claimcast::model::{
    cross_validated_auc, FittedPipeline, ModelError, PipelineError, TrainOptions,
};
use claimcast::split::{split_cohorts, SplitError, SPLIT_SEED};

#[derive(Parser)]
#[command(
    name = "claimcast",
    about = "Claim-risk modeling for yearly insurance policies",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fit the full pipeline and persist the artifact
    Train(TrainArgs),
    /// Score policies with a previously fitted artifact
    Predict(PredictArgs),
}

#[derive(Args)]
struct TrainArgs {
    /// Path to the policy CSV (claim column required)
    #[arg(long)]
    policies: String,

    /// Path to the postal-code geographic reference CSV
    #[arg(long)]
    geo: String,

    /// Output path for the fitted pipeline artifact (TOML)
    #[arg(long, default_value = "claimcast.toml")]
    output: String,

    /// Number of boosting rounds
    #[arg(long, default_value = "200")]
    rounds: usize,

    /// Shrinkage applied to every tree
    #[arg(long, default_value = "0.1")]
    learning_rate: f64,

    /// Maximum tree depth
    #[arg(long, default_value = "3")]
    max_depth: usize,

    /// Minimum rows per leaf
    #[arg(long, default_value = "20")]
    min_leaf: usize,

    /// User-level cross-validation folds over the training cohort (<2 skips)
    #[arg(long, default_value = "5")]
    cv_folds: usize,

    /// Seed for the cohort split and fold assignment
    #[arg(long, default_value_t = SPLIT_SEED)]
    seed: u64,
}

#[derive(Args)]
struct PredictArgs {
    /// Path to the fitted pipeline artifact
    #[arg(long)]
    model: String,

    /// Path to the policy CSV to score (claim column optional)
    #[arg(long)]
    policies: String,

    /// Path to the postal-code geographic reference CSV
    #[arg(long)]
    geo: String,

    /// Output path for the scores CSV
    #[arg(long, default_value = "scores.csv")]
    output: String,
}

#[derive(Error, Debug)]
enum AppError {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Enrich(#[from] EnrichError),
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("Failed to write scores: {0}")]
    ScoreOutput(#[from] csv::Error),
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Train(args) => run_train(&args),
        Command::Predict(args) => run_predict(&args),
    };
    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// Prints the univariate chi-squared diagnostics for the categorical
/// columns of the (imputed) training cohort. Advisory output for the
/// analyst; nothing downstream consumes it.
fn print_chi2_diagnostics(train: &EnrichedTable, imputer: &ImputationPlan) {
    let mut table = train.clone();
    imputer.apply(&mut table);
    let Some(claims) = table.policies.claim.as_ref() else {
        return;
    };

    println!("\nChi-squared independence diagnostics (feature vs claim):");
    println!("{:<16} {:>12} {:>6} {:>12}", "feature", "statistic", "dof", "p-value");

    let payment: Vec<&str> = table
        .policies
        .payment_method
        .iter()
        .map(|m| m.as_deref().unwrap_or(""))
        .collect();
    let region: Vec<&str> = table.policies.region.iter().map(String::as_str).collect();
    let product: Vec<&str> = table.policies.product.iter().map(String::as_str).collect();

    for (name, values) in [
        ("region", region),
        ("product", product),
        ("payment_method", payment),
    ] {
        match chi2_independence(&values, claims) {
            Some(result) => println!(
                "{:<16} {:>12.4} {:>6} {:>12.6}",
                name, result.statistic, result.degrees_of_freedom, result.p_value
            ),
            None => println!("{name:<16} (degenerate table, skipped)"),
        }
    }
}

fn run_train(args: &TrainArgs) -> Result<(), AppError> {
    let options = TrainOptions {
        rounds: args.rounds,
        learning_rate: args.learning_rate,
        max_depth: args.max_depth,
        min_leaf: args.min_leaf,
    };

    // Phase 1: load and enrich.
    let policies = data::load_training_policies(&args.policies)?;
    let geo = data::load_geo_reference(&args.geo)?;
    let enriched = enrich(policies, &geo)?;

    // Phase 2: user-level cohort split.
    let cohorts = split_cohorts(&enriched, args.seed)?;

    // Phase 3: fit the pipeline on the training cohort only.
    let pipeline = FittedPipeline::fit(&cohorts.train, &options)?;
    print_chi2_diagnostics(&cohorts.train, &pipeline.imputer);

    // Phase 4: cross-validated AUC over the training cohort.
    if args.cv_folds > 1 {
        let scores = cross_validated_auc(&cohorts.train, args.cv_folds, args.seed, &options)?;
        let mean = scores.iter().sum::<f64>() / scores.len() as f64;
        let formatted: Vec<String> = scores.iter().map(|s| format!("{s:.4}")).collect();
        println!(
            "\nCross-validated AUC over {} folds: {mean:.4} (per fold: {})",
            scores.len(),
            formatted.join(", ")
        );
    }

    // Phase 5: held-out evaluation.
    let (matrix, labels) = pipeline.apply(&cohorts.holdout)?;
    let y = labels.ok_or(PipelineError::LabelRequired)?;
    let p = pipeline.model.predict_proba(matrix.x.view());
    let holdout_auc = auc(&y, &p);
    println!("\nHoldout AUC: {holdout_auc:.4}");

    let curve = roc_points(&y, &p);
    println!("ROC curve ({} thresholds):", curve.len());
    println!("{:>12} {:>8} {:>8}", "threshold", "FPR", "TPR");
    let step = (curve.len() / 10).max(1);
    for point in curve.iter().step_by(step) {
        println!(
            "{:>12.4} {:>8.4} {:>8.4}",
            point.threshold, point.false_positive_rate, point.true_positive_rate
        );
    }

    // Phase 6: persist the artifact.
    pipeline.save(&args.output)?;
    println!("\nPipeline artifact written to '{}'", args.output);
    Ok(())
}

fn run_predict(args: &PredictArgs) -> Result<(), AppError> {
    let pipeline = FittedPipeline::load(&args.model)?;
    let policies = data::load_scoring_policies(&args.policies)?;
    let geo = data::load_geo_reference(&args.geo)?;
    let enriched = enrich(policies, &geo)?;

    let (matrix, labels) = pipeline.apply(&enriched)?;
    let scores = pipeline.model.predict_proba(matrix.x.view());

    let mut writer = csv::Writer::from_path(&args.output)?;
    writer.write_record(["policy_id", "score"])?;
    for (policy_id, score) in enriched.policies.policy_id.iter().zip(scores.iter()) {
        writer.write_record([policy_id.as_str(), format!("{score:.6}").as_str()])?;
    }
    writer.flush().map_err(csv::Error::from)?;

    println!("Scored {} policies into '{}'", scores.len(), args.output);
    if let Some(y) = labels {
        println!("Input carried labels; AUC: {:.4}", auc(&y, &scores));
    }
    Ok(())
}
