//! # The Fitted Pipeline Artifact
//!
//! The complete blueprint of a fitted claim-risk pipeline: the imputation
//! plan, the feature-transform statistics (including the neighbour index)
//! and the boosted ensemble. Everything needed to score new policies lives
//! in this one structure, serialized as a human-readable TOML file.
//!
//! All fitted state comes from the training cohort alone; `apply` never
//! updates it.

use crate::enrich::EnrichedTable;
use crate::features::{label_vector, FeatureMatrix, FeatureTransform, TransformError};
use crate::impute::{ImputationPlan, ImputeError};
use crate::learn::gbdt::{GradientBoosting, TrainError};
use crate::learn::metrics::auc;
use crate::split::{stratified_user_folds, SplitError};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use thiserror::Error;

/// Classifier hyperparameters, surfaced on the CLI.
#[derive(Debug, Clone, Copy)]
pub struct TrainOptions {
    pub rounds: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    pub min_leaf: usize,
}

impl Default for TrainOptions {
    fn default() -> Self {
        TrainOptions {
            rounds: 200,
            learning_rate: 0.1,
            max_depth: 3,
            min_leaf: 20,
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Fitting the pipeline requires the 'claim' label column.")]
    LabelRequired,
    #[error(transparent)]
    Impute(#[from] ImputeError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Train(#[from] TrainError),
    #[error(transparent)]
    Split(#[from] SplitError),
}

/// Errors for artifact persistence.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write the pipeline artifact: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse the TOML pipeline artifact: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize the pipeline to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// The self-contained, fitted pipeline artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedPipeline {
    /// Feature-matrix column names, recorded for artifact readability and
    /// cross-checked when the transform is re-applied. Serialized first so
    /// the TOML leads with plain values before the nested tables.
    pub feature_names: Vec<String>,
    pub imputer: ImputationPlan,
    pub transform: FeatureTransform,
    pub model: GradientBoosting,
}

impl FittedPipeline {
    /// Fits the whole pipeline on the (enriched, unimputed) training
    /// cohort.
    pub fn fit(train: &EnrichedTable, options: &TrainOptions) -> Result<FittedPipeline, PipelineError> {
        if train.policies.claim.is_none() {
            return Err(PipelineError::LabelRequired);
        }

        let mut train = train.clone();
        let imputer = ImputationPlan::fit(&train)?;
        imputer.apply(&mut train);

        let transform = FeatureTransform::fit(&train)?;
        let matrix = transform.transform(&train)?;
        let y = label_vector(&train).ok_or(PipelineError::LabelRequired)?;

        let mut model = GradientBoosting::new()
            .with_rounds(options.rounds)
            .with_learning_rate(options.learning_rate)
            .with_max_depth(options.max_depth)
            .with_min_leaf(options.min_leaf);
        model.fit(matrix.x.view(), y.view())?;

        Ok(FittedPipeline {
            feature_names: matrix.names,
            imputer,
            transform,
            model,
        })
    }

    /// Imputes and transforms any record set with the fitted statistics.
    /// Returns the feature matrix and, when the input carries labels, the
    /// aligned label vector.
    pub fn apply(
        &self,
        table: &EnrichedTable,
    ) -> Result<(FeatureMatrix, Option<Array1<f64>>), PipelineError> {
        let mut table = table.clone();
        self.imputer.apply(&mut table);
        let matrix = self.transform.transform(&table)?;
        debug_assert_eq!(matrix.names, self.feature_names);
        let y = label_vector(&table);
        Ok((matrix, y))
    }

    /// Claim probability per row of any record set.
    pub fn predict(&self, table: &EnrichedTable) -> Result<Array1<f64>, PipelineError> {
        let (matrix, _) = self.apply(table)?;
        Ok(self.model.predict_proba(matrix.x.view()))
    }

    /// Saves the artifact as pretty TOML.
    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        log::info!("Saved pipeline artifact to '{path}'");
        Ok(())
    }

    /// Loads an artifact from a TOML file.
    pub fn load(path: &str) -> Result<FittedPipeline, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let pipeline = toml::from_str(&toml_string)?;
        Ok(pipeline)
    }
}

/// User-level k-fold cross-validated AUC over the training cohort.
///
/// Every fold re-fits the entire pipeline (imputer, transform statistics,
/// neighbour index, classifier) on the fold-train users only, mirroring
/// the leakage rules of the outer train/holdout split.
pub fn cross_validated_auc(
    table: &EnrichedTable,
    folds: usize,
    seed: u64,
    options: &TrainOptions,
) -> Result<Vec<f64>, PipelineError> {
    let assignments = stratified_user_folds(table, folds, seed)?;
    let mut scores = Vec::with_capacity(folds);
    for (fold, (validation_rows, train_rows)) in assignments.iter().enumerate() {
        let fold_train = table.take(train_rows);
        let fold_validation = table.take(validation_rows);

        let pipeline = FittedPipeline::fit(&fold_train, options)?;
        let (matrix, labels) = pipeline.apply(&fold_validation)?;
        let y = labels.ok_or(PipelineError::LabelRequired)?;
        let p = pipeline.model.predict_proba(matrix.x.view());
        let fold_auc = auc(&y, &p);
        log::info!("Fold {}/{folds}: validation AUC {fold_auc:.4}", fold + 1);
        scores.push(fold_auc);
    }
    Ok(scores)
}
