//! # Data Loading and Validation Module
//!
//! This module is the exclusive entry point for user-provided data. It reads
//! the policy CSV and the postal-code geographic reference CSV, validates
//! them against a strict, predefined schema, and transforms them into the
//! typed column vectors the rest of the pipeline operates on.
//!
//! - Strict Schema: Column names are not configurable. The module enforces
//!   `policy_id`, `user_id`, `postal_code`, etc. This simplifies the user
//!   interface and eliminates a class of configuration errors.
//! - User-Centric Errors: Failures are assumed to be user-input errors. The
//!   `DataError` enum is designed to provide clear, actionable feedback.
//! - Documented missingness: only the columns listed in
//!   [`OPTIONAL_NUMERIC_COLUMNS`] and `payment_method` may contain nulls;
//!   a null anywhere else is rejected at load time because no imputation
//!   rule exists for it.

use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Columns that may legitimately contain nulls, resolved later by the
/// imputation plan (or dropped, in the case of `floor_area_sqft`).
pub const OPTIONAL_NUMERIC_COLUMNS: [&str; 4] =
    ["floor_area_sqft", "coast_km", "age", "covers_electronics"];

/// The policy table, one entry per column, all columns row-aligned.
///
/// Optional columns keep their nulls as `None` until the imputation plan
/// fills them; `claim` is absent entirely when a scoring file carries no
/// label column.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    pub policy_id: Vec<String>,
    pub user_id: Vec<String>,
    pub postal_code: Vec<String>,
    pub region: Vec<String>,
    pub product: Vec<String>,
    pub payment_method: Vec<Option<String>>,
    pub floor_area_sqft: Vec<Option<f64>>,
    pub coast_km: Vec<Option<f64>>,
    pub fire_station_rank: Vec<f64>,
    pub prior_policies: Vec<f64>,
    pub age: Vec<Option<f64>>,
    pub has_alarm: Vec<f64>,
    pub covers_electronics: Vec<Option<f64>>,
    pub claim: Option<Vec<f64>>,
}

impl PolicyTable {
    pub fn len(&self) -> usize {
        self.policy_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policy_id.is_empty()
    }
}

/// The geographic reference table, keyed by postal code. Immutable once
/// loaded.
#[derive(Debug, Clone)]
pub struct GeoTable {
    pub postal_code: Vec<String>,
    pub latitude: Vec<f64>,
    pub longitude: Vec<f64>,
    pub city: Vec<String>,
    pub population: Vec<f64>,
    pub density: Vec<f64>,
}

impl GeoTable {
    pub fn len(&self) -> usize {
        self.postal_code.len()
    }
}

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The required column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Missing or null values were found in the column '{0}', which has no imputation rule. Only {1:?} and 'payment_method' may contain missing values."
    )]
    MissingValuesFound(String, &'static [&'static str]),
    #[error(
        "Non-finite values (NaN or Infinity) were found in the required column '{0}'. All numeric data must be finite."
    )]
    NonFiniteValuesFound(String),
    #[error(
        "Input file contains only {found} data rows, but at least {required} are required for a meaningful fit."
    )]
    InsufficientRows { found: usize, required: usize },
    #[error("The column '{column}' must contain only 0 or 1, but row {row} holds {value}.")]
    NotBinary {
        column: String,
        row: usize,
        value: f64,
    },
}

/// Loads and validates the policy table for training. The `claim` label
/// column is required.
pub fn load_training_policies(path: &str) -> Result<PolicyTable, DataError> {
    internal::load_policies(path, true)
}

/// Loads and validates the policy table for scoring. The `claim` column is
/// used when present (holdout-style input) and skipped otherwise.
pub fn load_scoring_policies(path: &str) -> Result<PolicyTable, DataError> {
    internal::load_policies(path, false)
}

/// Loads and validates the postal-code geographic reference.
pub fn load_geo_reference(path: &str) -> Result<GeoTable, DataError> {
    let df = internal::read_csv(path)?;
    internal::require_columns(
        &df,
        &["postal_code", "latitude", "longitude", "city", "population", "density"],
    )?;

    let postal_code = internal::extract_string_column(&df, "postal_code")?;
    let latitude = internal::extract_numeric_column(&df, "latitude")?;
    let longitude = internal::extract_numeric_column(&df, "longitude")?;
    let city = internal::extract_string_column(&df, "city")?;
    let population = internal::extract_numeric_column(&df, "population")?;
    let density = internal::extract_numeric_column(&df, "density")?;

    log::info!(
        "Loaded geographic reference: {} postal codes from '{path}'",
        postal_code.len()
    );

    Ok(GeoTable {
        postal_code,
        latitude,
        longitude,
        city,
        population,
        density,
    })
}

/// Internal module for shared loading logic.
mod internal {
    use super::*;

    const MINIMUM_ROWS: usize = 20;

    pub(super) fn read_csv(path: &str) -> Result<DataFrame, DataError> {
        log::info!("Loading data from '{path}'");
        let df = CsvReader::new(File::open(Path::new(path))?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(CsvParseOptions::default().with_separator(b',')),
            )
            .finish()?;
        Ok(df)
    }

    pub(super) fn require_columns(df: &DataFrame, required: &[&str]) -> Result<(), DataError> {
        let present: HashSet<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        for name in required {
            if !present.contains(*name) {
                return Err(DataError::ColumnNotFound((*name).to_string()));
            }
        }
        Ok(())
    }

    fn cast_numeric(df: &DataFrame, column_name: &str) -> Result<Column, DataError> {
        let series = df.column(column_name)?;
        match series.cast(&DataType::Float64) {
            Ok(casted) => Ok(casted),
            Err(_) => Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            }),
        }
    }

    /// Extracts a numeric column that must be complete and finite.
    pub(super) fn extract_numeric_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<f64>, DataError> {
        let casted = cast_numeric(df, column_name)?;
        if casted.null_count() > 0 {
            return Err(DataError::MissingValuesFound(
                column_name.to_string(),
                &OPTIONAL_NUMERIC_COLUMNS,
            ));
        }
        let chunked = casted.f64()?.rechunk();
        let values: Vec<f64> = chunked.into_no_null_iter().collect();
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(values)
    }

    /// Extracts a numeric column whose nulls are carried through as `None`.
    pub(super) fn extract_optional_numeric_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<Option<f64>>, DataError> {
        let casted = cast_numeric(df, column_name)?;
        let chunked = casted.f64()?.rechunk();
        let values: Vec<Option<f64>> = chunked.into_iter().collect();
        for value in values.iter().flatten() {
            if !value.is_finite() {
                return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
            }
        }
        Ok(values)
    }

    /// Extracts a string column that must be complete. Values are read per
    /// row as `AnyValue`s, so numeric-looking identifier columns (postal
    /// codes, policy ids) come through as their text form.
    pub(super) fn extract_string_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<String>, DataError> {
        let series = df.column(column_name)?;
        let mut values = Vec::with_capacity(df.height());
        for i in 0..df.height() {
            match cell_text(series, i) {
                Some(text) => values.push(text),
                None => {
                    return Err(DataError::MissingValuesFound(
                        column_name.to_string(),
                        &OPTIONAL_NUMERIC_COLUMNS,
                    ));
                }
            }
        }
        Ok(values)
    }

    /// Text form of one cell; `None` for nulls. String cells come through
    /// verbatim, numeric identifier cells through their display form.
    fn cell_text(series: &Column, i: usize) -> Option<String> {
        match series.get(i).unwrap_or(AnyValue::Null) {
            AnyValue::Null => None,
            AnyValue::String(text) => Some(text.to_string()),
            AnyValue::StringOwned(text) => Some(text.to_string()),
            other => Some(other.to_string()),
        }
    }

    /// Extracts a string column whose nulls are carried through as `None`.
    pub(super) fn extract_optional_string_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<Option<String>>, DataError> {
        let series = df.column(column_name)?;
        let mut values = Vec::with_capacity(df.height());
        for i in 0..df.height() {
            values.push(cell_text(series, i));
        }
        Ok(values)
    }

    /// Extracts a complete numeric column and verifies every value is 0 or 1.
    fn extract_binary_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
        let values = extract_numeric_column(df, column_name)?;
        for (row, &value) in values.iter().enumerate() {
            if value != 0.0 && value != 1.0 {
                return Err(DataError::NotBinary {
                    column: column_name.to_string(),
                    row,
                    value,
                });
            }
        }
        Ok(values)
    }

    pub(super) fn load_policies(
        path: &str,
        require_label: bool,
    ) -> Result<PolicyTable, DataError> {
        let df = read_csv(path)?;

        if df.height() < MINIMUM_ROWS {
            return Err(DataError::InsufficientRows {
                found: df.height(),
                required: MINIMUM_ROWS,
            });
        }

        let mut required: Vec<&str> = vec![
            "policy_id",
            "user_id",
            "postal_code",
            "region",
            "product",
            "payment_method",
            "floor_area_sqft",
            "coast_km",
            "fire_station_rank",
            "prior_policies",
            "age",
            "has_alarm",
            "covers_electronics",
        ];
        if require_label {
            required.push("claim");
        }
        require_columns(&df, &required)?;

        let has_label = df.get_column_names().iter().any(|c| c.as_str() == "claim");
        let claim = if has_label {
            Some(extract_binary_column(&df, "claim")?)
        } else {
            None
        };

        let table = PolicyTable {
            policy_id: extract_string_column(&df, "policy_id")?,
            user_id: extract_string_column(&df, "user_id")?,
            postal_code: extract_string_column(&df, "postal_code")?,
            region: extract_string_column(&df, "region")?,
            product: extract_string_column(&df, "product")?,
            payment_method: extract_optional_string_column(&df, "payment_method")?,
            floor_area_sqft: extract_optional_numeric_column(&df, "floor_area_sqft")?,
            coast_km: extract_optional_numeric_column(&df, "coast_km")?,
            fire_station_rank: extract_numeric_column(&df, "fire_station_rank")?,
            prior_policies: extract_numeric_column(&df, "prior_policies")?,
            age: extract_optional_numeric_column(&df, "age")?,
            has_alarm: extract_binary_column(&df, "has_alarm")?,
            covers_electronics: {
                let values = extract_optional_numeric_column(&df, "covers_electronics")?;
                for (row, value) in values.iter().enumerate() {
                    if let Some(v) = value
                        && *v != 0.0
                        && *v != 1.0
                    {
                        return Err(DataError::NotBinary {
                            column: "covers_electronics".to_string(),
                            row,
                            value: *v,
                        });
                    }
                }
                values
            },
            claim,
        };

        log::info!(
            "Loaded policy table: {} rows, label column {}",
            table.len(),
            if table.claim.is_some() { "present" } else { "absent" }
        );
        Ok(table)
    }
}
