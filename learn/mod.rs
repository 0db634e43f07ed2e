//! Learning-algorithm collaborators: the boosted-tree classifier, ranking
//! metrics, and the univariate chi-squared diagnostics.

pub mod chi2;
pub mod gbdt;
pub mod metrics;
