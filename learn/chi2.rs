//! # Chi-Squared Independence Diagnostics
//!
//! Univariate significance tests between one categorical feature and the
//! binary claim label. Advisory only: the results are printed for the
//! analyst during training and never enforced at runtime.
//!
//! The p-value comes from the survival function of the chi-squared
//! distribution, evaluated through the regularized incomplete gamma
//! function (series expansion below `a + 1`, Lentz continued fraction
//! above) with a Lanczos log-gamma.

use ahash::AHashMap;

/// Result of one chi-squared independence test.
#[derive(Debug, Clone)]
pub struct Chi2Result {
    pub statistic: f64,
    pub degrees_of_freedom: usize,
    pub p_value: f64,
}

/// Chi-squared test of independence between a categorical column and a 0/1
/// label vector.
///
/// Returns `None` for degenerate tables: fewer than two categories, or a
/// label column with a single class (every expected cell would be zero).
pub fn chi2_independence(categories: &[&str], labels: &[f64]) -> Option<Chi2Result> {
    assert_eq!(categories.len(), labels.len());
    let n = categories.len() as f64;

    let mut observed: AHashMap<&str, (f64, f64)> = AHashMap::new();
    for (&category, &label) in categories.iter().zip(labels) {
        let cell = observed.entry(category).or_insert((0.0, 0.0));
        if label > 0.5 {
            cell.1 += 1.0;
        } else {
            cell.0 += 1.0;
        }
    }
    if observed.len() < 2 {
        return None;
    }

    let total_positive: f64 = observed.values().map(|c| c.1).sum();
    let total_negative = n - total_positive;
    if total_positive == 0.0 || total_negative == 0.0 {
        return None;
    }

    let mut statistic = 0.0;
    for &(negative, positive) in observed.values() {
        let row_total = negative + positive;
        let expected_negative = row_total * total_negative / n;
        let expected_positive = row_total * total_positive / n;
        statistic += (negative - expected_negative).powi(2) / expected_negative;
        statistic += (positive - expected_positive).powi(2) / expected_positive;
    }

    let degrees_of_freedom = observed.len() - 1;
    Some(Chi2Result {
        statistic,
        degrees_of_freedom,
        p_value: chi2_survival(statistic, degrees_of_freedom),
    })
}

/// P(X > x) for a chi-squared distribution with `df` degrees of freedom.
fn chi2_survival(x: f64, df: usize) -> f64 {
    if x <= 0.0 {
        return 1.0;
    }
    regularized_gamma_upper(df as f64 / 2.0, x / 2.0)
}

/// Lanczos approximation of ln Γ(x), g = 7, n = 9.
fn ln_gamma(x: f64) -> f64 {
    const COEFFICIENTS: [f64; 9] = [
        0.999_999_999_999_809_93,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_13,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    const G: f64 = 7.0;

    if x < 0.5 {
        // Reflection formula keeps the approximation accurate near zero.
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x);
    }

    let x = x - 1.0;
    let mut accumulator = COEFFICIENTS[0];
    for (i, &coefficient) in COEFFICIENTS.iter().enumerate().skip(1) {
        accumulator += coefficient / (x + i as f64);
    }
    let t = x + G + 0.5;
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + accumulator.ln()
}

/// Regularized upper incomplete gamma Q(a, x) = Γ(a, x) / Γ(a).
fn regularized_gamma_upper(a: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 1.0;
    }
    if x < a + 1.0 {
        // Series for the lower function converges fast here.
        1.0 - lower_series(a, x)
    } else {
        upper_continued_fraction(a, x)
    }
}

/// P(a, x) by series expansion: x^a e^-x Σ x^n / Γ(a + n + 1).
fn lower_series(a: f64, x: f64) -> f64 {
    let mut term = 1.0 / a;
    let mut sum = term;
    let mut denominator = a;
    for _ in 0..200 {
        denominator += 1.0;
        term *= x / denominator;
        sum += term;
        if term.abs() < sum.abs() * 1e-14 {
            break;
        }
    }
    (sum * (-x + a * x.ln() - ln_gamma(a)).exp()).clamp(0.0, 1.0)
}

/// Q(a, x) by modified Lentz continued fraction.
fn upper_continued_fraction(a: f64, x: f64) -> f64 {
    const TINY: f64 = 1e-300;
    let mut b = x + 1.0 - a;
    let mut c = 1.0 / TINY;
    let mut d = 1.0 / b;
    let mut h = d;
    for i in 1..200 {
        let an = -(i as f64) * (i as f64 - a);
        b += 2.0;
        d = an * d + b;
        if d.abs() < TINY {
            d = TINY;
        }
        c = b + an / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < 1e-14 {
            break;
        }
    }
    (h * (-x + a * x.ln() - ln_gamma(a)).exp()).clamp(0.0, 1.0)
}
