//! Numerical building blocks for baseline/candidate comparisons
//!
//! Pure functions only. Distribution functions are approximations accurate
//! well beyond what a significance decision needs (|error| < 1e-7).

use crate::model::ConfidenceInterval;

/// Mean and unbiased variance of a sample set
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleStats {
    pub n: usize,
    pub mean: f64,
    /// Sample variance (n - 1 denominator), 0.0 when n < 2
    pub variance: f64,
}

impl SampleStats {
    pub fn from_samples(samples: &[f64]) -> Self {
        let n = samples.len();
        if n == 0 {
            return SampleStats {
                n,
                mean: 0.0,
                variance: 0.0,
            };
        }
        let mean = samples.iter().sum::<f64>() / n as f64;
        let variance = if n < 2 {
            0.0
        } else {
            samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64
        };
        SampleStats { n, mean, variance }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }
}

/// Outcome of Welch's unequal-variance t-test
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WelchTest {
    /// `candidate - baseline`
    pub mean_difference: f64,
    pub std_error: f64,
    pub t_statistic: f64,
    pub degrees_of_freedom: f64,
    /// Two-tailed p-value
    pub p_value: f64,
}

/// Two-tailed Welch's t-test of candidate against baseline
///
/// Returns `None` when either side has fewer than two samples, since the
/// variance is undefined.
pub fn welch_t_test(baseline: &SampleStats, candidate: &SampleStats) -> Option<WelchTest> {
    if baseline.n < 2 || candidate.n < 2 {
        return None;
    }

    let vb = baseline.variance / baseline.n as f64;
    let vc = candidate.variance / candidate.n as f64;
    let mean_difference = candidate.mean - baseline.mean;
    let std_error = (vb + vc).sqrt();

    if std_error == 0.0 || !std_error.is_finite() {
        // Both sides constant: identical means are indistinguishable,
        // different means are as significant as it gets.
        let p_value = if mean_difference == 0.0 { 1.0 } else { 0.0 };
        return Some(WelchTest {
            mean_difference,
            std_error: 0.0,
            t_statistic: 0.0,
            degrees_of_freedom: (baseline.n + candidate.n - 2) as f64,
            p_value,
        });
    }

    let t_statistic = mean_difference / std_error;
    let denominator = vb.powi(2) / (baseline.n - 1) as f64 + vc.powi(2) / (candidate.n - 1) as f64;
    let degrees_of_freedom = if denominator > 0.0 {
        (vb + vc).powi(2) / denominator
    } else {
        (baseline.n + candidate.n - 2) as f64
    };

    Some(WelchTest {
        mean_difference,
        std_error,
        t_statistic,
        degrees_of_freedom,
        p_value: student_t_two_tailed_p(t_statistic, degrees_of_freedom),
    })
}

/// Cohen's d using the pooled standard deviation, candidate minus baseline
///
/// Returns 0.0 when the pooled deviation is zero or a side has < 2 samples.
pub fn cohens_d(baseline: &SampleStats, candidate: &SampleStats) -> f64 {
    if baseline.n < 2 || candidate.n < 2 {
        return 0.0;
    }
    let pooled = (((baseline.n - 1) as f64 * baseline.variance
        + (candidate.n - 1) as f64 * candidate.variance)
        / (baseline.n + candidate.n - 2) as f64)
        .sqrt();
    if pooled == 0.0 || !pooled.is_finite() {
        return 0.0;
    }
    (candidate.mean - baseline.mean) / pooled
}

/// Two-sided interval for the mean difference at `level` (e.g. 0.95)
pub fn mean_difference_interval(test: &WelchTest, level: f64) -> ConfidenceInterval {
    let t_critical = student_t_critical(level, test.degrees_of_freedom);
    let margin = t_critical * test.std_error;
    ConfidenceInterval {
        lower: test.mean_difference - margin,
        upper: test.mean_difference + margin,
        level,
    }
}

/// Relative change of candidate against baseline, in percent
pub fn percent_change(baseline_mean: f64, candidate_mean: f64) -> f64 {
    if baseline_mean == 0.0 {
        return if candidate_mean == 0.0 {
            0.0
        } else {
            100.0 * candidate_mean.signum()
        };
    }
    (candidate_mean - baseline_mean) / baseline_mean.abs() * 100.0
}

/// Minimum samples per variant to detect `min_effect` (absolute units)
///
/// Standard two-sample normal approximation:
/// n = 2 * (z_{1-alpha/2} + z_{power})^2 * variance / min_effect^2
pub fn required_sample_size(variance: f64, min_effect: f64, alpha: f64, power: f64) -> Option<u64> {
    if min_effect == 0.0 || !min_effect.is_finite() || !variance.is_finite() {
        return None;
    }
    let z_alpha = normal_quantile(1.0 - alpha / 2.0);
    let z_beta = normal_quantile(power);
    let n = 2.0 * (z_alpha + z_beta).powi(2) * variance / min_effect.powi(2);
    Some(n.ceil().max(2.0) as u64)
}

/// Bonferroni-adjusted p-values: each raw value times the family size, capped at 1
pub fn bonferroni_adjust(p_values: &[f64]) -> Vec<f64> {
    let family = p_values.len().max(1) as f64;
    p_values.iter().map(|p| (p * family).min(1.0)).collect()
}

/// Two-tailed p-value of Student's t distribution
///
/// P(|T| >= |t|) = I_{df/(df+t^2)}(df/2, 1/2)
pub fn student_t_two_tailed_p(t: f64, df: f64) -> f64 {
    if !t.is_finite() {
        return 0.0;
    }
    let x = df / (df + t * t);
    regularized_incomplete_beta(x, df / 2.0, 0.5).clamp(0.0, 1.0)
}

/// Critical value t such that P(|T| <= t) = level
pub fn student_t_critical(level: f64, df: f64) -> f64 {
    let target = 1.0 - level;
    let mut hi = 2.0;
    while student_t_two_tailed_p(hi, df) > target && hi < 1e6 {
        hi *= 2.0;
    }
    let mut lo = 0.0;
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if student_t_two_tailed_p(mid, df) > target {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo < 1e-10 {
            break;
        }
    }
    0.5 * (lo + hi)
}

/// Normal CDF approximation using Abramowitz and Stegun formula 7.1.26
pub fn normal_cdf(x: f64) -> f64 {
    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs() / std::f64::consts::SQRT_2;

    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();

    0.5 * (1.0 + sign * y)
}

/// Inverse standard normal CDF (Acklam's rational approximation)
pub fn normal_quantile(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549732539343734e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];
    const P_LOW: f64 = 0.02425;

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}

/// ln Γ(x) via the Lanczos approximation (g = 7)
fn ln_gamma(x: f64) -> f64 {
    const G: f64 = 7.0;
    const COEFFICIENTS: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];

    if x < 0.5 {
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x);
    }

    let x = x - 1.0;
    let mut a = COEFFICIENTS[0];
    let t = x + G + 0.5;
    for (i, c) in COEFFICIENTS.iter().enumerate().skip(1) {
        a += c / (x + i as f64);
    }
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + a.ln()
}

/// Regularized incomplete beta function I_x(a, b)
fn regularized_incomplete_beta(x: f64, a: f64, b: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }

    let ln_front = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let front = ln_front.exp();

    // The continued fraction converges quickly only on this side of the mean
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(x, a, b) / a
    } else {
        1.0 - front * beta_continued_fraction(1.0 - x, b, a) / b
    }
}

/// Continued fraction for I_x(a, b), modified Lentz's method
fn beta_continued_fraction(x: f64, a: f64, b: f64) -> f64 {
    const MAX_ITERATIONS: usize = 500;
    const EPSILON: f64 = 3e-14;
    const FLOOR: f64 = 1e-300;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;

    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < FLOOR {
        d = FLOOR;
    }
    d = 1.0 / d;
    let mut h = d;

    for m in 1..=MAX_ITERATIONS {
        let m = m as f64;
        let m2 = 2.0 * m;

        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < FLOOR {
            d = FLOOR;
        }
        c = 1.0 + aa / c;
        if c.abs() < FLOOR {
            c = FLOOR;
        }
        d = 1.0 / d;
        h *= d * c;

        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < FLOOR {
            d = FLOOR;
        }
        c = 1.0 + aa / c;
        if c.abs() < FLOOR {
            c = FLOOR;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;

        if (delta - 1.0).abs() < EPSILON {
            break;
        }
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, tolerance: f64) -> bool {
        (a - b).abs() < tolerance
    }

    #[test]
    fn test_sample_stats() {
        let stats = SampleStats::from_samples(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_eq!(stats.n, 8);
        assert!(close(stats.mean, 5.0, 1e-12));
        assert!(close(stats.variance, 32.0 / 7.0, 1e-12));
    }

    #[test]
    fn test_sample_stats_degenerate() {
        let empty = SampleStats::from_samples(&[]);
        assert_eq!(empty.n, 0);
        assert_eq!(empty.mean, 0.0);

        let single = SampleStats::from_samples(&[3.0]);
        assert_eq!(single.mean, 3.0);
        assert_eq!(single.variance, 0.0);
    }

    #[test]
    fn test_normal_cdf_reference_points() {
        assert!(close(normal_cdf(0.0), 0.5, 1e-7));
        assert!(close(normal_cdf(1.96), 0.975, 1e-3));
        assert!(close(normal_cdf(-1.96) + normal_cdf(1.96), 1.0, 1e-7));
    }

    #[test]
    fn test_normal_quantile_inverts_cdf() {
        assert!(close(normal_quantile(0.975), 1.959964, 1e-5));
        assert!(close(normal_quantile(0.8), 0.841621, 1e-5));
        assert!(close(normal_quantile(0.5), 0.0, 1e-9));
        assert!(close(normal_quantile(0.001), -3.090232, 1e-5));
    }

    #[test]
    fn test_t_distribution_matches_tables() {
        // df = 10: t = 2.228 is the 95% two-tailed critical value
        assert!(close(student_t_two_tailed_p(2.228, 10.0), 0.05, 1e-3));
        // df = 1 is Cauchy: P(|T| > 1) = 0.5
        assert!(close(student_t_two_tailed_p(1.0, 1.0), 0.5, 1e-9));
        assert!(close(student_t_two_tailed_p(0.0, 30.0), 1.0, 1e-12));
    }

    #[test]
    fn test_t_critical_values() {
        assert!(close(student_t_critical(0.95, 10.0), 2.228, 1e-3));
        assert!(close(student_t_critical(0.95, 1e6), 1.96, 1e-3));
        assert!(close(student_t_critical(0.99, 5.0), 4.032, 1e-3));
    }

    #[test]
    fn test_welch_requires_two_samples_each() {
        let one = SampleStats::from_samples(&[1.0]);
        let many = SampleStats::from_samples(&[1.0, 2.0, 3.0]);
        assert!(welch_t_test(&one, &many).is_none());
        assert!(welch_t_test(&many, &one).is_none());
    }

    #[test]
    fn test_welch_known_example() {
        // Classic unequal-variance example; reference values from R's t.test
        let a = SampleStats::from_samples(&[
            27.5, 21.0, 19.0, 23.6, 17.0, 17.9, 16.9, 20.1, 21.9, 22.6, 23.1, 19.6, 19.0, 21.7,
            21.4,
        ]);
        let b = SampleStats::from_samples(&[
            27.1, 22.0, 20.8, 23.4, 23.4, 23.5, 25.8, 22.0, 24.8, 20.2, 21.9, 22.1, 22.9, 20.5,
            24.4,
        ]);
        let test = welch_t_test(&a, &b).unwrap();
        assert!(close(test.t_statistic, 2.46, 0.01));
        assert!(close(test.degrees_of_freedom, 24.99, 0.05));
        assert!(close(test.p_value, 0.021, 0.001));
    }

    #[test]
    fn test_welch_constant_samples() {
        let a = SampleStats::from_samples(&[5.0, 5.0, 5.0]);
        let b = SampleStats::from_samples(&[5.0, 5.0, 5.0]);
        assert_eq!(welch_t_test(&a, &b).unwrap().p_value, 1.0);

        let c = SampleStats::from_samples(&[6.0, 6.0, 6.0]);
        assert_eq!(welch_t_test(&a, &c).unwrap().p_value, 0.0);
    }

    #[test]
    fn test_cohens_d() {
        let a = SampleStats::from_samples(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let b = SampleStats::from_samples(&[2.0, 3.0, 4.0, 5.0, 6.0]);
        // Difference of 1 over a pooled sd of sqrt(2.5)
        assert!(close(cohens_d(&a, &b), 1.0 / 2.5f64.sqrt(), 1e-12));
        assert!(close(cohens_d(&b, &a), -1.0 / 2.5f64.sqrt(), 1e-12));

        let flat = SampleStats::from_samples(&[1.0, 1.0]);
        assert_eq!(cohens_d(&flat, &flat), 0.0);
    }

    #[test]
    fn test_interval_contains_difference() {
        let a = SampleStats::from_samples(&[10.0, 11.0, 9.0, 10.5, 9.5, 10.0]);
        let b = SampleStats::from_samples(&[12.0, 13.0, 11.0, 12.5, 11.5, 12.0]);
        let test = welch_t_test(&a, &b).unwrap();
        let ci = mean_difference_interval(&test, 0.95);
        assert!(ci.lower < 2.0 && 2.0 < ci.upper);
        assert!(ci.lower > 0.0);
        assert_eq!(ci.level, 0.95);

        let wider = mean_difference_interval(&test, 0.99);
        assert!(wider.lower < ci.lower && wider.upper > ci.upper);
    }

    #[test]
    fn test_percent_change() {
        assert!(close(percent_change(100.5, 90.45), -10.0, 1e-9));
        assert!(close(percent_change(0.05, 0.06), 20.0, 1e-9));
        assert_eq!(percent_change(0.0, 0.0), 0.0);
        assert_eq!(percent_change(0.0, 3.0), 100.0);
    }

    #[test]
    fn test_required_sample_size() {
        // sd = 10, detect a difference of 5 at alpha 0.05, power 0.8
        let n = required_sample_size(100.0, 5.0, 0.05, 0.8).unwrap();
        assert_eq!(n, 63);
        assert!(required_sample_size(100.0, 0.0, 0.05, 0.8).is_none());

        // Smaller effects need more samples
        let bigger = required_sample_size(100.0, 2.5, 0.05, 0.8).unwrap();
        assert!(bigger > n * 3);
    }

    #[test]
    fn test_bonferroni_adjust() {
        let adjusted = bonferroni_adjust(&[0.01, 0.02, 0.5]);
        assert!(close(adjusted[0], 0.03, 1e-12));
        assert!(close(adjusted[1], 0.06, 1e-12));
        assert_eq!(adjusted[2], 1.0);
        assert!(bonferroni_adjust(&[]).is_empty());
    }
}
