//! Target-decoy calibration: p-values, q-values, and the π₀ estimate.
//!
//! All functions here take a score-sorted view of the collection, best
//! score first, and express everything in terms of target/decoy counts.
//! The decoy scores act as draws from the null distribution, so the
//! empirical p-value of a target is the fraction of decoys scoring at or
//! above it, and the FDR at a cutoff is the decoy count scaled by π₀ and
//! the target/decoy ratio.

use crate::psm::LabelClass;
use crate::random::Lcg;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CalibrationError {
    #[error("cannot calibrate an empty collection")]
    EmptyCollection,
    #[error("the collection contains no decoy PSMs")]
    NoDecoys,
    #[error("the collection contains no target PSMs")]
    NoTargets,
    #[error(
        "no valid lambda for pi0 estimation; target and decoy scores separate too cleanly"
    )]
    NoValidLambda,
}

/// Empirical p-values for the targets of a score-sorted label sequence.
///
/// For each target, the fraction of decoys with an equal or better score.
/// The output has one entry per *target*, in the same order.
pub fn p_values(labels: &[LabelClass]) -> Result<Vec<f64>, CalibrationError> {
    if labels.is_empty() {
        return Err(CalibrationError::EmptyCollection);
    }
    let total_decoys = labels.iter().filter(|l| l.is_decoy()).count();
    if total_decoys == 0 {
        return Err(CalibrationError::NoDecoys);
    }
    if total_decoys == labels.len() {
        return Err(CalibrationError::NoTargets);
    }
    let mut decoys_above = 0usize;
    let mut out = Vec::with_capacity(labels.len() - total_decoys);
    for label in labels {
        match label {
            LabelClass::Decoy => decoys_above += 1,
            LabelClass::Target => out.push(decoys_above as f64 / total_decoys as f64),
        }
    }
    Ok(out)
}

/// Q-values for every entry of a score-sorted label sequence.
///
/// The raw FDR at each position is `(decoys / targets) · π₀ · (T / D)`
/// where `T` and `D` are the total target and decoy counts; with
/// `count_decoys_plus_one` the numerator becomes `decoys + 1`, the
/// conservative form used while selecting among candidate directions. The
/// raw values are then converted to q-values by a best-to-worst running
/// minimum taken from the worst score backwards, so a worse-scoring entry
/// never gets a better q-value.
pub fn q_values(
    labels: &[LabelClass],
    pi0: f64,
    count_decoys_plus_one: bool,
) -> Result<Vec<f64>, CalibrationError> {
    if labels.is_empty() {
        return Err(CalibrationError::EmptyCollection);
    }
    let total_targets = labels.iter().filter(|l| l.is_target()).count();
    let total_decoys = labels.len() - total_targets;
    if total_targets == 0 {
        return Err(CalibrationError::NoTargets);
    }
    let factor = if total_decoys == 0 {
        // degenerate but allowed with the plus-one numerator
        pi0
    } else {
        pi0 * total_targets as f64 / total_decoys as f64
    };

    let mut targets = 0usize;
    let mut decoys = if count_decoys_plus_one { 1usize } else { 0 };
    let mut raw = Vec::with_capacity(labels.len());
    for label in labels {
        match label {
            LabelClass::Target => targets += 1,
            LabelClass::Decoy => decoys += 1,
        }
        let fdr = if targets == 0 {
            1.0
        } else {
            (decoys as f64 / targets as f64) * factor
        };
        raw.push(fdr.min(1.0));
    }
    let mut running_min = f64::INFINITY;
    for q in raw.iter_mut().rev() {
        running_min = running_min.min(*q);
        *q = running_min;
    }
    Ok(raw)
}

/// The number of targets at or below `threshold` in a q-value sequence
/// aligned with a label sequence.
pub fn count_accepted(labels: &[LabelClass], q_values: &[f64], threshold: f64) -> usize {
    labels
        .iter()
        .zip(q_values)
        .filter(|(label, q)| label.is_target() && **q <= threshold)
        .count()
}

const NUM_LAMBDA: usize = 21;
const MAX_LAMBDA: f64 = 0.9;
/// Bootstrap resamples drawn while picking the λ for the π₀ estimate.
pub const PI0_BOOTSTRAPS: usize = 100;

fn pi0_at_lambda(sorted_pvals: &[f64], lambda: f64) -> f64 {
    let n = sorted_pvals.len();
    let below = sorted_pvals.partition_point(|p| *p < lambda);
    let at_or_above = (n - below) as f64;
    at_or_above / n as f64 / (1.0 - lambda)
}

/// Estimate π₀, the fraction of incorrect targets, from target p-values.
///
/// Evaluates `π₀(λ) = #{p ≥ λ} / (n · (1 − λ))` over the grid
/// `λ = ((i + 1) / 20) · 0.9` for `i in 0..=20`, then picks the λ whose
/// bootstrap mean-squared error against the most optimistic (smallest) raw
/// estimate is lowest. Fails with [`CalibrationError::NoValidLambda`] when
/// every grid point leaves no p-values at or above λ, which happens when
/// scores separate targets from the decoy distribution almost perfectly.
pub fn estimate_pi0(p_values: &[f64], rng: &mut Lcg) -> Result<f64, CalibrationError> {
    if p_values.is_empty() {
        return Err(CalibrationError::EmptyCollection);
    }
    let mut sorted = p_values.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);
    let n = sorted.len();

    let mut lambdas = Vec::with_capacity(NUM_LAMBDA);
    let mut estimates = Vec::with_capacity(NUM_LAMBDA);
    for ix in 0..NUM_LAMBDA {
        let lambda = ((ix + 1) as f64 / (NUM_LAMBDA - 1) as f64) * MAX_LAMBDA;
        let pi0 = pi0_at_lambda(&sorted, lambda);
        if pi0 > 0.0 {
            lambdas.push(lambda);
            estimates.push(pi0);
        }
    }
    if estimates.is_empty() {
        return Err(CalibrationError::NoValidLambda);
    }
    let min_pi0 = estimates.iter().copied().fold(f64::INFINITY, f64::min);

    let mut mse = vec![0.0; lambdas.len()];
    let mut resample = vec![0.0; n];
    for _ in 0..PI0_BOOTSTRAPS {
        for slot in resample.iter_mut() {
            *slot = sorted[rng.next_in(n)];
        }
        resample.sort_unstable_by(f64::total_cmp);
        for (err, lambda) in mse.iter_mut().zip(&lambdas) {
            let boot = pi0_at_lambda(&resample, *lambda);
            *err += (boot - min_pi0) * (boot - min_pi0);
        }
    }
    let best = mse
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .map(|(ix, _)| ix)
        .unwrap();
    Ok(estimates[best].clamp(0.0, 1.0))
}

#[cfg(test)]
mod test {
    use super::*;
    use LabelClass::{Decoy as D, Target as T};

    #[test]
    fn test_p_values_count_decoys_above() {
        let labels = [T, D, T, T, D, T];
        let pvals = p_values(&labels).unwrap();
        assert_eq!(pvals, vec![0.0, 0.5, 0.5, 1.0]);
    }

    #[test]
    fn test_p_values_require_both_classes() {
        assert_eq!(p_values(&[]), Err(CalibrationError::EmptyCollection));
        assert_eq!(p_values(&[T, T]), Err(CalibrationError::NoDecoys));
        assert_eq!(p_values(&[D, D]), Err(CalibrationError::NoTargets));
    }

    #[test]
    fn test_q_values_running_min() {
        // T T D T D D: equal totals so the scale factor is pi0 alone
        let labels = [T, T, D, T, D, D];
        let qvals = q_values(&labels, 1.0, false).unwrap();
        assert_eq!(qvals.len(), labels.len());
        for pair in qvals.windows(2) {
            assert!(pair[0] <= pair[1], "q-values must never improve downward");
        }
        // decoy-free head keeps a zero q-value
        assert_eq!(&qvals[..2], &[0.0, 0.0]);
        // position 2 is pulled down to the best suffix value, 1 decoy over
        // 3 targets at position 3
        assert!((qvals[2] - 1.0 / 3.0).abs() < 1e-12);
        assert!((qvals[3] - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(*qvals.last().unwrap(), 1.0);
    }

    #[test]
    fn test_q_values_plus_one_is_conservative() {
        let labels = [T, T, T, D, T, D];
        let plain = q_values(&labels, 1.0, false).unwrap();
        let conservative = q_values(&labels, 1.0, true).unwrap();
        for (a, b) in plain.iter().zip(&conservative) {
            assert!(b >= a);
        }
    }

    #[test]
    fn test_pi0_scales_q_values() {
        let labels = [T, T, D, T, D, D];
        let full = q_values(&labels, 1.0, false).unwrap();
        let half = q_values(&labels, 0.5, false).unwrap();
        for (a, b) in full.iter().zip(&half) {
            if *a < 1.0 {
                assert!((b - a * 0.5).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_count_accepted() {
        let labels = [T, T, D, T];
        let qvals = [0.0, 0.01, 0.02, 0.5];
        assert_eq!(count_accepted(&labels, &qvals, 0.01), 2);
        assert_eq!(count_accepted(&labels, &qvals, 1.0), 3);
    }

    #[test]
    fn test_pi0_near_uniform_is_high() {
        // p-values spread uniformly: essentially all targets are incorrect
        let pvals: Vec<f64> = (0..1000).map(|i| (i as f64 + 0.5) / 1000.0).collect();
        let pi0 = estimate_pi0(&pvals, &mut Lcg::new(12)).unwrap();
        assert!(pi0 > 0.85, "uniform p-values should give pi0 near 1, got {pi0}");
    }

    #[test]
    fn test_pi0_enriched_near_zero_is_low() {
        // 80% of p-values packed near zero, the rest uniform
        let mut pvals: Vec<f64> = (0..800).map(|i| i as f64 / 80000.0).collect();
        pvals.extend((0..200).map(|i| (i as f64 + 0.5) / 200.0));
        let pi0 = estimate_pi0(&pvals, &mut Lcg::new(12)).unwrap();
        assert!(pi0 < 0.5, "enriched p-values should give low pi0, got {pi0}");
    }

    #[test]
    fn test_pi0_perfect_separation_fails() {
        let pvals = vec![0.0; 100];
        assert_eq!(
            estimate_pi0(&pvals, &mut Lcg::new(12)),
            Err(CalibrationError::NoValidLambda)
        );
    }

    #[test]
    fn test_pi0_lambda_grid_edges() {
        // the smallest grid point is 0.9 / 20; p-values sitting exactly on
        // it still count as at-or-above, so the point stays usable
        let boundary = (1.0 / 20.0) * 0.9;
        assert_eq!(estimate_pi0(&vec![boundary; 50], &mut Lcg::new(3)), Ok(1.0));
        // just below it, no grid point sees any p-value
        assert_eq!(
            estimate_pi0(&vec![0.044; 50], &mut Lcg::new(3)),
            Err(CalibrationError::NoValidLambda)
        );
    }

    #[test]
    fn test_pi0_deterministic_for_seed() {
        let pvals: Vec<f64> = (0..500).map(|i| (i as f64).sin().abs()).collect();
        let a = estimate_pi0(&pvals, &mut Lcg::new(7)).unwrap();
        let b = estimate_pi0(&pvals, &mut Lcg::new(7)).unwrap();
        assert_eq!(a, b);
    }
}
