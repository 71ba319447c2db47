//! Feature normalization and the matching weight-vector conversions.
//!
//! Normalization is fitted once over the full collection and applied in
//! place, so the solver always sees comparable feature scales. Because the
//! transform is affine per feature, a direction learned in normalized space
//! can be mapped back to raw feature units exactly, and vice versa.

use num_traits::Float;

use crate::arena::FeatureArena;
use crate::scores::ScoredPsm;
use crate::solver::WeightVector;

/// Which affine transform to fit per feature.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NormalizationKind {
    /// Subtract the mean, divide by the standard deviation.
    #[default]
    StandardDeviation,
    /// Subtract the minimum, divide by the range.
    UnitRange,
    /// Leave features untouched.
    Off,
}

fn guard_divisor<F: Float>(d: F) -> F {
    if d <= F::zero() {
        F::one()
    } else {
        d
    }
}

/// A fitted per-feature affine transform, `(x - sub) / div`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NormalizationProfile {
    sub: Vec<f64>,
    div: Vec<f64>,
}

impl NormalizationProfile {
    /// The identity transform over `num_features` dimensions.
    pub fn identity(num_features: usize) -> Self {
        Self {
            sub: vec![0.0; num_features],
            div: vec![1.0; num_features],
        }
    }

    /// Fit a transform of the requested kind over every listed row.
    ///
    /// Degenerate features (constant columns) get a unit divisor so they
    /// pass through unscaled instead of producing NaNs.
    pub fn fit(kind: NormalizationKind, arena: &FeatureArena, entries: &[ScoredPsm]) -> Self {
        let n = arena.num_features();
        if entries.is_empty() || matches!(kind, NormalizationKind::Off) {
            return Self::identity(n);
        }
        match kind {
            NormalizationKind::StandardDeviation => {
                let count = entries.len() as f64;
                let mut avg = vec![0.0; n];
                for entry in entries {
                    for (a, x) in avg.iter_mut().zip(arena.row(entry.row)) {
                        *a += x;
                    }
                }
                for a in avg.iter_mut() {
                    *a /= count;
                }
                let mut stdev = vec![0.0; n];
                for entry in entries {
                    for ((s, a), x) in stdev.iter_mut().zip(&avg).zip(arena.row(entry.row)) {
                        let d = x - a;
                        *s += d * d;
                    }
                }
                for s in stdev.iter_mut() {
                    *s = guard_divisor((*s / count).sqrt());
                }
                Self {
                    sub: avg,
                    div: stdev,
                }
            }
            NormalizationKind::UnitRange => {
                let mut min = vec![f64::INFINITY; n];
                let mut max = vec![f64::NEG_INFINITY; n];
                for entry in entries {
                    for ((lo, hi), x) in min.iter_mut().zip(max.iter_mut()).zip(arena.row(entry.row))
                    {
                        *lo = lo.min(*x);
                        *hi = hi.max(*x);
                    }
                }
                let div = min
                    .iter()
                    .zip(&max)
                    .map(|(lo, hi)| guard_divisor(hi - lo))
                    .collect();
                Self { sub: min, div }
            }
            NormalizationKind::Off => unreachable!(),
        }
    }

    pub fn num_features(&self) -> usize {
        self.sub.len()
    }

    /// Rewrite every listed row in place as `(x - sub) / div`.
    pub fn apply(&self, arena: &mut FeatureArena, entries: &[ScoredPsm]) {
        for entry in entries {
            let row = arena.row_mut(entry.row);
            for ((x, s), d) in row.iter_mut().zip(&self.sub).zip(&self.div) {
                *x = (*x - s) / d;
            }
        }
    }

    /// Map a direction expressed in raw feature units into normalized space,
    /// so that scores agree: `w_norm · x_norm + b_norm = w_raw · x + b_raw`.
    pub fn normalized_weights(&self, raw: &WeightVector) -> WeightVector {
        let n = self.sub.len();
        let values = raw.values();
        let mut out = Vec::with_capacity(n + 1);
        for (v, d) in values[..n].iter().zip(&self.div) {
            out.push(v * d);
        }
        let bias = values[n]
            + self
                .sub
                .iter()
                .zip(&values[..n])
                .map(|(s, v)| s * v)
                .sum::<f64>();
        out.push(bias);
        WeightVector::from_values(out)
    }

    /// The inverse of [`normalized_weights`](Self::normalized_weights).
    pub fn raw_weights(&self, normalized: &WeightVector) -> WeightVector {
        let n = self.sub.len();
        let values = normalized.values();
        let mut out = Vec::with_capacity(n + 1);
        for (v, d) in values[..n].iter().zip(&self.div) {
            out.push(v / d);
        }
        let bias = values[n]
            - self
                .sub
                .iter()
                .zip(&self.div)
                .zip(&values[..n])
                .map(|((s, d), v)| s * v / d)
                .sum::<f64>();
        out.push(bias);
        WeightVector::from_values(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::psm::{LabelClass, Psm, SpectrumId};

    fn build(rows: &[&[f64]]) -> (FeatureArena, Vec<ScoredPsm>) {
        let mut arena = FeatureArena::new(rows[0].len());
        let entries = rows
            .iter()
            .enumerate()
            .map(|(i, values)| {
                let psm = Psm::new(
                    format!("psm{i}"),
                    SpectrumId::new(0, i as u32),
                    "PEPTIDE".into(),
                )
                .shared();
                ScoredPsm::new(psm, arena.acquire_from(values), LabelClass::Target)
            })
            .collect();
        (arena, entries)
    }

    #[test]
    fn test_stdev_normalization() {
        let (mut arena, entries) = build(&[&[1.0, 5.0], &[3.0, 5.0], &[5.0, 5.0]]);
        let profile = NormalizationProfile::fit(
            NormalizationKind::StandardDeviation,
            &arena,
            &entries,
        );
        profile.apply(&mut arena, &entries);
        // column 0: mean 3, population stdev sqrt(8/3)
        let s = (8.0f64 / 3.0).sqrt();
        assert!((arena.row(entries[0].row)[0] - (-2.0 / s)).abs() < 1e-12);
        assert!((arena.row(entries[2].row)[0] - (2.0 / s)).abs() < 1e-12);
        // constant column passes through shifted only
        assert_eq!(arena.row(entries[0].row)[1], 0.0);
        assert_eq!(arena.row(entries[2].row)[1], 0.0);
    }

    #[test]
    fn test_unit_range_normalization() {
        let (mut arena, entries) = build(&[&[2.0, -1.0], &[4.0, 0.0], &[6.0, 1.0]]);
        let profile = NormalizationProfile::fit(NormalizationKind::UnitRange, &arena, &entries);
        profile.apply(&mut arena, &entries);
        assert_eq!(arena.row(entries[0].row), &[0.0, 0.0]);
        assert_eq!(arena.row(entries[1].row), &[0.5, 0.5]);
        assert_eq!(arena.row(entries[2].row), &[1.0, 1.0]);
    }

    #[test]
    fn test_weight_round_trip_preserves_scores() {
        let (mut arena, entries) = build(&[&[1.0, 2.0], &[3.0, 7.0], &[5.0, 4.0], &[2.0, 9.0]]);
        let raw_rows: Vec<Vec<f64>> = entries
            .iter()
            .map(|e| arena.row(e.row).to_vec())
            .collect();
        let profile = NormalizationProfile::fit(
            NormalizationKind::StandardDeviation,
            &arena,
            &entries,
        );
        profile.apply(&mut arena, &entries);

        let normalized = WeightVector::from_values(vec![0.7, -1.3, 0.25]);
        let raw = profile.raw_weights(&normalized);
        for (entry, raw_row) in entries.iter().zip(&raw_rows) {
            let score_norm = normalized.score(arena.row(entry.row));
            let score_raw = raw.score(raw_row);
            assert!(
                (score_norm - score_raw).abs() < 1e-10,
                "{score_norm} != {score_raw}"
            );
        }
        let back = profile.normalized_weights(&raw);
        for (a, b) in back.values().iter().zip(normalized.values()) {
            assert!((a - b).abs() < 1e-10);
        }
    }
}
