//! Choosing and sanity-checking the direction that bootstraps training.
//!
//! The first iteration of the learner needs some ranking to label positive
//! training examples with. That ranking can come from a weight file, from a
//! default-direction row carried in the input, from a caller-named feature,
//! or from scanning every feature in both orientations for the one that
//! accepts the most targets. After training, the learned directions are
//! checked against the bootstrap: a fold whose learned direction performs
//! worse than where it started is reset.

use tracing::{debug, warn};

use crate::arena::FeatureArena;
use crate::normalize::NormalizationProfile;
use crate::posterior::CalibrationError;
use crate::scores::ScoreSet;
use crate::solver::WeightVector;

/// Where the bootstrap ranking comes from, in caller-priority order.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DirectionSource {
    /// Raw-unit weights read back from a weight file.
    InitialWeights(Vec<f64>),
    /// Raw-unit weights carried in the input as a default-direction row.
    DefaultWeights(Vec<f64>),
    /// A single named feature, optionally reversed.
    Feature { index: usize, negate: bool },
    /// Scan all features in both orientations and keep the best.
    BestSingleFeature,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DirectionError {
    #[error("initial direction carries {given} weights but the collection has {expected} features")]
    WeightCountMismatch { given: usize, expected: usize },
    #[error("feature index {index} out of range for {num_features} features")]
    FeatureOutOfRange { index: usize, num_features: usize },
    #[error("no target PSM accepted at FDR {fdr} under any direction")]
    NoPositives { fdr: f64 },
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}

/// The resolved bootstrap direction plus the state needed to judge the
/// learned directions against it.
#[derive(Debug, Clone)]
pub struct InitialDirection {
    weights: WeightVector,
    /// Set when the bootstrap is a bare feature, for the orientation check.
    feature: Option<(usize, bool)>,
    /// Targets accepted per test fold under the bootstrap, filled in by
    /// [`record_initial_positives`](Self::record_initial_positives).
    initial_positives: Vec<usize>,
    override_check: bool,
}

impl InitialDirection {
    /// Resolve `source` against the collection, converting raw-unit weight
    /// sources into normalized space through `profile`.
    ///
    /// `collection` is re-scored while scanning candidate features; its
    /// scores and q-values are left under the chosen direction.
    pub fn resolve(
        source: &DirectionSource,
        arena: &FeatureArena,
        profile: &NormalizationProfile,
        collection: &mut ScoreSet,
        initial_fdr: f64,
        override_check: bool,
    ) -> Result<Self, DirectionError> {
        let n = arena.num_features();
        let (weights, feature) = match source {
            DirectionSource::InitialWeights(values) | DirectionSource::DefaultWeights(values) => {
                let raw = match values.len() {
                    len if len == n + 1 => WeightVector::from_values(values.clone()),
                    len if len == n => {
                        let mut with_bias = values.clone();
                        with_bias.push(0.0);
                        WeightVector::from_values(with_bias)
                    }
                    len => {
                        return Err(DirectionError::WeightCountMismatch {
                            given: len,
                            expected: n,
                        })
                    }
                };
                (profile.normalized_weights(&raw), None)
            }
            DirectionSource::Feature { index, negate } => {
                if *index >= n {
                    return Err(DirectionError::FeatureOutOfRange {
                        index: *index,
                        num_features: n,
                    });
                }
                (
                    WeightVector::single_feature(n, *index, *negate),
                    Some((*index, *negate)),
                )
            }
            DirectionSource::BestSingleFeature => {
                let mut best: Option<(usize, usize, bool)> = None;
                for index in 0..n {
                    for negate in [false, true] {
                        let candidate = WeightVector::single_feature(n, index, negate);
                        let accepted = collection
                            .calc_scores_and_qvals(arena, &candidate, initial_fdr, true)?;
                        if best.map(|(count, _, _)| accepted > count).unwrap_or(true) {
                            best = Some((accepted, index, negate));
                        }
                    }
                }
                let (accepted, index, negate) = best.unwrap_or((0, 0, false));
                debug!(
                    "bootstrap direction: feature {index} ({}), {accepted} targets at FDR {initial_fdr}",
                    if negate { "reversed" } else { "forward" }
                );
                if accepted == 0 {
                    return Err(DirectionError::NoPositives { fdr: initial_fdr });
                }
                (
                    WeightVector::single_feature(n, index, negate),
                    Some((index, negate)),
                )
            }
        };
        // leave the collection scored and calibrated under the chosen
        // direction, whichever branch picked it
        collection.calc_scores_and_qvals(arena, &weights, initial_fdr, true)?;
        Ok(Self {
            weights,
            feature,
            initial_positives: Vec::new(),
            override_check,
        })
    }

    pub fn weights(&self) -> &WeightVector {
        &self.weights
    }

    /// Remember how many targets each test fold accepted under the
    /// bootstrap, the baseline the learned directions must beat.
    pub fn record_initial_positives(&mut self, counts: Vec<usize>) {
        self.initial_positives = counts;
    }

    pub fn initial_positives(&self) -> &[usize] {
        &self.initial_positives
    }

    fn fold_is_sane(&self, fold: usize, weights: &WeightVector, positives: usize) -> bool {
        if positives == 0 {
            return false;
        }
        if let Some(baseline) = self.initial_positives.get(fold) {
            if positives < *baseline {
                return false;
            }
        }
        if let Some((index, negate)) = self.feature {
            let learned = weights.values()[index];
            let keeps_orientation = if negate { learned <= 0.0 } else { learned >= 0.0 };
            if !keeps_orientation {
                return false;
            }
        }
        true
    }

    /// Check every fold's learned direction on its test set and reset the
    /// folds that regressed below the bootstrap, unless the caller overrode
    /// the check. Returns the number of folds reset.
    ///
    /// Fails only when not a single target is accepted anywhere even after
    /// falling back to the bootstrap.
    pub fn validate_and_reset(
        &self,
        arena: &FeatureArena,
        weights: &mut [WeightVector],
        test_sets: &mut [ScoreSet],
        test_fdr: f64,
    ) -> Result<usize, DirectionError> {
        let mut reset_folds = 0;
        let mut total_positives = 0;
        for (fold, (w, scores)) in weights.iter_mut().zip(test_sets.iter_mut()).enumerate() {
            let positives = scores.calc_scores_and_qvals(arena, w, test_fdr, true)?;
            if self.fold_is_sane(fold, w, positives) {
                total_positives += positives;
                continue;
            }
            if self.override_check {
                warn!(
                    "learned direction of fold {fold} failed the sanity check \
                     ({positives} positives, baseline {:?}); keeping it as overridden",
                    self.initial_positives.get(fold)
                );
                total_positives += positives;
                continue;
            }
            warn!(
                "learned direction of fold {fold} failed the sanity check \
                 ({positives} positives, baseline {:?}); resetting to the bootstrap direction",
                self.initial_positives.get(fold)
            );
            *w = self.weights.clone();
            total_positives += scores.calc_scores_and_qvals(arena, w, test_fdr, true)?;
            reset_folds += 1;
        }
        if total_positives == 0 {
            return Err(DirectionError::NoPositives { fdr: test_fdr });
        }
        Ok(reset_folds)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::normalize::NormalizationKind;
    use crate::psm::{LabelClass, Psm, SpectrumId};
    use crate::scores::ScoredPsm;

    /// Feature 0 is noise, feature 1 separates cleanly but reversed.
    fn toy_collection() -> (FeatureArena, ScoreSet) {
        let mut arena = FeatureArena::new(2);
        let mut set = ScoreSet::new();
        for scan in 0..60u32 {
            let label = if scan % 2 == 0 {
                LabelClass::Target
            } else {
                LabelClass::Decoy
            };
            let noise = ((scan * 7) % 13) as f64;
            let separating = if label.is_target() { -1.0 } else { 1.0 } * (1.0 + scan as f64 / 60.0);
            let psm = Psm::new(format!("s{scan}"), SpectrumId::new(0, scan), "PEP".into()).shared();
            set.push(ScoredPsm::new(
                psm,
                arena.acquire_from(&[noise, separating]),
                label,
            ));
        }
        (arena, set)
    }

    #[test]
    fn test_best_single_feature_finds_reversed_separator() {
        let (arena, mut set) = toy_collection();
        let profile = NormalizationProfile::identity(2);
        let direction = InitialDirection::resolve(
            &DirectionSource::BestSingleFeature,
            &arena,
            &profile,
            &mut set,
            0.1,
            false,
        )
        .unwrap();
        assert_eq!(direction.weights().values(), &[0.0, -1.0, 0.0]);
    }

    #[test]
    fn test_explicit_feature_out_of_range() {
        let (arena, mut set) = toy_collection();
        let profile = NormalizationProfile::identity(2);
        let err = InitialDirection::resolve(
            &DirectionSource::Feature {
                index: 5,
                negate: false,
            },
            &arena,
            &profile,
            &mut set,
            0.1,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, DirectionError::FeatureOutOfRange { .. }));
    }

    #[test]
    fn test_raw_weights_pass_through_profile() {
        let (mut arena, mut set) = toy_collection();
        let entries: Vec<ScoredPsm> = set.entries().to_vec();
        let profile =
            NormalizationProfile::fit(NormalizationKind::StandardDeviation, &arena, &entries);
        profile.apply(&mut arena, &entries);
        let direction = InitialDirection::resolve(
            &DirectionSource::DefaultWeights(vec![0.0, -1.0]),
            &arena,
            &profile,
            &mut set,
            0.1,
            false,
        )
        .unwrap();
        // the converted direction must rank like the raw one: targets first
        let positives = set.count_accepted(0.1);
        assert!(positives > 0, "converted direction lost the separation");
        assert!(direction.feature.is_none());
    }

    #[test]
    fn test_validate_resets_regressed_fold() {
        let (arena, mut set) = toy_collection();
        let profile = NormalizationProfile::identity(2);
        let mut direction = InitialDirection::resolve(
            &DirectionSource::BestSingleFeature,
            &arena,
            &profile,
            &mut set,
            0.1,
            false,
        )
        .unwrap();
        direction.record_initial_positives(vec![10]);
        // a learned direction that flipped orientation and ranks decoys first
        let mut weights = vec![WeightVector::from_values(vec![0.0, 1.0, 0.0])];
        let mut test_sets = vec![set.clone()];
        let reset = direction
            .validate_and_reset(&arena, &mut weights, &mut test_sets, 0.1)
            .unwrap();
        assert_eq!(reset, 1);
        assert_eq!(weights[0], *direction.weights());
        assert!(test_sets[0].count_accepted(0.1) > 0);
    }

    #[test]
    fn test_override_keeps_bad_direction() {
        let (arena, mut set) = toy_collection();
        let profile = NormalizationProfile::identity(2);
        let mut direction = InitialDirection::resolve(
            &DirectionSource::BestSingleFeature,
            &arena,
            &profile,
            &mut set,
            0.1,
            true,
        )
        .unwrap();
        direction.record_initial_positives(vec![10]);
        let bad = WeightVector::from_values(vec![0.0, 1.0, 0.0]);
        let mut weights = vec![bad.clone()];
        let mut test_sets = vec![set.clone()];
        // overridden: the bad direction stays in place, and with nothing
        // accepted anywhere the overall call still fails
        let err = direction
            .validate_and_reset(&arena, &mut weights, &mut test_sets, 0.1)
            .unwrap_err();
        assert_eq!(weights[0], bad);
        assert!(matches!(err, DirectionError::NoPositives { .. }));
    }
}
