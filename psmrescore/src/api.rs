//! The top-level rescoring engine: dataset in, calibrated collection out.

use tracing::{debug, info, warn};

use crate::arena::FeatureArena;
use crate::crossval::{CrossValidation, CrossValidationError, CrossValidationParams};
use crate::direction::DirectionSource;
use crate::normalize::{NormalizationKind, NormalizationProfile};
use crate::posterior::{self, CalibrationError};
use crate::psm::{LabelClass, Psm};
use crate::random::Lcg;
use crate::scores::{ScoreSet, ScoredPsm};
use crate::solver::WeightVector;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DatasetError {
    #[error("the dataset is empty")]
    Empty,
    #[error("the dataset contains no decoy PSMs")]
    NoDecoys,
    #[error("the dataset contains no target PSMs")]
    NoTargets,
    #[error("feature row carries {given} values but the dataset has {expected} features")]
    FeatureCountMismatch { given: usize, expected: usize },
    #[error("default direction carries {given} weights but the dataset has {expected} features")]
    DirectionCountMismatch { given: usize, expected: usize },
}

/// The assembled input: feature rows, PSM metadata, and labels.
#[derive(Debug, Default, Clone)]
pub struct PsmDataset {
    arena: FeatureArena,
    scores: ScoreSet,
    feature_names: Vec<String>,
    default_direction: Option<Vec<f64>>,
}

impl PsmDataset {
    pub fn new(feature_names: Vec<String>) -> Self {
        Self {
            arena: FeatureArena::new(feature_names.len()),
            scores: ScoreSet::new(),
            feature_names,
            default_direction: None,
        }
    }

    pub fn push(
        &mut self,
        psm: Psm,
        label: LabelClass,
        features: &[f64],
    ) -> Result<(), DatasetError> {
        if features.len() != self.feature_names.len() {
            return Err(DatasetError::FeatureCountMismatch {
                given: features.len(),
                expected: self.feature_names.len(),
            });
        }
        let row = self.arena.acquire_from(features);
        self.scores.push(ScoredPsm::new(psm.shared(), row, label));
        Ok(())
    }

    /// Attach a raw-unit default direction carried alongside the input,
    /// with or without a trailing bias value.
    pub fn set_default_direction(&mut self, weights: Vec<f64>) -> Result<(), DatasetError> {
        let n = self.feature_names.len();
        if weights.len() != n && weights.len() != n + 1 {
            return Err(DatasetError::DirectionCountMismatch {
                given: weights.len(),
                expected: n,
            });
        }
        self.default_direction = Some(weights);
        Ok(())
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn num_targets(&self) -> usize {
        self.scores.num_targets()
    }

    pub fn num_decoys(&self) -> usize {
        self.scores.num_decoys()
    }

    /// Find a feature column by its (case-insensitive) name.
    pub fn feature_index(&self, name: &str) -> Option<usize> {
        self.feature_names
            .iter()
            .position(|f| f.eq_ignore_ascii_case(name))
    }

    fn validate(&self) -> Result<(), DatasetError> {
        if self.scores.is_empty() {
            return Err(DatasetError::Empty);
        }
        if self.scores.num_decoys() == 0 {
            return Err(DatasetError::NoDecoys);
        }
        if self.scores.num_targets() == 0 {
            return Err(DatasetError::NoTargets);
        }
        Ok(())
    }
}

/// Everything configurable about one engine run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RescoreParams {
    pub crossval: CrossValidationParams,
    pub normalization: NormalizationKind,
    /// Leave per-fold test scores on their native scales when merging.
    pub skip_score_normalization: bool,
    /// Estimate π₀ and fold it into the final q-values and p-values.
    pub use_pi0: bool,
    /// Also report the collection reduced to its best PSM per peptide.
    pub unique_peptides: bool,
    pub override_direction_check: bool,
    /// Caller-chosen bootstrap; `None` falls back to the dataset's default
    /// direction, then to scanning for the best single feature.
    pub initial_direction: Option<DirectionSource>,
}

/// The calibrated result of one engine run.
#[derive(Debug, Clone)]
pub struct RescoreOutcome {
    /// The merged PSM collection with final scores, q-values, PEPs, and
    /// p-values assigned.
    pub psms: ScoreSet,
    /// The peptide-level reduction, when requested.
    pub peptides: Option<ScoreSet>,
    /// The estimated fraction of incorrect targets, `1.0` unless π₀
    /// estimation was enabled.
    pub pi0: f64,
    /// Per-fold directions in normalized feature space.
    pub weights: Vec<WeightVector>,
    /// The same directions mapped back to raw feature units.
    pub raw_weights: Vec<WeightVector>,
    pub feature_names: Vec<String>,
    /// Targets accepted at the test FDR in the final collection.
    pub num_positives: usize,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RescoreError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    CrossValidation(#[from] CrossValidationError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}

/// Drives the full pipeline: normalization, bootstrap, cross-validated
/// training, merging, and final calibration.
#[derive(Debug, Default, Clone)]
pub struct RescoreEngine {
    params: RescoreParams,
}

impl RescoreEngine {
    pub fn new(params: RescoreParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &RescoreParams {
        &self.params
    }

    pub fn run(&self, dataset: PsmDataset) -> Result<RescoreOutcome, RescoreError> {
        dataset.validate()?;
        let PsmDataset {
            mut arena,
            mut scores,
            feature_names,
            default_direction,
        } = dataset;
        info!(
            "rescoring {} PSMs ({} targets, {} decoys, {} features)",
            scores.len(),
            scores.num_targets(),
            scores.num_decoys(),
            feature_names.len()
        );

        let profile = NormalizationProfile::fit(self.params.normalization, &arena, scores.entries());
        profile.apply(&mut arena, scores.entries());

        let source = match &self.params.initial_direction {
            Some(source) => source.clone(),
            None => match default_direction {
                Some(values) => {
                    debug!("bootstrapping from the dataset's default direction");
                    DirectionSource::DefaultWeights(values)
                }
                None => DirectionSource::BestSingleFeature,
            },
        };

        let mut cv = CrossValidation::setup(
            &arena,
            &mut scores,
            &source,
            &profile,
            self.params.override_direction_check,
            self.params.crossval.clone(),
        )?;
        cv.train(&arena)?;
        let (mut merged, weights) =
            cv.post_iteration_processing(&arena, self.params.skip_score_normalization)?;

        let pi0 = if self.params.use_pi0 {
            self.estimate_pi0(&merged)?
        } else {
            1.0
        };
        merged.assign_statistics(pi0)?;
        let num_positives = merged.count_accepted(self.params.crossval.test_fdr);
        info!(
            "final collection: {num_positives} targets at FDR {} (pi0 {pi0:0.3})",
            self.params.crossval.test_fdr
        );

        let peptides = if self.params.unique_peptides {
            let mut reduced = merged.clone();
            reduced.weed_out_redundant();
            reduced.assign_statistics(pi0)?;
            info!(
                "peptide level: {} unique peptides, {} at FDR {}",
                reduced.len(),
                reduced.count_accepted(self.params.crossval.test_fdr),
                self.params.crossval.test_fdr
            );
            Some(reduced)
        } else {
            None
        };

        let raw_weights = weights.iter().map(|w| profile.raw_weights(w)).collect();
        Ok(RescoreOutcome {
            psms: merged,
            peptides,
            pi0,
            weights,
            raw_weights,
            feature_names,
            num_positives,
        })
    }

    /// π₀ from the merged collection's target p-values. Falls back to `1.0`
    /// with a warning when the scores separate too cleanly for the
    /// estimator.
    fn estimate_pi0(&self, merged: &ScoreSet) -> Result<f64, RescoreError> {
        let labels: Vec<LabelClass> = merged.iter().map(|e| e.label).collect();
        let pvals = posterior::p_values(&labels)?;
        let mut rng = Lcg::new(self.params.crossval.seed);
        match posterior::estimate_pi0(&pvals, &mut rng) {
            Ok(pi0) => Ok(pi0),
            Err(CalibrationError::NoValidLambda) => {
                warn!("pi0 estimation found no usable lambda; continuing with pi0 = 1.0");
                Ok(1.0)
            }
            Err(err) => Err(err.into()),
        }
    }
}
