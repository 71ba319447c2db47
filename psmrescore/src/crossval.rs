//! The semi-supervised cross-validation training loop.
//!
//! The collection is split into disjoint spectrum-grouped folds. Each
//! fold trains on the other folds' PSMs: decoys are the negatives, and the
//! targets currently accepted below the training FDR are the positives.
//! Per fold, a small grid of cost pairs is trained concurrently and the
//! pair accepting the most targets on its own training split wins. Learned
//! directions only ever score the fold's held-out test split, which is what
//! keeps the final statistics unbiased.

use rayon::prelude::*;
use tracing::{debug, info};

use crate::arena::FeatureArena;
use crate::direction::{DirectionError, DirectionSource, InitialDirection};
use crate::normalize::NormalizationProfile;
use crate::posterior::CalibrationError;
use crate::random::Lcg;
use crate::scores::ScoreSet;
use crate::solver::{l2_svm_mfn, SolverOptions, SvmInput, WeightVector};

/// Iterating stops once the accepted count fails to grow by this fraction
/// over the count from two iterations back.
pub const REQUIRED_INCREASE_OVER_TWO_ITERATIONS: f64 = 0.01;

/// Cost grid for the positive class when the caller fixes nothing.
pub const DEFAULT_CPOS_CANDIDATES: [f64; 3] = [10.0, 1.0, 0.1];
/// Negative-cost multipliers, scaled by each fold's target/decoy ratio.
pub const DEFAULT_CFRAC_CANDIDATES: [f64; 3] = [1.0, 3.0, 10.0];

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CrossValidationParams {
    pub num_folds: usize,
    pub max_iterations: usize,
    /// FDR threshold that admits targets into the positive training set.
    pub train_fdr: f64,
    /// FDR threshold that counts reported positives.
    pub test_fdr: f64,
    /// FDR threshold for the very first labeling pass, under the bootstrap
    /// direction.
    pub initial_fdr: f64,
    /// Fixed positive-class cost; `None` turns on the grid search.
    pub cpos: Option<f64>,
    /// Fixed negative-class cost; `None` turns on the grid search.
    pub cneg: Option<f64>,
    /// Calibrate costs on the first fold only and reuse the pair elsewhere.
    pub quick_validation: bool,
    /// Admit only the best-scoring target per spectrum as a positive.
    pub train_best_positive: bool,
    pub report_each_iteration: bool,
    pub seed: u64,
    pub solver: SolverOptions,
}

impl Default for CrossValidationParams {
    fn default() -> Self {
        Self {
            num_folds: 3,
            max_iterations: 10,
            train_fdr: 0.01,
            test_fdr: 0.01,
            initial_fdr: 0.01,
            cpos: None,
            cneg: None,
            quick_validation: false,
            train_best_positive: false,
            report_each_iteration: false,
            seed: 1,
            solver: SolverOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CrossValidationError {
    #[error("cross-validation requires at least two folds, got {0}")]
    TooFewFolds(usize),
    #[error("training split of fold {fold} has no decoy PSMs")]
    NoNegativeExamples { fold: usize },
    #[error("training split of fold {fold} has no target PSM below the training FDR")]
    NoPositiveExamples { fold: usize },
    #[error(transparent)]
    Direction(#[from] DirectionError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}

/// One trained candidate from the cost grid.
struct Candidate {
    accepted: usize,
    cpos: f64,
    cneg: f64,
    weights: WeightVector,
}

/// The cross-validation state: per-fold splits, per-fold directions, and
/// the bootstrap they are judged against.
#[derive(Debug)]
pub struct CrossValidation {
    params: CrossValidationParams,
    direction: InitialDirection,
    train_sets: Vec<ScoreSet>,
    test_sets: Vec<ScoreSet>,
    weights: Vec<WeightVector>,
    iteration: usize,
}

impl CrossValidation {
    /// Split the collection, resolve the bootstrap direction, and score
    /// every fold under it.
    pub fn setup(
        arena: &FeatureArena,
        collection: &mut ScoreSet,
        source: &DirectionSource,
        profile: &NormalizationProfile,
        override_direction_check: bool,
        params: CrossValidationParams,
    ) -> Result<Self, CrossValidationError> {
        if params.num_folds < 2 {
            return Err(CrossValidationError::TooFewFolds(params.num_folds));
        }
        let mut rng = Lcg::new(params.seed);
        let (mut train_sets, mut test_sets) =
            collection.split_by_spectrum(params.num_folds, &mut rng);
        for (fold, set) in train_sets.iter().enumerate() {
            if set.num_decoys() == 0 {
                return Err(CrossValidationError::NoNegativeExamples { fold });
            }
        }
        let mut direction = InitialDirection::resolve(
            source,
            arena,
            profile,
            collection,
            params.initial_fdr,
            override_direction_check,
        )?;
        let weights = vec![direction.weights().clone(); params.num_folds];

        let mut initial_positives = Vec::with_capacity(params.num_folds);
        for (fold, test) in test_sets.iter_mut().enumerate() {
            let accepted =
                test.calc_scores_and_qvals(arena, direction.weights(), params.test_fdr, true)?;
            debug!("fold {fold}: {accepted} positives under the bootstrap direction");
            initial_positives.push(accepted);
        }
        direction.record_initial_positives(initial_positives);
        for train in train_sets.iter_mut() {
            train.calc_scores_and_qvals(arena, direction.weights(), params.initial_fdr, true)?;
        }
        Ok(Self {
            params,
            direction,
            train_sets,
            test_sets,
            weights,
            iteration: 0,
        })
    }

    pub fn weights(&self) -> &[WeightVector] {
        &self.weights
    }

    pub fn num_folds(&self) -> usize {
        self.params.num_folds
    }

    /// The cost pairs to try for one fold, built from the fixed costs if
    /// given, the grids otherwise.
    fn candidate_costs(&self, fold: usize) -> Vec<(f64, f64)> {
        let ratio = self.train_sets[fold].target_decoy_ratio();
        let cpos_candidates: Vec<f64> = match self.params.cpos {
            Some(c) => vec![c],
            None => DEFAULT_CPOS_CANDIDATES.to_vec(),
        };
        let mut pairs = Vec::new();
        for &cpos in &cpos_candidates {
            match self.params.cneg {
                Some(cneg) => pairs.push((cpos, cneg)),
                None => {
                    for &cfrac in &DEFAULT_CFRAC_CANDIDATES {
                        pairs.push((cpos, cfrac * ratio * cpos));
                    }
                }
            }
        }
        pairs
    }

    /// Build the training input of one fold from its current q-values.
    fn training_input(&self, fold: usize) -> Result<SvmInput, CrossValidationError> {
        let threshold = if self.iteration == 0 {
            self.params.initial_fdr
        } else {
            self.params.train_fdr
        };
        let train = &self.train_sets[fold];
        let mut input = SvmInput::new();
        train.generate_negative_training_set(&mut input);
        let positives =
            train.generate_positive_training_set(&mut input, threshold, self.params.train_best_positive);
        if positives == 0 {
            return Err(CrossValidationError::NoPositiveExamples { fold });
        }
        debug!(
            "fold {fold}: training on {positives} positives and {} negatives at FDR {threshold}",
            input.negatives()
        );
        Ok(input)
    }

    /// Train the grid for one fold and keep the candidate accepting the
    /// most targets on its own training split; among ties the
    /// latest-trained pair wins.
    fn train_fold(
        &self,
        arena: &FeatureArena,
        fold: usize,
        pairs: &[(f64, f64)],
    ) -> Result<Candidate, CrossValidationError> {
        let input = self.training_input(fold)?;
        let num_features = arena.num_features();
        let candidates: Vec<Candidate> = pairs
            .par_iter()
            .map(|&(cpos, cneg)| -> Result<Candidate, CalibrationError> {
                let mut weights = WeightVector::zeroed(num_features);
                l2_svm_mfn(arena, &input, &self.params.solver, &mut weights, cpos, cneg);
                let mut eval = self.train_sets[fold].clone();
                let accepted =
                    eval.calc_scores_and_qvals(arena, &weights, self.params.test_fdr, true)?;
                Ok(Candidate {
                    accepted,
                    cpos,
                    cneg,
                    weights,
                })
            })
            .collect::<Result<_, _>>()?;
        let best = candidates
            .into_iter()
            .reduce(|best, next| if next.accepted >= best.accepted { next } else { best })
            .expect("cost grid is never empty");
        debug!(
            "fold {fold}: best pair cpos={} cneg={} accepted {}",
            best.cpos, best.cneg, best.accepted
        );
        Ok(best)
    }

    /// One training pass over all folds. Returns the estimated number of
    /// positives, the per-fold training-split counts scaled down for the
    /// overlap between training splits.
    fn do_step(&mut self, arena: &FeatureArena) -> Result<usize, CrossValidationError> {
        let mut estimate = 0usize;
        let mut reuse: Option<(f64, f64)> = None;
        for fold in 0..self.params.num_folds {
            let pairs = match reuse {
                Some(pair) => vec![pair],
                None => self.candidate_costs(fold),
            };
            let best = self.train_fold(arena, fold, &pairs)?;
            if self.params.quick_validation && reuse.is_none() {
                reuse = Some((best.cpos, best.cneg));
            }
            let accepted = self.train_sets[fold].calc_scores_and_qvals(
                arena,
                &best.weights,
                self.params.test_fdr,
                false,
            )?;
            estimate += accepted;
            self.weights[fold] = best.weights;
        }
        Ok(estimate / (self.params.num_folds - 1))
    }

    /// Run training passes until the accepted count stalls or the
    /// iteration cap is reached. Returns the number of test-set positives
    /// under the final directions.
    pub fn train(&mut self, arena: &FeatureArena) -> Result<usize, CrossValidationError> {
        let mut found_old_old = 0usize;
        let mut found_old = 0usize;
        while self.iteration < self.params.max_iterations {
            let found = self.do_step(arena)?;
            self.iteration += 1;
            if self.params.report_each_iteration {
                info!(
                    "iteration {}: estimated {found} positives at FDR {}",
                    self.iteration, self.params.test_fdr
                );
            } else {
                debug!("iteration {}: estimated {found} positives", self.iteration);
            }
            if found_old_old > 0
                && (found as f64 - found_old_old as f64)
                    <= found_old_old as f64 * REQUIRED_INCREASE_OVER_TWO_ITERATIONS
            {
                info!(
                    "accepted count stalled after {} iterations ({found_old_old} -> {found})",
                    self.iteration
                );
                break;
            }
            found_old_old = found_old;
            found_old = found;
        }
        // now label the held-out splits with their own fold's direction
        let mut total = 0;
        for fold in 0..self.params.num_folds {
            total += self.test_sets[fold].calc_scores_and_qvals(
                arena,
                &self.weights[fold],
                self.params.test_fdr,
                false,
            )?;
        }
        info!(
            "cross-validation finished after {} iterations with {total} test-set positives",
            self.iteration
        );
        Ok(total)
    }

    /// Sanity-check the learned directions against the bootstrap, then
    /// merge the test splits into the final collection. Consumes the
    /// cross-validation state; the (possibly score-rescaled) per-fold
    /// directions come back alongside the merged collection.
    pub fn post_iteration_processing(
        mut self,
        arena: &FeatureArena,
        skip_score_normalization: bool,
    ) -> Result<(ScoreSet, Vec<WeightVector>), CrossValidationError> {
        let reset = self.direction.validate_and_reset(
            arena,
            &mut self.weights,
            &mut self.test_sets,
            self.params.test_fdr,
        )?;
        if reset > 0 {
            info!("{reset} fold(s) fell back to the bootstrap direction");
        }
        let merged = ScoreSet::merge(
            self.test_sets,
            self.params.train_fdr,
            skip_score_normalization,
            &mut self.weights,
        );
        Ok((merged, self.weights))
    }
}
