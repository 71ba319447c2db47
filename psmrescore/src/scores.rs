//! The scored PSM collection and its training-set operations.
//!
//! A [`ScoreSet`] owns the mutable per-PSM state of one working set: the
//! current score under some direction, plus the statistics hung off it.
//! The metadata and feature rows live elsewhere ([`Psm`] behind an `Arc`,
//! features in the [`FeatureArena`]), so fold views and the merged final
//! collection share them without copying.

use std::collections::HashSet;
use std::sync::Arc;

use identity_hash::BuildIdentityHasher;
use itertools::Itertools;

use crate::arena::{FeatureArena, RowId};
use crate::isotonic;
use crate::posterior::{self, CalibrationError};
use crate::psm::{LabelClass, Psm};
use crate::random::Lcg;
use crate::solver::{SvmInput, WeightVector};

type SpectrumKeySet = HashSet<u64, BuildIdentityHasher<u64>>;

/// One PSM plus its mutable scoring state.
#[derive(Debug, Clone)]
pub struct ScoredPsm {
    pub psm: Arc<Psm>,
    pub row: RowId,
    pub label: LabelClass,
    pub score: f64,
    /// Minimal FDR at which this PSM is accepted.
    pub q: f64,
    /// Posterior probability that this PSM is incorrect.
    pub pep: f64,
    /// Empirical p-value against the decoy score distribution. Only
    /// meaningful for targets.
    pub p: f64,
}

impl ScoredPsm {
    pub fn new(psm: Arc<Psm>, row: RowId, label: LabelClass) -> Self {
        Self {
            psm,
            row,
            label,
            score: 0.0,
            q: 1.0,
            pep: 1.0,
            p: 1.0,
        }
    }

    /// Ordering for score-sorted collections: better scores first, ties
    /// broken by scan number, then experimental mass, then targets before
    /// decoys so a target wins a dead-even competition.
    pub fn cmp_desc(&self, other: &Self) -> std::cmp::Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.psm.spectrum.cmp(&other.psm.spectrum))
            .then_with(|| self.psm.exp_mass.total_cmp(&other.psm.exp_mass))
            .then_with(|| other.label.cmp(&self.label))
    }
}

/// A collection of scored PSMs, kept sorted best-to-worst whenever scores
/// are current.
#[derive(Debug, Default, Clone)]
pub struct ScoreSet {
    entries: Vec<ScoredPsm>,
    num_targets: usize,
    num_decoys: usize,
}

impl ScoreSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            ..Default::default()
        }
    }

    pub fn push(&mut self, entry: ScoredPsm) {
        match entry.label {
            LabelClass::Target => self.num_targets += 1,
            LabelClass::Decoy => self.num_decoys += 1,
        }
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn num_targets(&self) -> usize {
        self.num_targets
    }

    #[inline]
    pub fn num_decoys(&self) -> usize {
        self.num_decoys
    }

    /// How many real targets each decoy stands in for, used to scale the
    /// cost grid.
    pub fn target_decoy_ratio(&self) -> f64 {
        if self.num_decoys == 0 {
            1.0
        } else {
            self.num_targets as f64 / self.num_decoys as f64
        }
    }

    pub fn entries(&self) -> &[ScoredPsm] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [ScoredPsm] {
        &mut self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ScoredPsm> {
        self.entries.iter()
    }

    fn labels(&self) -> Vec<LabelClass> {
        self.entries.iter().map(|e| e.label).collect()
    }

    fn recount(&mut self) {
        self.num_targets = self.entries.iter().filter(|e| e.label.is_target()).count();
        self.num_decoys = self.entries.len() - self.num_targets;
    }

    /// Re-score every entry under `weights` and restore the best-to-worst
    /// ordering.
    pub fn calc_scores(&mut self, arena: &FeatureArena, weights: &WeightVector) {
        for entry in self.entries.iter_mut() {
            entry.score = weights.score(arena.row(entry.row));
        }
        self.entries.sort_by(ScoredPsm::cmp_desc);
    }

    /// Re-score, re-sort, and refresh q-values, returning the number of
    /// targets accepted at `fdr`.
    ///
    /// `count_decoys_plus_one` selects the conservative `decoys + 1`
    /// numerator used while comparing candidate directions.
    pub fn calc_scores_and_qvals(
        &mut self,
        arena: &FeatureArena,
        weights: &WeightVector,
        fdr: f64,
        count_decoys_plus_one: bool,
    ) -> Result<usize, CalibrationError> {
        self.calc_scores(arena, weights);
        let labels = self.labels();
        let qvals = posterior::q_values(&labels, 1.0, count_decoys_plus_one)?;
        for (entry, q) in self.entries.iter_mut().zip(&qvals) {
            entry.q = *q;
        }
        Ok(posterior::count_accepted(&labels, &qvals, fdr))
    }

    /// The number of targets currently at `q <= fdr`. Scores and q-values
    /// must be current.
    pub fn count_accepted(&self, fdr: f64) -> usize {
        self.entries
            .iter()
            .filter(|e| e.label.is_target() && e.q <= fdr)
            .count()
    }

    /// Assign the final statistics: p-values and q-values scaled by `pi0`,
    /// and PEPs from the isotonic decoy-rate fit. Assumes the collection is
    /// score-sorted.
    pub fn assign_statistics(&mut self, pi0: f64) -> Result<(), CalibrationError> {
        let labels = self.labels();
        let qvals = posterior::q_values(&labels, pi0, false)?;
        for (entry, q) in self.entries.iter_mut().zip(&qvals) {
            entry.q = *q;
        }
        let pvals = posterior::p_values(&labels)?;
        let mut pvals = pvals.iter();
        for entry in self.entries.iter_mut() {
            if entry.label.is_target() {
                entry.p = *pvals.next().unwrap();
            }
        }
        let is_decoy: Vec<bool> = labels.iter().map(|l| l.is_decoy()).collect();
        let peps = isotonic::tdc_to_pep(&is_decoy);
        for (entry, pep) in self.entries.iter_mut().zip(peps) {
            entry.pep = pep;
        }
        Ok(())
    }

    /// Partition into `k` disjoint test sets, keeping every PSM of a
    /// spectrum in the same test set, and pair each with the complementary
    /// training set.
    ///
    /// Spectra are visited in mixed key order and assigned a fold from the
    /// generator, so the split is deterministic per seed but uncorrelated
    /// with acquisition order.
    pub fn split_by_spectrum(&self, k: usize, rng: &mut Lcg) -> (Vec<ScoreSet>, Vec<ScoreSet>) {
        let mut by_spectrum: Vec<&ScoredPsm> = self.entries.iter().collect();
        by_spectrum.sort_by_key(|e| (e.psm.spectrum.key(), e.psm.spectrum));

        let mut train = vec![ScoreSet::new(); k];
        let mut test = vec![ScoreSet::new(); k];
        for (_, group) in &by_spectrum.iter().group_by(|e| e.psm.spectrum) {
            let fold = rng.next_in(k);
            for entry in group {
                for (j, set) in train.iter_mut().enumerate() {
                    if j != fold {
                        set.push((*entry).clone());
                    }
                }
                test[fold].push((*entry).clone());
            }
        }
        (train, test)
    }

    /// Append every decoy to the solver input. Must run before any
    /// positives are added.
    pub fn generate_negative_training_set(&self, input: &mut SvmInput) {
        for entry in self.entries.iter().filter(|e| e.label.is_decoy()) {
            input.push_negative(entry.row);
        }
    }

    /// Append the targets accepted at `q <= threshold` to the solver input.
    ///
    /// With `best_positive_only`, at most one target per spectrum is taken;
    /// since the collection is score-sorted, the first target seen for a
    /// spectrum is its best. Returns the number of positives added.
    pub fn generate_positive_training_set(
        &self,
        input: &mut SvmInput,
        threshold: f64,
        best_positive_only: bool,
    ) -> usize {
        let mut taken: SpectrumKeySet =
            HashSet::with_capacity_and_hasher(self.num_targets, Default::default());
        let mut added = 0;
        for entry in self.entries.iter() {
            if entry.label.is_decoy() || entry.q > threshold {
                continue;
            }
            if best_positive_only && !taken.insert(entry.psm.spectrum.key()) {
                continue;
            }
            input.push_positive(entry.row);
            added += 1;
        }
        added
    }

    /// Reduce to the best-scoring PSM per peptide sequence, targets and
    /// decoys competing against each other. On a dead-even tie the sort
    /// order puts the target first, so the target survives. Assumes the
    /// collection is score-sorted.
    pub fn weed_out_redundant(&mut self) {
        let mut seen: HashSet<String> = HashSet::with_capacity(self.entries.len());
        self.entries.retain(|e| seen.insert(e.psm.peptide.clone()));
        self.recount();
    }

    /// Affine-rescale scores so the score at the `fdr` acceptance boundary
    /// maps to zero and the median decoy score maps to minus one, updating
    /// `weights` to match so re-scoring stays consistent.
    ///
    /// This puts the per-fold test collections on a common scale before
    /// they are merged.
    pub fn normalize_scores(&mut self, fdr: f64, weights: &mut WeightVector) {
        let median_index = (self.num_decoys / 2).max(1);
        let mut fdr_score = self
            .entries
            .first()
            .map(|e| e.score)
            .unwrap_or_default();
        let mut median_decoy = fdr_score - 1.0;
        let mut decoys = 0usize;
        for entry in self.entries.iter() {
            if entry.q < fdr {
                fdr_score = entry.score;
            }
            if entry.label.is_decoy() {
                decoys += 1;
                if decoys == median_index {
                    median_decoy = entry.score;
                    break;
                }
            }
        }
        let diff = fdr_score - median_decoy;
        let diff = if diff > 0.0 { diff } else { 1.0 };
        for entry in self.entries.iter_mut() {
            entry.score = (entry.score - fdr_score) / diff;
        }
        let n = weights.num_features();
        for w in weights.values_mut().iter_mut() {
            *w /= diff;
        }
        weights.values_mut()[n] -= fdr_score / diff;
    }

    /// Merge per-fold test collections into one score-sorted collection.
    ///
    /// Unless `skip_normalization` is set, each fold is first rescaled with
    /// [`normalize_scores`](Self::normalize_scores) against its own
    /// direction so scores are comparable across folds.
    pub fn merge(
        folds: Vec<ScoreSet>,
        fdr: f64,
        skip_normalization: bool,
        weights: &mut [WeightVector],
    ) -> ScoreSet {
        let capacity = folds.iter().map(|f| f.len()).sum();
        let mut merged = ScoreSet::with_capacity(capacity);
        for (mut fold, w) in folds.into_iter().zip(weights.iter_mut()) {
            if !skip_normalization {
                fold.normalize_scores(fdr, w);
            }
            for entry in fold.entries {
                merged.push(entry);
            }
        }
        merged.entries.sort_by(ScoredPsm::cmp_desc);
        merged
    }
}

impl<'a> IntoIterator for &'a ScoreSet {
    type Item = &'a ScoredPsm;
    type IntoIter = std::slice::Iter<'a, ScoredPsm>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
