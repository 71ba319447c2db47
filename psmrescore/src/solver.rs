//! The weighted L2-SVM solver, a Modified Finite Newton method over a
//! linear kernel.
//!
//! The outer loop alternates between recomputing the active set of
//! margin-violating examples, solving the Newton system restricted to that
//! active set with conjugate gradient on the least-squares form (CGLS), and
//! taking an exact line-search step along the Newton direction. Because the
//! loss is piecewise quadratic, the line search walks the breakpoints where
//! individual margins change sign and solves the final segment in closed
//! form.
//!
//! Minimizes `0.5·λ·‖w‖² + 0.5·Σ_i C_i·max(0, 1 − y_i·wᵀx_i)²`, where `C_i`
//! is `cneg` for decoy rows and `cpos` for target rows.

use crate::arena::{FeatureArena, RowId};

/// Maximum number of CGLS iterations.
pub const CG_ITER_MAX: usize = 10_000;
/// Reduced CG budget for the first, coarse-tolerance outer pass.
pub const SMALL_CG_ITER_MAX: usize = 10;
/// The tolerance most optimality tests use.
pub const EPSILON: f64 = 1e-7;
/// Coarse tolerance for the annealed first pass.
pub const BIG_EPSILON: f64 = 0.01;
/// Relative objective-decrease stopping criterion for the outer loop.
pub const RELATIVE_STOP_EPS: f64 = 1e-9;
/// Maximum number of outer finite-Newton iterations.
pub const MFN_ITER_MAX: usize = 50;

/// A learned direction: one value per feature plus a trailing bias term.
///
/// Replaced wholesale by each solver call, never patched in place.
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WeightVector {
    values: Vec<f64>,
}

impl WeightVector {
    /// An all-zero vector for `num_features` feature dimensions.
    pub fn zeroed(num_features: usize) -> Self {
        Self {
            values: vec![0.0; num_features + 1],
        }
    }

    /// Wrap an existing `features + bias` value sequence.
    pub fn from_values(values: Vec<f64>) -> Self {
        debug_assert!(!values.is_empty());
        Self { values }
    }

    /// A unit vector along a single feature, optionally negated.
    pub fn single_feature(num_features: usize, index: usize, negate: bool) -> Self {
        let mut w = Self::zeroed(num_features);
        w.values[index] = if negate { -1.0 } else { 1.0 };
        w
    }

    #[inline]
    pub fn num_features(&self) -> usize {
        self.values.len() - 1
    }

    #[inline]
    pub fn bias(&self) -> f64 {
        *self.values.last().unwrap()
    }

    #[inline]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    #[inline]
    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    /// The linear score `w·x + bias` of one feature row.
    #[inline]
    pub fn score(&self, row: &[f64]) -> f64 {
        dot(&self.values, row)
    }
}

/// `w·x + bias` where `w` carries the bias in its last slot and `x` is a
/// bare feature row.
#[inline]
fn dot(w: &[f64], row: &[f64]) -> f64 {
    let n = w.len() - 1;
    let mut acc = w[n];
    for (wi, xi) in w[..n].iter().zip(row) {
        acc = wi.mul_add(*xi, acc);
    }
    acc
}

fn norm_squared(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum()
}

/// Training input for one solver call: decoy rows first, then target rows.
///
/// Labels and per-example costs are derived from position, so one immutable
/// input can be shared by concurrent trainings with different `(cpos, cneg)`
/// pairs.
#[derive(Debug, Default, Clone)]
pub struct SvmInput {
    rows: Vec<RowId>,
    negatives: usize,
    positives: usize,
}

impl SvmInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.negatives = 0;
        self.positives = 0;
    }

    /// Push a decoy row. All negatives must be pushed before any positive.
    pub fn push_negative(&mut self, row: RowId) {
        debug_assert_eq!(self.positives, 0, "negatives must precede positives");
        self.rows.push(row);
        self.negatives += 1;
    }

    pub fn push_positive(&mut self, row: RowId) {
        self.rows.push(row);
        self.positives += 1;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[inline]
    pub fn positives(&self) -> usize {
        self.positives
    }

    #[inline]
    pub fn negatives(&self) -> usize {
        self.negatives
    }

    #[inline]
    fn y(&self, i: usize) -> f64 {
        if i < self.negatives {
            -1.0
        } else {
            1.0
        }
    }

    #[inline]
    fn cost(&self, i: usize, cpos: f64, cneg: f64) -> f64 {
        if i < self.negatives {
            cneg
        } else {
            cpos
        }
    }

    #[inline]
    fn row<'a>(&self, arena: &'a FeatureArena, i: usize) -> &'a [f64] {
        arena.row(self.rows[i])
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SolverOptions {
    /// Regularization weight λ on `‖w‖²`.
    pub lambda: f64,
    pub epsilon: f64,
    pub cg_iter_max: usize,
    pub mfn_iter_max: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            lambda: 1.0,
            epsilon: EPSILON,
            cg_iter_max: CG_ITER_MAX,
            mfn_iter_max: MFN_ITER_MAX,
        }
    }
}

/// How a solver call terminated. Never an error: whatever the route, the
/// best weights found within the budget were written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverOutcome {
    /// All margins satisfied the optimality test at tolerance.
    Optimal,
    /// The objective stopped decreasing in relative terms.
    RelativeCriterion,
    /// The outer iteration cap was reached first.
    IterationLimit,
}

/// Conjugate gradient on the regularized least-squares system restricted to
/// the active subset. Updates `beta` and the outputs of active examples in
/// place; returns whether the residual test passed.
#[allow(clippy::too_many_arguments)]
fn cgls(
    arena: &FeatureArena,
    input: &SvmInput,
    lambda: f64,
    cg_iter_max: usize,
    epsilon: f64,
    active: &[usize],
    beta: &mut [f64],
    outputs: &mut [f64],
    cpos: f64,
    cneg: f64,
) -> bool {
    let n = beta.len();
    let bias = n - 1;

    let mut z: Vec<f64> = active
        .iter()
        .map(|&ii| input.cost(ii, cpos, cneg) * (input.y(ii) - outputs[ii]))
        .collect();
    let mut q = vec![0.0; active.len()];

    let mut r = vec![0.0; n];
    for (j, &ii) in active.iter().enumerate() {
        let row = input.row(arena, ii);
        for (ri, xi) in r.iter_mut().zip(row) {
            *ri += xi * z[j];
        }
        r[bias] += z[j];
    }
    for (ri, bi) in r.iter_mut().zip(beta.iter()) {
        *ri -= lambda * bi;
    }

    let mut p = r.clone();
    let mut omega1 = norm_squared(&r);
    if omega1 <= 0.0 {
        return true;
    }
    let mut omega_p = omega1;
    let epsilon2 = epsilon * epsilon;

    let mut optimality = false;
    let mut cg_iter = 0;
    while cg_iter < cg_iter_max {
        cg_iter += 1;
        let mut omega_q = 0.0;
        for (j, &ii) in active.iter().enumerate() {
            let t = dot(&p, input.row(arena, ii));
            q[j] = t;
            omega_q += input.cost(ii, cpos, cneg) * t * t;
        }
        let denom = lambda * omega_p + omega_q;
        if denom <= 0.0 {
            break;
        }
        let gamma = omega1 / denom;
        let inv_omega2 = 1.0 / omega1;

        for (bi, pi) in beta.iter_mut().zip(p.iter()) {
            *bi += gamma * pi;
        }
        let mut omega_z = 0.0;
        for (j, &ii) in active.iter().enumerate() {
            outputs[ii] += gamma * q[j];
            z[j] -= gamma * input.cost(ii, cpos, cneg) * q[j];
            omega_z += z[j] * z[j];
        }

        r.fill(0.0);
        for (j, &ii) in active.iter().enumerate() {
            let row = input.row(arena, ii);
            for (ri, xi) in r.iter_mut().zip(row) {
                *ri += xi * z[j];
            }
            r[bias] += z[j];
        }
        for (ri, bi) in r.iter_mut().zip(beta.iter()) {
            *ri -= lambda * bi;
        }
        omega1 = norm_squared(&r);
        if omega1 < epsilon2 * omega_z {
            optimality = true;
            break;
        }
        let scale = omega1 * inv_omega2;
        omega_p = 0.0;
        for (pi, ri) in p.iter_mut().zip(r.iter()) {
            *pi = ri + *pi * scale;
            omega_p += *pi * *pi;
        }
    }
    optimality
}

/// Exact line search along `w → w_bar`. The directional derivative of the
/// piecewise-quadratic objective is linear between breakpoints where a
/// margin changes sign, so the breakpoints are walked in order until the
/// derivative would turn non-negative.
fn line_search(
    w: &[f64],
    w_bar: &[f64],
    lambda: f64,
    o: &[f64],
    o_bar: &[f64],
    input: &SvmInput,
    cpos: f64,
    cneg: f64,
) -> f64 {
    let mut omega_l = 0.0;
    let mut omega_r = 0.0;
    for (wi, wbi) in w.iter().zip(w_bar) {
        let diff = wbi - wi;
        omega_l += wi * diff;
        omega_r += wbi * diff;
    }
    let mut l = lambda * omega_l;
    let mut r = lambda * omega_r;

    struct Breakpoint {
        delta: f64,
        index: usize,
        sign: f64,
    }

    let mut breakpoints: Vec<Breakpoint> = Vec::with_capacity(input.len());
    for i in 0..input.len() {
        let y = input.y(i);
        let c = input.cost(i, cpos, cneg);
        let margin_slope = y * (o_bar[i] - o[i]);
        if y * o[i] < 1.0 {
            let diff = c * (o_bar[i] - o[i]);
            l += (o[i] - y) * diff;
            r += (o_bar[i] - y) * diff;
            if margin_slope > 0.0 {
                breakpoints.push(Breakpoint {
                    delta: (1.0 - y * o[i]) / margin_slope,
                    index: i,
                    sign: -1.0,
                });
            }
        } else if margin_slope < 0.0 {
            breakpoints.push(Breakpoint {
                delta: (1.0 - y * o[i]) / margin_slope,
                index: i,
                sign: 1.0,
            });
        }
    }
    breakpoints.sort_unstable_by(|a, b| a.delta.total_cmp(&b.delta));

    for bp in breakpoints.iter() {
        let derivative_here = l + bp.delta * (r - l);
        if derivative_here >= 0.0 {
            break;
        }
        let ii = bp.index;
        let y = input.y(ii);
        let diff = bp.sign * input.cost(ii, cpos, cneg) * (o_bar[ii] - o[ii]);
        l += diff * (o[ii] - y);
        r += diff * (o_bar[ii] - y);
    }
    let slope = r - l;
    if slope <= 0.0 {
        // derivative never turns positive along the direction
        if l < 0.0 {
            1.0
        } else {
            0.0
        }
    } else {
        -l / slope
    }
}

/// Train the weighted L2-SVM on `input`, writing the result into `weights`.
///
/// `weights` seeds the search; the all-zero vector is the usual start. The
/// CG workspace is scoped to this call. Convergence difficulty is never an
/// error: the outcome only records which stopping rule fired, and quality
/// is judged downstream by FDR performance.
pub fn l2_svm_mfn(
    arena: &FeatureArena,
    input: &SvmInput,
    options: &SolverOptions,
    weights: &mut WeightVector,
    cpos: f64,
    cneg: f64,
) -> SolverOutcome {
    let m = input.len();
    let w = weights.values_mut();
    let n = w.len();

    let mut outputs: Vec<f64> = (0..m).map(|i| dot(w, input.row(arena, i))).collect();

    // Annealing heuristic: run the first pass at the coarse tolerance with a
    // small CG budget, then restart the optimality test at full precision.
    let mut epsilon = BIG_EPSILON;
    let mut annealing = true;
    let mut cg_iter_max = SMALL_CG_ITER_MAX;

    let mut f = 0.5 * options.lambda * norm_squared(w);
    let mut active: Vec<usize> = Vec::with_capacity(m);
    let mut inactive: Vec<usize> = Vec::with_capacity(m);
    for i in 0..m {
        let diff = 1.0 - input.y(i) * outputs[i];
        if diff > 0.0 {
            active.push(i);
            f += 0.5 * input.cost(i, cpos, cneg) * diff * diff;
        } else {
            inactive.push(i);
        }
    }

    let mut w_bar = vec![0.0; n];
    let mut o_bar = vec![0.0; m];

    let mut iter = 0;
    while iter < options.mfn_iter_max {
        iter += 1;
        tracing::trace!(
            "MFN iteration {iter} ({} active examples, objective {f:0.6e})",
            active.len()
        );
        w_bar.copy_from_slice(w);
        o_bar.copy_from_slice(&outputs);

        let opt = cgls(
            arena,
            input,
            options.lambda,
            cg_iter_max,
            epsilon,
            &active,
            &mut w_bar,
            &mut o_bar,
            cpos,
            cneg,
        );
        for &ii in inactive.iter() {
            o_bar[ii] = dot(&w_bar, input.row(arena, ii));
        }
        cg_iter_max = options.cg_iter_max;

        let mut opt2 = true;
        for &ii in active.iter() {
            if input.y(ii) * o_bar[ii] > 1.0 + epsilon {
                opt2 = false;
                break;
            }
        }
        if opt2 {
            for &ii in inactive.iter() {
                if input.y(ii) * o_bar[ii] < 1.0 - epsilon {
                    opt2 = false;
                    break;
                }
            }
        }
        if opt && opt2 {
            if annealing {
                annealing = false;
                epsilon = options.epsilon;
                continue;
            }
            w.copy_from_slice(&w_bar);
            return SolverOutcome::Optimal;
        }

        let delta = line_search(
            w, &w_bar, options.lambda, &outputs, &o_bar, input, cpos, cneg,
        );
        let f_old = f;
        f = 0.0;
        for (wi, wbi) in w.iter_mut().zip(w_bar.iter()) {
            *wi += delta * (wbi - *wi);
            f += *wi * *wi;
        }
        f *= 0.5 * options.lambda;
        active.clear();
        inactive.clear();
        for i in 0..m {
            outputs[i] += delta * (o_bar[i] - outputs[i]);
            let diff = 1.0 - input.y(i) * outputs[i];
            if diff > 0.0 {
                active.push(i);
                f += 0.5 * input.cost(i, cpos, cneg) * diff * diff;
            } else {
                inactive.push(i);
            }
        }
        if (f - f_old).abs() < RELATIVE_STOP_EPS * f_old.abs() {
            return SolverOutcome::RelativeCriterion;
        }
    }
    SolverOutcome::IterationLimit
}

/// The objective value of `weights` on `input`, exposed for tests and
/// diagnostics.
pub fn objective(
    arena: &FeatureArena,
    input: &SvmInput,
    lambda: f64,
    weights: &WeightVector,
    cpos: f64,
    cneg: f64,
) -> f64 {
    let mut f = 0.5 * lambda * norm_squared(weights.values());
    for i in 0..input.len() {
        let o = dot(weights.values(), input.row(arena, i));
        let diff = 1.0 - input.y(i) * o;
        if diff > 0.0 {
            f += 0.5 * input.cost(i, cpos, cneg) * diff * diff;
        }
    }
    f
}

#[cfg(test)]
mod test {
    use super::*;

    fn separable_input() -> (FeatureArena, SvmInput) {
        let mut arena = FeatureArena::new(2);
        let mut input = SvmInput::new();
        // decoys first
        input.push_negative(arena.acquire_from(&[-1.0, -1.0]));
        input.push_negative(arena.acquire_from(&[-1.5, -0.5]));
        input.push_positive(arena.acquire_from(&[1.0, 1.0]));
        input.push_positive(arena.acquire_from(&[0.5, 1.5]));
        (arena, input)
    }

    #[test]
    fn test_solver_separates_and_descends() {
        let (arena, input) = separable_input();
        let options = SolverOptions::default();
        let mut weights = WeightVector::zeroed(2);
        let f0 = objective(&arena, &input, options.lambda, &weights, 1.0, 1.0);
        let outcome = l2_svm_mfn(&arena, &input, &options, &mut weights, 1.0, 1.0);
        let f1 = objective(&arena, &input, options.lambda, &weights, 1.0, 1.0);
        assert!(f1 <= f0, "solver must not worsen the objective: {f1} > {f0}");
        assert!(!matches!(outcome, SolverOutcome::IterationLimit));
        for i in 0..input.len() {
            let o = weights.score(input.row(&arena, i));
            assert!(
                o * input.y(i) > 0.0,
                "example {i} misclassified (output {o})"
            );
        }
    }

    #[test]
    fn test_asymmetric_costs_shift_decision() {
        let (arena, input) = separable_input();
        let options = SolverOptions::default();
        let mut balanced = WeightVector::zeroed(2);
        l2_svm_mfn(&arena, &input, &options, &mut balanced, 1.0, 1.0);
        let mut skewed = WeightVector::zeroed(2);
        l2_svm_mfn(&arena, &input, &options, &mut skewed, 10.0, 0.1);
        // a heavier positive cost pushes the boundary toward the negatives,
        // raising the outputs of the positive examples
        let pos_balanced = balanced.score(input.row(&arena, 2));
        let pos_skewed = skewed.score(input.row(&arena, 2));
        assert!(pos_skewed > pos_balanced);
    }

    #[test]
    fn test_empty_active_set_degenerates_gracefully() {
        let (arena, input) = separable_input();
        let options = SolverOptions::default();
        // seed with a direction that already classifies everything with a
        // wide margin: no active examples on entry
        let mut weights = WeightVector::from_values(vec![10.0, 10.0, 0.0]);
        let outcome = l2_svm_mfn(&arena, &input, &options, &mut weights, 1.0, 1.0);
        assert!(!matches!(outcome, SolverOutcome::IterationLimit));
    }

    #[test]
    fn test_single_feature_weight() {
        let w = WeightVector::single_feature(3, 1, true);
        assert_eq!(w.values(), &[0.0, -1.0, 0.0, 0.0]);
        assert_eq!(w.num_features(), 3);
        assert_eq!(w.bias(), 0.0);
        assert_eq!(w.score(&[2.0, 3.0, 4.0]), -3.0);
    }
}
