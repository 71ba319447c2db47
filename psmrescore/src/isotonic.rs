//! Isotonic regression and the decoy-rate-to-PEP transform built on it.
//!
//! The pool-adjacent-violators algorithm (PAVA) fits the best
//! least-squares non-decreasing sequence to its input by merging adjacent
//! blocks whose means are out of order. Applied to the 0/1 decoy indicator
//! of a score-sorted PSM list it yields a monotone estimate of the local
//! decoy rate, which converts directly into a posterior error probability.

/// One merged run of consecutive inputs sharing a fitted value.
#[derive(Debug, Clone, Copy)]
struct Block {
    sum: f64,
    count: usize,
}

impl Block {
    #[inline]
    fn mean(&self) -> f64 {
        self.sum / self.count as f64
    }

    #[inline]
    fn absorb(&mut self, other: Block) {
        self.sum += other.sum;
        self.count += other.count;
    }
}

/// The least-squares non-decreasing fit to `values`.
///
/// Output has the same length as the input; ties in the input are
/// preserved and an already-sorted input comes back unchanged.
pub fn pava_non_decreasing(values: &[f64]) -> Vec<f64> {
    let mut blocks: Vec<Block> = Vec::with_capacity(values.len());
    for &v in values {
        let mut block = Block { sum: v, count: 1 };
        while let Some(last) = blocks.last() {
            if last.mean() > block.mean() {
                block.absorb(blocks.pop().unwrap());
            } else {
                break;
            }
        }
        blocks.push(block);
    }
    let mut out = Vec::with_capacity(values.len());
    for block in blocks {
        let mean = block.mean();
        out.extend(std::iter::repeat(mean).take(block.count));
    }
    out
}

/// Smallest admissible complement of a decoy rate, keeping `rate / (1 - rate)`
/// finite.
const MIN_RATE_COMPLEMENT: f64 = 1e-20;

/// Posterior error probabilities from a score-sorted decoy indicator.
///
/// `is_decoy` must be ordered from best score to worst. A pseudo
/// observation of `0.5` is prepended before the fit so the best-scoring
/// region is not forced to a zero rate, then dropped again. Each fitted
/// decoy rate `r` becomes `pep = r / (1 - r)`, clamped to `[0, 1]`, and the
/// PAVA monotonicity guarantees the PEPs never improve as scores worsen.
pub fn tdc_to_pep(is_decoy: &[bool]) -> Vec<f64> {
    if is_decoy.is_empty() {
        return Vec::new();
    }
    let mut indicator = Vec::with_capacity(is_decoy.len() + 1);
    indicator.push(0.5);
    indicator.extend(is_decoy.iter().map(|d| if *d { 1.0 } else { 0.0 }));
    let fitted = pava_non_decreasing(&indicator);
    fitted[1..]
        .iter()
        .map(|&rate| {
            let rate = rate.min(1.0 - MIN_RATE_COMPLEMENT);
            (rate / (1.0 - rate)).min(1.0)
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn assert_close(a: &[f64], b: &[f64]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-12, "{a:?} != {b:?}");
        }
    }

    #[test]
    fn test_sorted_input_unchanged() {
        let values = [0.0, 0.25, 0.25, 0.5, 1.0];
        assert_close(&pava_non_decreasing(&values), &values);
    }

    #[test]
    fn test_violators_pool_to_mean() {
        assert_close(&pava_non_decreasing(&[3.0, 1.0, 2.0]), &[2.0, 2.0, 2.0]);
        assert_close(
            &pava_non_decreasing(&[1.0, 3.0, 2.0, 4.0]),
            &[1.0, 2.5, 2.5, 4.0],
        );
    }

    #[test]
    fn test_cascading_merge() {
        // the final low value drags the two blocks before it down to their
        // pooled mean, (2 + 3 + 0) / 3
        assert_close(
            &pava_non_decreasing(&[1.0, 2.0, 3.0, 0.0]),
            &[1.0, 5.0 / 3.0, 5.0 / 3.0, 5.0 / 3.0],
        );
    }

    #[test]
    fn test_pep_monotone_and_bounded() {
        let mut is_decoy = vec![false; 50];
        is_decoy.extend([true, false].iter().cycle().take(30).copied());
        is_decoy.extend(vec![true; 20]);
        let peps = tdc_to_pep(&is_decoy);
        assert_eq!(peps.len(), is_decoy.len());
        for pair in peps.windows(2) {
            assert!(pair[0] <= pair[1] + 1e-12);
        }
        for &p in &peps {
            assert!((0.0..=1.0).contains(&p));
        }
        // decoy-free head stays near zero, decoy-only tail saturates
        assert!(peps[0] < 0.05);
        assert!(*peps.last().unwrap() > 0.5);
    }

    #[test]
    fn test_pep_all_targets_not_forced_to_zero() {
        let peps = tdc_to_pep(&[false; 10]);
        // the pseudo observation keeps the fit strictly positive
        assert!(peps.iter().all(|&p| p > 0.0 && p < 0.1));
    }

    #[test]
    fn test_pep_empty() {
        assert!(tdc_to_pep(&[]).is_empty());
    }
}
