//! Peptide-spectrum match records and their identifying keys.

use std::fmt;
use std::sync::Arc;

/// Whether a PSM matched the real database or the decoy database.
///
/// Decoys never change class; they are the null-distribution proxy that the
/// FDR machinery counts against.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LabelClass {
    Decoy,
    #[default]
    Target,
}

impl LabelClass {
    #[inline]
    pub fn is_target(&self) -> bool {
        matches!(self, Self::Target)
    }

    #[inline]
    pub fn is_decoy(&self) -> bool {
        matches!(self, Self::Decoy)
    }

    /// The label as seen by the SVM, `+1` for targets and `-1` for decoys.
    #[inline]
    pub fn y(&self) -> f64 {
        match self {
            Self::Target => 1.0,
            Self::Decoy => -1.0,
        }
    }
}

/// Integer mixing hash. `std` hashers may be the identity function for
/// integers, which would defeat the shuffling that fold assignment relies
/// on, so the key is mixed explicitly.
#[inline]
pub fn mix_u32(mut x: u32) -> u32 {
    x = ((x >> 16) ^ x).wrapping_mul(0x45d9f3b);
    x = ((x >> 16) ^ x).wrapping_mul(0x45d9f3b);
    (x >> 16) ^ x
}

/// The spectrum a PSM was matched against: the scan number within one
/// input file, plus the index of that file.
///
/// All PSMs sharing a [`SpectrumId`] must land in the same cross-validation
/// fold, so the id doubles as the fold-grouping key.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SpectrumId {
    pub file_index: u32,
    pub scan: u32,
}

impl SpectrumId {
    pub fn new(file_index: u32, scan: u32) -> Self {
        Self { file_index, scan }
    }

    /// A pre-mixed key suitable for identity-hashed maps and for visiting
    /// spectra in a shuffled but deterministic order.
    #[inline]
    pub fn key(&self) -> u64 {
        (mix_u32(self.file_index) as u64) ^ ((mix_u32(self.scan) as u64) << 1)
    }
}

impl fmt::Display for SpectrumId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_index, self.scan)
    }
}

/// The immutable metadata of one peptide-spectrum match.
///
/// Feature values live in the [`FeatureArena`](crate::arena::FeatureArena),
/// not here. Instances are shared behind an [`Arc`] between the full
/// collection and the per-fold working sets.
#[derive(Debug, Default, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Psm {
    /// The identifier carried through from the input, e.g. a spectrum title.
    pub id: String,
    pub spectrum: SpectrumId,
    /// Experimental (observed) precursor mass.
    pub exp_mass: f64,
    /// Calculated (theoretical) mass of the matched peptide.
    pub calc_mass: f64,
    /// The matched peptide sequence, including flanking residues if present.
    pub peptide: String,
    pub proteins: Vec<String>,
}

impl Psm {
    pub fn new(id: String, spectrum: SpectrumId, peptide: String) -> Self {
        Self {
            id,
            spectrum,
            peptide,
            ..Default::default()
        }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mix_spreads_consecutive_scans() {
        let keys: Vec<u64> = (0..16u32)
            .map(|scan| SpectrumId::new(0, scan).key())
            .collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), keys.len());
        // consecutive scans must not stay in scan order once mixed
        let in_order = keys.windows(2).filter(|w| w[0] < w[1]).count();
        assert!(in_order < 15);
    }

    #[test]
    fn test_label_sign() {
        assert_eq!(LabelClass::Target.y(), 1.0);
        assert_eq!(LabelClass::Decoy.y(), -1.0);
        assert!(LabelClass::Target > LabelClass::Decoy);
    }
}
