//! Semi-supervised rescoring of peptide-spectrum match (PSM) collections.
//!
//! The library trains a linear discriminant between target and decoy PSMs
//! where the positive training labels are inferred from a target-decoy
//! competition, iterating between an L2-SVM solver and an FDR calibration
//! pass inside a spectrum-grouped cross-validation loop. The final artifact
//! is the merged, globally re-calibrated collection carrying a score,
//! q-value, and posterior error probability per PSM.

pub mod api;
pub mod arena;
pub mod crossval;
pub mod direction;
pub mod isotonic;
pub mod normalize;
pub mod posterior;
pub mod psm;
pub mod random;
pub mod scores;
pub mod solver;

pub use crate::api::{
    DatasetError, PsmDataset, RescoreEngine, RescoreError, RescoreOutcome, RescoreParams,
};
pub use crate::crossval::CrossValidationParams;
pub use crate::direction::DirectionSource;
pub use crate::normalize::NormalizationKind;
pub use crate::psm::{LabelClass, Psm, SpectrumId};
pub use crate::scores::{ScoreSet, ScoredPsm};
pub use crate::solver::{SolverOptions, WeightVector};
