//! The error type returned for the "shape or invariant violation" class of failure from the
//! error-handling design (programmer errors, not the recoverable numerical failures a training
//! run is expected to see and shrug off — those are reported through an `ok` flag instead, see
//! [`crate::driver`]).

use thiserror::Error;

/// Unrecoverable misuse of the core: bad shapes, inconsistent supervision, or a malformed graph.
///
/// None of these are expected to occur for a correctly wired-up training loop; they exist to
/// catch integration bugs early rather than let them silently corrupt a gradient.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChainError {
    #[error("score matrix has {rows} rows, expected frames_per_sequence * num_sequences = {expected} ({t} * {s})")]
    ScoreMatrixShape {
        rows: usize,
        expected: usize,
        t: usize,
        s: usize,
    },

    #[error("score matrix has {cols} columns, expected num_pdfs = {expected}")]
    ScoreMatrixPdfCount { cols: usize, expected: usize },

    #[error("gradient buffer shape {found:?} does not match score matrix shape {expected:?}")]
    GradientShapeMismatch {
        found: (usize, usize),
        expected: (usize, usize),
    },

    #[error("KL-mode target posterior matrix shape {found:?} does not match score matrix shape {expected:?}")]
    TargetPosteriorShapeMismatch {
        found: (usize, usize),
        expected: (usize, usize),
    },

    #[error("generic/compact supervision carries {found} sequences, expected {expected}")]
    SequenceCountMismatch { found: usize, expected: usize },

    #[error("leaky_hmm_coefficient must be > 0, got {0}")]
    NonPositiveLeakyHmmCoefficient(f64),

    #[error("denominator graph has no states")]
    EmptyDenominatorGraph,

    #[error("denominator graph arc references out-of-range pdf-id {pdf_id} (num_pdfs = {num_pdfs})")]
    PdfIdOutOfRange { pdf_id: usize, num_pdfs: usize },

    #[error("denominator graph arc references out-of-range state {state} (num_states = {num_states})")]
    StateOutOfRange { state: usize, num_states: usize },

    #[error("power iteration for the stationary distribution did not converge within {iters} iterations (residual {residual:e})")]
    StationaryDistributionDidNotConverge { iters: usize, residual: f64 },

    #[error("SMBR training requires numerator posteriors and is undefined for KL-mode supervision")]
    SmbrRequiresNumeratorSupervision,

    #[error("exclude_silence/one_silence_class requested but no silence index vector was provided")]
    MissingSilenceIndices,
}
