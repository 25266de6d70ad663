//! Recognized options for the chain driver (§6 of the spec). This is a plain data struct; it
//! does no parsing of its own beyond the `Default` values documented in the spec. Splitting
//! `silence_pdfs_str` into an index vector is a boundary concern and lives in
//! [`crate::silence::parse_silence_pdfs`], not here.

use serde::{Deserialize, Serialize};

/// Training-time options consumed by [`crate::driver::compute_chain_objf_and_deriv`] and
/// [`crate::driver::compute_chain_smbr_objf_and_deriv`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainTrainingOptions {
    /// Coefficient of the squared-Frobenius penalty on `X` (or, in norm-regularize mode, on
    /// `exp(X)`). Zero disables the regularizer entirely.
    pub l2_regularize: f64,
    /// When true (and SMBR is in use) switch the L2 penalty to `-lambda * sum(exp(X))`.
    pub norm_regularize: bool,
    /// `kappa` in the leaky-HMM mix (§4.2). Must be strictly positive; see
    /// [`ChainTrainingOptions::validate`].
    pub leaky_hmm_coefficient: f64,
    /// Non-zero tells the driver to populate `dX_xent`; the numeric value itself is used only by
    /// the (external) neural network code that trains the cross-entropy regularizer output.
    pub xent_regularize: f64,
    /// Selects the SMBR driver instead of the MMI/KL driver.
    pub use_smbr_objective: bool,
    /// Interpolation weight for the MMI term when `use_smbr_objective` is set.
    pub mmi_factor: f64,
    /// Interpolation weight for the SMBR term when `use_smbr_objective` is set.
    pub smbr_factor: f64,
    /// SMBR only: zero out the numerator-posterior accuracy at silence columns.
    pub exclude_silence: bool,
    /// SMBR only: treat all silence classes as a single class by summing and broadcasting their
    /// posterior mass before using it as an accuracy target.
    pub one_silence_class: bool,
    /// Verbosity level; `>= 1` additionally logs the per-frame gradient-norm diagnostic of §4.1
    /// step 8.
    pub verbosity: i32,
}

impl Default for ChainTrainingOptions {
    fn default() -> Self {
        Self {
            l2_regularize: 0.0,
            norm_regularize: false,
            leaky_hmm_coefficient: 1e-5,
            xent_regularize: 0.0,
            use_smbr_objective: false,
            mmi_factor: 0.0,
            smbr_factor: 1.0,
            exclude_silence: false,
            one_silence_class: false,
            verbosity: 0,
        }
    }
}

impl ChainTrainingOptions {
    /// Checks the invariants the driver relies on (§7 "configuration inconsistency" /
    /// §9 "refuse kappa <= 0"). This is cheap and the driver always calls it first.
    pub fn validate(&self) -> Result<(), crate::error::ChainError> {
        if self.leaky_hmm_coefficient <= 0.0 {
            return Err(crate::error::ChainError::NonPositiveLeakyHmmCoefficient(
                self.leaky_hmm_coefficient,
            ));
        }
        Ok(())
    }

    /// Whether `dX_xent` should be populated for this call, per §4.1 step 4.
    pub fn wants_xent_gradient(&self) -> bool {
        self.xent_regularize != 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let opts = ChainTrainingOptions::default();
        assert_eq!(opts.l2_regularize, 0.0);
        assert_eq!(opts.leaky_hmm_coefficient, 1e-5);
        assert!(!opts.use_smbr_objective);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn rejects_nonpositive_leaky_hmm() {
        let mut opts = ChainTrainingOptions::default();
        opts.leaky_hmm_coefficient = 0.0;
        assert!(opts.validate().is_err());
        opts.leaky_hmm_coefficient = -1e-3;
        assert!(opts.validate().is_err());
    }
}
