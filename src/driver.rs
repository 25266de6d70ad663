//! The driver (§4.1): the one pure-function entry point external callers use. Everything else in
//! this crate exists to be composed here.

use ndarray::Array2;
use tracing::{debug, warn};

use crate::denominator::DenominatorComputation;
use crate::denominator_graph::DenominatorGraph;
use crate::denominator_smbr::DenominatorSmbrComputation;
use crate::error::ChainError;
use crate::generic_numerator::GenericNumeratorComputation;
use crate::numerator::NumeratorComputation;
use crate::options::ChainTrainingOptions;
use crate::silence;
use crate::supervision::{Supervision, SupervisionKind};

/// Outputs of [`compute_chain_objf_and_deriv`] (§6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainObjf {
    pub objf: f64,
    pub l2_term: f64,
    pub weight: f64,
}

/// Outputs of [`compute_chain_smbr_objf_and_deriv`] (§6, §4.4).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmbrObjf {
    pub objf: f64,
    pub mmi_objf: f64,
    pub l2_term: f64,
    pub weight: f64,
}

/// Default substituted objective for a minibatch the §7 numerical-failure policy has to discard.
const FAILURE_OBJF_SCALE: f64 = -10.0;

fn validate_shapes(
    supervision: &Supervision,
    den_graph: &DenominatorGraph,
    x: &Array2<f64>,
    dx: &Option<&mut Array2<f64>>,
    dx_xent: &Option<&mut Array2<f64>>,
) -> Result<(), ChainError> {
    let expected_rows = supervision.num_sequences * supervision.frames_per_sequence;
    if x.nrows() != expected_rows {
        return Err(ChainError::ScoreMatrixShape {
            rows: x.nrows(),
            expected: expected_rows,
            t: supervision.frames_per_sequence,
            s: supervision.num_sequences,
        });
    }
    if x.ncols() != den_graph.num_pdfs() {
        return Err(ChainError::ScoreMatrixPdfCount {
            cols: x.ncols(),
            expected: den_graph.num_pdfs(),
        });
    }
    if let Some(dx) = dx.as_ref() {
        if dx.dim() != x.dim() {
            return Err(ChainError::GradientShapeMismatch {
                found: dx.dim(),
                expected: x.dim(),
            });
        }
    }
    if let Some(dx_xent) = dx_xent.as_ref() {
        if dx_xent.dim() != x.dim() {
            return Err(ChainError::GradientShapeMismatch {
                found: dx_xent.dim(),
                expected: x.dim(),
            });
        }
    }
    Ok(())
}

fn log_gradient_norm_diagnostic(dx: &Array2<f64>, num_sequences: usize) {
    let frames = dx.nrows() / num_sequences.max(1);
    let mut max_norm = 0.0_f64;
    let mut sum_norm = 0.0_f64;
    for row in dx.rows() {
        let norm: f64 = row.iter().map(|v| v * v).sum();
        max_norm = max_norm.max(norm);
        sum_norm += norm;
    }
    let mean_norm = if dx.nrows() > 0 {
        sum_norm / dx.nrows() as f64
    } else {
        0.0
    };
    debug!(
        frames,
        mean_squared_grad_norm = mean_norm,
        max_squared_grad_norm = max_norm,
        "per-frame gradient norm diagnostic"
    );
}

/// Adds the L2/norm regularizer contribution (§4.1 step 7) into `l2_term` and, if present, `dx`.
fn apply_l2_regularizer(
    opts: &ChainTrainingOptions,
    weight: f64,
    x: &Array2<f64>,
    dx: Option<&mut Array2<f64>>,
) -> f64 {
    if opts.l2_regularize == 0.0 {
        return 0.0;
    }
    let lambda = opts.l2_regularize;
    if opts.norm_regularize {
        let sum_exp: f64 = x.mapv(f64::exp).sum();
        let l2_term = -weight * lambda * sum_exp;
        if let Some(dx) = dx {
            let contribution = x.mapv(|v| -weight * lambda * v.exp());
            *dx += &contribution;
        }
        l2_term
    } else {
        let frob_sq: f64 = x.iter().map(|v| v * v).sum();
        let l2_term = -0.5 * weight * lambda * frob_sq;
        if let Some(dx) = dx {
            let contribution = x.mapv(|v| -weight * lambda * v);
            *dx += &contribution;
        }
        l2_term
    }
}

/// The MMI/KL driver (§4.1). `supervision.weight` is the scalar `w`; the returned `weight` field
/// is `w * S * T`.
pub fn compute_chain_objf_and_deriv(
    opts: &ChainTrainingOptions,
    den_graph: &DenominatorGraph,
    supervision: &Supervision,
    x: &Array2<f64>,
    mut dx: Option<&mut Array2<f64>>,
    mut dx_xent: Option<&mut Array2<f64>>,
) -> Result<ChainObjf, ChainError> {
    opts.validate()?;
    validate_shapes(supervision, den_graph, x, &dx, &dx_xent)?;

    let w = supervision.weight;
    let weight = w * supervision.num_sequences as f64 * supervision.frames_per_sequence as f64;

    if let Some(dx) = dx.as_deref_mut() {
        dx.fill(0.0);
    }
    if let Some(dx_xent) = dx_xent.as_deref_mut() {
        dx_xent.fill(0.0);
    }

    let (log_z_den, den_ok) = {
        let mut den_comp = DenominatorComputation::new(
            den_graph,
            x,
            supervision.num_sequences,
            supervision.frames_per_sequence,
            opts.leaky_hmm_coefficient,
        );
        let (log_z_den, mut den_ok) = den_comp.forward();
        if let Some(dx) = dx.as_deref_mut() {
            den_ok &= den_comp.backward(w, dx);
        }
        (log_z_den, den_ok)
    };

    let (num_logprob_weighted, num_ok) = match &supervision.kind {
        SupervisionKind::Compact(graphs) => {
            let comp = NumeratorComputation::new(graphs, supervision.num_sequences, w);
            let (logprob, ok) = comp.forward(x);
            if let Some(dx) = dx.as_deref_mut() {
                let mut posterior = Array2::<f64>::zeros(x.dim());
                let post_ok = comp.backward(x, &mut posterior);
                *dx += &posterior;
                if let Some(dx_xent) = dx_xent.as_deref_mut() {
                    if opts.wants_xent_gradient() {
                        dx_xent.assign(&posterior);
                    }
                }
                (logprob, ok && post_ok)
            } else {
                (logprob, ok)
            }
        }
        SupervisionKind::Generic(graphs) => {
            let comp = GenericNumeratorComputation::new(graphs, supervision.num_sequences, w);
            let (logprob, ok) = comp.forward(x);
            if let Some(dx) = dx.as_deref_mut() {
                let mut posterior = Array2::<f64>::zeros(x.dim());
                let post_ok = comp.backward(x, &mut posterior);
                *dx += &posterior;
                if let Some(dx_xent) = dx_xent.as_deref_mut() {
                    if opts.wants_xent_gradient() {
                        dx_xent.assign(&posterior);
                    }
                }
                (logprob, ok && post_ok)
            } else {
                (logprob, ok)
            }
        }
        SupervisionKind::Kl(q) => {
            if let Some(dx) = dx.as_deref_mut() {
                let weighted_q = q.mapv(|v| v * w);
                *dx += &weighted_q;
                if let Some(dx_xent) = dx_xent.as_deref_mut() {
                    if opts.wants_xent_gradient() {
                        dx_xent.assign(&weighted_q);
                    }
                }
            }
            (0.0, true)
        }
    };

    let mut objf = num_logprob_weighted - w * log_z_den;

    if !objf.is_finite() || !den_ok || !num_ok {
        warn!(
            den_ok,
            num_ok, objf, "chain minibatch failed numerically, substituting default objective"
        );
        if let Some(dx) = dx.as_deref_mut() {
            dx.fill(0.0);
        }
        if let Some(dx_xent) = dx_xent.as_deref_mut() {
            dx_xent.fill(0.0);
        }
        objf = FAILURE_OBJF_SCALE * weight;
        return Ok(ChainObjf {
            objf,
            l2_term: 0.0,
            weight,
        });
    }

    let l2_term = apply_l2_regularizer(opts, weight, x, dx.as_deref_mut());

    if opts.verbosity >= 1 {
        if let Some(dx) = dx.as_deref() {
            log_gradient_norm_diagnostic(dx, supervision.num_sequences);
        }
    }

    Ok(ChainObjf {
        objf,
        l2_term,
        weight,
    })
}

/// The SMBR driver (§4.4). KL supervision is rejected (undefined for SMBR, §4.4).
///
/// Whether `silence_indices` must be `Some` is a configuration-consistency question, not a
/// core invariant (§7): callers are responsible for rejecting `opts.exclude_silence` or
/// `opts.one_silence_class` with no `silence_indices` at their own configuration boundary before
/// reaching this function. If `silence_indices` is `None` here, silence masking is simply
/// skipped.
pub fn compute_chain_smbr_objf_and_deriv(
    opts: &ChainTrainingOptions,
    den_graph: &DenominatorGraph,
    supervision: &Supervision,
    x: &Array2<f64>,
    silence_indices: Option<&[i32]>,
    mut dx: Option<&mut Array2<f64>>,
    mut dx_xent: Option<&mut Array2<f64>>,
) -> Result<SmbrObjf, ChainError> {
    opts.validate()?;
    validate_shapes(supervision, den_graph, x, &dx, &dx_xent)?;

    let graphs = match &supervision.kind {
        SupervisionKind::Compact(graphs) | SupervisionKind::Generic(graphs) => graphs,
        SupervisionKind::Kl(_) => return Err(ChainError::SmbrRequiresNumeratorSupervision),
    };
    let is_generic = matches!(supervision.kind, SupervisionKind::Generic(_));

    let w = supervision.weight;
    let weight = w * supervision.num_sequences as f64 * supervision.frames_per_sequence as f64;
    let mu = opts.mmi_factor;

    if let Some(dx) = dx.as_deref_mut() {
        dx.fill(0.0);
    }
    if let Some(dx_xent) = dx_xent.as_deref_mut() {
        dx_xent.fill(0.0);
    }

    let mut posterior = Array2::<f64>::zeros(x.dim());
    let (num_logprob_weighted, num_ok) = if is_generic {
        let comp = GenericNumeratorComputation::new(graphs, supervision.num_sequences, w);
        let (logprob, ok) = comp.forward(x);
        let post_ok = comp.backward(x, &mut posterior);
        (logprob, ok && post_ok)
    } else {
        let comp = NumeratorComputation::new(graphs, supervision.num_sequences, w);
        let (logprob, ok) = comp.forward(x);
        let post_ok = comp.backward(x, &mut posterior);
        (logprob, ok && post_ok)
    };

    if let Some(dx_xent) = dx_xent.as_deref_mut() {
        if opts.wants_xent_gradient() {
            dx_xent.assign(&posterior);
        }
    }

    let mut accuracy = posterior.clone();
    if let Some(sil) = silence_indices {
        if opts.exclude_silence {
            silence::exclude_silence(&mut accuracy, sil);
        } else if opts.one_silence_class {
            silence::one_silence_class(&mut accuracy, sil);
        }
    }

    let mut smbr_comp = DenominatorSmbrComputation::new(
        den_graph,
        x,
        accuracy,
        supervision.num_sequences,
        supervision.frames_per_sequence,
        opts.leaky_hmm_coefficient,
    );
    let (smbr_acc_total, neg_log_z_total, smbr_ok) = smbr_comp.forward();

    let mut objf = smbr_acc_total * w;
    let mut mmi_objf = w * neg_log_z_total + mu * num_logprob_weighted;

    if !objf.is_finite() || !mmi_objf.is_finite() || !smbr_ok || !num_ok {
        warn!(
            smbr_ok,
            num_ok, objf, mmi_objf, "SMBR minibatch failed numerically, substituting default objective"
        );
        if let Some(dx) = dx.as_deref_mut() {
            dx.fill(0.0);
        }
        if let Some(dx_xent) = dx_xent.as_deref_mut() {
            dx_xent.fill(0.0);
        }
        objf = FAILURE_OBJF_SCALE * weight;
        mmi_objf = -mu * FAILURE_OBJF_SCALE.abs() * weight;
        return Ok(SmbrObjf {
            objf,
            mmi_objf,
            l2_term: 0.0,
            weight,
        });
    }

    if let Some(dx) = dx.as_deref_mut() {
        smbr_comp.backward(w, dx);
        if mu != 0.0 {
            let mu_term = posterior.mapv(|v| v * mu);
            *dx += &mu_term;
        }
    }

    let l2_term = apply_l2_regularizer(opts, weight, x, dx.as_deref_mut());

    if opts.verbosity >= 1 {
        if let Some(dx) = dx.as_deref() {
            log_gradient_norm_diagnostic(dx, supervision.num_sequences);
        }
    }

    Ok(SmbrObjf {
        objf,
        mmi_objf,
        l2_term,
        weight,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fst::{StdArc, StdFst};
    use crate::supervision::NumeratorGraph;
    use ndarray::Array2;

    fn single_state_graph(num_pdfs: usize) -> DenominatorGraph {
        let mut fst = StdFst::new(1);
        for pdf in 0..num_pdfs {
            fst.add_arc(0, StdArc::new(0, pdf, 0.0));
        }
        DenominatorGraph::build(&fst, num_pdfs).unwrap()
    }

    #[test]
    fn scenario_s1_single_state_zero_scores_zero_objf() {
        let graph = single_state_graph(1);
        let sup = Supervision::compact(1, 3, 1.0, vec![NumeratorGraph::linear_chain(&[0, 0, 0])])
            .unwrap();
        let x = Array2::<f64>::zeros((3, 1));
        let mut dx = Array2::<f64>::zeros((3, 1));
        let opts = ChainTrainingOptions::default();

        let result =
            compute_chain_objf_and_deriv(&opts, &graph, &sup, &x, Some(&mut dx), None).unwrap();

        assert!(result.objf.abs() < 1e-6, "objf = {}", result.objf);
        assert!((result.weight - 3.0).abs() < 1e-9);
        for v in dx.iter() {
            assert!(v.abs() < 1e-6);
        }
    }

    #[test]
    fn scenario_s3_non_finite_input_falls_back_to_default_objf() {
        let graph = single_state_graph(1);
        let sup = Supervision::compact(1, 2, 1.0, vec![NumeratorGraph::linear_chain(&[0, 0])])
            .unwrap();
        let mut x = Array2::<f64>::zeros((2, 1));
        x[(0, 0)] = f64::INFINITY;
        let mut dx = Array2::<f64>::zeros((2, 1));
        let mut dx_xent = Array2::<f64>::zeros((2, 1));
        let opts = ChainTrainingOptions::default();

        let result = compute_chain_objf_and_deriv(
            &opts,
            &graph,
            &sup,
            &x,
            Some(&mut dx),
            Some(&mut dx_xent),
        )
        .unwrap();

        assert!((result.objf - FAILURE_OBJF_SCALE * result.weight).abs() < 1e-9);
        assert!(dx.iter().all(|&v| v == 0.0));
        assert!(dx_xent.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn weight_is_w_times_s_times_t() {
        let graph = single_state_graph(1);
        let sup = Supervision::compact(
            2,
            4,
            0.5,
            vec![
                NumeratorGraph::linear_chain(&[0, 0, 0, 0]),
                NumeratorGraph::linear_chain(&[0, 0, 0, 0]),
            ],
        )
        .unwrap();
        let x = Array2::<f64>::zeros((8, 1));
        let opts = ChainTrainingOptions::default();
        let result = compute_chain_objf_and_deriv(&opts, &graph, &sup, &x, None, None).unwrap();
        assert!((result.weight - 0.5 * 2.0 * 4.0).abs() < 1e-9);
    }

    #[test]
    fn l2_regularizer_matches_closed_form() {
        let graph = single_state_graph(1);
        let sup = Supervision::compact(1, 2, 1.0, vec![NumeratorGraph::linear_chain(&[0, 0])])
            .unwrap();
        let x = Array2::from_shape_vec((2, 1), vec![0.5, -0.25]).unwrap();

        let mut dx_plain = Array2::<f64>::zeros((2, 1));
        let opts_plain = ChainTrainingOptions::default();
        compute_chain_objf_and_deriv(&opts_plain, &graph, &sup, &x, Some(&mut dx_plain), None)
            .unwrap();

        let mut dx_l2 = Array2::<f64>::zeros((2, 1));
        let mut opts_l2 = ChainTrainingOptions::default();
        opts_l2.l2_regularize = 0.1;
        let result = compute_chain_objf_and_deriv(&opts_l2, &graph, &sup, &x, Some(&mut dx_l2), None)
            .unwrap();

        let expected_l2 = -0.5 * 0.1 * (0.5f64.powi(2) + 0.25f64.powi(2));
        assert!((result.l2_term - expected_l2).abs() < 1e-9);

        for t in 0..2 {
            let expected_contribution = -0.1 * x[(t, 0)];
            let actual_contribution = dx_l2[(t, 0)] - dx_plain[(t, 0)];
            assert!((actual_contribution - expected_contribution).abs() < 1e-9);
        }
    }

    #[test]
    fn smbr_rejects_kl_supervision() {
        let graph = single_state_graph(1);
        let q = Array2::<f64>::zeros((2, 1));
        let sup = Supervision::kl(1, 2, 1.0, q).unwrap();
        let x = Array2::<f64>::zeros((2, 1));
        let opts = ChainTrainingOptions::default();
        let err =
            compute_chain_smbr_objf_and_deriv(&opts, &graph, &sup, &x, None, None, None).unwrap_err();
        assert!(matches!(err, ChainError::SmbrRequiresNumeratorSupervision));
    }
}
