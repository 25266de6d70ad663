//! The shared, read-only denominator HMM graph (§3, §4.2).
//!
//! Built once from a [`StdFst`] and a class count, then shared (without synchronization — it is
//! never mutated again) across every minibatch and thread for the lifetime of a training run.

use ndarray::Array1;

use crate::error::ChainError;
use crate::fst::StdFst;

/// One denominator arc, linear-domain probability already exponentiated out of the FST's
/// log-probability so the hot forward/backward loops never call `exp` per arc.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DenArc {
    pub dest_state: usize,
    pub pdf_id: usize,
    pub prob: f64,
}

/// The mirror of [`DenArc`] indexed by *destination*, used by the backward pass so it never has
/// to scan every state's forward arc list looking for ones that land on it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DenArcRev {
    pub src_state: usize,
    pub pdf_id: usize,
    pub prob: f64,
}

/// Maximum power-iteration steps before giving up on convergence (§3's "until convergence").
const MAX_POWER_ITERS: usize = 10_000;
/// L1 change between successive iterates below which the stationary distribution is considered
/// converged.
const POWER_ITER_TOL: f64 = 1e-10;

/// The compact, immutable denominator HMM (§3).
#[derive(Debug, Clone)]
pub struct DenominatorGraph {
    num_states: usize,
    num_pdfs: usize,
    forward_arcs: Vec<Vec<DenArc>>,
    backward_arcs: Vec<Vec<DenArcRev>>,
    /// Stationary distribution of the graph's state-transition matrix; used as both the initial
    /// and final probability vector (§3 invariant: sums to 1, non-negative).
    initial_probs: Array1<f64>,
}

impl DenominatorGraph {
    /// Builds a `DenominatorGraph` from a raw FST and a pdf count, deriving `initial_probs` by
    /// power iteration on the graph's transition matrix (summed over pdf labels, since the
    /// stationary distribution only depends on state-to-state mass, not on which class labels
    /// the arcs carry).
    pub fn build(fst: &StdFst, num_pdfs: usize) -> Result<Self, ChainError> {
        let num_states = fst.num_states();
        if num_states == 0 {
            return Err(ChainError::EmptyDenominatorGraph);
        }

        let mut forward_arcs = vec![Vec::new(); num_states];
        let mut backward_arcs = vec![Vec::new(); num_states];

        for src in fst.states() {
            for arc in fst.out_arcs(src) {
                if arc.pdf_id >= num_pdfs {
                    return Err(ChainError::PdfIdOutOfRange {
                        pdf_id: arc.pdf_id,
                        num_pdfs,
                    });
                }
                if arc.dest_state >= num_states {
                    return Err(ChainError::StateOutOfRange {
                        state: arc.dest_state,
                        num_states,
                    });
                }
                let prob = arc.log_prob.exp();
                forward_arcs[src].push(DenArc {
                    dest_state: arc.dest_state,
                    pdf_id: arc.pdf_id,
                    prob,
                });
                backward_arcs[arc.dest_state].push(DenArcRev {
                    src_state: src,
                    pdf_id: arc.pdf_id,
                    prob,
                });
            }
        }

        let initial_probs = stationary_distribution(&forward_arcs, num_states)?;

        Ok(Self {
            num_states,
            num_pdfs,
            forward_arcs,
            backward_arcs,
            initial_probs,
        })
    }

    pub fn num_states(&self) -> usize {
        self.num_states
    }

    pub fn num_pdfs(&self) -> usize {
        self.num_pdfs
    }

    pub fn forward_arcs(&self, state: usize) -> &[DenArc] {
        &self.forward_arcs[state]
    }

    pub fn backward_arcs(&self, state: usize) -> &[DenArcRev] {
        &self.backward_arcs[state]
    }

    pub fn initial_probs(&self) -> &Array1<f64> {
        &self.initial_probs
    }
}

/// Power iteration on the (row-stochastic-after-normalization) transition matrix implied by
/// `forward_arcs`, returning a distribution `v` with `v' P == v` up to `POWER_ITER_TOL`.
///
/// States with no outgoing mass at all (true dead ends) are folded back towards the uniform
/// distribution each step so the iteration can't divide by zero; this matches real denominator
/// graphs, which are built so that every state has some outgoing arc, but keeps the routine
/// total.
fn stationary_distribution(
    forward_arcs: &[Vec<DenArc>],
    num_states: usize,
) -> Result<Array1<f64>, ChainError> {
    let mut row_totals = vec![0.0_f64; num_states];
    for (state, arcs) in forward_arcs.iter().enumerate() {
        row_totals[state] = arcs.iter().map(|a| a.prob).sum();
    }

    let mut v = Array1::from_elem(num_states, 1.0 / num_states as f64);
    let mut iters = 0;
    loop {
        let mut next = Array1::zeros(num_states);
        for (state, arcs) in forward_arcs.iter().enumerate() {
            let mass = v[state];
            if mass == 0.0 {
                continue;
            }
            let total = row_totals[state];
            if total <= 0.0 {
                // No outgoing mass: stay put rather than vanish.
                next[state] += mass;
                continue;
            }
            for arc in arcs {
                next[arc.dest_state] += mass * (arc.prob / total);
            }
        }
        let sum: f64 = next.sum();
        if sum > 0.0 {
            next.mapv_inplace(|x| x / sum);
        }

        let residual: f64 = v
            .iter()
            .zip(next.iter())
            .map(|(a, b)| (a - b).abs())
            .sum();

        v = next;
        iters += 1;

        if residual < POWER_ITER_TOL {
            break;
        }
        if iters >= MAX_POWER_ITERS {
            return Err(ChainError::StationaryDistributionDidNotConverge {
                iters,
                residual,
            });
        }
    }

    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fst::StdArc;

    #[test]
    fn single_state_self_loop_is_its_own_stationary_distribution() {
        let mut fst = StdFst::new(1);
        fst.add_arc(0, StdArc::new(0, 0, 0.0));
        let graph = DenominatorGraph::build(&fst, 1).unwrap();
        assert_eq!(graph.num_states(), 1);
        assert!((graph.initial_probs()[0] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn two_state_ring_converges_to_uniform() {
        let mut fst = StdFst::new(2);
        fst.add_arc(0, StdArc::new(1, 0, 0.0));
        fst.add_arc(1, StdArc::new(0, 1, 0.0));
        let graph = DenominatorGraph::build(&fst, 2).unwrap();
        let probs = graph.initial_probs();
        assert!((probs[0] - 0.5).abs() < 1e-8);
        assert!((probs[1] - 0.5).abs() < 1e-8);
        assert!((probs.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_empty_graph() {
        let fst = StdFst::new(0);
        assert!(matches!(
            DenominatorGraph::build(&fst, 1),
            Err(ChainError::EmptyDenominatorGraph)
        ));
    }

    #[test]
    fn rejects_out_of_range_pdf() {
        let mut fst = StdFst::new(1);
        fst.add_arc(0, StdArc::new(0, 5, 0.0));
        assert!(matches!(
            DenominatorGraph::build(&fst, 1),
            Err(ChainError::PdfIdOutOfRange { .. })
        ));
    }
}
