//! The generic/e2e numerator computation (§4.6): forward-backward over an unconstrained
//! per-sequence FST, with an explicit per-sequence reachability check since, unlike the compact
//! numerator, these graphs are not guaranteed to be well-formed for every input.

use ndarray::Array2;
use tracing::warn;

use crate::numerator_fb::forward_backward;
use crate::supervision::NumeratorGraph;

/// Per-minibatch generic-numerator forward-backward.
pub struct GenericNumeratorComputation<'a> {
    graphs: &'a [NumeratorGraph],
    num_sequences: usize,
    weight: f64,
}

impl<'a> GenericNumeratorComputation<'a> {
    pub fn new(graphs: &'a [NumeratorGraph], num_sequences: usize, weight: f64) -> Self {
        Self {
            graphs,
            num_sequences,
            weight,
        }
    }

    /// Forward pass. Reports `ok = false` for the whole minibatch when any one sequence's
    /// forward log-likelihood is not finite (§4.6) — an unconstrained e2e graph can legitimately
    /// have no path consistent with a short or truncated sequence, and that is treated as a
    /// minibatch-wide failure by the driver rather than silently dropping just that sequence's
    /// contribution.
    pub fn forward(&self, x: &Array2<f64>) -> (f64, bool) {
        let mut total = 0.0;
        let mut ok = true;
        for (s, graph) in self.graphs.iter().enumerate() {
            let result = forward_backward(graph, x, s, self.num_sequences, self.weight, None);
            if !result.ok {
                warn!(sequence = s, "generic numerator graph unreachable or non-finite");
                ok = false;
            }
            total += result.log_prob;
        }
        (self.weight * total, ok)
    }

    /// Backward pass, same contract as [`crate::numerator::NumeratorComputation::backward`].
    pub fn backward(&self, x: &Array2<f64>, posterior_out: &mut Array2<f64>) -> bool {
        let mut ok = true;
        let mut view = posterior_out.view_mut();
        for (s, graph) in self.graphs.iter().enumerate() {
            let result = forward_backward(
                graph,
                x,
                s,
                self.num_sequences,
                self.weight,
                Some(&mut view),
            );
            if !result.ok {
                warn!(sequence = s, "generic numerator backward skipped unreachable sequence");
                ok = false;
            }
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fst::{StdArc, StdFst};

    #[test]
    fn unreachable_sequence_is_reported_as_not_ok() {
        // A graph whose only final state sits at a frame the arcs never reach.
        let mut fst = StdFst::new(2);
        fst.add_arc(0, StdArc::new(1, 0, 0.0));
        let frame_of = vec![0, 1];
        // Final state declared at frame 2, but no state exists there: build() itself would
        // reject this, so instead make the only final state unreachable by giving it weight
        // -inf, which forward_backward reports as non-finite.
        let graphs = vec![crate::supervision::NumeratorGraph::build(
            &fst,
            frame_of,
            0,
            vec![(1, f64::NEG_INFINITY)],
            1,
        )
        .unwrap()];
        let x = Array2::<f64>::zeros((1, 1));
        let comp = GenericNumeratorComputation::new(&graphs, 1, 1.0);
        let (_, ok) = comp.forward(&x);
        assert!(!ok);
    }
}
