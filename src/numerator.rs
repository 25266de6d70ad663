//! The compact numerator computation (§4.5): forward-backward over a per-frame-small-alternative
//! supervision FST, batched across the sequences of a minibatch.

use ndarray::Array2;

use crate::numerator_fb::forward_backward;
use crate::supervision::NumeratorGraph;

/// Per-minibatch compact-numerator forward-backward.
///
/// Constructed once per minibatch and dropped before the next one begins, same lifetime as the
/// denominator's scratch (§5 "Shared resources").
pub struct NumeratorComputation<'a> {
    graphs: &'a [NumeratorGraph],
    num_sequences: usize,
    weight: f64,
}

impl<'a> NumeratorComputation<'a> {
    pub fn new(graphs: &'a [NumeratorGraph], num_sequences: usize, weight: f64) -> Self {
        Self {
            graphs,
            num_sequences,
            weight,
        }
    }

    /// Forward pass: returns `w * sum_s log P(supervision_s | X)` and whether every sequence's
    /// graph was reachable and finite. The compact numerator is expected to always be reachable
    /// (it is built directly off the reference alignment) so a failure here usually indicates a
    /// construction bug rather than the ordinary pathological minibatch §7 anticipates for the
    /// denominator/generic paths — but the driver treats it the same way regardless.
    pub fn forward(&self, x: &Array2<f64>) -> (f64, bool) {
        let mut total = 0.0;
        let mut ok = true;
        for (s, graph) in self.graphs.iter().enumerate() {
            let result = forward_backward(graph, x, s, self.num_sequences, self.weight, None);
            ok &= result.ok;
            total += result.log_prob;
        }
        (self.weight * total, ok)
    }

    /// Backward pass: adds `weight`-scaled per-frame posteriors into `posterior_out`
    /// (shape `(T*S, P)`, same row convention as `X`).
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
            ok &= result.ok;
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_sequence_uniform_path_has_zero_logprob_when_scores_are_zero() {
        let graphs = vec![NumeratorGraph::linear_chain(&[0, 0, 0])];
        let x = Array2::<f64>::zeros((3, 1));
        let comp = NumeratorComputation::new(&graphs, 1, 1.0);
        let (logprob, ok) = comp.forward(&x);
        assert!(ok);
        assert!((logprob - 0.0).abs() < 1e-9);

        let mut posterior = Array2::<f64>::zeros((3, 1));
        assert!(comp.backward(&x, &mut posterior));
        for t in 0..3 {
            assert!((posterior[(t, 0)] - 1.0).abs() < 1e-9);
        }
    }
}
