//! Shared log-domain forward-backward recursion over a single sequence's [`NumeratorGraph`].
//!
//! Both the compact numerator (§4.5) and the generic/e2e numerator (§4.6) run exactly this
//! recursion per sequence; what differs between them is how the driver batches the calls and how
//! aggressively it treats a non-finite result (see [`crate::numerator`] and
//! [`crate::generic_numerator`]).

use ndarray::{Array1, Array2, ArrayViewMut2};

use crate::supervision::NumeratorGraph;

const NEG_INF: f64 = f64::NEG_INFINITY;

fn log_add(a: f64, b: f64) -> f64 {
    if a == NEG_INF {
        return b;
    }
    if b == NEG_INF {
        return a;
    }
    let m = a.max(b);
    m + ((a - m).exp() + (b - m).exp()).ln()
}

/// Result of running forward-backward for one sequence.
pub struct NumeratorFbResult {
    /// Unweighted `log P(supervision | X)` for this sequence.
    pub log_prob: f64,
    /// Whether the forward pass produced a finite, reachable total probability.
    pub ok: bool,
}

/// Runs forward-backward for one sequence's numerator graph against its rows of `x`
/// (`frame_of_row = t * num_sequences + seq_idx`), adding `weight` times the resulting posterior
/// into `posterior_out` (same row convention) when `posterior_out` is `Some`.
pub fn forward_backward(
    graph: &NumeratorGraph,
    x: &Array2<f64>,
    seq_idx: usize,
    num_sequences: usize,
    weight: f64,
    mut posterior_out: Option<&mut ArrayViewMut2<f64>>,
) -> NumeratorFbResult {
    let num_states = graph.num_states();
    let frames = graph.frames();

    let mut alpha = Array1::from_elem(num_states, NEG_INF);
    alpha[graph.init_state()] = 0.0;

    for t in 0..frames {
        let row = t * num_sequences + seq_idx;
        let mut next = Array1::from_elem(num_states, NEG_INF);
        for &state in graph.states_at_frame(t) {
            let a = alpha[state];
            if a == NEG_INF {
                continue;
            }
            for arc in graph.out_arcs(state) {
                let score = x[(row, arc.pdf_id)];
                let contrib = a + arc.log_prob + score;
                next[arc.dest_state] = log_add(next[arc.dest_state], contrib);
            }
        }
        alpha = next;
    }

    let mut total = NEG_INF;
    for &(state, final_log_prob) in graph.final_states() {
        total = log_add(total, alpha[state] + final_log_prob);
    }

    let ok = total.is_finite();
    if !ok {
        return NumeratorFbResult {
            log_prob: total,
            ok: false,
        };
    }

    if let Some(posterior_out) = posterior_out.as_deref_mut() {
        let mut beta = Array1::from_elem(num_states, NEG_INF);
        for &(state, final_log_prob) in graph.final_states() {
            beta[state] = final_log_prob;
        }

        for t in (0..frames).rev() {
            let row = t * num_sequences + seq_idx;
            let mut new_beta_contrib: Vec<(usize, f64)> = Vec::new();
            for &state in graph.states_at_frame(t) {
                let mut acc = NEG_INF;
                for arc in graph.out_arcs(state) {
                    let score = x[(row, arc.pdf_id)];
                    let b = beta[arc.dest_state];
                    if b == NEG_INF {
                        continue;
                    }
                    acc = log_add(acc, arc.log_prob + score + b);

                    let gamma = (alpha[state] + arc.log_prob + score + beta[arc.dest_state]
                        - total)
                        .exp();
                    posterior_out[(row, arc.pdf_id)] += weight * gamma;
                }
                new_beta_contrib.push((state, acc));
            }
            for (state, acc) in new_beta_contrib {
                beta[state] = acc;
            }
        }
    }

    NumeratorFbResult {
        log_prob: total,
        ok: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn single_arc_per_frame_gives_exact_posterior_one() {
        let graph = NumeratorGraph::linear_chain(&[0, 1]);
        // T=2, S=1, P=2, all-zero scores.
        let x = Array2::<f64>::zeros((2, 2));
        let mut posterior = Array2::<f64>::zeros((2, 2));
        let mut view = posterior.view_mut();
        let result = forward_backward(&graph, &x, 0, 1, 1.0, Some(&mut view));
        assert!(result.ok);
        assert!((result.log_prob - 0.0).abs() < 1e-9);
        assert!((posterior[(0, 0)] - 1.0).abs() < 1e-9);
        assert!((posterior[(1, 1)] - 1.0).abs() < 1e-9);
        assert!((posterior[(0, 1)]).abs() < 1e-9);
    }
}
