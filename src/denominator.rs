//! The denominator forward/backward with leaky-HMM smoothing (§4.2, §4.3): the shared,
//! corpus-wide phone-loop-like graph that every minibatch must sum over to get `log Z_den`.

use ndarray::{Array1, Array2, Array3};
use rayon::prelude::*;
use tracing::warn;

use crate::denominator_graph::DenominatorGraph;

/// Tolerance for the alpha/beta self-consistency check of §4.3, scaled by `|log Z_den|` per
/// sequence (§9 open question, resolved here as a tunable with this default).
pub const SELF_CONSISTENCY_TOL: f64 = 1e-4;

/// Owns the per-minibatch denominator scratch (transposed exp-scores, alpha, beta, rescale
/// factors) for the lifetime of one minibatch, then is dropped (§3 "Ownership & lifetime", §9
/// "Device buffer ownership").
pub struct DenominatorComputation<'a> {
    graph: &'a DenominatorGraph,
    num_sequences: usize,
    frames: usize,
    leaky_hmm_coefficient: f64,
    /// `expX_T[(pdf, t*S+s)]`, the transposed exponentiated score matrix (§4.2).
    exp_x_t: Array2<f64>,
    /// `alpha[(t, s, state)]` for `t in 0..=frames`.
    alpha: Array3<f64>,
    /// `c[(t, s)]`.
    scale: Array2<f64>,
}

impl<'a> DenominatorComputation<'a> {
    pub fn new(
        graph: &'a DenominatorGraph,
        x: &Array2<f64>,
        num_sequences: usize,
        frames: usize,
        leaky_hmm_coefficient: f64,
    ) -> Self {
        let exp_x_t = x.t().mapv(f64::exp);
        Self {
            graph,
            num_sequences,
            frames,
            leaky_hmm_coefficient,
            exp_x_t,
            alpha: Array3::zeros((frames + 1, num_sequences, graph.num_states())),
            scale: Array2::ones((frames + 1, num_sequences)),
        }
    }

    /// Forward pass (§4.2). Returns `(sum_s log Z_den(s), ok)`.
    ///
    /// Frames are processed strictly in order within a sequence, but sequences are independent
    /// and commutative (§5), so each sequence's whole `t in 0..=frames` recursion is computed on
    /// its own rayon task and only assembled back into the shared `alpha`/`scale` tensors once
    /// every sequence has finished.
    pub fn forward(&mut self) -> (f64, bool) {
        let n = self.graph.num_states();
        let initial = self.graph.initial_probs().to_owned();
        let frames = self.frames;
        let num_sequences = self.num_sequences;
        let kappa = self.leaky_hmm_coefficient;
        let graph = self.graph;
        let exp_x_t = &self.exp_x_t;

        let per_sequence: Vec<(Array2<f64>, Array1<f64>, bool)> = (0..num_sequences)
            .into_par_iter()
            .map(|s| {
                let mut alpha_seq = Array2::<f64>::zeros((frames + 1, n));
                let mut scale_seq = Array1::<f64>::ones(frames + 1);
                for i in 0..n {
                    alpha_seq[(0, i)] = initial[i];
                }

                let mut seq_ok = true;
                for t in 1..=frames {
                    let mut raw = Array1::<f64>::zeros(n);
                    for i in 0..n {
                        let a = alpha_seq[(t - 1, i)];
                        if a == 0.0 {
                            continue;
                        }
                        for arc in graph.forward_arcs(i) {
                            let col = (t - 1) * num_sequences + s;
                            let score = exp_x_t[(arc.pdf_id, col)];
                            raw[arc.dest_state] += a * arc.prob * score;
                        }
                    }

                    let tot: f64 = (0..n).map(|i| raw[i] * initial[i]).sum();
                    let mut row_sum = 0.0;
                    for j in 0..n {
                        let mixed = (1.0 - kappa) * raw[j] + kappa * tot * initial[j];
                        alpha_seq[(t, j)] = mixed;
                        row_sum += mixed;
                    }

                    if !(row_sum > 0.0) || !row_sum.is_finite() {
                        warn!(sequence = s, frame = t, "denominator alpha underflowed to zero");
                        seq_ok = false;
                        scale_seq[t] = 1.0;
                        continue;
                    }

                    let c = 1.0 / row_sum;
                    scale_seq[t] = c;
                    for j in 0..n {
                        alpha_seq[(t, j)] *= c;
                    }
                }

                (alpha_seq, scale_seq, seq_ok)
            })
            .collect();

        let mut ok = true;
        for (s, (alpha_seq, scale_seq, seq_ok)) in per_sequence.into_iter().enumerate() {
            ok &= seq_ok;
            for t in 0..=frames {
                self.scale[(t, s)] = scale_seq[t];
                for j in 0..n {
                    self.alpha[(t, s, j)] = alpha_seq[(t, j)];
                }
            }
        }

        if !ok {
            return (f64::NEG_INFINITY, false);
        }

        let mut total = 0.0;
        for s in 0..self.num_sequences {
            let mut log_c_sum = 0.0;
            for t in 0..=self.frames {
                log_c_sum += self.scale[(t, s)].ln();
            }
            let final_sum: f64 = (0..n).map(|i| self.alpha[(self.frames, s, i)] * initial[i]).sum();
            if !(final_sum > 0.0) {
                ok = false;
                continue;
            }
            let log_z = -log_c_sum + final_sum.ln();
            total += log_z;
        }

        (total, ok)
    }

    /// Backward pass (§4.3). Accumulates `-weight * d(log Z_den)/dX` into `dx`. Returns whether
    /// the alpha/beta self-consistency check held within [`SELF_CONSISTENCY_TOL`] of `|log Z_den|`.
    ///
    /// Same per-sequence parallelism as [`Self::forward`]: row `t*S+s` of `dx` is only ever
    /// touched by sequence `s`'s own task, so every sequence's beta recursion and gradient
    /// contribution can be computed independently and the results merged afterwards without any
    /// shared mutable state during the parallel phase.
    pub fn backward(&self, weight: f64, dx: &mut Array2<f64>) -> bool {
        let n = self.graph.num_states();
        let initial = self.graph.initial_probs().to_owned();
        let kappa = self.leaky_hmm_coefficient;
        let frames = self.frames;
        let num_sequences = self.num_sequences;
        let graph = self.graph;
        let exp_x_t = &self.exp_x_t;
        let alpha = &self.alpha;
        let scale = &self.scale;

        let per_sequence: Vec<(Array1<f64>, Vec<(usize, usize, f64)>)> = (0..num_sequences)
            .into_par_iter()
            .map(|s| {
                let mut beta_seq = Array2::<f64>::zeros((frames + 1, n));
                let c_last = scale[(frames, s)];
                for i in 0..n {
                    beta_seq[(frames, i)] = initial[i] * c_last;
                }

                for t in (0..frames).rev() {
                    let mut raw = Array1::<f64>::zeros(n);
                    for i in 0..n {
                        let mut acc = 0.0;
                        for arc in graph.forward_arcs(i) {
                            let col = t * num_sequences + s;
                            let score = exp_x_t[(arc.pdf_id, col)];
                            acc += arc.prob * score * beta_seq[(t + 1, arc.dest_state)];
                        }
                        raw[i] = acc;
                    }

                    let tot: f64 = (0..n).map(|j| raw[j] * initial[j]).sum();
                    let c = scale[(t, s)];
                    for i in 0..n {
                        let mixed = (1.0 - kappa) * raw[i] + kappa * initial[i] * tot;
                        beta_seq[(t, i)] = mixed * c;
                    }
                }

                // Gradient accumulation, per §4.3's closed form.
                let mut deltas = Vec::new();
                for t in 0..frames {
                    let col = t * num_sequences + s;
                    let c = scale[(t, s)];
                    let mut per_pdf_accum = vec![0.0_f64; graph.num_pdfs()];
                    for i in 0..n {
                        let a = alpha[(t, s, i)];
                        if a == 0.0 {
                            continue;
                        }
                        for arc in graph.forward_arcs(i) {
                            per_pdf_accum[arc.pdf_id] += a * arc.prob * beta_seq[(t + 1, arc.dest_state)];
                        }
                    }
                    for pdf in 0..graph.num_pdfs() {
                        if per_pdf_accum[pdf] == 0.0 {
                            continue;
                        }
                        let score = exp_x_t[(pdf, col)];
                        let grad = score * per_pdf_accum[pdf] / c;
                        deltas.push((col, pdf, grad));
                    }
                }

                (beta_seq.row(0).to_owned(), deltas)
            })
            .collect();

        for (_, deltas) in &per_sequence {
            for &(row, pdf, grad) in deltas {
                dx[(row, pdf)] -= weight * grad;
            }
        }

        let beta_t0: Vec<Array1<f64>> = per_sequence.into_iter().map(|(b, _)| b).collect();
        self.check_self_consistency(&beta_t0)
    }

    fn check_self_consistency(&self, beta_t0: &[Array1<f64>]) -> bool {
        let n = self.graph.num_states();
        let mut total = 0.0;
        for s in 0..self.num_sequences {
            let c0 = self.scale[(0, s)];
            let dot: f64 = (0..n)
                .map(|i| self.alpha[(0, s, i)] * beta_t0[s][i])
                .sum();
            if dot <= 0.0 {
                return false;
            }
            total += (dot / c0).ln();
        }

        let (mut any_log_z, mut sum_log_z) = (false, 0.0);
        for s in 0..self.num_sequences {
            let initial = self.graph.initial_probs();
            let final_sum: f64 = (0..n)
                .map(|i| self.alpha[(self.frames, s, i)] * initial[i])
                .sum();
            if final_sum <= 0.0 {
                continue;
            }
            let mut log_c_sum = 0.0;
            for t in 0..=self.frames {
                log_c_sum += self.scale[(t, s)].ln();
            }
            sum_log_z += -log_c_sum + final_sum.ln();
            any_log_z = true;
        }

        if !any_log_z {
            return false;
        }

        total.abs() <= SELF_CONSISTENCY_TOL * sum_log_z.abs().max(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::denominator_graph::DenominatorGraph;
    use crate::fst::{StdArc, StdFst};

    fn single_state_graph() -> DenominatorGraph {
        let mut fst = StdFst::new(1);
        fst.add_arc(0, StdArc::new(0, 0, 0.0));
        DenominatorGraph::build(&fst, 1).unwrap()
    }

    #[test]
    fn single_state_zero_scores_gives_zero_log_z() {
        let graph = single_state_graph();
        let x = Array2::<f64>::zeros((3, 1));
        let mut comp = DenominatorComputation::new(&graph, &x, 1, 3, 1e-5);
        let (log_z, ok) = comp.forward();
        assert!(ok);
        assert!(log_z.abs() < 1e-6, "log_z = {log_z}");

        let mut dx = Array2::<f64>::zeros((3, 1));
        let self_consistent = comp.backward(1.0, &mut dx);
        assert!(self_consistent);
    }

    #[test]
    fn two_state_ring_alpha_rows_stay_positive() {
        let mut fst = StdFst::new(2);
        fst.add_arc(0, StdArc::new(1, 0, 0.0));
        fst.add_arc(1, StdArc::new(0, 1, 0.0));
        let graph = DenominatorGraph::build(&fst, 2).unwrap();
        let x = Array2::<f64>::zeros((10, 2));
        let mut comp = DenominatorComputation::new(&graph, &x, 1, 10, 0.1);
        let (log_z, ok) = comp.forward();
        assert!(ok);
        assert!(log_z.is_finite());
        for t in 0..=10 {
            let row_sum: f64 = (0..2).map(|i| comp.alpha[(t, 0, i)]).sum();
            assert!(row_sum > 0.0);
        }
    }
}
