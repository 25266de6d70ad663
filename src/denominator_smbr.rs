//! The SMBR denominator extension (§4.4): the same leaky-HMM alpha/beta recursion as
//! [`crate::denominator::DenominatorComputation`], carried in parallel with a second,
//! accuracy-weighted quantity so the backward pass can produce the gradient of the *expected
//! frame accuracy* rather than of `log Z_den`.
//!
//! Because the per-arc accuracy here depends only on `(pdf, frame, sequence)` and not on which
//! graph arc was taken (§4.4: "accuracy... equal to the numerator posterior for class pdf at
//! frame t, sequence s"), the expected accuracy collapses to a covariance between the ordinary
//! denominator posterior and the accuracy target, which is exactly what the `alpha_w`/`beta_w`
//! pair below is built to compute without ever materializing per-path accuracies.

use ndarray::{Array1, Array2, Array3};

use crate::denominator_graph::DenominatorGraph;

/// Per-minibatch SMBR denominator scratch, paired with [`crate::denominator::DenominatorComputation`]
/// in spirit but tracking `(alpha, alpha_w)` / `(beta, beta_w)` instead of a single quantity.
pub struct DenominatorSmbrComputation<'a> {
    graph: &'a DenominatorGraph,
    num_sequences: usize,
    frames: usize,
    leaky_hmm_coefficient: f64,
    exp_x_t: Array2<f64>,
    /// Accuracy target per `(t*S+s, pdf)`, i.e. the (possibly silence-masked) numerator posterior.
    accuracy: Array2<f64>,
    alpha: Array3<f64>,
    alpha_w: Array3<f64>,
    scale: Array2<f64>,
    /// Per-sequence expected accuracy, filled in by [`Self::forward`].
    expected_accuracy: Vec<f64>,
}

impl<'a> DenominatorSmbrComputation<'a> {
    pub fn new(
        graph: &'a DenominatorGraph,
        x: &Array2<f64>,
        accuracy: Array2<f64>,
        num_sequences: usize,
        frames: usize,
        leaky_hmm_coefficient: f64,
    ) -> Self {
        let exp_x_t = x.t().mapv(f64::exp);
        let n = graph.num_states();
        Self {
            graph,
            num_sequences,
            frames,
            leaky_hmm_coefficient,
            exp_x_t,
            accuracy,
            alpha: Array3::zeros((frames + 1, num_sequences, n)),
            alpha_w: Array3::zeros((frames + 1, num_sequences, n)),
            scale: Array2::ones((frames + 1, num_sequences)),
            expected_accuracy: vec![0.0; num_sequences],
        }
    }

    /// Forward pass. Returns `(sum_s expected_accuracy(s), sum_s -log Z_den(s), ok)`; the
    /// negated log-likelihood is the same quantity [`crate::denominator::DenominatorComputation::forward`]
    /// would produce, reused here so the caller can form the MMI interpolation term (§4.4)
    /// without a second denominator pass.
    pub fn forward(&mut self) -> (f64, f64, bool) {
        let n = self.graph.num_states();
        let initial = self.graph.initial_probs();
        let kappa = self.leaky_hmm_coefficient;

        for s in 0..self.num_sequences {
            for i in 0..n {
                self.alpha[(0, s, i)] = initial[i];
                self.alpha_w[(0, s, i)] = 0.0;
            }
        }

        let mut ok = true;

        for t in 1..=self.frames {
            for s in 0..self.num_sequences {
                let mut raw = Array1::<f64>::zeros(n);
                let mut raw_w = Array1::<f64>::zeros(n);
                for i in 0..n {
                    let a = self.alpha[(t - 1, s, i)];
                    let aw = self.alpha_w[(t - 1, s, i)];
                    if a == 0.0 && aw == 0.0 {
                        continue;
                    }
                    for arc in self.graph.forward_arcs(i) {
                        let col = (t - 1) * self.num_sequences + s;
                        let score = self.exp_x_t[(arc.pdf_id, col)];
                        let acc = self.accuracy[(col, arc.pdf_id)];
                        let weight = arc.prob * score;
                        raw[arc.dest_state] += a * weight;
                        raw_w[arc.dest_state] += (aw + a * acc) * weight;
                    }
                }

                let tot: f64 = (0..n).map(|i| raw[i] * initial[i]).sum();
                let tot_w: f64 = (0..n).map(|i| raw_w[i] * initial[i]).sum();

                let mut row_sum = 0.0;
                for j in 0..n {
                    let mixed = (1.0 - kappa) * raw[j] + kappa * tot * initial[j];
                    let mixed_w = (1.0 - kappa) * raw_w[j] + kappa * tot_w * initial[j];
                    self.alpha[(t, s, j)] = mixed;
                    self.alpha_w[(t, s, j)] = mixed_w;
                    row_sum += mixed;
                }

                if !(row_sum > 0.0) || !row_sum.is_finite() {
                    ok = false;
                    self.scale[(t, s)] = 1.0;
                    continue;
                }
                let c = 1.0 / row_sum;
                self.scale[(t, s)] = c;
                for j in 0..n {
                    self.alpha[(t, s, j)] *= c;
                    self.alpha_w[(t, s, j)] *= c;
                }
            }
        }

        if !ok {
            return (0.0, f64::INFINITY, false);
        }

        let mut total_acc = 0.0;
        let mut total_neg_log_z = 0.0;
        for s in 0..self.num_sequences {
            let den: f64 = (0..n).map(|i| self.alpha[(self.frames, s, i)] * initial[i]).sum();
            let num: f64 = (0..n).map(|i| self.alpha_w[(self.frames, s, i)] * initial[i]).sum();
            if !(den > 0.0) {
                ok = false;
                continue;
            }
            let acc = num / den;
            self.expected_accuracy[s] = acc;
            total_acc += acc;

            let mut log_c_sum = 0.0;
            for t in 0..=self.frames {
                log_c_sum += self.scale[(t, s)].ln();
            }
            let log_z = -log_c_sum + den.ln();
            total_neg_log_z += -log_z;
        }

        (total_acc, total_neg_log_z, ok)
    }

    /// Backward pass. Adds `weight * d(expected_accuracy)/dX` into `dx` (note the sign: unlike
    /// the MMI denominator, this objective is *ascended* directly, not subtracted, so the
    /// gradient is added rather than subtracted — §4.4).
    pub fn backward(&self, weight: f64, dx: &mut Array2<f64>) {
        let n = self.graph.num_states();
        let initial = self.graph.initial_probs();
        let kappa = self.leaky_hmm_coefficient;

        let mut beta = Array3::<f64>::zeros((self.frames + 1, self.num_sequences, n));
        let mut beta_w = Array3::<f64>::zeros((self.frames + 1, self.num_sequences, n));
        for s in 0..self.num_sequences {
            let c = self.scale[(self.frames, s)];
            for i in 0..n {
                beta[(self.frames, s, i)] = initial[i] * c;
                beta_w[(self.frames, s, i)] = 0.0;
            }
        }

        for t in (0..self.frames).rev() {
            for s in 0..self.num_sequences {
                let mut raw = Array1::<f64>::zeros(n);
                let mut raw_w = Array1::<f64>::zeros(n);
                for i in 0..n {
                    let mut acc_sum = 0.0;
                    let mut acc_w_sum = 0.0;
                    for arc in self.graph.forward_arcs(i) {
                        let col = t * self.num_sequences + s;
                        let score = self.exp_x_t[(arc.pdf_id, col)];
                        let acc_target = self.accuracy[(col, arc.pdf_id)];
                        let weight_arc = arc.prob * score;
                        let b = beta[(t + 1, s, arc.dest_state)];
                        let bw = beta_w[(t + 1, s, arc.dest_state)];
                        acc_sum += weight_arc * b;
                        acc_w_sum += weight_arc * (bw + b * acc_target);
                    }
                    raw[i] = acc_sum;
                    raw_w[i] = acc_w_sum;
                }

                let tot: f64 = (0..n).map(|j| raw[j] * initial[j]).sum();
                let tot_w: f64 = (0..n).map(|j| raw_w[j] * initial[j]).sum();
                let c = self.scale[(t, s)];
                for i in 0..n {
                    let mixed = (1.0 - kappa) * raw[i] + kappa * initial[i] * tot;
                    let mixed_w = (1.0 - kappa) * raw_w[i] + kappa * initial[i] * tot_w;
                    beta[(t, s, i)] = mixed * c;
                    beta_w[(t, s, i)] = mixed_w * c;
                }
            }
        }

        for t in 0..self.frames {
            for s in 0..self.num_sequences {
                let col = t * self.num_sequences + s;
                let c = self.scale[(t, s)];
                let e = self.expected_accuracy[s];

                let mut gamma = vec![0.0_f64; self.graph.num_pdfs()];
                let mut gamma_w = vec![0.0_f64; self.graph.num_pdfs()];
                for i in 0..n {
                    let a = self.alpha[(t, s, i)];
                    let aw = self.alpha_w[(t, s, i)];
                    if a == 0.0 && aw == 0.0 {
                        continue;
                    }
                    for arc in self.graph.forward_arcs(i) {
                        let j = arc.dest_state;
                        let b = beta[(t + 1, s, j)];
                        let bw = beta_w[(t + 1, s, j)];
                        let acc_target = self.accuracy[(col, arc.pdf_id)];
                        gamma[arc.pdf_id] += a * arc.prob * b;
                        gamma_w[arc.pdf_id] +=
                            aw * arc.prob * b + a * arc.prob * bw + a * arc.prob * b * acc_target;
                    }
                }

                for pdf in 0..self.graph.num_pdfs() {
                    if gamma[pdf] == 0.0 && gamma_w[pdf] == 0.0 {
                        continue;
                    }
                    let score = self.exp_x_t[(pdf, col)];
                    let g = score * gamma[pdf] / c;
                    let gw = score * gamma_w[pdf] / c;
                    let grad = gw - e * g;
                    dx[(col, pdf)] += weight * grad;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fst::{StdArc, StdFst};

    #[test]
    fn single_state_perfect_accuracy_gives_expected_accuracy_one() {
        let mut fst = StdFst::new(1);
        fst.add_arc(0, StdArc::new(0, 0, 0.0));
        let graph = DenominatorGraph::build(&fst, 1).unwrap();

        let x = Array2::<f64>::zeros((3, 1));
        // The only class has accuracy 1 at every frame, so expected accuracy must be 1.
        let accuracy = Array2::<f64>::ones((3, 1));
        let mut comp = DenominatorSmbrComputation::new(&graph, &x, accuracy, 1, 3, 1e-5);
        let (acc, neg_log_z, ok) = comp.forward();
        assert!(ok);
        assert!((acc - 1.0).abs() < 1e-6);
        assert!(neg_log_z.abs() < 1e-6);
    }

    #[test]
    fn flipping_accuracy_sign_flips_objective_sign() {
        let mut fst = StdFst::new(1);
        fst.add_arc(0, StdArc::new(0, 0, 0.0));
        let graph = DenominatorGraph::build(&fst, 1).unwrap();
        let x = Array2::<f64>::zeros((3, 1));

        let accuracy = Array2::<f64>::ones((3, 1));
        let mut comp = DenominatorSmbrComputation::new(&graph, &x, accuracy.clone(), 1, 3, 1e-5);
        let (acc_pos, _, _) = comp.forward();

        let neg_accuracy = accuracy.mapv(|v| -v);
        let mut comp_neg = DenominatorSmbrComputation::new(&graph, &x, neg_accuracy, 1, 3, 1e-5);
        let (acc_neg, _, _) = comp_neg.forward();

        assert!((acc_pos + acc_neg).abs() < 1e-9);
    }
}
