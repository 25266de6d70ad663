//! Synthetic fixture generation, used by `chain-tool`'s `synth` and `gradient-check`
//! subcommands and by the gradient-check property test (§8 property 4 of the spec).
//!
//! Not part of the numerical core: nothing in [`crate::driver`] depends on this module. It exists
//! purely so the core can be exercised and sanity-checked without an upstream neural-network
//! executor or real FST/lexicon tooling to produce one, the same role the teacher's
//! `training::lj_speech::Dataset` plays relative to its own inference path.

use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::Rng;

use crate::denominator_graph::DenominatorGraph;
use crate::error::ChainError;
use crate::fst::{StdArc, StdFst};
use crate::supervision::{NumeratorGraph, Supervision};

/// Shape of a synthetic minibatch, mirroring the `(options, denominator graph, supervision, X)`
/// tuple the driver consumes.
pub struct SyntheticMinibatch {
    pub den_graph: DenominatorGraph,
    pub supervision: Supervision,
    pub x: Array2<f64>,
}

/// Builds a random ergodic denominator HMM: `num_states` states, each with `out_degree` outgoing
/// arcs to randomly chosen destinations carrying randomly chosen pdf-ids, log-probabilities drawn
/// so that each state's arcs form a valid (normalized) categorical distribution.
pub fn random_denominator_graph(
    num_states: usize,
    num_pdfs: usize,
    out_degree: usize,
    rng: &mut SmallRng,
) -> Result<DenominatorGraph, ChainError> {
    let mut fst = StdFst::new(num_states);
    for src in 0..num_states {
        let degree = out_degree.min(num_states).max(1);
        let mut raw_weights = Vec::with_capacity(degree);
        for _ in 0..degree {
            raw_weights.push(rng.gen_range(0.1_f64..1.0));
        }
        let total: f64 = raw_weights.iter().sum();
        for w in &raw_weights {
            let dest = rng.gen_range(0..num_states);
            let pdf_id = rng.gen_range(0..num_pdfs);
            let log_prob = (w / total).ln();
            fst.add_arc(src, StdArc::new(dest, pdf_id, log_prob));
        }
    }
    DenominatorGraph::build(&fst, num_pdfs)
}

/// Builds a random compact-numerator supervision: `num_sequences` independent linear chains of
/// `frames` random pdf-ids each, exactly the degenerate single-path-per-frame topology §4.5
/// describes as "the common case of a single linear chain".
pub fn random_compact_supervision(
    num_sequences: usize,
    frames: usize,
    num_pdfs: usize,
    weight: f64,
    rng: &mut SmallRng,
) -> Result<Supervision, ChainError> {
    let graphs: Vec<NumeratorGraph> = (0..num_sequences)
        .map(|_| {
            let pdf_ids: Vec<usize> = (0..frames).map(|_| rng.gen_range(0..num_pdfs)).collect();
            NumeratorGraph::linear_chain(&pdf_ids)
        })
        .collect();
    Supervision::compact(num_sequences, frames, weight, graphs)
}

/// Draws a `(frames * num_sequences, num_pdfs)` score matrix with small random entries, small
/// enough that `exp(X)` cannot overflow in the denominator forward pass.
pub fn random_scores(
    frames: usize,
    num_sequences: usize,
    num_pdfs: usize,
    rng: &mut SmallRng,
) -> Array2<f64> {
    Array2::from_shape_fn((frames * num_sequences, num_pdfs), |_| {
        rng.gen_range(-1.0_f64..1.0)
    })
}

/// Draws a unit-Frobenius-norm perturbation matrix of the given shape, for the gradient-check
/// property (§8 property 4: `(objf(X + eps*E) - objf(X - eps*E)) / (2*eps) ~ <dX, E>`).
pub fn random_unit_perturbation(rows: usize, cols: usize, rng: &mut SmallRng) -> Array2<f64> {
    let mut e = Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0_f64..1.0));
    let norm: f64 = e.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        e.mapv_inplace(|v| v / norm);
    }
    e
}

/// Builds a complete random minibatch: an ergodic denominator graph and a compact-numerator
/// supervision sized to match it.
pub fn random_minibatch(
    num_states: usize,
    num_pdfs: usize,
    out_degree: usize,
    num_sequences: usize,
    frames: usize,
    weight: f64,
    rng: &mut SmallRng,
) -> Result<SyntheticMinibatch, ChainError> {
    let den_graph = random_denominator_graph(num_states, num_pdfs, out_degree, rng)?;
    let supervision =
        random_compact_supervision(num_sequences, frames, num_pdfs, weight, rng)?;
    let x = random_scores(frames, num_sequences, num_pdfs, rng);
    Ok(SyntheticMinibatch {
        den_graph,
        supervision,
        x,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn random_denominator_graph_has_requested_shape() {
        let mut rng = SmallRng::seed_from_u64(42);
        let graph = random_denominator_graph(4, 3, 2, &mut rng).unwrap();
        assert_eq!(graph.num_states(), 4);
        assert_eq!(graph.num_pdfs(), 3);
        assert!((graph.initial_probs().sum() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn random_minibatch_shapes_are_consistent() {
        let mut rng = SmallRng::seed_from_u64(7);
        let batch = random_minibatch(3, 2, 2, 2, 5, 1.0, &mut rng).unwrap();
        assert_eq!(batch.x.dim(), (10, 2));
        assert_eq!(batch.supervision.num_sequences, 2);
        assert_eq!(batch.supervision.frames_per_sequence, 5);
    }
}
