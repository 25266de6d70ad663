//! Per-minibatch supervision (§3, §6): either a numerator FST per sequence (compact or generic
//! flavor), or a fixed target-posterior matrix for KL mode. The three are mutually exclusive,
//! discriminated by the `SupervisionKind` tag exactly as §3 describes.

use ndarray::Array2;

use crate::error::ChainError;
use crate::fst::StdFst;

/// One arc of a [`NumeratorGraph`]: it always advances the frame index by exactly one, which is
/// what lets the forward/backward recursion index straight into the score matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumeratorArc {
    pub dest_state: usize,
    pub pdf_id: usize,
    pub log_prob: f64,
}

/// A per-sequence supervision FST, time-aligned so that every state has a well-defined frame
/// index and every arc advances it by exactly one frame.
///
/// The *compact* numerator (§4.5) uses graphs built with a small, usually constant, number of
/// states per frame (often exactly one — a single forced alignment path, maybe with a handful of
/// alternatives for optional silence); the *generic*/e2e numerator (§4.6) uses the same
/// representation but permits arbitrary branching per frame and does not assume every sequence in
/// a minibatch shares the same topology, which is why it cannot share the compact numerator's
/// densely batched scratch layout and must check reachability per sequence instead.
#[derive(Debug, Clone)]
pub struct NumeratorGraph {
    frames: usize,
    /// `states_by_frame[t]` lists the global state indices that sit at frame `t`, for
    /// `t in 0..=frames`.
    states_by_frame: Vec<Vec<usize>>,
    /// `frame_of[state]` is the frame a given global state index sits at.
    frame_of: Vec<usize>,
    /// Forward out-arcs indexed by global state.
    arcs: Vec<Vec<NumeratorArc>>,
    /// Backward arcs indexed by destination global state: `(src_state, pdf_id, log_prob)`.
    arcs_rev: Vec<Vec<(usize, usize, f64)>>,
    init_state: usize,
    /// `(state, final_log_prob)` pairs; almost always a single state at frame `frames`.
    final_states: Vec<(usize, f64)>,
}

impl NumeratorGraph {
    /// Builds a time-aligned supervision graph from a [`StdFst`] plus an explicit per-state frame
    /// assignment. `frame_of[state]` must be `0` for `init_state`, every arc must advance the
    /// frame by exactly one, and every final state's frame must equal `frames`.
    pub fn build(
        fst: &StdFst,
        frame_of: Vec<usize>,
        init_state: usize,
        final_states: Vec<(usize, f64)>,
        frames: usize,
    ) -> Result<Self, ChainError> {
        let num_states = fst.num_states();
        if frame_of.len() != num_states {
            return Err(ChainError::StateOutOfRange {
                state: frame_of.len(),
                num_states,
            });
        }

        let mut states_by_frame = vec![Vec::new(); frames + 1];
        for (state, &frame) in frame_of.iter().enumerate() {
            if frame > frames {
                return Err(ChainError::StateOutOfRange {
                    state: frame,
                    num_states: frames + 1,
                });
            }
            states_by_frame[frame].push(state);
        }

        let mut arcs = vec![Vec::new(); num_states];
        let mut arcs_rev = vec![Vec::new(); num_states];
        for src in fst.states() {
            for arc in fst.out_arcs(src) {
                if frame_of[arc.dest_state] != frame_of[src] + 1 {
                    return Err(ChainError::StateOutOfRange {
                        state: arc.dest_state,
                        num_states,
                    });
                }
                arcs[src].push(NumeratorArc {
                    dest_state: arc.dest_state,
                    pdf_id: arc.pdf_id,
                    log_prob: arc.log_prob,
                });
                arcs_rev[arc.dest_state].push((src, arc.pdf_id, arc.log_prob));
            }
        }

        for &(state, _) in &final_states {
            if frame_of[state] != frames {
                return Err(ChainError::StateOutOfRange {
                    state,
                    num_states: frames + 1,
                });
            }
        }

        Ok(Self {
            frames,
            states_by_frame,
            frame_of,
            arcs,
            arcs_rev,
            init_state,
            final_states,
        })
    }

    /// Convenience constructor for the common case of a single linear chain: one state per frame,
    /// `pdf_ids[t]` is the (only) class allowed at frame `t`. This is the degenerate "compact"
    /// graph a plain forced alignment reduces to.
    pub fn linear_chain(pdf_ids: &[usize]) -> Self {
        let frames = pdf_ids.len();
        let mut fst = StdFst::new(frames + 1);
        for (t, &pdf_id) in pdf_ids.iter().enumerate() {
            fst.add_arc(t, crate::fst::StdArc::new(t + 1, pdf_id, 0.0));
        }
        let frame_of: Vec<usize> = (0..=frames).collect();
        Self::build(&fst, frame_of, 0, vec![(frames, 0.0)], frames).expect("linear chain is well-formed")
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn states_at_frame(&self, frame: usize) -> &[usize] {
        &self.states_by_frame[frame]
    }

    pub fn frame_of(&self, state: usize) -> usize {
        self.frame_of[state]
    }

    pub fn out_arcs(&self, state: usize) -> &[NumeratorArc] {
        &self.arcs[state]
    }

    pub fn in_arcs(&self, state: usize) -> &[(usize, usize, f64)] {
        &self.arcs_rev[state]
    }

    pub fn init_state(&self) -> usize {
        self.init_state
    }

    pub fn final_states(&self) -> &[(usize, f64)] {
        &self.final_states
    }

    /// Total number of states across all frames, useful for sizing scratch buffers.
    pub fn num_states(&self) -> usize {
        self.frame_of.len()
    }
}

/// Tag discriminating the three mutually-exclusive supervision kinds (§3).
#[derive(Debug, Clone)]
pub enum SupervisionKind {
    /// Compact numerator FST per sequence (§4.5).
    Compact(Vec<NumeratorGraph>),
    /// Generic/e2e numerator FST per sequence (§4.6).
    Generic(Vec<NumeratorGraph>),
    /// Fixed target-posterior matrix `Q`, shape `(T*S, P)` (KL mode).
    Kl(Array2<f64>),
}

/// Per-minibatch, immutable supervision (§3).
#[derive(Debug, Clone)]
pub struct Supervision {
    pub num_sequences: usize,
    pub frames_per_sequence: usize,
    pub weight: f64,
    pub kind: SupervisionKind,
}

impl Supervision {
    pub fn compact(
        num_sequences: usize,
        frames_per_sequence: usize,
        weight: f64,
        graphs: Vec<NumeratorGraph>,
    ) -> Result<Self, ChainError> {
        if graphs.len() != num_sequences {
            return Err(ChainError::SequenceCountMismatch {
                found: graphs.len(),
                expected: num_sequences,
            });
        }
        Ok(Self {
            num_sequences,
            frames_per_sequence,
            weight,
            kind: SupervisionKind::Compact(graphs),
        })
    }

    pub fn generic(
        num_sequences: usize,
        frames_per_sequence: usize,
        weight: f64,
        graphs: Vec<NumeratorGraph>,
    ) -> Result<Self, ChainError> {
        if graphs.len() != num_sequences {
            return Err(ChainError::SequenceCountMismatch {
                found: graphs.len(),
                expected: num_sequences,
            });
        }
        Ok(Self {
            num_sequences,
            frames_per_sequence,
            weight,
            kind: SupervisionKind::Generic(graphs),
        })
    }

    pub fn kl(
        num_sequences: usize,
        frames_per_sequence: usize,
        weight: f64,
        targets: Array2<f64>,
    ) -> Result<Self, ChainError> {
        let expected_rows = num_sequences * frames_per_sequence;
        if targets.nrows() != expected_rows {
            return Err(ChainError::TargetPosteriorShapeMismatch {
                found: (targets.nrows(), targets.ncols()),
                expected: (expected_rows, targets.ncols()),
            });
        }
        Ok(Self {
            num_sequences,
            frames_per_sequence,
            weight,
            kind: SupervisionKind::Kl(targets),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_chain_has_one_state_per_frame() {
        let g = NumeratorGraph::linear_chain(&[0, 1, 0]);
        assert_eq!(g.frames(), 3);
        for t in 0..=3 {
            assert_eq!(g.states_at_frame(t).len(), 1);
        }
        assert_eq!(g.out_arcs(g.init_state())[0].pdf_id, 0);
    }

    #[test]
    fn rejects_sequence_count_mismatch() {
        let graphs = vec![NumeratorGraph::linear_chain(&[0])];
        let err = Supervision::compact(2, 1, 1.0, graphs).unwrap_err();
        assert!(matches!(err, ChainError::SequenceCountMismatch { .. }));
    }
}
