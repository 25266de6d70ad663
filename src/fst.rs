//! Minimal weighted-FST input representation.
//!
//! This is the in-memory shape of the "opaque handle... built once from `(StdFst, P)`" language
//! in the data model: a plain adjacency list of states and arcs with a pdf-id label and a
//! transition weight. Constructing one of these from a lexicon, grammar, or decoding graph is out
//! of scope (§1) — callers are expected to hand in an already-built graph, the same way
//! [`crate::fst`] expects an already-labelled graph rather than compiling one from text.

/// A single arc in a [`StdFst`]: `pdf_id` is the acoustic class consumed when traversing it, and
/// `weight` is a transition *log-probability* (non-positive for a normalized graph, but this is
/// not enforced here — callers may hand in graphs with unreachable or incompletely normalized
/// mass, which [`crate::denominator_graph::DenominatorGraph::build`] will reject if it cannot
/// derive a valid stationary distribution from them).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StdArc {
    pub dest_state: usize,
    pub pdf_id: usize,
    pub log_prob: f64,
}

impl StdArc {
    pub fn new(dest_state: usize, pdf_id: usize, log_prob: f64) -> Self {
        Self {
            dest_state,
            pdf_id,
            log_prob,
        }
    }
}

/// A weighted acceptor over pdf-ids: a flat list of per-state out-arcs.
///
/// State 0 is always the start state. This is deliberately the simplest representation that can
/// express both the denominator HMM graph (cyclic, shared across minibatches) and a per-sequence
/// numerator/supervision graph (acyclic, one per utterance).
#[derive(Debug, Clone, Default)]
pub struct StdFst {
    /// `arcs[state]` are the out-arcs of `state`.
    arcs: Vec<Vec<StdArc>>,
}

impl StdFst {
    /// Creates an FST with `num_states` states and no arcs.
    pub fn new(num_states: usize) -> Self {
        Self {
            arcs: vec![Vec::new(); num_states],
        }
    }

    pub fn num_states(&self) -> usize {
        self.arcs.len()
    }

    /// Appends an arc from `src_state`. Panics if `src_state` is out of range — this is a
    /// construction-time helper used only by callers who already know the state count, the same
    /// way `ndarray`'s indexing operators panic on out-of-bounds rather than returning a
    /// `Result`.
    pub fn add_arc(&mut self, src_state: usize, arc: StdArc) {
        self.arcs[src_state].push(arc);
    }

    pub fn out_arcs(&self, state: usize) -> &[StdArc] {
        &self.arcs[state]
    }

    pub fn states(&self) -> impl Iterator<Item = usize> {
        0..self.arcs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_simple_ring() {
        let mut fst = StdFst::new(2);
        fst.add_arc(0, StdArc::new(1, 0, -0.1));
        fst.add_arc(1, StdArc::new(0, 1, -0.2));
        assert_eq!(fst.num_states(), 2);
        assert_eq!(fst.out_arcs(0).len(), 1);
        assert_eq!(fst.out_arcs(1)[0].pdf_id, 1);
    }
}
