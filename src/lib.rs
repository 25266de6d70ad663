//! Lattice-free sequence discriminative training ("chain") objective and gradient core.
//!
//! Given the per-frame, per-class log-scores produced by an upstream acoustic model and a pair
//! of graph-structured supervisions — a numerator constraint graph describing allowed alignments
//! for one utterance, and a denominator phone-level language model graph shared across the
//! corpus — [`driver::compute_chain_objf_and_deriv`] and [`driver::compute_chain_smbr_objf_and_deriv`]
//! compute a scalar training objective and, optionally, its gradient with respect to the scores.
//!
//! The crate is a pure numerical core: it does no file I/O, no FST construction from a lexicon or
//! decoding graph, and no training-loop orchestration. Callers hand in an already-built
//! [`denominator_graph::DenominatorGraph`] and [`supervision::Supervision`]; the `chain-tool`
//! binary in `src/bin/` exercises the core with synthetic fixtures for development and
//! gradient-check purposes.

pub mod denominator;
pub mod denominator_graph;
pub mod denominator_smbr;
pub mod driver;
pub mod error;
pub mod fst;
pub mod generic_numerator;
pub mod numerator;
pub mod numerator_fb;
pub mod options;
pub mod silence;
pub mod supervision;
pub mod synth;

pub use denominator_graph::DenominatorGraph;
pub use driver::{
    compute_chain_objf_and_deriv, compute_chain_smbr_objf_and_deriv, ChainObjf, SmbrObjf,
};
pub use error::ChainError;
pub use options::ChainTrainingOptions;
pub use supervision::{NumeratorGraph, Supervision};

use std::env;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::{Layer, Registry};

/// Installs a global `tracing` subscriber, `info` by default for this crate and `chain-tool`,
/// overridable with `RUST_LOG`. Only binaries should call this; the library itself never installs
/// a subscriber, it only emits events.
pub fn setup_logging() {
    let filter = match env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_env("RUST_LOG"),
        _ => EnvFilter::new("lf_chain=info,chain_tool=info"),
    };

    let fmt = tracing_subscriber::fmt::Layer::default();

    let subscriber = filter.and_then(fmt).with_subscriber(Registry::default());

    tracing::subscriber::set_global_default(subscriber).unwrap();
}
