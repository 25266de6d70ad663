//! Thin CLI driver around the `lf_chain` core: since there is no upstream neural-network
//! executor in this crate to wire up for real training, this binary instead exercises the core
//! against synthetic fixtures, the same "analysis tool over a dataset" role the teacher's
//! `trainer.rs Analyse` subcommand plays.

use clap::{Parser, Subcommand};
use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

use lf_chain::driver::compute_chain_objf_and_deriv;
use lf_chain::options::ChainTrainingOptions;
use lf_chain::synth;

#[derive(Parser, Debug)]
pub struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Emits a random denominator graph + compact-numerator supervision + score matrix of the
    /// requested shape, reporting basic stats (and optionally dumping them as JSON).
    Synth {
        #[clap(long, default_value_t = 8)]
        states: usize,
        #[clap(long, default_value_t = 4)]
        pdfs: usize,
        #[clap(long, default_value_t = 3)]
        out_degree: usize,
        #[clap(long, default_value_t = 2)]
        sequences: usize,
        #[clap(long, default_value_t = 10)]
        frames: usize,
        #[clap(long, default_value_t = 1)]
        seed: u64,
        /// Location to save a JSON summary of the generated fixture
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
    /// Runs the driver twice with `X` perturbed by `+-eps*E` for a random unit-norm `E` and
    /// compares the finite-difference directional derivative against `<dX, E>` (§8 property 4).
    GradientCheck {
        #[clap(long, default_value_t = 6)]
        states: usize,
        #[clap(long, default_value_t = 3)]
        pdfs: usize,
        #[clap(long, default_value_t = 2)]
        out_degree: usize,
        #[clap(long, default_value_t = 2)]
        sequences: usize,
        #[clap(long, default_value_t = 5)]
        frames: usize,
        #[clap(long, default_value_t = 1)]
        seed: u64,
        #[clap(long, default_value_t = 1e-3)]
        eps: f64,
        #[clap(long, default_value_t = 1e-5)]
        leaky_hmm_coefficient: f64,
        /// Location to save a JSON report of the comparison
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Serialize)]
struct SynthReport {
    num_states: usize,
    num_pdfs: usize,
    num_sequences: usize,
    frames_per_sequence: usize,
    objf: f64,
    l2_term: f64,
    weight: f64,
}

#[derive(Debug, Serialize)]
struct GradientCheckReport {
    finite_difference: f64,
    analytic: f64,
    relative_error: f64,
}

fn main() -> anyhow::Result<()> {
    lf_chain::setup_logging();
    let args = Args::parse();

    match args.command {
        Commands::Synth {
            states,
            pdfs,
            out_degree,
            sequences,
            frames,
            seed,
            output,
        } => {
            let mut rng = SmallRng::seed_from_u64(seed);
            let batch =
                synth::random_minibatch(states, pdfs, out_degree, sequences, frames, 1.0, &mut rng)?;
            let opts = ChainTrainingOptions::default();
            let mut dx = Array2::<f64>::zeros(batch.x.dim());
            let result = compute_chain_objf_and_deriv(
                &opts,
                &batch.den_graph,
                &batch.supervision,
                &batch.x,
                Some(&mut dx),
                None,
            )?;

            info!(
                objf = result.objf,
                weight = result.weight,
                "synthesized and scored a random minibatch"
            );

            let report = SynthReport {
                num_states: states,
                num_pdfs: pdfs,
                num_sequences: sequences,
                frames_per_sequence: frames,
                objf: result.objf,
                l2_term: result.l2_term,
                weight: result.weight,
            };
            if let Some(output) = output {
                std::fs::write(output, serde_json::to_string_pretty(&report)?)?;
            }
            Ok(())
        }
        Commands::GradientCheck {
            states,
            pdfs,
            out_degree,
            sequences,
            frames,
            seed,
            eps,
            leaky_hmm_coefficient,
            output,
        } => {
            let mut rng = SmallRng::seed_from_u64(seed);
            let batch =
                synth::random_minibatch(states, pdfs, out_degree, sequences, frames, 1.0, &mut rng)?;
            let mut opts = ChainTrainingOptions::default();
            opts.leaky_hmm_coefficient = leaky_hmm_coefficient;

            let mut dx = Array2::<f64>::zeros(batch.x.dim());
            compute_chain_objf_and_deriv(
                &opts,
                &batch.den_graph,
                &batch.supervision,
                &batch.x,
                Some(&mut dx),
                None,
            )?;

            let e = synth::random_unit_perturbation(batch.x.nrows(), batch.x.ncols(), &mut rng);
            let analytic: f64 = dx.iter().zip(e.iter()).map(|(a, b)| a * b).sum();

            let x_plus = &batch.x + &e.mapv(|v| v * eps);
            let x_minus = &batch.x - &e.mapv(|v| v * eps);
            let plus = compute_chain_objf_and_deriv(
                &opts,
                &batch.den_graph,
                &batch.supervision,
                &x_plus,
                None,
                None,
            )?;
            let minus = compute_chain_objf_and_deriv(
                &opts,
                &batch.den_graph,
                &batch.supervision,
                &x_minus,
                None,
                None,
            )?;
            let finite_difference = (plus.objf - minus.objf) / (2.0 * eps);
            let relative_error =
                (finite_difference - analytic).abs() / analytic.abs().max(finite_difference.abs()).max(1e-12);

            info!(
                finite_difference,
                analytic, relative_error, "gradient check"
            );

            let report = GradientCheckReport {
                finite_difference,
                analytic,
                relative_error,
            };
            if let Some(output) = output {
                std::fs::write(output, serde_json::to_string_pretty(&report)?)?;
            }
            Ok(())
        }
    }
}
