pub mod fit;

use clap::{Parser, Subcommand};

pub use fit::FitArgs;

#[derive(Parser)]
#[command(name = "fsvi-util")]
#[command(about = "Function-space variational inference for Bayesian MLPs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fit a mean-field MLP classifier with the FSVI ELBO on synthetic blobs
    Fit(FitArgs),
}
