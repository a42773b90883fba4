pub mod fit;
pub mod simulate;

use clap::{Parser, Subcommand};

pub use fit::FitCmdArgs;
pub use simulate::SimulateArgs;

#[derive(Parser)]
#[command(name = "vidkl")]
#[command(about = "Variational deep kernel learning: GP regression on learned embeddings")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Simulate a toy regression data set
    Simulate(SimulateArgs),
    /// Fit viDKL and predict on new inputs
    Fit(FitCmdArgs),
}
