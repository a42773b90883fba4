use anyhow::Result;
use clap::Args;
use log::info;
use matrix_util::traits::{IoOps, SampleOps};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct SimulateArgs {
    #[arg(short = 'n', long, default_value = "20", help = "Number of data points")]
    pub num_points: usize,

    #[arg(short = 'd', long, default_value = "5", help = "Input dimension")]
    pub input_dim: usize,

    #[arg(long, default_value = "0")]
    pub seed: u64,

    #[arg(short, long, help = "Output prefix (creates {output}.x.tsv and {output}.y.tsv)")]
    pub output: PathBuf,
}

/// `X ~ N(0, 1)` and `y = sin(sum_j X_ij)`
pub fn simulate_sine(n: usize, d: usize, seed: u64) -> (DMatrix<f64>, DVector<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let x_nd = DMatrix::<f64>::rnorm_with(n, d, &mut rng);
    let y_n = DVector::from_iterator(n, x_nd.row_iter().map(|row| row.sum().sin()));
    (x_nd, y_n)
}

pub fn run(args: &SimulateArgs) -> Result<()> {
    if args.num_points == 0 || args.input_dim == 0 {
        anyhow::bail!("need at least one data point and one input dimension");
    }

    let (x_nd, y_n) = simulate_sine(args.num_points, args.input_dim, args.seed);

    let prefix = args.output.to_string_lossy();
    let x_file = format!("{}.x.tsv", prefix);
    let y_file = format!("{}.y.tsv", prefix);

    x_nd.to_tsv(&x_file)?;
    DMatrix::from_column_slice(y_n.len(), 1, y_n.as_slice()).to_tsv(&y_file)?;

    info!(
        "simulated {} x {} inputs: {}, {}",
        args.num_points, args.input_dim, x_file, y_file
    );
    Ok(())
}
