use crate::guide::InferenceStrategy;
use crate::kernels::KernelKind;
use crate::vidkl::{DklConfig, FitArgs, ViDkl};

use anyhow::Result;
use candle_core::Device;
use clap::Args;
use log::info;
use matrix_util::common_io::{mkdir_parent, open_buf_writer};
use matrix_util::traits::{ConvertMatOps, IoOps};
use nalgebra::DMatrix;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Args, Debug)]
pub struct FitCmdArgs {
    #[arg(short, long, help = "Training inputs (n x d), tsv or csv, optionally gzipped")]
    pub x: PathBuf,

    #[arg(short, long, help = "Training targets (n x 1)")]
    pub y: PathBuf,

    #[arg(long, help = "Inputs to predict at (m x d)")]
    pub x_new: Option<PathBuf>,

    #[arg(short, long, value_enum, ignore_case = true, default_value = "RBF")]
    pub kernel: KernelKind,

    #[arg(long, default_value = "2")]
    pub z_dim: usize,

    #[arg(long, default_value = "1000")]
    pub steps: usize,

    #[arg(long, default_value = "5e-3")]
    pub lr: f64,

    #[arg(long, default_value = "5000", help = "Number of posterior draws")]
    pub samples: usize,

    #[arg(long, default_value = "0")]
    pub seed: u64,

    #[arg(long, help = "Mean-field guide with this many particles (default: MAP)")]
    pub mean_field: Option<usize>,

    #[arg(long, help = "Hide the progress bar")]
    pub no_progress: bool,

    #[arg(short, long, help = "Output prefix (creates {output}.params.json, {output}.embed.tsv, etc.)")]
    pub output: PathBuf,
}

#[derive(Serialize)]
struct FitReport {
    kernel: String,
    z_dim: usize,
    num_steps: usize,
    step_size: f64,
    seed: u64,
    final_loss: Option<f64>,
    params: BTreeMap<String, Vec<f64>>,
}

fn read_matrix(path: &Path) -> Result<DMatrix<f64>> {
    let file = path.to_str().ok_or_else(|| anyhow::anyhow!("invalid path {:?}", path))?;
    let name = file.strip_suffix(".gz").unwrap_or(file).to_lowercase();
    let mat = if name.ends_with(".csv") {
        DMatrix::<f64>::read_file_delim(file, ",", None)?
    } else {
        DMatrix::<f64>::from_tsv(file, None)?
    };
    info!("read {} x {} matrix from {}", mat.nrows(), mat.ncols(), file);
    Ok(mat)
}

fn output_file(prefix: &Path, suffix: &str) -> String {
    format!("{}.{}", prefix.to_string_lossy(), suffix)
}

pub fn run(args: &FitCmdArgs) -> Result<()> {
    let device = Device::Cpu;

    let x_nd = read_matrix(&args.x)?;
    let y_n1 = read_matrix(&args.y)?;
    if y_n1.ncols() != 1 {
        anyhow::bail!("expected a single column of targets, got {}", y_n1.ncols());
    }

    let strategy = match args.mean_field {
        Some(num_particles) => InferenceStrategy::MeanField { num_particles },
        None => InferenceStrategy::PointEstimate,
    };

    let config = DklConfig::new(&[x_nd.ncols()])
        .z_dim(args.z_dim)
        .kernel(args.kernel)
        .strategy(strategy)
        .show_progress(!args.no_progress);

    let mut model = ViDkl::new(config)?;

    let x = x_nd.to_tensor(&device)?;
    let y = y_n1.to_tensor(&device)?;

    let fit_args = FitArgs {
        num_steps: args.steps,
        step_size: args.lr,
        print_summary: true,
    };
    model.fit(args.seed, &x, &y, &fit_args)?;

    let report = FitReport {
        kernel: model.kernel().to_string(),
        z_dim: model.z_dim(),
        num_steps: args.steps,
        step_size: args.lr,
        seed: args.seed,
        final_loss: model.losses()?.last().copied(),
        params: model.kernel_params()?.to_vec_map()?,
    };

    let params_file = output_file(&args.output, "params.json");
    mkdir_parent(&params_file)?;
    let mut writer = open_buf_writer(&params_file)?;
    serde_json::to_writer_pretty(&mut writer, &report)?;
    writer.flush()?;
    info!("wrote {}", params_file);

    let z_nk = DMatrix::<f64>::from_tensor(&model.embed(&x)?)?;
    let embed_file = output_file(&args.output, "embed.tsv");
    z_nk.to_tsv(&embed_file)?;
    info!("wrote {}", embed_file);

    if let Some(x_new_path) = &args.x_new {
        let x_new = read_matrix(x_new_path)?.to_tensor(&device)?;
        let (mean, samples) = model.predict(args.seed, &x_new, None, args.samples)?;
        let (_, cov) = model.get_mvn_posterior(&x_new, None)?;

        let var = cov.diagonal();
        DMatrix::from_column_slice(mean.len(), 1, mean.as_slice())
            .to_tsv(&output_file(&args.output, "mean.tsv"))?;
        DMatrix::from_column_slice(var.len(), 1, var.as_slice())
            .to_tsv(&output_file(&args.output, "var.tsv"))?;
        samples.to_tsv(&output_file(&args.output, "samples.tsv.gz"))?;

        info!(
            "predicted {} points with {} posterior draws",
            mean.len(),
            args.samples
        );
    }

    Ok(())
}
