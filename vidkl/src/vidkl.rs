use crate::embedding::{
    apply, initialize_network, FeatureExtractor, Mlp, NetworkParams, FEATURE_EXTRACTOR,
    PREDICTION_SEED,
};
use crate::guide::{AutoGuide, InferenceStrategy};
use crate::kernels::{KernelKind, KernelParams};
use crate::model::DklModel;
use crate::posterior::{mvn_posterior, sample_mvn};
use crate::priors::{KernelPrior, LatentPrior, LogNormalKernelPrior};
use crate::svi::{elbo_loss, run_svi, ObservedData, SviConfig};
use crate::trace::{Trace, TraceMode};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use log::info;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Construction-time settings of a [`ViDkl`] model
pub struct DklConfig {
    pub data_dim: Vec<usize>,
    pub z_dim: usize,
    pub kernel: KernelKind,
    pub strategy: InferenceStrategy,
    pub dtype: DType,
    pub device: Device,
    pub show_progress: bool,
    kernel_prior: Option<Box<dyn KernelPrior>>,
    latent_prior: Option<Box<dyn LatentPrior>>,
    extractor: Option<Box<dyn FeatureExtractor>>,
}

impl DklConfig {
    /// * `data_dim` - shape of a single input, e.g. `&[5]` or `&[8, 8]`
    pub fn new(data_dim: &[usize]) -> Self {
        Self {
            data_dim: data_dim.to_vec(),
            z_dim: 2,
            kernel: KernelKind::Rbf,
            strategy: InferenceStrategy::default(),
            dtype: DType::F64,
            device: Device::Cpu,
            show_progress: true,
            kernel_prior: None,
            latent_prior: None,
            extractor: None,
        }
    }

    pub fn z_dim(mut self, z_dim: usize) -> Self {
        self.z_dim = z_dim;
        self
    }

    pub fn kernel(mut self, kernel: KernelKind) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn strategy(mut self, strategy: InferenceStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn show_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn kernel_prior(mut self, prior: Box<dyn KernelPrior>) -> Self {
        self.kernel_prior = Some(prior);
        self
    }

    pub fn latent_prior(mut self, prior: Box<dyn LatentPrior>) -> Self {
        self.latent_prior = Some(prior);
        self
    }

    /// Replace the default `Mlp` embedding network
    pub fn extractor(mut self, extractor: Box<dyn FeatureExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }
}

pub struct FitArgs {
    pub num_steps: usize,
    pub step_size: f64,
    pub print_summary: bool,
}

impl Default for FitArgs {
    fn default() -> Self {
        Self {
            num_steps: 1000,
            step_size: 5e-3,
            print_summary: true,
        }
    }
}

/// Everything a fit leaves behind for prediction
pub struct FittedState {
    /// `(n, *data_dim)`
    pub x_train: Tensor,
    /// `(n,)`
    pub y_train: Tensor,
    pub nn_params: NetworkParams,
    pub kernel_params: KernelParams,
    /// negative ELBO at each SVI step
    pub losses: Vec<f64>,
}

/// Variational deep kernel learning
///
/// A GP whose kernel acts on the output of an embedding network. Network
/// weights, kernel hyperparameters and observation noise are fitted
/// jointly by SVI; predictions use the exact GP posterior in latent space.
pub struct ViDkl {
    data_dim: Vec<usize>,
    z_dim: usize,
    kernel: KernelKind,
    strategy: InferenceStrategy,
    dtype: DType,
    device: Device,
    show_progress: bool,
    kernel_prior: Box<dyn KernelPrior>,
    latent_prior: Option<Box<dyn LatentPrior>>,
    extractor: Box<dyn FeatureExtractor>,
    fitted: Option<FittedState>,
}

impl ViDkl {
    pub fn new(config: DklConfig) -> anyhow::Result<Self> {
        if config.z_dim == 0 {
            anyhow::bail!("latent dimension must be positive");
        }
        if config.data_dim.is_empty() || config.data_dim.contains(&0) {
            anyhow::bail!("invalid input shape {:?}", config.data_dim);
        }

        let extractor = config
            .extractor
            .unwrap_or_else(|| Box::new(Mlp::new(config.z_dim)));

        if extractor.dim_latent() != config.z_dim {
            anyhow::bail!(
                "embedding network outputs {} dimensions, but z_dim = {}",
                extractor.dim_latent(),
                config.z_dim
            );
        }

        Ok(Self {
            data_dim: config.data_dim,
            z_dim: config.z_dim,
            kernel: config.kernel,
            strategy: config.strategy,
            dtype: config.dtype,
            device: config.device,
            show_progress: config.show_progress,
            kernel_prior: config
                .kernel_prior
                .unwrap_or_else(|| Box::new(LogNormalKernelPrior::default())),
            latent_prior: config.latent_prior,
            extractor,
            fitted: None,
        })
    }

    pub fn kernel(&self) -> KernelKind {
        self.kernel
    }

    pub fn z_dim(&self) -> usize {
        self.z_dim
    }

    fn model(&self) -> DklModel<'_> {
        DklModel {
            kernel: self.kernel,
            z_dim: self.z_dim,
            extractor: self.extractor.as_ref(),
            kernel_prior: self.kernel_prior.as_ref(),
            latent_prior: self.latent_prior.as_deref(),
        }
    }

    /// Move `x` to the model's dtype/device and check its shape; a vector
    /// of scalars becomes a single column
    fn prepare_inputs(&self, x: &Tensor) -> anyhow::Result<Tensor> {
        let x = x.to_device(&self.device)?.to_dtype(self.dtype)?;
        let x = if x.rank() == 1 {
            let n = x.dim(0)?;
            x.reshape((n, 1))?
        } else {
            x
        };

        if x.rank() < 2 || x.dims()[1..] != self.data_dim[..] {
            anyhow::bail!(
                "inputs of shape {:?} do not match the input shape {:?}",
                x.dims(),
                self.data_dim
            );
        }
        Ok(x)
    }

    /// Fit the embedding network and the GP hyperparameters
    ///
    /// * `seed` - seeds network initialization and any stochastic draws
    /// * `x` - training inputs `(n, *data_dim)`
    /// * `y` - training targets `(n,)`
    ///
    /// Any previous fit is discarded.
    pub fn fit(&mut self, seed: u64, x: &Tensor, y: &Tensor, args: &FitArgs) -> anyhow::Result<()> {
        let x = self.prepare_inputs(x)?;
        let y = y
            .to_device(&self.device)?
            .to_dtype(self.dtype)?
            .flatten_all()?;

        let n = x.dim(0)?;
        if n != y.dim(0)? {
            anyhow::bail!("{} input rows but {} targets", n, y.dim(0)?);
        }

        let mut svi_config = SviConfig::new(args.num_steps, args.step_size);
        svi_config.show_progress = self.show_progress;
        svi_config.validate()?;

        info!(
            "fitting {} kernel on {} points, z_dim = {}, {:?}",
            self.kernel, n, self.z_dim, self.strategy
        );

        let (dtype, device) = (self.dtype, self.device.clone());
        let mut rng = StdRng::seed_from_u64(seed);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, &device);

        // register the network weights and re-draw them from the seed
        self.extractor
            .forward(vb.pp(FEATURE_EXTRACTOR), &x, PREDICTION_SEED)?;
        initialize_network(&varmap, FEATURE_EXTRACTOR, &mut rng)?;

        let guide = AutoGuide::new(self.strategy, &varmap);
        let model = self.model();
        let data = ObservedData { x: &x, y: &y };

        // Create the optimizer AFTER this pass so the varmap holds the guide sites
        elbo_loss(&model, &guide, &vb, &data, &mut rng)?;

        let losses = run_svi(&varmap, &svi_config, |_| {
            elbo_loss(&model, &guide, &vb, &data, &mut rng)
        })?;

        let nn_params = NetworkParams::from_varmap(&varmap, FEATURE_EXTRACTOR)?;

        let kernel_params = {
            let mut median_rng = StdRng::seed_from_u64(PREDICTION_SEED);
            let mut trace = Trace::new(&guide, &mut median_rng, TraceMode::Median, dtype, &device);
            model.run(&mut trace, &vb, &x, &y)?;
            trace.point_values()?
        };

        if let Some(last) = losses.last() {
            info!("final loss: {:.4}", last);
        }

        self.fitted = Some(FittedState {
            x_train: x,
            y_train: y,
            nn_params,
            kernel_params,
            losses,
        });

        if args.print_summary {
            for line in self.summary_lines()? {
                println!("{}", line);
            }
        }
        Ok(())
    }

    pub fn fitted(&self) -> anyhow::Result<&FittedState> {
        self.fitted
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("model not fitted: call fit first"))
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    /// Point estimates of the kernel hyperparameters and noise
    pub fn kernel_params(&self) -> anyhow::Result<&KernelParams> {
        Ok(&self.fitted()?.kernel_params)
    }

    pub fn losses(&self) -> anyhow::Result<&[f64]> {
        Ok(&self.fitted()?.losses)
    }

    /// Latent features of `x_new` under the fitted network `(m, z_dim)`
    pub fn embed(&self, x_new: &Tensor) -> anyhow::Result<Tensor> {
        let fitted = self.fitted()?;
        let x_new = self.prepare_inputs(x_new)?;
        Ok(apply(
            self.extractor.as_ref(),
            &fitted.nn_params,
            &x_new,
            PREDICTION_SEED,
        )?)
    }

    /// GP posterior mean `(m,)` and covariance `(m, m)` at `x_new`
    ///
    /// * `kernel_params` - hyperparameters to use instead of the fitted ones
    pub fn get_mvn_posterior(
        &self,
        x_new: &Tensor,
        kernel_params: Option<&KernelParams>,
    ) -> anyhow::Result<(DVector<f64>, DMatrix<f64>)> {
        let fitted = self.fitted()?;
        let x_new = self.prepare_inputs(x_new)?;

        let params = match kernel_params {
            Some(params) => params.to_dtype_device(self.dtype, &self.device)?,
            None => fitted.kernel_params.clone(),
        };

        let extractor = self.extractor.as_ref();
        let z_train = apply(extractor, &fitted.nn_params, &fitted.x_train, PREDICTION_SEED)?;
        let z_test = apply(extractor, &fitted.nn_params, &x_new, PREDICTION_SEED)?;

        mvn_posterior(self.kernel, &z_train, &fitted.y_train, &z_test, &params)
    }

    /// Posterior mean `(m,)` and `n` posterior draws `(n, m)` at `x_new`
    pub fn predict(
        &self,
        seed: u64,
        x_new: &Tensor,
        kernel_params: Option<&KernelParams>,
        n: usize,
    ) -> anyhow::Result<(DVector<f64>, DMatrix<f64>)> {
        let (mean, cov) = self.get_mvn_posterior(x_new, kernel_params)?;
        let mut rng = StdRng::seed_from_u64(seed);
        let samples = sample_mvn(&mean, &cov, n, &mut rng)?;
        Ok((mean, samples))
    }

    /// Report of the inferred hyperparameters, one per line
    pub fn summary_lines(&self) -> anyhow::Result<Vec<String>> {
        let params = self.kernel_params()?;

        let mut lines = vec!["\nInferred parameters".to_string()];
        for (name, value) in params.iter() {
            let values = value
                .to_device(&Device::Cpu)?
                .to_dtype(DType::F64)?
                .flatten_all()?
                .to_vec1::<f64>()?;

            let value_str = if value.rank() == 0 {
                format!("{:.4}", values[0])
            } else {
                let parts: Vec<String> = values.iter().map(|v| format!("{:.4}", v)).collect();
                format!("[{}]", parts.join(" "))
            };

            let pad = " ".repeat(15_usize.saturating_sub(name.len()));
            lines.push(format!("{} {} {}", name, pad, value_str));
        }
        Ok(lines)
    }
}
