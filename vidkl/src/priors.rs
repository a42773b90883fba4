use crate::distributions::SiteDist;
use crate::kernels::{KernelKind, KernelParams, K_LENGTH, K_SCALE, PERIOD};
use crate::trace::Trace;

use candle_core::{Result, Tensor};

/// Site name of the latent embedding under a latent prior
pub const LATENT_Z: &str = "z_latent";

/// Declares the kernel hyperparameters as sites of a trace
pub trait KernelPrior {
    /// Sample every hyperparameter `kernel` needs (except `noise`)
    ///
    /// * `trace` - site context of the current model execution
    /// * `kernel` - covariance function the values are for
    /// * `z_dim` - latent dimension, the length of an ARD `k_length`
    fn sample(&self, trace: &mut Trace, kernel: KernelKind, z_dim: usize)
        -> Result<KernelParams>;
}

/// Every hyperparameter ~ LogNormal(0, 1); `k_length` has one entry per
/// latent dimension
#[derive(Clone, Copy, Debug)]
pub struct LogNormalKernelPrior {
    /// if false, `k_scale` is fixed at 1
    pub output_scale: bool,
}

impl Default for LogNormalKernelPrior {
    fn default() -> Self {
        Self { output_scale: true }
    }
}

impl KernelPrior for LogNormalKernelPrior {
    fn sample(
        &self,
        trace: &mut Trace,
        kernel: KernelKind,
        z_dim: usize,
    ) -> Result<KernelParams> {
        let dist = SiteDist::standard_log_normal();
        let mut params = KernelParams::new();

        params.insert(K_LENGTH, trace.sample(K_LENGTH, &dist, &[z_dim])?);

        let k_scale = if self.output_scale {
            trace.sample(K_SCALE, &dist, &[])?
        } else {
            let one = Tensor::ones((), trace.dtype(), trace.device())?;
            trace.deterministic(K_SCALE, one)?
        };
        params.insert(K_SCALE, k_scale);

        if kernel == KernelKind::Periodic {
            params.insert(PERIOD, trace.sample(PERIOD, &dist, &[])?);
        }

        Ok(params)
    }
}

/// Stochastic transform applied to the embedding before the kernel
pub trait LatentPrior {
    fn transform(&self, z_nk: &Tensor, trace: &mut Trace) -> Result<Tensor>;
}

/// `z' ~ N(z, scale^2)` elementwise
#[derive(Clone, Copy, Debug)]
pub struct GaussianLatentPrior {
    pub scale: f64,
}

impl GaussianLatentPrior {
    pub fn new(scale: f64) -> Self {
        Self { scale }
    }
}

impl LatentPrior for GaussianLatentPrior {
    fn transform(&self, z_nk: &Tensor, trace: &mut Trace) -> Result<Tensor> {
        let dist = SiteDist::normal(z_nk.clone(), self.scale);
        trace.sample(LATENT_Z, &dist, z_nk.dims())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guide::{AutoGuide, InferenceStrategy};
    use crate::trace::TraceMode;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sampled_names(prior: &dyn KernelPrior, kernel: KernelKind) -> Result<Vec<String>> {
        let varmap = VarMap::new();
        let guide = AutoGuide::new(InferenceStrategy::PointEstimate, &varmap);
        let mut rng = StdRng::seed_from_u64(0);
        let mut trace = Trace::new(&guide, &mut rng, TraceMode::Guided, DType::F64, &Device::Cpu);
        let params = prior.sample(&mut trace, kernel, 3)?;
        assert_eq!(params.get(K_LENGTH)?.dims(), &[3]);
        Ok(params.names().map(|s| s.to_string()).collect())
    }

    #[test]
    fn default_prior_sites() -> Result<()> {
        let prior = LogNormalKernelPrior::default();
        assert_eq!(sampled_names(&prior, KernelKind::Rbf)?, vec![K_LENGTH, K_SCALE]);
        assert_eq!(
            sampled_names(&prior, KernelKind::Periodic)?,
            vec![K_LENGTH, K_SCALE, PERIOD]
        );
        Ok(())
    }

    #[test]
    fn fixed_output_scale_is_deterministic() -> Result<()> {
        let varmap = VarMap::new();
        let guide = AutoGuide::new(InferenceStrategy::PointEstimate, &varmap);
        let mut rng = StdRng::seed_from_u64(0);
        let mut trace = Trace::new(&guide, &mut rng, TraceMode::Guided, DType::F64, &Device::Cpu);

        let prior = LogNormalKernelPrior {
            output_scale: false,
        };
        let params = prior.sample(&mut trace, KernelKind::Matern, 2)?;
        assert_eq!(params.get(K_SCALE)?.to_scalar::<f64>()?, 1.0);
        // only k_length is learnable
        assert_eq!(varmap.all_vars().len(), 1);
        Ok(())
    }

    #[test]
    fn latent_prior_starts_at_the_embedding() -> Result<()> {
        let varmap = VarMap::new();
        let guide = AutoGuide::new(InferenceStrategy::PointEstimate, &varmap);
        let mut rng = StdRng::seed_from_u64(0);
        let dev = Device::Cpu;
        let mut trace = Trace::new(&guide, &mut rng, TraceMode::Guided, DType::F64, &dev);

        let z = Tensor::new(&[[0.5_f64, -0.5], [1.0, 2.0]], &dev)?;
        let z_new = GaussianLatentPrior::new(0.1).transform(&z, &mut trace)?;
        assert_eq!(z_new.to_vec2::<f64>()?, z.to_vec2::<f64>()?);
        assert!(trace.sites().contains_key(LATENT_Z));
        Ok(())
    }
}
