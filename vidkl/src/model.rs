use crate::distributions::SiteDist;
use crate::embedding::{FeatureExtractor, FEATURE_EXTRACTOR};
use crate::kernels::{KernelKind, NOISE};
use crate::linalg::mvn_log_prob;
use crate::priors::{KernelPrior, LatentPrior};
use crate::trace::Trace;

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

/// GP on top of a learned embedding
///
/// ```text
/// z       = f(x; θ)
/// z'      = latent_prior(z)          (optional)
/// ℓ, s    ~ kernel prior
/// noise   ~ LogNormal(0, 1)
/// y       ~ N(0, K(z', z') + (noise + jitter) I)
/// ```
pub struct DklModel<'a> {
    pub kernel: KernelKind,
    pub z_dim: usize,
    pub extractor: &'a dyn FeatureExtractor,
    pub kernel_prior: &'a dyn KernelPrior,
    pub latent_prior: Option<&'a dyn LatentPrior>,
}

impl DklModel<'_> {
    /// Run the model once, declaring every site on `trace`
    ///
    /// * `vb` - parameter scope holding the network weights
    /// * `x` - training inputs `(n, *data_dim)`
    /// * `y` - training targets `(n,)`
    pub fn run(&self, trace: &mut Trace, vb: &VarBuilder, x: &Tensor, y: &Tensor) -> Result<()> {
        let seed = trace.network_seed();
        let mut z_nk = self.extractor.forward(vb.pp(FEATURE_EXTRACTOR), x, seed)?;

        if let Some(latent_prior) = self.latent_prior {
            z_nk = latent_prior.transform(&z_nk, trace)?;
        }

        let mut params = self.kernel_prior.sample(trace, self.kernel, self.z_dim)?;
        let noise = trace.sample(NOISE, &SiteDist::standard_log_normal(), &[])?;
        params.insert(NOISE, noise.clone());

        let kernel = self.kernel;
        trace.observe("y", y, || {
            let k_nn = kernel.covariance(&z_nk, &z_nk, &params, Some(&noise))?;
            mvn_log_prob(y, &k_nn)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::Mlp;
    use crate::guide::{AutoGuide, InferenceStrategy};
    use crate::priors::LogNormalKernelPrior;
    use crate::trace::TraceMode;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn model_declares_hyperparameters_and_observation() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &dev);
        let guide = AutoGuide::new(InferenceStrategy::PointEstimate, &varmap);
        let mut rng = StdRng::seed_from_u64(0);

        let mlp = Mlp::new(2);
        let prior = LogNormalKernelPrior::default();
        let model = DklModel {
            kernel: KernelKind::Rbf,
            z_dim: 2,
            extractor: &mlp,
            kernel_prior: &prior,
            latent_prior: None,
        };

        let x = Tensor::new(&[[0.0_f64, 1.0], [1.0, 0.0], [0.5, 0.5]], &dev)?;
        let y = Tensor::new(&[0.1_f64, -0.2, 0.3], &dev)?;

        let mut trace = Trace::new(&guide, &mut rng, TraceMode::Guided, DType::F64, &dev);
        model.run(&mut trace, &vb, &x, &y)?;

        let names: Vec<&String> = trace.sites().keys().collect();
        assert_eq!(names, vec!["k_length", "k_scale", "noise", "y"]);
        assert!(trace.log_density()?.to_scalar::<f64>()?.is_finite());
        Ok(())
    }

    #[test]
    fn mismatched_targets_fail() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &dev);
        let guide = AutoGuide::new(InferenceStrategy::PointEstimate, &varmap);
        let mut rng = StdRng::seed_from_u64(0);

        let mlp = Mlp::new(2);
        let prior = LogNormalKernelPrior::default();
        let model = DklModel {
            kernel: KernelKind::Matern,
            z_dim: 2,
            extractor: &mlp,
            kernel_prior: &prior,
            latent_prior: None,
        };

        let x = Tensor::zeros((3, 2), DType::F64, &dev)?;
        let y = Tensor::zeros(4, DType::F64, &dev)?;
        let mut trace = Trace::new(&guide, &mut rng, TraceMode::Guided, DType::F64, &dev);
        assert!(model.run(&mut trace, &vb, &x, &y).is_err());
        Ok(())
    }
}
