use candle_core::{Result, Tensor, Var};
use candle_nn::VarMap;

/// Initial standard deviation of mean-field guide sites
const INIT_SCALE: f64 = 0.1;

/// How latent sites are approximated during fitting
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum InferenceStrategy {
    /// Delta guide: every latent site is a learnable point (MAP)
    #[default]
    PointEstimate,
    /// Diagonal normal guide in unconstrained space, with the ELBO
    /// averaged over `num_particles` reparameterized draws
    MeanField { num_particles: usize },
}

impl InferenceStrategy {
    pub fn num_particles(&self) -> usize {
        match self {
            InferenceStrategy::PointEstimate => 1,
            InferenceStrategy::MeanField { num_particles } => (*num_particles).max(1),
        }
    }
}

/// Automatically built variational guide
///
/// Site parameters live in the same `VarMap` as the network weights,
/// under `auto_loc.<site>` and `auto_scale.<site>`, so one optimizer
/// updates both.
pub struct AutoGuide<'a> {
    pub strategy: InferenceStrategy,
    varmap: &'a VarMap,
}

impl<'a> AutoGuide<'a> {
    pub fn new(strategy: InferenceStrategy, varmap: &'a VarMap) -> Self {
        Self { strategy, varmap }
    }

    /// Unconstrained location of `site`, created from `init` on first use
    pub fn loc(&self, site: &str, init: &Tensor) -> Result<Tensor> {
        self.get_or_insert(&format!("auto_loc.{}", site), init)
    }

    /// Log standard deviation of `site`, created at `ln(0.1)` on first use
    pub fn log_scale(&self, site: &str, loc: &Tensor) -> Result<Tensor> {
        let init = (loc.zeros_like()? + INIT_SCALE.ln())?;
        self.get_or_insert(&format!("auto_scale.{}", site), &init)
    }

    fn get_or_insert(&self, name: &str, init: &Tensor) -> Result<Tensor> {
        let mut data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("varmap lock: {}", e)))?;

        if let Some(var) = data.get(name) {
            if var.dims() != init.dims() {
                candle_core::bail!(
                    "guide site {} has shape {:?}, requested {:?}",
                    name,
                    var.dims(),
                    init.dims()
                );
            }
            return Ok(var.as_tensor().clone());
        }

        let var = Var::from_tensor(&init.detach().contiguous()?)?;
        let ret = var.as_tensor().clone();
        data.insert(name.to_string(), var);
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn sites_are_registered_once() -> Result<()> {
        let varmap = VarMap::new();
        let guide = AutoGuide::new(InferenceStrategy::PointEstimate, &varmap);
        let dev = Device::Cpu;

        let init = Tensor::zeros(3, DType::F64, &dev)?;
        let a = guide.loc("k_length", &init)?;
        let b = guide.loc("k_length", &(init.ones_like()?))?;

        // second call returns the existing variable, not the new init
        assert_eq!(b.to_vec1::<f64>()?, vec![0.0; 3]);
        assert_eq!(a.id(), b.id());
        assert_eq!(varmap.all_vars().len(), 1);

        assert!(guide.loc("k_length", &Tensor::zeros(2, DType::F64, &dev)?).is_err());
        Ok(())
    }

    #[test]
    fn mean_field_scale_starts_small() -> Result<()> {
        let varmap = VarMap::new();
        let strategy = InferenceStrategy::MeanField { num_particles: 4 };
        let guide = AutoGuide::new(strategy, &varmap);

        let loc = guide.loc("noise", &Tensor::new(0.0_f64, &Device::Cpu)?)?;
        let log_scale = guide.log_scale("noise", &loc)?.to_scalar::<f64>()?;
        approx::assert_abs_diff_eq!(log_scale.exp(), 0.1, epsilon = 1e-12);

        assert_eq!(strategy.num_particles(), 4);
        assert_eq!(InferenceStrategy::default().num_particles(), 1);
        let data = varmap.data().lock().map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        assert!(data.contains_key("auto_loc.noise"));
        assert!(data.contains_key("auto_scale.noise"));
        assert_eq!(data.len(), 2);
        Ok(())
    }
}
