//! Explicit site context threaded through one execution of the model.
//!
//! A trace resolves every `sample` statement through the guide, keeps the
//! chosen values by name and accumulates the log joint density that the
//! SVI loss is built from.

use crate::distributions::{normal_log_prob, SiteDist};
use crate::embedding::PREDICTION_SEED;
use crate::guide::{AutoGuide, InferenceStrategy};
use crate::kernels::KernelParams;

use candle_core::{DType, Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::RngCore;
use rand_distr::{Distribution, StandardNormal};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceMode {
    /// draw values from the guide and accumulate the log density
    Guided,
    /// read the guide's median, nothing is accumulated
    Median,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SiteKind {
    Latent,
    Deterministic,
    Observed,
}

#[derive(Clone, Debug)]
pub struct Site {
    pub kind: SiteKind,
    pub value: Tensor,
}

pub struct Trace<'a> {
    guide: &'a AutoGuide<'a>,
    rng: &'a mut StdRng,
    mode: TraceMode,
    dtype: DType,
    device: Device,
    sites: BTreeMap<String, Site>,
    log_density: Vec<Tensor>,
}

impl<'a> Trace<'a> {
    pub fn new(
        guide: &'a AutoGuide<'a>,
        rng: &'a mut StdRng,
        mode: TraceMode,
        dtype: DType,
        device: &Device,
    ) -> Self {
        Self {
            guide,
            rng,
            mode,
            dtype,
            device: device.clone(),
            sites: BTreeMap::new(),
            log_density: vec![],
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Seed for stochastic layers of the embedding network
    pub fn network_seed(&mut self) -> u64 {
        match self.mode {
            TraceMode::Median => PREDICTION_SEED,
            TraceMode::Guided => self.rng.next_u64(),
        }
    }

    fn register(&mut self, name: &str, site: Site) -> Result<()> {
        if self.sites.contains_key(name) {
            candle_core::bail!("site `{}` declared twice in one trace", name);
        }
        self.sites.insert(name.to_string(), site);
        Ok(())
    }

    /// Latent random variable `name ~ dist` with the given shape
    pub fn sample(&mut self, name: &str, dist: &SiteDist, shape: &[usize]) -> Result<Tensor> {
        if self.sites.contains_key(name) {
            candle_core::bail!("site `{}` declared twice in one trace", name);
        }

        let support = dist.support();
        let init = dist.median_unconstrained(shape, self.dtype, &self.device)?;
        let loc = self.guide.loc(name, &init)?;

        let value = match (self.mode, self.guide.strategy) {
            (TraceMode::Median, _) => support.to_constrained(&loc.detach())?,
            (TraceMode::Guided, InferenceStrategy::PointEstimate) => {
                let value = support.to_constrained(&loc)?;
                self.log_density.push(dist.log_prob(&value)?);
                value
            }
            (TraceMode::Guided, InferenceStrategy::MeanField { .. }) => {
                let log_scale = self.guide.log_scale(name, &loc)?;
                let eps = self.standard_normal(loc.dims())?;
                let u = (&loc + log_scale.exp()?.mul(&eps)?)?;
                let value = support.to_constrained(&u)?;

                let log_p = dist.log_prob(&value)?;
                let log_jac = support.log_abs_det_jacobian(&u)?;
                let log_q = normal_log_prob(&u, &loc, &log_scale)?;
                self.log_density.push(((log_p + log_jac)? - log_q)?);
                value
            }
        };

        self.register(
            name,
            Site {
                kind: SiteKind::Latent,
                value: value.clone(),
            },
        )?;
        Ok(value)
    }

    /// Record a derived value under `name`
    pub fn deterministic(&mut self, name: &str, value: Tensor) -> Result<Tensor> {
        self.register(
            name,
            Site {
                kind: SiteKind::Deterministic,
                value: value.clone(),
            },
        )?;
        Ok(value)
    }

    /// Condition on `obs`; the likelihood is only evaluated in guided mode
    pub fn observe<F>(&mut self, name: &str, obs: &Tensor, log_likelihood: F) -> Result<()>
    where
        F: FnOnce() -> Result<Tensor>,
    {
        if self.mode == TraceMode::Guided {
            self.log_density.push(log_likelihood()?);
        }
        self.register(
            name,
            Site {
                kind: SiteKind::Observed,
                value: obs.clone(),
            },
        )
    }

    /// Accumulated log joint density (scalar, zero if nothing was added)
    pub fn log_density(&self) -> Result<Tensor> {
        if self.log_density.is_empty() {
            return Tensor::zeros((), self.dtype, &self.device);
        }
        Tensor::stack(&self.log_density, 0)?.sum_all()
    }

    pub fn sites(&self) -> &BTreeMap<String, Site> {
        &self.sites
    }

    /// Latent and deterministic values, detached
    pub fn point_values(&self) -> Result<KernelParams> {
        let mut ret = KernelParams::new();
        for (name, site) in self.sites.iter() {
            if site.kind != SiteKind::Observed {
                ret.insert(name.clone(), site.value.detach().copy()?);
            }
        }
        Ok(ret)
    }

    fn standard_normal(&mut self, shape: &[usize]) -> Result<Tensor> {
        let n: usize = shape.iter().product();
        let data: Vec<f64> = (0..n)
            .map(|_| StandardNormal.sample(&mut *self.rng))
            .collect();
        Tensor::from_vec(data, shape, &self.device)?.to_dtype(self.dtype)
    }
}
