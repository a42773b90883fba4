use candle_core::{DType, Device, Result, Tensor};
use clap::ValueEnum;
use std::collections::BTreeMap;
use std::fmt;

/// Added to the diagonal, together with the observation noise, to keep
/// covariance matrices numerically positive definite
pub const JITTER: f64 = 1e-6;

pub const K_LENGTH: &str = "k_length";
pub const K_SCALE: &str = "k_scale";
pub const PERIOD: &str = "period";
pub const NOISE: &str = "noise";

/// Covariance functions available to the GP
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KernelKind {
    /// squared exponential
    #[value(name = "RBF")]
    Rbf,
    /// Matern with ν = 5/2
    #[value(name = "Matern")]
    Matern,
    /// exponentiated sine squared
    #[value(name = "Periodic")]
    Periodic,
}

impl fmt::Display for KernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_possible_value() {
            Some(value) => write!(f, "{}", value.get_name()),
            None => write!(f, "{:?}", self),
        }
    }
}

impl KernelKind {
    /// Look a kernel up by name, ignoring case
    pub fn from_name(name: &str) -> anyhow::Result<Self> {
        <Self as ValueEnum>::from_str(name, true).map_err(|_| {
            anyhow::anyhow!(
                "unknown kernel `{}` (expected RBF, Matern or Periodic)",
                name
            )
        })
    }

    /// Hyperparameters the covariance function reads
    pub fn required_params(&self) -> &'static [&'static str] {
        match self {
            KernelKind::Rbf | KernelKind::Matern => &[K_LENGTH, K_SCALE],
            KernelKind::Periodic => &[K_LENGTH, K_SCALE, PERIOD],
        }
    }

    /// Covariance between the rows of `x_nd` and `z_md` (n x m)
    ///
    /// * `params` - kernel hyperparameters, see `required_params`
    /// * `noise` - observation noise; when given, the result must be
    ///   square and `noise + JITTER` is added to its diagonal. Pass `None`
    ///   for cross-covariances, which never carry observation noise.
    pub fn covariance(
        &self,
        x_nd: &Tensor,
        z_md: &Tensor,
        params: &KernelParams,
        noise: Option<&Tensor>,
    ) -> Result<Tensor> {
        let k_nm = match self {
            KernelKind::Rbf => rbf_kernel(x_nd, z_md, params)?,
            KernelKind::Matern => matern_kernel(x_nd, z_md, params)?,
            KernelKind::Periodic => periodic_kernel(x_nd, z_md, params)?,
        };

        match noise {
            None => Ok(k_nm),
            Some(noise) => add_noise_diagonal(&k_nm, noise),
        }
    }
}

/// `|x/ℓ - z/ℓ|^2` for every pair of rows, clipped at zero
fn square_scaled_distance(x_nd: &Tensor, z_md: &Tensor, length: &Tensor) -> Result<Tensor> {
    let x_nd = x_nd.broadcast_div(length)?;
    let z_md = z_md.broadcast_div(length)?;

    let x2_n1 = x_nd.sqr()?.sum_keepdim(1)?;
    let z2_m1 = z_md.sqr()?.sum_keepdim(1)?;
    let xz_nm = x_nd.matmul(&z_md.t()?)?;

    x2_n1
        .broadcast_sub(&(xz_nm * 2.)?)?
        .broadcast_add(&z2_m1.t()?)?
        .clamp(0_f64, f64::INFINITY)
}

fn rbf_kernel(x_nd: &Tensor, z_md: &Tensor, params: &KernelParams) -> Result<Tensor> {
    let r2 = square_scaled_distance(x_nd, z_md, params.get(K_LENGTH)?)?;
    (r2 * (-0.5))?.exp()?.broadcast_mul(params.get(K_SCALE)?)
}

fn matern_kernel(x_nd: &Tensor, z_md: &Tensor, params: &KernelParams) -> Result<Tensor> {
    const SQRT_5: f64 = 2.23606797749979;

    let r2 = square_scaled_distance(x_nd, z_md, params.get(K_LENGTH)?)?;
    // keep the gradient of sqrt finite at zero distance
    let sqrt5_r = ((&r2 + 1e-12)?.sqrt()? * SQRT_5)?;
    let poly = ((&sqrt5_r + 1.)? + (r2 * (5. / 3.))?)?;
    (poly * sqrt5_r.neg()?.exp()?)?.broadcast_mul(params.get(K_SCALE)?)
}

fn periodic_kernel(x_nd: &Tensor, z_md: &Tensor, params: &KernelParams) -> Result<Tensor> {
    let diff_nmd = x_nd.unsqueeze(1)?.broadcast_sub(&z_md.unsqueeze(0)?)?;
    let scaled_sin = (diff_nmd * std::f64::consts::PI)?
        .broadcast_div(params.get(PERIOD)?)?
        .sin()?
        .broadcast_div(params.get(K_LENGTH)?)?;
    (scaled_sin.sqr()?.sum(2)? * (-2.))?
        .exp()?
        .broadcast_mul(params.get(K_SCALE)?)
}

fn add_noise_diagonal(k_nn: &Tensor, noise: &Tensor) -> Result<Tensor> {
    let (n, m) = k_nn.dims2()?;
    if n != m {
        candle_core::bail!(
            "observation noise only applies to square covariance, got {}x{}",
            n,
            m
        );
    }
    let diag_nn =
        Tensor::eye(n, k_nn.dtype(), k_nn.device())?.broadcast_mul(&(noise + JITTER)?)?;
    k_nn + diag_nn
}

/// Named kernel hyperparameters (including `noise`), kept in name order
#[derive(Clone, Debug, Default)]
pub struct KernelParams {
    params: BTreeMap<String, Tensor>,
}

impl KernelParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Tensor) -> Option<Tensor> {
        self.params.insert(name.into(), value)
    }

    pub fn with(mut self, name: impl Into<String>, value: Tensor) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Result<&Tensor> {
        match self.params.get(name) {
            Some(value) => Ok(value),
            None => candle_core::bail!("missing kernel hyperparameter `{}`", name),
        }
    }

    pub fn noise(&self) -> Result<&Tensor> {
        self.get(NOISE)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Detached copies on `device` with `dtype`
    pub fn to_dtype_device(&self, dtype: DType, device: &Device) -> Result<Self> {
        let mut ret = Self::new();
        for (name, value) in self.params.iter() {
            let value = value.detach().to_device(device)?.to_dtype(dtype)?.copy()?;
            ret.insert(name.clone(), value);
        }
        Ok(ret)
    }

    /// Flattened values, for reports and serialization
    pub fn to_vec_map(&self) -> Result<BTreeMap<String, Vec<f64>>> {
        let mut ret = BTreeMap::new();
        for (name, value) in self.params.iter() {
            let values = value
                .to_device(&Device::Cpu)?
                .to_dtype(DType::F64)?
                .flatten_all()?
                .to_vec1::<f64>()?;
            ret.insert(name.clone(), values);
        }
        Ok(ret)
    }
}
