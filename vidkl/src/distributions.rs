use candle_core::{DType, Device, Result, Tensor};

const LN_2PI: f64 = 1.8378770664093453;

/// Where a site's values live
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Support {
    Real,
    Positive,
}

impl Support {
    /// Map an unconstrained value `u` into the support
    pub fn to_constrained(&self, u: &Tensor) -> Result<Tensor> {
        match self {
            Support::Real => Ok(u.clone()),
            Support::Positive => u.exp(),
        }
    }

    /// `log |dT/du|` summed over elements
    pub fn log_abs_det_jacobian(&self, u: &Tensor) -> Result<Tensor> {
        match self {
            Support::Real => Tensor::zeros((), u.dtype(), u.device()),
            Support::Positive => u.sum_all(),
        }
    }
}

/// Prior distribution of a latent site
#[derive(Clone, Debug)]
pub enum SiteDist {
    /// `log v ~ N(loc, scale^2)`, elementwise
    LogNormal { loc: f64, scale: f64 },
    /// `v ~ N(loc, scale^2)` with a tensor-valued location
    Normal { loc: Tensor, scale: f64 },
}

impl SiteDist {
    pub fn log_normal(loc: f64, scale: f64) -> Self {
        SiteDist::LogNormal { loc, scale }
    }

    /// LogNormal(0, 1), the default hyperparameter prior
    pub fn standard_log_normal() -> Self {
        Self::log_normal(0., 1.)
    }

    pub fn normal(loc: Tensor, scale: f64) -> Self {
        SiteDist::Normal { loc, scale }
    }

    pub fn support(&self) -> Support {
        match self {
            SiteDist::LogNormal { .. } => Support::Positive,
            SiteDist::Normal { .. } => Support::Real,
        }
    }

    /// Log density of `value`, summed over all elements (scalar)
    pub fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        match self {
            SiteDist::LogNormal { loc, scale } => {
                let log_v = value.log()?;
                let n = value.elem_count() as f64;
                let quad = ((&log_v - *loc)?.sqr()?.sum_all()? / (2. * scale * scale))?;
                let log_jac = log_v.sum_all()?;
                let norm_const = n * (scale.ln() + 0.5 * LN_2PI);
                (quad + log_jac)?.neg()? - norm_const
            }
            SiteDist::Normal { loc, scale } => {
                let n = value.elem_count() as f64;
                let quad =
                    (value.broadcast_sub(loc)?.sqr()?.sum_all()? / (2. * scale * scale))?;
                quad.neg()? - n * (scale.ln() + 0.5 * LN_2PI)
            }
        }
    }

    /// Median of the distribution in unconstrained coordinates
    pub fn median_unconstrained(
        &self,
        shape: &[usize],
        dtype: DType,
        device: &Device,
    ) -> Result<Tensor> {
        match self {
            SiteDist::LogNormal { loc, .. } => Tensor::ones(shape, dtype, device)? * *loc,
            SiteDist::Normal { loc, .. } => loc
                .to_dtype(dtype)?
                .to_device(device)?
                .broadcast_as(shape)?
                .contiguous(),
        }
    }
}

/// Diagonal normal log density with tensor parameters, summed (scalar)
///
/// * `x` - value
/// * `loc` - location, same shape as `x`
/// * `log_scale` - log standard deviation, same shape as `x`
pub fn normal_log_prob(x: &Tensor, loc: &Tensor, log_scale: &Tensor) -> Result<Tensor> {
    let z = ((x - loc)? / log_scale.exp()?)?;
    let n = x.elem_count() as f64;
    let quad = (z.sqr()?.sum_all()? * 0.5)?;
    (quad + log_scale.sum_all()?)?.neg()? - 0.5 * n * LN_2PI
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_log_normal_density() -> Result<()> {
        let dev = Device::Cpu;
        let v = Tensor::new(&[1.0_f64, 2.0], &dev)?;
        let lp = SiteDist::standard_log_normal().log_prob(&v)?.to_scalar::<f64>()?;

        let single = |x: f64| -x.ln() - 0.5 * LN_2PI - 0.5 * x.ln().powi(2);
        approx::assert_abs_diff_eq!(lp, single(1.0) + single(2.0), epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn normal_density_broadcasts_location() -> Result<()> {
        let dev = Device::Cpu;
        let loc = Tensor::new(&[[0.0_f64, 1.0], [2.0, 3.0]], &dev)?;
        let dist = SiteDist::normal(loc.clone(), 0.5);

        let lp = dist.log_prob(&loc)?.to_scalar::<f64>()?;
        let expected = -4.0 * (0.5_f64.ln() + 0.5 * LN_2PI);
        approx::assert_abs_diff_eq!(lp, expected, epsilon = 1e-12);
        assert_eq!(dist.support(), Support::Real);
        Ok(())
    }

    #[test]
    fn medians_in_unconstrained_space() -> Result<()> {
        let dev = Device::Cpu;
        let m = SiteDist::log_normal(0.3, 1.0).median_unconstrained(&[3], DType::F64, &dev)?;
        assert_eq!(m.to_vec1::<f64>()?, vec![0.3; 3]);

        let scalar = SiteDist::standard_log_normal().median_unconstrained(&[], DType::F64, &dev)?;
        assert_eq!(scalar.to_scalar::<f64>()?, 0.0);

        let loc = Tensor::new(&[[1.0_f64, -1.0]], &dev)?;
        let m = SiteDist::normal(loc, 1.0).median_unconstrained(&[1, 2], DType::F64, &dev)?;
        assert_eq!(m.to_vec2::<f64>()?, vec![vec![1.0, -1.0]]);
        Ok(())
    }

    #[test]
    fn positive_support_jacobian() -> Result<()> {
        let dev = Device::Cpu;
        let u = Tensor::new(&[0.5_f64, -0.25], &dev)?;
        let v = Support::Positive.to_constrained(&u)?.to_vec1::<f64>()?;
        approx::assert_abs_diff_eq!(v[0], 0.5_f64.exp(), epsilon = 1e-12);

        let j = Support::Positive.log_abs_det_jacobian(&u)?.to_scalar::<f64>()?;
        approx::assert_abs_diff_eq!(j, 0.25, epsilon = 1e-12);

        let j = Support::Real.log_abs_det_jacobian(&u)?.to_scalar::<f64>()?;
        assert_eq!(j, 0.0);
        Ok(())
    }

    #[test]
    fn diagonal_normal_matches_site_normal() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[0.2_f64, -0.4, 1.0], &dev)?;
        let loc = Tensor::new(&[0.0_f64, 0.0, 0.5], &dev)?;
        let log_scale = (Tensor::ones(3, DType::F64, &dev)? * 0.7_f64.ln())?;

        let a = normal_log_prob(&x, &loc, &log_scale)?.to_scalar::<f64>()?;
        let b = SiteDist::normal(loc, 0.7).log_prob(&x)?.to_scalar::<f64>()?;
        approx::assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        Ok(())
    }
}
