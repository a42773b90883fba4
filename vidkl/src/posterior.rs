use crate::kernels::{KernelKind, KernelParams};

use candle_core::Tensor;
use log::warn;
use matrix_util::dmatrix_util::symmetrize;
use matrix_util::traits::{ConvertMatOps, SampleOps};
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rand::rngs::StdRng;

/// Noise-free covariance between test and training embeddings (m x n)
pub fn cross_covariance(
    kernel: KernelKind,
    z_test: &Tensor,
    z_train: &Tensor,
    params: &KernelParams,
) -> anyhow::Result<DMatrix<f64>> {
    let k_px = kernel.covariance(z_test, z_train, params, None)?;
    DMatrix::<f64>::from_tensor(&k_px)
}

/// Closed-form GP posterior at `z_test` given `(z_train, y_train)`
///
/// ```text
/// mean = K(*, X) K(X, X)^{-1} y
/// cov  = K(*, *) - K(*, X) K(X, X)^{-1} K(X, *)
/// ```
///
/// `K(X, X)` and `K(*, *)` carry the observation noise, `K(*, X)` does
/// not. The returned covariance is symmetrized.
pub fn mvn_posterior(
    kernel: KernelKind,
    z_train: &Tensor,
    y_train: &Tensor,
    z_test: &Tensor,
    params: &KernelParams,
) -> anyhow::Result<(DVector<f64>, DMatrix<f64>)> {
    for name in kernel.required_params() {
        params.get(name)?;
    }
    let noise = params.noise()?;

    let k_pp = kernel.covariance(z_test, z_test, params, Some(noise))?;
    let k_xx = kernel.covariance(z_train, z_train, params, Some(noise))?;

    let k_pp = DMatrix::<f64>::from_tensor(&k_pp)?;
    let k_xx = DMatrix::<f64>::from_tensor(&k_xx)?;
    let k_px = cross_covariance(kernel, z_test, z_train, params)?;
    let y = DVector::<f64>::from_tensor(y_train)?;

    if y.len() != k_xx.nrows() {
        anyhow::bail!(
            "{} training targets for {} training embeddings",
            y.len(),
            k_xx.nrows()
        );
    }

    let k_xx_inv = k_xx
        .try_inverse()
        .ok_or_else(|| anyhow::anyhow!("training covariance K(X, X) is singular"))?;

    let proj = &k_px * &k_xx_inv;
    let mean = &proj * &y;
    let mut cov = k_pp - &proj * k_px.transpose();
    symmetrize(&mut cov);

    Ok((mean, cov))
}

/// Draw `n` samples from `N(mean, cov)` as rows of an `n x m` matrix
///
/// Uses the Cholesky factor of `cov`; if `cov` is not numerically positive
/// definite, falls back to its eigendecomposition with negative
/// eigenvalues clamped to zero.
pub fn sample_mvn(
    mean: &DVector<f64>,
    cov: &DMatrix<f64>,
    n: usize,
    rng: &mut StdRng,
) -> anyhow::Result<DMatrix<f64>> {
    let m = mean.len();
    if cov.nrows() != m || cov.ncols() != m {
        anyhow::bail!(
            "covariance {}x{} does not match mean of length {}",
            cov.nrows(),
            cov.ncols(),
            m
        );
    }

    let mut cov = cov.clone();
    symmetrize(&mut cov);

    let l_mm = match cov.clone().cholesky() {
        Some(chol) => chol.l(),
        None => {
            warn!("posterior covariance is not positive definite; clamping its spectrum");
            let eig = SymmetricEigen::new(cov);
            let sqrt_lambda = eig.eigenvalues.map(|x| x.max(0.).sqrt());
            eig.eigenvectors * DMatrix::from_diagonal(&sqrt_lambda)
        }
    };

    let eps_nm = DMatrix::<f64>::rnorm_with(n, m, rng);
    let mut samples_nm = eps_nm * l_mm.transpose();
    let mean_t = mean.transpose();
    for mut row in samples_nm.row_iter_mut() {
        row += &mean_t;
    }
    Ok(samples_nm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{K_LENGTH, K_SCALE, NOISE};
    use candle_core::Device;
    use rand::SeedableRng;

    fn rbf_params(noise: f64) -> anyhow::Result<KernelParams> {
        let dev = Device::Cpu;
        Ok(KernelParams::new()
            .with(K_LENGTH, Tensor::new(&[1.0_f64], &dev)?)
            .with(K_SCALE, Tensor::new(1.0_f64, &dev)?)
            .with(NOISE, Tensor::new(noise, &dev)?))
    }

    #[test]
    fn posterior_interpolates_with_small_noise() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let z = Tensor::new(&[[-1.0_f64], [0.0], [1.5]], &dev)?;
        let y = Tensor::new(&[0.3_f64, -0.2, 0.8], &dev)?;
        let params = rbf_params(1e-6)?;

        let (mean, cov) = mvn_posterior(KernelKind::Rbf, &z, &y, &z, &params)?;
        approx::assert_abs_diff_eq!(mean[0], 0.3, epsilon = 1e-3);
        approx::assert_abs_diff_eq!(mean[1], -0.2, epsilon = 1e-3);
        approx::assert_abs_diff_eq!(mean[2], 0.8, epsilon = 1e-3);

        assert_eq!(cov, cov.transpose());
        for i in 0..3 {
            assert!(cov[(i, i)] > -1e-9);
            assert!(cov[(i, i)] < 1e-3);
        }
        Ok(())
    }

    #[test]
    fn posterior_far_away_reverts_to_prior() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let z = Tensor::new(&[[0.0_f64], [0.5]], &dev)?;
        let y = Tensor::new(&[1.0_f64, 1.2], &dev)?;
        let z_far = Tensor::new(&[[50.0_f64]], &dev)?;
        let params = rbf_params(0.1)?;

        let (mean, cov) = mvn_posterior(KernelKind::Rbf, &z, &y, &z_far, &params)?;
        approx::assert_abs_diff_eq!(mean[0], 0.0, epsilon = 1e-9);
        approx::assert_abs_diff_eq!(cov[(0, 0)], 1.1 + crate::kernels::JITTER, epsilon = 1e-9);
        Ok(())
    }

    #[test]
    fn posterior_requires_noise() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let z = Tensor::new(&[[0.0_f64]], &dev)?;
        let y = Tensor::new(&[1.0_f64], &dev)?;
        let params = KernelParams::new()
            .with(K_LENGTH, Tensor::new(&[1.0_f64], &dev)?)
            .with(K_SCALE, Tensor::new(1.0_f64, &dev)?);
        assert!(mvn_posterior(KernelKind::Rbf, &z, &y, &z, &params).is_err());
        Ok(())
    }

    #[test]
    fn periodic_posterior_requires_a_period() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let z = Tensor::new(&[[0.0_f64], [1.0]], &dev)?;
        let y = Tensor::new(&[1.0_f64, 0.5], &dev)?;
        let params = rbf_params(0.1)?;

        let err = mvn_posterior(KernelKind::Periodic, &z, &y, &z, &params)
            .err()
            .map(|e| e.to_string());
        assert!(err.is_some_and(|e| e.contains("period")));

        let params = params.with(crate::kernels::PERIOD, Tensor::new(1.5_f64, &dev)?);
        let (mean, _) = mvn_posterior(KernelKind::Periodic, &z, &y, &z, &params)?;
        assert_eq!(mean.len(), 2);
        Ok(())
    }

    #[test]
    fn samples_match_moments() -> anyhow::Result<()> {
        let mean = DVector::from_vec(vec![1.0, -2.0]);
        let cov = DMatrix::from_row_slice(2, 2, &[2.0, 0.6, 0.6, 0.5]);
        let mut rng = StdRng::seed_from_u64(11);

        let n = 20000;
        let samples = sample_mvn(&mean, &cov, n, &mut rng)?;
        assert_eq!(samples.shape(), (n, 2));

        let mu = samples.row_mean();
        approx::assert_abs_diff_eq!(mu[0], 1.0, epsilon = 0.05);
        approx::assert_abs_diff_eq!(mu[1], -2.0, epsilon = 0.05);

        let centered = DMatrix::from_fn(n, 2, |i, j| samples[(i, j)] - mu[j]);
        let emp = centered.transpose() * &centered / (n as f64 - 1.);
        approx::assert_abs_diff_eq!(emp[(0, 0)], 2.0, epsilon = 0.1);
        approx::assert_abs_diff_eq!(emp[(0, 1)], 0.6, epsilon = 0.05);
        approx::assert_abs_diff_eq!(emp[(1, 1)], 0.5, epsilon = 0.05);
        Ok(())
    }

    #[test]
    fn degenerate_covariance_still_samples() -> anyhow::Result<()> {
        // rank one: both coordinates move together
        let mean = DVector::from_vec(vec![0.0, 0.0]);
        let cov = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let mut rng = StdRng::seed_from_u64(3);

        let samples = sample_mvn(&mean, &cov, 100, &mut rng)?;
        for i in 0..100 {
            approx::assert_abs_diff_eq!(samples[(i, 0)], samples[(i, 1)], epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn sampling_is_seeded() -> anyhow::Result<()> {
        let mean = DVector::from_vec(vec![0.5, 0.0, -0.5]);
        let cov = DMatrix::<f64>::identity(3, 3);

        let a = sample_mvn(&mean, &cov, 10, &mut StdRng::seed_from_u64(5))?;
        let b = sample_mvn(&mean, &cov, 10, &mut StdRng::seed_from_u64(5))?;
        let c = sample_mvn(&mean, &cov, 10, &mut StdRng::seed_from_u64(6))?;
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut rng = StdRng::seed_from_u64(5);
        assert!(sample_mvn(&mean, &DMatrix::identity(2, 2), 10, &mut rng).is_err());
        Ok(())
    }
}
