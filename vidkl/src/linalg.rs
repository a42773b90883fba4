//! Dense linear algebra composed out of differentiable tensor ops.
//!
//! candle has no Cholesky factorization, so it is built one column at a
//! time from `narrow`, `matmul`, `sqrt` and `cat`; gradients flow back
//! through every step. The loops are sequential in `n`, which is fine for
//! the full-batch GP likelihood on a few hundred points.

use candle_core::{DType, Device, Result, Tensor};

/// `n x 1` mask keeping rows `i >= j`
fn lower_mask(n: usize, j: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    Tensor::arange(0u32, n as u32, device)?
        .ge(j as u32)?
        .to_dtype(dtype)?
        .reshape((n, 1))
}

/// Cholesky factor `L` such that `A = L * L'`
///
/// * `a_nn` - symmetric positive definite matrix (n x n)
///
/// A non-positive pivot is not reported; it shows up as `NaN` in `L`.
pub fn cholesky(a_nn: &Tensor) -> Result<Tensor> {
    let (n, m) = a_nn.dims2()?;
    if n != m {
        candle_core::bail!("cholesky: matrix must be square, got {}x{}", n, m);
    }
    let (dtype, device) = (a_nn.dtype(), a_nn.device());

    if n == 0 {
        return Tensor::zeros((0, 0), dtype, device);
    }

    let mut l_nj: Option<Tensor> = None;

    for j in 0..n {
        let a_j = a_nn.narrow(1, j, 1)?; // n x 1

        // v = A[:, j] - L[:, :j] * L[j, :j]'
        let v_j = match &l_nj {
            None => a_j,
            Some(l_nj) => {
                let l_row = l_nj.narrow(0, j, 1)?.t()?.contiguous()?; // j x 1
                (a_j - l_nj.matmul(&l_row)?)?
            }
        };

        // L[j, j] = sqrt(v[j]) and L[i, j] = v[i] / L[j, j] below
        let l_jj = v_j.narrow(0, j, 1)?.sqrt()?;
        let col_j = v_j
            .broadcast_div(&l_jj)?
            .broadcast_mul(&lower_mask(n, j, dtype, device)?)?;

        l_nj = Some(match l_nj {
            None => col_j,
            Some(l_nj) => Tensor::cat(&[&l_nj, &col_j], 1)?,
        });
    }

    match l_nj {
        Some(l_nn) => Ok(l_nn),
        None => candle_core::bail!("cholesky: empty factor"),
    }
}

/// Solve `L * X = B` by forward substitution
///
/// * `l_nn` - lower triangular matrix (n x n)
/// * `b_nk` - right-hand side (n x k)
pub fn solve_lower_triangular(l_nn: &Tensor, b_nk: &Tensor) -> Result<Tensor> {
    let (n, m) = l_nn.dims2()?;
    let (nb, _) = b_nk.dims2()?;
    if n != m || n != nb {
        candle_core::bail!(
            "solve_lower_triangular: incompatible shapes {:?} and {:?}",
            l_nn.dims(),
            b_nk.dims()
        );
    }

    let mut x_ik: Option<Tensor> = None;

    for i in 0..n {
        let b_i = b_nk.narrow(0, i, 1)?; // 1 x k
        let l_ii = l_nn.narrow(0, i, 1)?.narrow(1, i, 1)?; // 1 x 1

        let r_i = match &x_ik {
            None => b_i,
            Some(x_ik) => {
                let l_row = l_nn.narrow(0, i, 1)?.narrow(1, 0, i)?.contiguous()?; // 1 x i
                (b_i - l_row.matmul(x_ik)?)?
            }
        };

        let x_i = r_i.broadcast_div(&l_ii)?;

        x_ik = Some(match x_ik {
            None => x_i,
            Some(x_ik) => Tensor::cat(&[&x_ik, &x_i], 0)?,
        });
    }

    match x_ik {
        Some(x_nk) => Ok(x_nk),
        None => Tensor::zeros(b_nk.dims(), b_nk.dtype(), b_nk.device()),
    }
}

/// Diagonal elements of a square matrix (n,)
pub fn diagonal(a_nn: &Tensor) -> Result<Tensor> {
    let (n, _) = a_nn.dims2()?;
    (a_nn * Tensor::eye(n, a_nn.dtype(), a_nn.device())?)?.sum(1)
}

/// Log density of a zero-mean multivariate normal
///
/// `log N(y; 0, K) = -0.5 * |L^{-1} y|^2 - sum_i log L(i,i) - n/2 * log(2π)`
///
/// * `y_n` - observations (n,)
/// * `cov_nn` - covariance matrix (n x n)
///
/// Returns a scalar tensor.
pub fn mvn_log_prob(y_n: &Tensor, cov_nn: &Tensor) -> Result<Tensor> {
    let n = y_n.elem_count();
    let (nrow, _) = cov_nn.dims2()?;
    if n != nrow {
        candle_core::bail!(
            "mvn_log_prob: {} observations for a {}x{} covariance",
            n,
            nrow,
            nrow
        );
    }

    let l_nn = cholesky(cov_nn)?;
    let z_n1 = solve_lower_triangular(&l_nn, &y_n.reshape((n, 1))?)?;

    let quad = z_n1.sqr()?.sum_all()?;
    let half_log_det = diagonal(&l_nn)?.log()?.sum_all()?;
    let norm_const = 0.5 * (n as f64) * (2. * std::f64::consts::PI).ln();

    ((quad * (-0.5))? - half_log_det)? - norm_const
}
