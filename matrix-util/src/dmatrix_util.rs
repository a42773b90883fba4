use crate::traits::*;
use candle_core::{DType, Device, Tensor};
pub use nalgebra::{DMatrix, DVector};
use rand_distr::StandardNormal;

impl ConvertMatOps for DMatrix<f64> {
    type Mat = Self;

    /// A rank-1 tensor becomes a single column
    fn from_tensor(tensor: &Tensor) -> anyhow::Result<Self::Mat> {
        let tensor = tensor.to_device(&Device::Cpu)?.to_dtype(DType::F64)?;
        match tensor.rank() {
            1 => {
                let data = tensor.to_vec1::<f64>()?;
                Ok(DMatrix::<f64>::from_column_slice(data.len(), 1, &data))
            }
            2 => {
                let (nrow, ncol) = tensor.dims2()?;
                let data = tensor.to_vec2::<f64>()?.into_iter().flatten();
                Ok(DMatrix::<f64>::from_row_iterator(nrow, ncol, data))
            }
            r => Err(anyhow::anyhow!("expected a 1D or 2D tensor, got rank {}", r)),
        }
    }

    fn to_tensor(&self, dev: &Device) -> anyhow::Result<Tensor> {
        let data = self.transpose().as_slice().to_vec();
        Ok(Tensor::from_vec(data, (self.nrows(), self.ncols()), dev)?)
    }
}

impl ConvertMatOps for DVector<f64> {
    type Mat = Self;

    fn from_tensor(tensor: &Tensor) -> anyhow::Result<Self::Mat> {
        let data = tensor
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F64)?
            .flatten_all()?
            .to_vec1::<f64>()?;
        Ok(DVector::<f64>::from_vec(data))
    }

    fn to_tensor(&self, dev: &Device) -> anyhow::Result<Tensor> {
        Ok(Tensor::from_vec(self.as_slice().to_vec(), self.len(), dev)?)
    }
}

impl SampleOps for DMatrix<f64> {
    type Mat = Self;

    fn rnorm_with<R: rand::Rng>(nrow: usize, ncol: usize, rng: &mut R) -> Self::Mat {
        let data: Vec<f64> = (0..(nrow * ncol))
            .map(|_| rng.sample::<f64, _>(StandardNormal))
            .collect();
        DMatrix::<f64>::from_row_slice(nrow, ncol, &data)
    }
}

/// Symmetrize a square matrix in place: `X <- (X + X') / 2`
pub fn symmetrize(xx: &mut DMatrix<f64>) {
    let n = xx.nrows().min(xx.ncols());
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (xx[(i, j)] + xx[(j, i)]);
            xx[(i, j)] = avg;
            xx[(j, i)] = avg;
        }
    }
}
