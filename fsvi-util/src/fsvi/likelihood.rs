use candle_core::{bail, DType, Result, Tensor};

use crate::candle_loss_functions::categorical_likelihood;

/// Monte Carlo categorical log-likelihood of one-hot targets
///
/// ```text
/// llik = 1/S Σ_s Σ_i Σ_k y(i,k) log_softmax(f_s(x_i))(k)
/// ```
///
/// Summed over the batch, averaged over samples, so the scale does not
/// depend on how many samples were drawn.
#[derive(Debug, Clone)]
pub struct CrossEntropyLikelihood {
    dtype: DType,
}

impl Default for CrossEntropyLikelihood {
    fn default() -> Self {
        Self::new(DType::F32)
    }
}

impl CrossEntropyLikelihood {
    /// * `dtype` - working dtype; inputs are cast to it
    pub fn new(dtype: DType) -> Self {
        Self { dtype }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// # Arguments
    /// * `f_snk` - sampled function outputs (S x n x k)
    /// * `y_nk` - one-hot targets (n x k)
    ///
    /// # Returns
    /// Scalar expected log-likelihood
    pub fn log_likelihood(&self, f_snk: &Tensor, y_nk: &Tensor) -> Result<Tensor> {
        let (_, n, k) = f_snk.dims3()?;
        let (n_y, k_y) = y_nk.dims2()?;
        if (n, k) != (n_y, k_y) {
            bail!(
                "samples are (_, {}, {}) but targets are ({}, {})",
                n,
                k,
                n_y,
                k_y
            );
        }
        let f_snk = f_snk.to_dtype(self.dtype)?;
        let y_nk = y_nk.to_dtype(self.dtype)?;
        categorical_likelihood(&y_nk, &f_snk)?.mean(0)
    }
}
