use candle_core::{bail, DType, Result, Tensor};
use log::{debug, warn};

use super::config::FsviConfig;
use super::prior::{FunctionPrior, PriorType};
use crate::candle_loss_functions::{gaussian_kl_diag, gaussian_kl_full};

/// Multi-output KL divergence between two Gaussians over function values
///
/// `KL(N(mean, cov) || N(prior.mean, prior.cov))`, evaluated channel by
/// channel and summed over the `output_dim` channels. Channels are
/// independent; within a channel the covariance over inducing points is
/// either diagonal (`full_cov = false`, shapes (m x k)) or full
/// (`full_cov = true`, shapes (k x m x m)).
///
/// A degenerate prior is not repaired: the result may be Inf/NaN, and a
/// warning is logged so the caller can notice.
#[derive(Debug, Clone)]
pub struct FunctionKl {
    output_dim: usize,
    full_cov: bool,
    prior_type: PriorType,
    dtype: DType,
    eps: f64,
}

impl FunctionKl {
    /// * `output_dim` - number of independent output channels
    /// * `full_cov` - full covariances instead of per-point variances
    /// * `prior_type` - layout of the prior covariance
    /// * `dtype` - working dtype
    /// * `eps` - prior variances at or below this get reported
    pub fn new(
        output_dim: usize,
        full_cov: bool,
        prior_type: PriorType,
        dtype: DType,
        eps: f64,
    ) -> Self {
        Self {
            output_dim,
            full_cov,
            prior_type,
            dtype,
            eps,
        }
    }

    pub fn from_config(config: &FsviConfig) -> Self {
        Self::new(
            config.output_dim,
            config.full_cov,
            config.prior_type,
            config.dtype,
            config.eps,
        )
    }

    /// # Arguments
    /// * `mean_mk` - variational mean at the inducing points (m x k)
    /// * `cov` - variational covariance, (m x k) or (k x m x m)
    /// * `prior` - function-space prior at the same points
    ///
    /// # Returns
    /// Scalar KL divergence
    pub fn divergence(
        &self,
        mean_mk: &Tensor,
        cov: &Tensor,
        prior: &FunctionPrior,
    ) -> Result<Tensor> {
        let (m, k) = mean_mk.dims2()?;
        if k != self.output_dim {
            bail!("expected {} output channels, got {}", self.output_dim, k);
        }
        let expected: Vec<usize> = if self.full_cov {
            vec![k, m, m]
        } else {
            vec![m, k]
        };
        if cov.dims() != expected.as_slice() {
            bail!(
                "full_cov = {} needs variational covariance {:?}, got {:?}",
                self.full_cov,
                expected,
                cov.dims()
            );
        }
        prior.validate(self.full_cov, self.prior_type, m, k)?;

        let min_var = prior.min_variance(self.full_cov, self.prior_type)?;
        if min_var <= self.eps {
            warn!(
                "degenerate prior covariance: smallest variance {:e} <= {:e}",
                min_var, self.eps
            );
        }

        let mean_mk = mean_mk.to_dtype(self.dtype)?;
        let cov = cov.to_dtype(self.dtype)?;
        let prior_mean_mk = prior.mean.to_dtype(self.dtype)?;
        let prior_cov = prior.cov.to_dtype(self.dtype)?;

        let kl_per_channel = (0..k)
            .map(|c| {
                let mean_q = mean_mk.narrow(1, c, 1)?;
                let mean_p = prior_mean_mk.narrow(1, c, 1)?;
                if self.full_cov {
                    let cov_q = cov.get(c)?;
                    let cov_p = match self.prior_type {
                        PriorType::Isotropic => {
                            let eye = Tensor::eye(m, self.dtype, cov.device())?;
                            eye.broadcast_mul(&prior_cov.narrow(0, c, 1)?)?
                        }
                        PriorType::PerPoint => prior_cov.get(c)?,
                    };
                    gaussian_kl_full(&mean_q, &cov_q, &mean_p, &cov_p)
                } else {
                    let var_q = cov.narrow(1, c, 1)?;
                    let var_p = match self.prior_type {
                        PriorType::Isotropic => prior_cov.narrow(0, c, 1)?.unsqueeze(1)?,
                        PriorType::PerPoint => prior_cov.narrow(1, c, 1)?,
                    };
                    gaussian_kl_diag(&mean_q, &var_q, &mean_p, &var_p)
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let kl = Tensor::stack(&kl_per_channel, 0)?.sum_all()?;

        let kl_val = kl.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        if !kl_val.is_finite() {
            warn!("function KL is not finite: {}", kl_val);
        }
        debug!("function KL over {} points x {} channels: {}", m, k, kl_val);
        Ok(kl)
    }
}
