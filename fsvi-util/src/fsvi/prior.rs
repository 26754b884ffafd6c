use std::fmt;
use std::str::FromStr;

use candle_core::{bail, DType, Device, Error, Result, Tensor};

use crate::candle_model_traits::{Linearize, StochasticForward};
use crate::candle_param_map::{ModelState, Params};
use crate::candle_rng_key::RngKey;

/// How the prior covariance tensor is laid out
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PriorType {
    /// One variance per output channel, σ²I over the inducing points: (k,)
    Isotropic,
    /// Same structure as the variational covariance: (m, k) or (k, m, m)
    PerPoint,
}

impl FromStr for PriorType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "isotropic" => Ok(PriorType::Isotropic),
            "per_point" | "per-point" => Ok(PriorType::PerPoint),
            other => Err(Error::Msg(format!(
                "unsupported prior type `{}`: expected isotropic or per_point",
                other
            ))),
        }
    }
}

impl fmt::Display for PriorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriorType::Isotropic => write!(f, "isotropic"),
            PriorType::PerPoint => write!(f, "per_point"),
        }
    }
}

/// Function-space prior N(mean, cov) at a set of inducing inputs
#[derive(Clone, Debug)]
pub struct FunctionPrior {
    /// Prior mean (m x k)
    pub mean: Tensor,
    /// Prior covariance, laid out per [`PriorType`]
    pub cov: Tensor,
}

impl FunctionPrior {
    pub fn new(mean: Tensor, cov: Tensor) -> Self {
        Self { mean, cov }
    }

    /// Constant mean and one shared variance for every channel
    ///
    /// * `m` - number of inducing points
    /// * `k` - number of output channels
    pub fn isotropic(
        m: usize,
        k: usize,
        mean: f64,
        variance: f64,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let mean_mk = (Tensor::ones((m, k), dtype, device)? * mean)?;
        let cov_k = (Tensor::ones(k, dtype, device)? * variance)?;
        Ok(Self::new(mean_mk, cov_k))
    }

    /// Prior induced on function space by a parameter-space Gaussian
    ///
    /// The mean is `forward` evaluated at the prior means. The covariance
    /// is `J diag(σ²) Jᵀ` with `J` taken at one draw `θ ~ N(μ, σ²)` of
    /// `prior_params`; at the means themselves a zero-mean ReLU network
    /// has no active units and only the output bias would contribute.
    /// The result is detached and is meant for [`PriorType::PerPoint`].
    #[allow(clippy::too_many_arguments)]
    pub fn bnn_induced<F, L>(
        forward: &F,
        linearizer: &L,
        prior_params: &Params,
        state: &ModelState,
        inducing_md: &Tensor,
        key: RngKey,
        full_ntk: bool,
    ) -> Result<Self>
    where
        F: StochasticForward,
        L: Linearize,
    {
        let (key_draw, key_lin) = key.split2();
        let (f_mk, _) = forward.forward_t(prior_params, state, key, inducing_md, false, false)?;

        let draw = prior_params.draw(key_draw)?;
        let (mean, log_var, deterministic) = draw.partition();
        let linearized = linearizer.linearize(
            forward,
            mean,
            log_var,
            deterministic,
            state,
            inducing_md,
            key_lin,
            false,
            full_ntk,
        )?;
        Ok(Self::new(f_mk.detach(), linearized.cov.detach()))
    }

    /// Check shapes against the KL configuration
    ///
    /// * `full_cov` - full (k x m x m) covariances expected
    /// * `prior_type` - covariance layout
    /// * `m`, `k` - inducing points and output channels
    pub fn validate(
        &self,
        full_cov: bool,
        prior_type: PriorType,
        m: usize,
        k: usize,
    ) -> Result<()> {
        if self.mean.dims() != [m, k].as_slice() {
            bail!(
                "prior mean must be ({}, {}), got {:?}",
                m,
                k,
                self.mean.dims()
            );
        }
        let expected: Vec<usize> = match (prior_type, full_cov) {
            (PriorType::Isotropic, _) => vec![k],
            (PriorType::PerPoint, false) => vec![m, k],
            (PriorType::PerPoint, true) => vec![k, m, m],
        };
        if self.cov.dims() != expected.as_slice() {
            bail!(
                "{} prior with full_cov = {} needs covariance {:?}, got {:?}",
                prior_type,
                full_cov,
                expected,
                self.cov.dims()
            );
        }
        Ok(())
    }

    /// Smallest prior variance (a diagonal entry for full covariances)
    pub fn min_variance(&self, full_cov: bool, prior_type: PriorType) -> Result<f64> {
        let var = match (prior_type, full_cov) {
            (PriorType::PerPoint, true) => {
                let (k, m, _) = self.cov.dims3()?;
                let eye = Tensor::eye(m, self.cov.dtype(), self.cov.device())?;
                self.cov
                    .broadcast_mul(&eye.unsqueeze(0)?)?
                    .sum(2)?
                    .reshape(k * m)?
            }
            _ => self.cov.flatten_all()?,
        };
        var.min(0)?.to_dtype(DType::F64)?.to_scalar::<f64>()
    }
}
