use candle_core::{Result, Tensor};

use crate::candle_param_map::{ModelState, Params, TensorMap};
use crate::candle_rng_key::RngKey;

pub trait StochasticForward {
    /// One forward pass of a mean-field network
    ///
    /// # Arguments
    /// * `params` - all three parameter partitions
    /// * `state` - auxiliary state (e.g. running batch statistics)
    /// * `key` - randomness for weight sampling
    /// * `x_nd` - input data (n x d)
    /// * `stochastic` - sample weights `θ = μ + σ ε` instead of using `μ`
    /// * `train` - use batch statistics and advance the state
    ///
    /// # Returns `(f_nk, new_state)`
    /// * `f_nk` - function outputs (n x k)
    /// * `new_state` - state after this pass (unchanged when `!train`)
    fn forward_t(
        &self,
        params: &Params,
        state: &ModelState,
        key: RngKey,
        x_nd: &Tensor,
        stochastic: bool,
        train: bool,
    ) -> Result<(Tensor, ModelState)>;

    fn dim_input(&self) -> usize;

    fn dim_output(&self) -> usize;
}

/// Gaussian over function outputs at `m` inputs and `k` channels
///
/// `cov` is either diagonal variances (m x k) or per-channel full
/// covariances (k x m x m).
#[derive(Clone, Debug)]
pub struct FunctionGaussian {
    pub mean: Tensor,
    pub cov: Tensor,
}

impl FunctionGaussian {
    pub fn is_full(&self) -> bool {
        self.cov.rank() == 3
    }

    /// Diagonal form (m x k); full covariances keep their per-point variances
    pub fn to_diagonal(&self) -> Result<Self> {
        if !self.is_full() {
            return Ok(self.clone());
        }
        let (k, m, _) = self.cov.dims3()?;
        let eye = Tensor::eye(m, self.cov.dtype(), self.cov.device())?;
        let var_km = self.cov.broadcast_mul(&eye.unsqueeze(0)?)?.sum(2)?;
        debug_assert_eq!(var_km.dims(), &[k, m]);
        Ok(Self {
            mean: self.mean.clone(),
            cov: var_km.t()?.contiguous()?,
        })
    }

    /// Copy cut off the autodiff graph
    pub fn detach(&self) -> Self {
        Self {
            mean: self.mean.detach(),
            cov: self.cov.detach(),
        }
    }
}

pub trait Linearize {
    /// Gaussian approximation of a network's outputs at `inducing_md`,
    /// obtained by linearizing around the variational mean.
    ///
    /// # Arguments
    /// * `forward` - the network
    /// * `mean`, `log_var`, `deterministic` - parameter partitions
    /// * `state` - auxiliary network state
    /// * `inducing_md` - inducing inputs (m x d)
    /// * `key` - randomness for a stochastic linearization point
    /// * `stochastic_linearization` - evaluate the mean at a sampled weight draw
    /// * `full_ntk` - full (k x m x m) covariance instead of (m x k) variances
    #[allow(clippy::too_many_arguments)]
    fn linearize<F: StochasticForward>(
        &self,
        forward: &F,
        mean: &TensorMap,
        log_var: &TensorMap,
        deterministic: &TensorMap,
        state: &ModelState,
        inducing_md: &Tensor,
        key: RngKey,
        stochastic_linearization: bool,
        full_ntk: bool,
    ) -> Result<FunctionGaussian>;
}
