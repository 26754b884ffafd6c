use candle_core::{bail, IndexOp, Result, Tensor, Var};
use log::debug;

use crate::candle_model_traits::{FunctionGaussian, Linearize, StochasticForward};
use crate::candle_param_map::{paired_log_var_name, ModelState, Params, TensorMap};
use crate::candle_rng_key::RngKey;

/// First-order (delta method) linearization of a mean-field network
///
/// ```text
/// f(x; θ) ≈ f(x; μ) + J(x) (θ - μ),   θ ~ N(μ, diag σ²)
/// mean = f(x; μ)
/// cov  = J diag(σ²) Jᵀ
/// ```
///
/// `J` is the Jacobian of the outputs at the inducing points with respect
/// to the mean parameters, evaluated at `μ` and held constant. Gradients
/// reach `μ` through the mean and `ln σ²` through the covariance.
#[derive(Debug, Clone)]
pub struct JacobianLinearizer {
    jitter: f64,
}

impl Default for JacobianLinearizer {
    fn default() -> Self {
        Self::new(1e-6)
    }
}

impl JacobianLinearizer {
    /// * `jitter` - added to the diagonal of full covariances
    pub fn new(jitter: f64) -> Self {
        Self { jitter }
    }

    /// Jacobian `(m * k) x P`, row `i * k + c` for output channel `c` at
    /// inducing point `i`; columns follow the mean parameters by name.
    #[allow(clippy::too_many_arguments)]
    fn jacobian<F: StochasticForward>(
        &self,
        forward: &F,
        mean: &TensorMap,
        log_var: &TensorMap,
        deterministic: &TensorMap,
        state: &ModelState,
        inducing_md: &Tensor,
        key: RngKey,
    ) -> Result<Tensor> {
        let vars = mean
            .iter()
            .map(|(name, t)| Ok((name.to_string(), Var::from_tensor(&t.detach())?)))
            .collect::<Result<Vec<_>>>()?;

        let at_mean: TensorMap = vars
            .iter()
            .map(|(name, v)| (name.clone(), v.as_tensor().clone()))
            .collect();
        let params = Params::new(at_mean, log_var.detach(), deterministic.detach())?;
        let (f_mk, _) = forward.forward_t(&params, state, key, inducing_md, false, true)?;
        let (m, k) = f_mk.dims2()?;

        let mut rows = Vec::with_capacity(m * k);
        for i in 0..m {
            for c in 0..k {
                let grads = f_mk.i((i, c))?.backward()?;
                let row = vars
                    .iter()
                    .map(|(_, v)| match grads.get(v.as_tensor()) {
                        Some(g) => g.flatten_all(),
                        None => Tensor::zeros(v.elem_count(), v.dtype(), v.device()),
                    })
                    .collect::<Result<Vec<_>>>()?;
                rows.push(Tensor::cat(&row, 0)?);
            }
        }
        Tensor::stack(&rows, 0)?.detach().contiguous()
    }

    /// σ² of every mean parameter, flattened in the Jacobian's column order
    fn param_variance(mean: &TensorMap, log_var: &TensorMap) -> Result<Tensor> {
        let parts = mean
            .names()
            .map(|name| match paired_log_var_name(name) {
                Some(lv_name) => log_var.get(&lv_name)?.exp()?.flatten_all(),
                None => bail!("mean parameter `{}` has no log-variance pair", name),
            })
            .collect::<Result<Vec<_>>>()?;
        Tensor::cat(&parts, 0)
    }
}

impl Linearize for JacobianLinearizer {
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
    ) -> Result<FunctionGaussian> {
        if mean.is_empty() {
            bail!("nothing to linearize: no mean parameters");
        }

        let (key_mean, key_jac) = key.split2();

        let params = Params::new(mean.clone(), log_var.clone(), deterministic.clone())?;
        let (mean_mk, _) = forward.forward_t(
            &params,
            state,
            key_mean,
            inducing_md,
            stochastic_linearization,
            true,
        )?;
        let (m, k) = mean_mk.dims2()?;

        let jac = self.jacobian(
            forward,
            mean,
            log_var,
            deterministic,
            state,
            inducing_md,
            key_jac,
        )?;
        let var_p = Self::param_variance(mean, log_var)?;
        let n_params = var_p.dim(0)?;
        if jac.dims() != [m * k, n_params].as_slice() {
            bail!(
                "Jacobian is {:?}, expected ({}, {})",
                jac.dims(),
                m * k,
                n_params
            );
        }
        debug!(
            "linearized {} outputs over {} parameters (full_ntk = {})",
            m * k,
            n_params,
            full_ntk
        );

        let cov = if full_ntk {
            let jac_mkp = jac.reshape((m, k, n_params))?;
            let var_1p = var_p.unsqueeze(0)?;
            let jitter = (Tensor::eye(m, jac.dtype(), jac.device())? * self.jitter)?;
            let per_channel = (0..k)
                .map(|c| {
                    let jac_mp = jac_mkp.i((.., c, ..))?.contiguous()?;
                    jac_mp
                        .broadcast_mul(&var_1p)?
                        .matmul(&jac_mp.t()?)?
                        .add(&jitter)
                })
                .collect::<Result<Vec<_>>>()?;
            Tensor::stack(&per_channel, 0)?
        } else {
            jac.sqr()?.matmul(&var_p.unsqueeze(1)?)?.reshape((m, k))?
        };

        Ok(FunctionGaussian { mean: mean_mk, cov })
    }
}
