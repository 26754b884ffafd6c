use candle_core::{bail, DType, Device, Result, Tensor};

use crate::candle_model_traits::StochasticForward;
use crate::candle_param_map::{ModelState, Params, TensorMap, LOG_VAR_SUFFIX, MEAN_SUFFIX};
use crate::candle_rng_key::RngKey;

fn weight_base(l: usize) -> String {
    format!("fc{}.weight", l)
}

fn bias_base(l: usize) -> String {
    format!("fc{}.bias", l)
}

fn bn_name(l: usize, what: &str) -> String {
    format!("bn{}.{}", l, what)
}

/// Mean-field Gaussian Bayesian MLP
///
/// Every weight and bias has a variational mean `*_mu` and log-variance
/// `*_logvar`. Hidden layers are `relu(bn(x W + b))`, with batch
/// normalization optional; its affine terms are deterministic
/// parameters and its running statistics live in the [`ModelState`].
#[derive(Clone, Debug)]
pub struct MeanFieldMlp {
    layer_dims: Vec<usize>,
    batch_norm: bool,
    bn_momentum: f64,
    bn_eps: f64,
}

impl MeanFieldMlp {
    pub fn new(dim_input: usize, hidden: &[usize], dim_output: usize) -> Self {
        let mut layer_dims = vec![dim_input];
        layer_dims.extend_from_slice(hidden);
        layer_dims.push(dim_output);
        Self {
            layer_dims,
            batch_norm: false,
            bn_momentum: 0.9,
            bn_eps: 1e-5,
        }
    }

    /// Batch-normalize hidden layers
    /// * `momentum` - weight of the old running statistics
    /// * `eps` - variance floor inside the normalization
    pub fn with_batch_norm(mut self, momentum: f64, eps: f64) -> Self {
        self.batch_norm = true;
        self.bn_momentum = momentum;
        self.bn_eps = eps;
        self
    }

    pub fn num_layers(&self) -> usize {
        self.layer_dims.len() - 1
    }

    fn is_hidden(&self, l: usize) -> bool {
        l + 1 < self.num_layers()
    }

    /// Fresh variational parameters and state
    ///
    /// * `key` - randomness for the weight means (scaled normal init)
    /// * `init_log_var` - initial log-variance of every weight and bias
    pub fn init_params(
        &self,
        key: RngKey,
        init_log_var: f64,
        dtype: DType,
        device: &Device,
    ) -> Result<(Params, ModelState)> {
        let mut mean = TensorMap::new();
        let mut log_var = TensorMap::new();

        for l in 0..self.num_layers() {
            let (d_in, d_out) = (self.layer_dims[l], self.layer_dims[l + 1]);
            let eps = key.fold_in(l as u64).normal((d_in, d_out), dtype, device)?;
            let w = (eps / (d_in as f64).sqrt())?;
            mean.insert(format!("{}{}", weight_base(l), MEAN_SUFFIX), w);
            mean.insert(
                format!("{}{}", bias_base(l), MEAN_SUFFIX),
                Tensor::zeros((1, d_out), dtype, device)?,
            );
            log_var.insert(
                format!("{}{}", weight_base(l), LOG_VAR_SUFFIX),
                (Tensor::ones((d_in, d_out), dtype, device)? * init_log_var)?,
            );
            log_var.insert(
                format!("{}{}", bias_base(l), LOG_VAR_SUFFIX),
                (Tensor::ones((1, d_out), dtype, device)? * init_log_var)?,
            );
        }

        let (deterministic, state) = self.init_batch_norm(dtype, device)?;
        Ok((Params::new(mean, log_var, deterministic)?, state))
    }

    /// Parameter-space prior N(0, prior_var) in the same layout
    pub fn prior_params(&self, prior_var: f64, dtype: DType, device: &Device) -> Result<Params> {
        if prior_var <= 0.0 {
            bail!("prior variance must be positive, got {}", prior_var);
        }
        let mut mean = TensorMap::new();
        let mut log_var = TensorMap::new();
        let ln_var = prior_var.ln();

        for l in 0..self.num_layers() {
            let (d_in, d_out) = (self.layer_dims[l], self.layer_dims[l + 1]);
            let shapes = [(weight_base(l), (d_in, d_out)), (bias_base(l), (1, d_out))];
            for (base, shape) in shapes {
                mean.insert(
                    format!("{}{}", base, MEAN_SUFFIX),
                    Tensor::zeros(shape, dtype, device)?,
                );
                log_var.insert(
                    format!("{}{}", base, LOG_VAR_SUFFIX),
                    (Tensor::ones(shape, dtype, device)? * ln_var)?,
                );
            }
        }

        let (deterministic, _) = self.init_batch_norm(dtype, device)?;
        Params::new(mean, log_var, deterministic)
    }

    fn init_batch_norm(&self, dtype: DType, device: &Device) -> Result<(TensorMap, ModelState)> {
        let mut deterministic = TensorMap::new();
        let mut state = ModelState::new();
        if !self.batch_norm {
            return Ok((deterministic, state));
        }
        for l in (0..self.num_layers()).filter(|&l| self.is_hidden(l)) {
            let d_out = self.layer_dims[l + 1];
            deterministic.insert(
                bn_name(l, "gamma"),
                Tensor::ones((1, d_out), dtype, device)?,
            );
            deterministic.insert(
                bn_name(l, "beta"),
                Tensor::zeros((1, d_out), dtype, device)?,
            );
            state.insert(
                bn_name(l, "running_mean"),
                Tensor::zeros((1, d_out), dtype, device)?,
            );
            state.insert(
                bn_name(l, "running_var"),
                Tensor::ones((1, d_out), dtype, device)?,
            );
        }
        Ok((deterministic, state))
    }

    /// θ = μ when deterministic, θ = μ + exp(0.5 lnσ²) ε otherwise
    fn layer_param(
        &self,
        params: &Params,
        base: &str,
        key: RngKey,
        stochastic: bool,
    ) -> Result<Tensor> {
        let mu = params.get(&format!("{}{}", base, MEAN_SUFFIX))?;
        if !stochastic {
            return Ok(mu.clone());
        }
        let log_var = params.get(&format!("{}{}", base, LOG_VAR_SUFFIX))?;
        let eps = key.normal(mu.dims(), mu.dtype(), mu.device())?;
        mu + (log_var * 0.5)?.exp()?.mul(&eps)?
    }

    fn batch_norm_t(
        &self,
        l: usize,
        h_nk: &Tensor,
        params: &Params,
        state: &ModelState,
        train: bool,
        new_state: &mut ModelState,
    ) -> Result<Tensor> {
        let gamma = params.get(&bn_name(l, "gamma"))?;
        let beta = params.get(&bn_name(l, "beta"))?;
        let running_mean = state.get(&bn_name(l, "running_mean"))?;
        let running_var = state.get(&bn_name(l, "running_var"))?;

        let (mean_1k, var_1k) = if train {
            let mean_1k = h_nk.mean_keepdim(0)?;
            let var_1k = h_nk.broadcast_sub(&mean_1k)?.sqr()?.mean_keepdim(0)?;
            let m = self.bn_momentum;
            new_state.insert(
                bn_name(l, "running_mean"),
                ((running_mean * m)? + (mean_1k.detach() * (1.0 - m))?)?,
            );
            new_state.insert(
                bn_name(l, "running_var"),
                ((running_var * m)? + (var_1k.detach() * (1.0 - m))?)?,
            );
            (mean_1k, var_1k)
        } else {
            (running_mean.clone(), running_var.clone())
        };

        let std_1k = (var_1k + self.bn_eps)?.sqrt()?;
        h_nk.broadcast_sub(&mean_1k)?
            .broadcast_div(&std_1k)?
            .broadcast_mul(gamma)?
            .broadcast_add(beta)
    }
}

impl StochasticForward for MeanFieldMlp {
    fn forward_t(
        &self,
        params: &Params,
        state: &ModelState,
        key: RngKey,
        x_nd: &Tensor,
        stochastic: bool,
        train: bool,
    ) -> Result<(Tensor, ModelState)> {
        let (_, d) = x_nd.dims2()?;
        if d != self.dim_input() {
            bail!("expected {} input features, got {}", self.dim_input(), d);
        }

        let mut new_state = state.clone();
        let mut h = x_nd.clone();

        for l in 0..self.num_layers() {
            let key_w = key.fold_in(2 * l as u64);
            let key_b = key.fold_in(2 * l as u64 + 1);
            let w = self.layer_param(params, &weight_base(l), key_w, stochastic)?;
            let b = self.layer_param(params, &bias_base(l), key_b, stochastic)?;
            h = h.matmul(&w)?.broadcast_add(&b)?;
            if self.is_hidden(l) {
                if self.batch_norm {
                    h = self.batch_norm_t(l, &h, params, state, train, &mut new_state)?;
                }
                h = h.relu()?;
            }
        }
        Ok((h, new_state))
    }

    fn dim_input(&self) -> usize {
        self.layer_dims[0]
    }

    fn dim_output(&self) -> usize {
        self.layer_dims[self.layer_dims.len() - 1]
    }
}
