use candle_core::{bail, Result, Tensor};

use crate::candle_model_traits::StochasticForward;
use crate::candle_param_map::{ModelState, Params};
use crate::candle_rng_key::RngKey;

/// Monte Carlo predictions at a batch of inputs
pub struct MultiSample {
    /// Function outputs (S x n x k)
    pub samples: Tensor,
    /// Sample mean (n x k)
    pub mean: Tensor,
    /// Sample variance, 1/S normalization (n x k)
    pub var: Tensor,
}

/// `n_samples` stochastic forward passes, one split key each
///
/// The model state handed back by the individual passes is dropped;
/// advancing the state is the caller's job.
///
/// # Arguments
/// * `forward` - the network
/// * `params` - merged parameter set
/// * `state` - model state
/// * `x_nd` - inputs (n x d)
/// * `key` - split into one key per sample
/// * `n_samples` - number of passes S
/// * `is_training` - use batch statistics
pub fn predict_f_multisample<F: StochasticForward>(
    forward: &F,
    params: &Params,
    state: &ModelState,
    x_nd: &Tensor,
    key: RngKey,
    n_samples: usize,
    is_training: bool,
) -> Result<MultiSample> {
    if n_samples == 0 {
        bail!("need at least one sample");
    }

    let draws = key
        .split(n_samples)
        .into_iter()
        .map(|k| {
            let (f_nk, _) = forward.forward_t(params, state, k, x_nd, true, is_training)?;
            Ok(f_nk)
        })
        .collect::<Result<Vec<_>>>()?;

    let samples = Tensor::stack(&draws, 0)?;
    let mean = samples.mean(0)?;
    let var = samples.broadcast_sub(&mean.unsqueeze(0)?)?.sqr()?.mean(0)?;
    Ok(MultiSample { samples, mean, var })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_bnn_mlp::MeanFieldMlp;
    use candle_core::{DType, Device};

    #[test]
    fn test_shapes_and_reproducibility() -> Result<()> {
        let device = Device::Cpu;
        let mlp = MeanFieldMlp::new(3, &[5], 4);
        let (params, state) = mlp.init_params(RngKey::new(0), -1.0, DType::F64, &device)?;
        let x = RngKey::new(1).normal((6, 3), DType::F64, &device)?;

        let a = predict_f_multisample(&mlp, &params, &state, &x, RngKey::new(2), 7, true)?;
        assert_eq!(a.samples.dims(), &[7, 6, 4]);
        assert_eq!(a.mean.dims(), &[6, 4]);
        assert_eq!(a.var.dims(), &[6, 4]);

        let b = predict_f_multisample(&mlp, &params, &state, &x, RngKey::new(2), 7, true)?;
        let diff: f64 = (&a.samples - &b.samples)?.abs()?.max_all()?.to_scalar()?;
        assert_eq!(diff, 0.0);

        let min_var: f64 = a.var.min_all()?.to_scalar()?;
        assert!(min_var > 0.0);
        Ok(())
    }

    #[test]
    fn test_single_sample_has_zero_variance() -> Result<()> {
        let device = Device::Cpu;
        let mlp = MeanFieldMlp::new(2, &[3], 2);
        let (params, state) = mlp.init_params(RngKey::new(0), -1.0, DType::F64, &device)?;
        let x = RngKey::new(1).normal((4, 2), DType::F64, &device)?;
        let s = predict_f_multisample(&mlp, &params, &state, &x, RngKey::new(2), 1, false)?;
        let max_var: f64 = s.var.max_all()?.to_scalar()?;
        assert_eq!(max_var, 0.0);
        let none = predict_f_multisample(&mlp, &params, &state, &x, RngKey::new(2), 0, false);
        assert!(none.is_err());
        Ok(())
    }
}
