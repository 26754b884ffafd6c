use candle_core::{bail, DType, Device, Result, Tensor};

use crate::candle_rng_key::RngKey;

/// Inducing inputs drawn uniformly from the box `[low, high)^dim`
pub fn uniform_inducing_inputs(
    key: RngKey,
    n_inducing: usize,
    dim: usize,
    low: f64,
    high: f64,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    if n_inducing == 0 {
        bail!("need at least one inducing point");
    }
    key.uniform((n_inducing, dim), low, high, dtype, device)
}

/// `n_inducing` distinct rows of `inputs_nd`, chosen at random
pub fn subsample_inducing_inputs(
    key: RngKey,
    inputs_nd: &Tensor,
    n_inducing: usize,
) -> Result<Tensor> {
    if n_inducing == 0 {
        bail!("need at least one inducing point");
    }
    let (n, _) = inputs_nd.dims2()?;
    let idx = key.sample_indices(n, n_inducing)?;
    let idx = Tensor::from_vec(idx, n_inducing, inputs_nd.device())?;
    inputs_nd.index_select(&idx, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_range() -> Result<()> {
        let device = Device::Cpu;
        let key = RngKey::new(0);
        let z = uniform_inducing_inputs(key, 50, 3, -2.0, 1.0, DType::F64, &device)?;
        assert_eq!(z.dims(), &[50, 3]);
        let lo: f64 = z.min_all()?.to_scalar()?;
        let hi: f64 = z.max_all()?.to_scalar()?;
        assert!(lo >= -2.0 && hi < 1.0);
        let empty = uniform_inducing_inputs(key, 0, 3, -2.0, 1.0, DType::F64, &device);
        assert!(empty.is_err());
        Ok(())
    }

    #[test]
    fn test_subsample_rows() -> Result<()> {
        let x = Tensor::arange(0f64, 20., &Device::Cpu)?.reshape((10, 2))?;
        let z = subsample_inducing_inputs(RngKey::new(3), &x, 4)?;
        assert_eq!(z.dims(), &[4, 2]);
        // rows stay intact: second column is first + 1
        let gap = (z.narrow(1, 1, 1)? - z.narrow(1, 0, 1)?)?;
        let diff: f64 = (gap - 1.0)?.abs()?.max_all()?.to_scalar()?;
        assert_eq!(diff, 0.0);
        assert!(subsample_inducing_inputs(RngKey::new(3), &x, 11).is_err());
        Ok(())
    }
}
