use candle_core::{bail, DType, Result, Tensor, D};

/// Fraction of rows where the arg-max of `preds_nk` hits the one-hot target
pub fn accuracy(preds_nk: &Tensor, targets_nk: &Tensor) -> Result<f64> {
    let (n, k) = preds_nk.dims2()?;
    if targets_nk.dims() != [n, k].as_slice() {
        bail!(
            "predictions are ({}, {}) but targets are {:?}",
            n,
            k,
            targets_nk.dims()
        );
    }
    if n == 0 {
        bail!("accuracy of an empty batch");
    }
    let hits = preds_nk
        .argmax(1)?
        .eq(&targets_nk.argmax(1)?)?
        .to_dtype(DType::F64)?;
    hits.mean_all()?.to_scalar::<f64>()
}

/// Monte Carlo predictive class probabilities: mean of softmax over samples
///
/// * `samples_snk` - sampled logits (S x n x k)
pub fn predictive_probs(samples_snk: &Tensor) -> Result<Tensor> {
    samples_snk.dims3()?;
    candle_nn::ops::softmax(samples_snk, D::Minus1)?.mean(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_rng_key::RngKey;
    use candle_core::Device;

    #[test]
    fn test_accuracy() -> Result<()> {
        let device = Device::Cpu;
        let preds = Tensor::new(
            &[[2f32, 1., 0.], [0., 3., 1.], [1., 0., 0.], [0., 0., 5.]],
            &device,
        )?;
        let targets = Tensor::new(
            &[[1f32, 0., 0.], [0., 1., 0.], [0., 0., 1.], [0., 0., 1.]],
            &device,
        )?;
        approx::assert_abs_diff_eq!(accuracy(&preds, &targets)?, 0.75);
        assert!(accuracy(&preds, &targets.narrow(0, 0, 3)?).is_err());
        Ok(())
    }

    #[test]
    fn test_predictive_probs_sum_to_one() -> Result<()> {
        let device = Device::Cpu;
        let samples = RngKey::new(0).normal((5, 4, 3), DType::F64, &device)?;
        let probs = predictive_probs(&samples)?;
        assert_eq!(probs.dims(), &[4, 3]);
        let row_sums: Vec<f64> = probs.sum(1)?.to_vec1()?;
        for s in row_sums {
            approx::assert_abs_diff_eq!(s, 1.0, epsilon = 1e-12);
        }
        Ok(())
    }
}
