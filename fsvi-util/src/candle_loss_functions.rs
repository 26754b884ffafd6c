use candle_core::{Result, Tensor};
use candle_nn::ops;

use crate::candle_linalg::{cholesky, log_det_from_cholesky, solve_lower_triangular};

/// Categorical log-likelihood of one-hot data under sampled logits
///
/// llik(s) = sum_i sum_k y(i,k) * log_softmax(f(s,i,:))(k)
///
/// * `y_nk` - one-hot targets (n x k)
/// * `logits_snk` - sampled function outputs (s x n x k)
///
/// Returns `llik_s` (s,)
pub fn categorical_likelihood(y_nk: &Tensor, logits_snk: &Tensor) -> Result<Tensor> {
    let log_prob_snk = ops::log_softmax(logits_snk, logits_snk.rank() - 1)?;
    log_prob_snk.broadcast_mul(y_nk)?.sum(2)?.sum(1)
}

/// KL divergence between two diagonal Gaussians, summed over all entries
///
/// 0.5 * sum [ log(v_p / v_q) + (v_q + (m_q - m_p)^2) / v_p - 1 ]
///
/// * `mean_q`, `var_q` - first distribution
/// * `mean_p`, `var_p` - second distribution (broadcastable to `mean_q`)
pub fn gaussian_kl_diag(
    mean_q: &Tensor,
    var_q: &Tensor,
    mean_p: &Tensor,
    var_p: &Tensor,
) -> Result<Tensor> {
    let diff_sq = mean_q.broadcast_sub(mean_p)?.sqr()?;
    let log_ratio = var_p.broadcast_div(var_q)?.log()?;
    let quad = (var_q + diff_sq)?.broadcast_div(var_p)?;
    ((log_ratio + quad)? - 1.0)?.sum_all()? * 0.5
}

/// KL divergence between two full-covariance Gaussians over m points
///
/// 0.5 * [ tr(Σp⁻¹Σq) + (μp-μq)ᵀΣp⁻¹(μp-μq) - m + log|Σp| - log|Σq| ]
///
/// * `mean_q_m1`, `cov_q_mm` - first distribution (m x 1), (m x m)
/// * `mean_p_m1`, `cov_p_mm` - second distribution
pub fn gaussian_kl_full(
    mean_q_m1: &Tensor,
    cov_q_mm: &Tensor,
    mean_p_m1: &Tensor,
    cov_p_mm: &Tensor,
) -> Result<Tensor> {
    let m = cov_q_mm.dim(0)? as f64;
    let chol_p = cholesky(cov_p_mm)?;
    let chol_q = cholesky(cov_q_mm)?;

    // tr(Σp⁻¹Σq) = ‖Lp⁻¹ Lq‖²
    let trace = solve_lower_triangular(&chol_p, &chol_q)?.sqr()?.sum_all()?;
    let delta = (mean_p_m1 - mean_q_m1)?;
    let mahalanobis = solve_lower_triangular(&chol_p, &delta)?.sqr()?.sum_all()?;
    let log_det = (log_det_from_cholesky(&chol_p)? - log_det_from_cholesky(&chol_q)?)?;

    (((trace + mahalanobis)? + log_det)? - m)? * 0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_categorical_likelihood_by_hand() -> Result<()> {
        let device = Device::Cpu;
        let y = Tensor::new(&[[1f64, 0.], [0., 1.]], &device)?;
        let f = Tensor::new(&[[[0f64, 0.], [1., 3.]]], &device)?;
        let llik: Vec<f64> = categorical_likelihood(&y, &f)?.to_vec1()?;

        let expected = -(2f64).ln() + (3. - (1f64.exp() + 3f64.exp()).ln());
        assert_eq!(llik.len(), 1);
        assert!((llik[0] - expected).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_kl_diag_closed_form() -> Result<()> {
        let device = Device::Cpu;
        let mq = Tensor::new(&[1f64], &device)?;
        let vq = Tensor::new(&[0.5f64], &device)?;
        let mp = Tensor::new(&[0f64], &device)?;
        let vp = Tensor::new(&[2f64], &device)?;
        let kl: f64 = gaussian_kl_diag(&mq, &vq, &mp, &vp)?.to_scalar()?;
        let expected = 0.5 * ((2f64 / 0.5).ln() + (0.5 + 1.0) / 2.0 - 1.0);
        assert!((kl - expected).abs() < 1e-12);

        let same: f64 = gaussian_kl_diag(&mq, &vq, &mq, &vq)?.to_scalar()?;
        assert_eq!(same, 0.0);
        Ok(())
    }

    #[test]
    fn test_kl_full_matches_diag_for_diagonal_cov() -> Result<()> {
        let device = Device::Cpu;
        let mq = Tensor::new(&[[0.3f64], [-1.0], [2.0]], &device)?;
        let mp = Tensor::new(&[[0.0f64], [0.5], [1.0]], &device)?;
        let vq = Tensor::new(&[[0.4f64], [1.5], [0.9]], &device)?;
        let vp = Tensor::new(&[[1.0f64], [2.0], [0.7]], &device)?;
        let eye = Tensor::eye(3, candle_core::DType::F64, &device)?;

        let cov_q = eye.broadcast_mul(&vq)?;
        let cov_p = eye.broadcast_mul(&vp)?;
        let full: f64 = gaussian_kl_full(&mq, &cov_q, &mp, &cov_p)?.to_scalar()?;
        let diag: f64 = gaussian_kl_diag(&mq, &vq, &mp, &vp)?.to_scalar()?;
        assert!((full - diag).abs() < 1e-10, "{} vs {}", full, diag);
        Ok(())
    }
}
