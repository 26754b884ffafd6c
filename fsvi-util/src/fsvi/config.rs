use candle_core::{bail, DType, Result};

use super::prior::PriorType;
use super::scale::KlScale;

/// Static configuration of the FSVI objectives.
///
/// Fixed for a training run; the objective holds onto it and never
/// re-reads it per step.
#[derive(Debug, Clone)]
pub struct FsviConfig {
    /// Number of independent output channels k
    pub output_dim: usize,
    /// Weight of the KL term
    pub kl_scale: KlScale,
    /// Monte Carlo samples for the likelihood term
    pub n_samples: usize,
    /// Full (k x m x m) covariances in the KL instead of (m x k) variances
    pub full_cov: bool,
    /// Layout of the prior covariance
    pub prior_type: PriorType,
    /// Linearize around a sampled weight draw instead of the mean
    pub stochastic_linearization: bool,
    /// Ask the linearization for full covariances
    pub full_ntk: bool,
    /// Working dtype of the KL and likelihood computations
    pub dtype: DType,
    /// Prior variances at or below this are reported as degenerate
    pub eps: f64,
}

impl Default for FsviConfig {
    fn default() -> Self {
        Self {
            output_dim: 2,
            kl_scale: KlScale::Equal,
            n_samples: 5,
            full_cov: false,
            prior_type: PriorType::Isotropic,
            stochastic_linearization: false,
            full_ntk: false,
            dtype: DType::F32,
            eps: 1e-6,
        }
    }
}

impl FsviConfig {
    pub fn new(output_dim: usize) -> Self {
        Self {
            output_dim,
            ..Default::default()
        }
    }

    /// Full-covariance KL; switches the linearization to full NTK as well
    pub fn with_full_cov(mut self, full_cov: bool) -> Self {
        self.full_cov = full_cov;
        self.full_ntk = full_cov;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.output_dim == 0 {
            bail!("output_dim must be positive");
        }
        if self.n_samples == 0 {
            bail!("n_samples must be positive");
        }
        if self.full_cov && !self.full_ntk {
            bail!("full_cov requires a full_ntk linearization");
        }
        if self.eps.is_nan() || self.eps < 0.0 {
            bail!("eps must be non-negative, got {}", self.eps);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(FsviConfig::new(3).validate().is_ok());
        assert!(FsviConfig::new(3).with_full_cov(true).validate().is_ok());
        assert!(FsviConfig::new(0).validate().is_err());

        let mut config = FsviConfig::new(3);
        config.n_samples = 0;
        assert!(config.validate().is_err());

        let mut config = FsviConfig::new(3);
        config.full_cov = true;
        assert!(config.validate().is_err());
    }
}
