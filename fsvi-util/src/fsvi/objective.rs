use candle_core::{bail, DType, Result, Tensor};
use log::{debug, warn};
use serde::Serialize;

use super::config::FsviConfig;
use super::function_kl::FunctionKl;
use super::likelihood::CrossEntropyLikelihood;
use super::metrics::{accuracy, predictive_probs};
use super::multisample::predict_f_multisample;
use super::prior::FunctionPrior;
use crate::candle_model_traits::{Linearize, StochasticForward};
use crate::candle_param_map::{ModelState, Params, TensorMap, TrainableParams};
use crate::candle_rng_key::RngKey;

/// Which objective a step optimizes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectiveKind {
    /// Negative Monte Carlo log-likelihood per example, no KL term
    NllClassification,
    /// Function-space ELBO
    ElboFsviClassification,
}

/// Supervised minibatch with one-hot targets
#[derive(Clone, Copy, Debug)]
pub struct Batch<'a> {
    pub inputs: &'a Tensor,
    pub targets: &'a Tensor,
}

impl<'a> Batch<'a> {
    /// * `inputs` - (n x d)
    /// * `targets` - one-hot (n x k)
    pub fn new(inputs: &'a Tensor, targets: &'a Tensor) -> Result<Self> {
        let (n, _) = inputs.dims2()?;
        let (n_y, _) = targets.dims2()?;
        if n != n_y {
            bail!("{} inputs but {} targets", n, n_y);
        }
        if n == 0 {
            bail!("empty batch");
        }
        Ok(Self { inputs, targets })
    }

    pub fn size(&self) -> usize {
        self.inputs.dims()[0]
    }
}

/// Inducing inputs and the function prior at those inputs
#[derive(Clone, Copy, Debug)]
pub struct InducingSet<'a> {
    /// (m x d)
    pub inputs: &'a Tensor,
    pub prior: &'a FunctionPrior,
}

impl InducingSet<'_> {
    pub fn size(&self) -> usize {
        self.inputs.dims().first().copied().unwrap_or(0)
    }
}

/// ELBO and its parts, still on the autodiff graph
#[derive(Clone, Debug)]
pub struct ElboTerms {
    pub elbo: Tensor,
    pub log_likelihood: Tensor,
    pub kl: Tensor,
    pub scale: f64,
}

#[derive(Clone, Debug)]
pub enum ObjectiveValue {
    Nll { loss: Tensor },
    Elbo(ElboTerms),
}

impl ObjectiveValue {
    /// Quantity to minimize: the NLL itself, or the negative ELBO
    pub fn loss(&self) -> Result<Tensor> {
        match self {
            ObjectiveValue::Nll { loss } => Ok(loss.clone()),
            ObjectiveValue::Elbo(terms) => terms.elbo.neg(),
        }
    }
}

/// What a negative-ELBO step reports besides the loss
#[derive(Clone, Debug)]
pub struct FsviDiagnostics {
    /// Model state to adopt together with the parameter update
    pub state: ModelState,
    pub elbo: f64,
    pub log_likelihood: f64,
    pub kl: f64,
    pub scale: f64,
}

/// Plain-number view of [`FsviDiagnostics`] for tracing
#[derive(Clone, Debug, Serialize)]
pub struct FsviRecord {
    pub elbo: f64,
    pub log_likelihood: f64,
    pub kl: f64,
    pub scale: f64,
}

impl FsviDiagnostics {
    pub fn to_record(&self) -> FsviRecord {
        FsviRecord {
            elbo: self.elbo,
            log_likelihood: self.log_likelihood,
            kl: self.kl,
            scale: self.scale,
        }
    }
}

fn scalar(t: &Tensor) -> Result<f64> {
    t.to_dtype(DType::F64)?.to_scalar::<f64>()
}

/// FSVI training objectives for classification
///
/// Holds the network, its linearization and the static configuration
/// for a whole run. Every call is a pure function of its arguments:
/// parameters and state go in, a loss and a fresh state come out.
pub struct FsviObjectives<F, L> {
    forward: F,
    linearizer: L,
    config: FsviConfig,
    likelihood: CrossEntropyLikelihood,
    kl: FunctionKl,
}

impl<F, L> FsviObjectives<F, L>
where
    F: StochasticForward,
    L: Linearize,
{
    pub fn new(forward: F, linearizer: L, config: FsviConfig) -> Result<Self> {
        config.validate()?;
        if forward.dim_output() != config.output_dim {
            bail!(
                "network has {} outputs but output_dim is {}",
                forward.dim_output(),
                config.output_dim
            );
        }
        let likelihood = CrossEntropyLikelihood::new(config.dtype);
        let kl = FunctionKl::from_config(&config);
        Ok(Self {
            forward,
            linearizer,
            config,
            likelihood,
            kl,
        })
    }

    /// The network, e.g. for inducing a function prior from it
    pub fn forward(&self) -> &F {
        &self.forward
    }

    pub fn linearizer(&self) -> &L {
        &self.linearizer
    }

    pub fn config(&self) -> &FsviConfig {
        &self.config
    }

    /// Monte Carlo log-likelihood of the batch under `n_samples` weight draws
    pub fn crossentropy_log_likelihood(
        &self,
        params: &Params,
        state: &ModelState,
        batch: &Batch,
        key: RngKey,
        is_training: bool,
    ) -> Result<Tensor> {
        let draws = predict_f_multisample(
            &self.forward,
            params,
            state,
            batch.inputs,
            key,
            self.config.n_samples,
            is_training,
        )?;
        self.likelihood
            .log_likelihood(&draws.samples, batch.targets)
    }

    /// Function-space KL at the inducing inputs and its weight
    ///
    /// # Returns `(kl, scale)`
    /// * `kl` - scalar KL between the linearized network and the prior
    /// * `scale` - weight from the configured [`super::KlScale`]; the
    ///   batch only contributes its size
    pub fn function_kl(
        &self,
        params: &Params,
        state: &ModelState,
        batch_size: usize,
        inducing: &InducingSet,
        key: RngKey,
    ) -> Result<(Tensor, f64)> {
        let (mean, log_var, deterministic) = params.partition();
        let scale = self.config.kl_scale.scale(batch_size, inducing.size())?;

        let mut q = self.linearizer.linearize(
            &self.forward,
            mean,
            log_var,
            deterministic,
            state,
            inducing.inputs,
            key,
            self.config.stochastic_linearization,
            self.config.full_ntk,
        )?;
        if !self.config.full_cov {
            q = q.to_diagonal()?;
        }

        let kl = self.kl.divergence(&q.mean, &q.cov, inducing.prior)?;
        Ok((kl, scale))
    }

    /// `-llik / n`
    fn nll_objective(
        &self,
        params: &Params,
        state: &ModelState,
        batch: &Batch,
        key: RngKey,
    ) -> Result<Tensor> {
        let llik = self.crossentropy_log_likelihood(params, state, batch, key, true)?;
        llik.neg()? / batch.size() as f64
    }

    /// `elbo = llik - scale * kl`, likelihood and KL on separate keys
    fn elbo_objective(
        &self,
        params: &Params,
        state: &ModelState,
        batch: &Batch,
        inducing: &InducingSet,
        key_llik: RngKey,
        key_kl: RngKey,
    ) -> Result<ElboTerms> {
        let llik = self.crossentropy_log_likelihood(params, state, batch, key_llik, true)?;
        let (kl, scale) = self.function_kl(params, state, batch.size(), inducing, key_kl)?;
        let elbo = (&llik - (&kl * scale)?)?;
        Ok(ElboTerms {
            elbo,
            log_likelihood: llik,
            kl,
            scale,
        })
    }

    /// Evaluate one objective and the model state that goes with it
    ///
    /// The state comes from a separate training-mode stochastic forward
    /// pass on the batch, independent of the objective's own passes.
    /// Callers adopt the returned state only together with the
    /// parameter update computed from the returned objective.
    ///
    /// # Arguments
    /// * `trainable` - variational means and log-variances
    /// * `non_trainable` - deterministic parameters; must not share names
    /// * `state` - current model state
    /// * `batch` - inputs and one-hot targets
    /// * `inducing` - inducing inputs with their prior; the ELBO fails
    ///   without them, the NLL never reads them
    /// * `key` - split three ways: likelihood, KL, state refresh
    /// * `kind` - which objective
    #[allow(clippy::too_many_arguments)]
    pub fn objective_and_state(
        &self,
        trainable: &TrainableParams,
        non_trainable: &TensorMap,
        state: &ModelState,
        batch: &Batch,
        inducing: Option<&InducingSet>,
        key: RngKey,
        kind: ObjectiveKind,
    ) -> Result<(ObjectiveValue, ModelState)> {
        let params = Params::merge(trainable, non_trainable)?;
        let (key_llik, key_kl, key_state) = key.split3();

        let value = match kind {
            ObjectiveKind::NllClassification => ObjectiveValue::Nll {
                loss: self.nll_objective(&params, state, batch, key_llik)?,
            },
            ObjectiveKind::ElboFsviClassification => {
                let Some(set) = inducing else {
                    bail!("the function-space ELBO needs an inducing set");
                };
                let terms = self.elbo_objective(&params, state, batch, set, key_llik, key_kl)?;
                ObjectiveValue::Elbo(terms)
            }
        };

        let (_, new_state) = self
            .forward
            .forward_t(&params, state, key_state, batch.inputs, true, true)?;
        Ok((value, new_state.detach()))
    }

    /// Plain maximum-likelihood loss `(loss, new_state)`
    pub fn nll_loss_classification(
        &self,
        trainable: &TrainableParams,
        non_trainable: &TensorMap,
        state: &ModelState,
        batch: &Batch,
        key: RngKey,
    ) -> Result<(Tensor, ModelState)> {
        let (value, new_state) = self.objective_and_state(
            trainable,
            non_trainable,
            state,
            batch,
            None,
            key,
            ObjectiveKind::NllClassification,
        )?;
        Ok((value.loss()?, new_state))
    }

    /// Negative FSVI ELBO `(loss, diagnostics)`
    pub fn nelbo_fsvi_classification(
        &self,
        trainable: &TrainableParams,
        non_trainable: &TensorMap,
        state: &ModelState,
        batch: &Batch,
        inducing: &InducingSet,
        key: RngKey,
    ) -> Result<(Tensor, FsviDiagnostics)> {
        let (value, new_state) = self.objective_and_state(
            trainable,
            non_trainable,
            state,
            batch,
            Some(inducing),
            key,
            ObjectiveKind::ElboFsviClassification,
        )?;
        let loss = value.loss()?;
        let terms = match value {
            ObjectiveValue::Elbo(terms) => terms,
            ObjectiveValue::Nll { .. } => bail!("ELBO objective returned an NLL value"),
        };

        let diagnostics = FsviDiagnostics {
            state: new_state,
            elbo: scalar(&terms.elbo)?,
            log_likelihood: scalar(&terms.log_likelihood)?,
            kl: scalar(&terms.kl)?,
            scale: terms.scale,
        };
        if !diagnostics.elbo.is_finite() {
            warn!(
                "non-finite ELBO: llik {}, kl {}, scale {}",
                diagnostics.log_likelihood, diagnostics.kl, diagnostics.scale
            );
        }
        debug!(
            "elbo {:.4} = llik {:.4} - {} * kl {:.4}",
            diagnostics.elbo, diagnostics.log_likelihood, diagnostics.scale, diagnostics.kl
        );
        Ok((loss, diagnostics))
    }

    /// Accuracy of the Monte Carlo predictive distribution (evaluation mode)
    pub fn accuracy(
        &self,
        params: &Params,
        state: &ModelState,
        batch: &Batch,
        key: RngKey,
    ) -> Result<f64> {
        let draws = predict_f_multisample(
            &self.forward,
            params,
            state,
            batch.inputs,
            key,
            self.config.n_samples,
            false,
        )?;
        accuracy(&predictive_probs(&draws.samples)?, batch.targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_bnn_mlp::MeanFieldMlp;
    use crate::fsvi::JacobianLinearizer;
    use candle_core::Device;

    struct Setup {
        objectives: FsviObjectives<MeanFieldMlp, JacobianLinearizer>,
        params: Params,
        state: ModelState,
        x: Tensor,
        y: Tensor,
        z: Tensor,
        prior: FunctionPrior,
    }

    fn setup(n: usize, m: usize, batch_norm: bool) -> Result<Setup> {
        let device = Device::Cpu;
        let mut mlp = MeanFieldMlp::new(2, &[6], 3);
        if batch_norm {
            mlp = mlp.with_batch_norm(0.9, 1e-5);
        }
        let (params, state) = mlp.init_params(RngKey::new(0), -4.0, DType::F64, &device)?;
        let mut config = FsviConfig::new(3);
        config.dtype = DType::F64;
        config.n_samples = 3;
        let objectives = FsviObjectives::new(mlp, JacobianLinearizer::default(), config)?;

        let x = RngKey::new(1).normal((n, 2), DType::F64, &device)?;
        let labels: Vec<u32> = (0..n as u32).map(|i| i % 3).collect();
        let y = candle_nn::encoding::one_hot(Tensor::new(labels, &device)?, 3, 1f64, 0f64)?;
        let z = RngKey::new(2).normal((m, 2), DType::F64, &device)?;
        let prior = FunctionPrior::isotropic(m, 3, 0.0, 1.0, DType::F64, &device)?;
        Ok(Setup {
            objectives,
            params,
            state,
            x,
            y,
            z,
            prior,
        })
    }

    #[test]
    fn test_nelbo_matches_terms() -> Result<()> {
        let s = setup(8, 4, false)?;
        let (trainable, det) = s.params.split();
        let batch = Batch::new(&s.x, &s.y)?;
        let inducing = InducingSet {
            inputs: &s.z,
            prior: &s.prior,
        };
        let (loss, diag) = s.objectives.nelbo_fsvi_classification(
            &trainable,
            &det,
            &s.state,
            &batch,
            &inducing,
            RngKey::new(9),
        )?;
        let loss: f64 = loss.to_scalar()?;
        assert_eq!(diag.scale, 2.0);
        assert!(diag.kl >= 0.0);
        approx::assert_abs_diff_eq!(loss, -diag.elbo, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(
            diag.elbo,
            diag.log_likelihood - diag.scale * diag.kl,
            epsilon = 1e-9
        );
        Ok(())
    }

    #[test]
    fn test_nll_is_per_example() -> Result<()> {
        let s = setup(6, 3, false)?;
        let (trainable, det) = s.params.split();
        let batch = Batch::new(&s.x, &s.y)?;
        let obj = &s.objectives;
        let key = RngKey::new(4);
        let (loss, _) = obj.nll_loss_classification(&trainable, &det, &s.state, &batch, key)?;

        let (key_llik, _, _) = key.split3();
        let llik = obj.crossentropy_log_likelihood(&s.params, &s.state, &batch, key_llik, true)?;
        let llik: f64 = llik.to_scalar()?;
        let loss: f64 = loss.to_scalar()?;
        approx::assert_abs_diff_eq!(loss, -llik / 6.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_state_advances_with_batch_norm() -> Result<()> {
        let s = setup(8, 4, true)?;
        let (trainable, det) = s.params.split();
        let batch = Batch::new(&s.x, &s.y)?;
        let inducing = InducingSet {
            inputs: &s.z,
            prior: &s.prior,
        };
        let (_, diag) = s.objectives.nelbo_fsvi_classification(
            &trainable,
            &det,
            &s.state,
            &batch,
            &inducing,
            RngKey::new(1),
        )?;
        let before = s.state.get("bn0.running_mean")?;
        let after = diag.state.get("bn0.running_mean")?;
        let moved: f64 = (after - before)?.abs()?.max_all()?.to_scalar()?;
        assert!(moved > 0.0);
        Ok(())
    }

    #[test]
    fn test_batch_validation() -> Result<()> {
        let s = setup(8, 4, false)?;
        assert!(Batch::new(&s.x, &s.y.narrow(0, 0, 7)?).is_err());
        Ok(())
    }

    #[test]
    fn test_elbo_needs_inducing_set() -> Result<()> {
        let s = setup(6, 3, false)?;
        let (t, det) = s.params.split();
        let batch = Batch::new(&s.x, &s.y)?;
        let obj = &s.objectives;
        let key = RngKey::new(2);

        let elbo = ObjectiveKind::ElboFsviClassification;
        let missing = obj.objective_and_state(&t, &det, &s.state, &batch, None, key, elbo);
        assert!(missing.is_err());

        let nll = ObjectiveKind::NllClassification;
        let (value, _) = obj.objective_and_state(&t, &det, &s.state, &batch, None, key, nll)?;
        assert!(matches!(value, ObjectiveValue::Nll { .. }));
        Ok(())
    }

    #[test]
    fn test_output_dim_must_match_network() {
        let mlp = MeanFieldMlp::new(2, &[4], 3);
        let config = FsviConfig::new(2);
        let result = FsviObjectives::new(mlp, JacobianLinearizer::default(), config);
        assert!(result.is_err());
    }
}
