//! Function-space variational inference (FSVI) objectives.
//!
//! The variational and prior distributions live on network outputs at a
//! set of inducing inputs, not on the weights. One training step reads:
//!
//! ```text
//! llik  = 1/S Σ_s Σ_i y_i · log_softmax(f_s(x_i))       (batch, S weight draws)
//! q(f)  ≈ N(f(z; μ), J diag(σ²) Jᵀ)                       (inducing inputs z)
//! elbo  = llik - scale · KL(q(f) || p(f))
//! loss  = -elbo
//! ```
//!
//! # Example
//!
//! ```ignore
//! use fsvi_util::fsvi::*;
//!
//! let objectives = FsviObjectives::new(mlp, JacobianLinearizer::default(), config)?;
//! let (trainable, det) = params.split();
//! let prior = FunctionPrior::isotropic(m, k, 0.0, 1.0, dtype, &device)?;
//! let inducing = InducingSet { inputs: &z_md, prior: &prior };
//! let (loss, diag) = objectives.nelbo_fsvi_classification(
//!     &trainable, &det, &state, &Batch::new(&x_nd, &y_nk)?, &inducing, key,
//! )?;
//! // optimizer.backward_step(&loss)?; then adopt diag.state
//! ```

mod config;
mod function_kl;
mod inducing;
mod likelihood;
mod linearization;
mod metrics;
mod multisample;
mod objective;
mod prior;
mod scale;

pub use config::FsviConfig;
pub use function_kl::FunctionKl;
pub use inducing::{subsample_inducing_inputs, uniform_inducing_inputs};
pub use likelihood::CrossEntropyLikelihood;
pub use linearization::JacobianLinearizer;
pub use metrics::{accuracy, predictive_probs};
pub use multisample::{predict_f_multisample, MultiSample};
pub use objective::{
    Batch, ElboTerms, FsviDiagnostics, FsviObjectives, FsviRecord, InducingSet, ObjectiveKind,
    ObjectiveValue,
};
pub use prior::{FunctionPrior, PriorType};
pub use scale::{compute_scale, KlScale};
