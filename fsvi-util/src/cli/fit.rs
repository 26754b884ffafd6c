use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer};
use clap::Args;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use serde::Serialize;

use crate::candle_bnn_mlp::MeanFieldMlp;
use crate::candle_inference::TrainConfig;
use crate::candle_param_map::{Params, TrainableVars};
use crate::candle_rng_key::RngKey;
use crate::fsvi::{
    uniform_inducing_inputs, Batch, FsviConfig, FsviObjectives, FsviRecord, FunctionPrior,
    InducingSet, JacobianLinearizer, KlScale, PriorType,
};

#[derive(Args, Debug)]
pub struct FitArgs {
    #[arg(long, default_value = "3")]
    pub classes: usize,

    #[arg(long, default_value = "2")]
    pub features: usize,

    #[arg(long, default_value = "600", help = "Number of synthetic examples")]
    pub n_obs: usize,

    #[arg(long, default_value = "2.0", help = "Spread of the class centers")]
    pub separation: f64,

    #[arg(long, value_delimiter = ',', default_values_t = vec![32, 32])]
    pub hidden: Vec<usize>,

    #[arg(long)]
    pub batch_norm: bool,

    #[arg(long, default_value = "5", help = "Monte Carlo likelihood samples")]
    pub samples: usize,

    #[arg(long, default_value = "16", help = "Inducing points drawn per step")]
    pub inducing: usize,

    /// KL weight: none, equal, normalized, or a number
    #[arg(long, default_value = "equal")]
    pub kl_scale: KlScale,

    /// Function prior: isotropic, or per_point (induced by a weight prior)
    #[arg(long, default_value = "isotropic")]
    pub prior_type: PriorType,

    /// Prior variance of function values (isotropic) or of weights (per_point)
    #[arg(long, default_value = "1.0")]
    pub prior_var: f64,

    #[arg(long, default_value = "-6.0", allow_hyphen_values = true)]
    pub init_log_var: f64,

    #[arg(long, help = "Full covariance over inducing points in the KL")]
    pub full_cov: bool,

    #[arg(long)]
    pub stochastic_linearization: bool,

    #[arg(long, default_value = "100")]
    pub epochs: usize,

    #[arg(long, default_value = "0", help = "Maximum-likelihood warm-up epochs")]
    pub pretrain_epochs: usize,

    #[arg(long, default_value = "64")]
    pub batch_size: usize,

    #[arg(long, default_value = "0.001")]
    pub lr: f32,

    #[arg(long, default_value = "42")]
    pub seed: u64,

    #[arg(long, help = "Write per-epoch ELBO terms to this JSON file")]
    pub trace: Option<PathBuf>,

    #[arg(long)]
    pub gpu: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Serialize)]
struct EpochRecord {
    epoch: usize,
    #[serde(flatten)]
    terms: FsviRecord,
}

#[derive(Serialize)]
struct FitTrace {
    epochs: Vec<EpochRecord>,
    train_accuracy: f64,
}

/// Gaussian blobs around random class centers, labels cycling `0..k`
///
/// # Returns `(x_nd, y_nk)` with one-hot `y_nk`
fn gaussian_blobs(
    key: RngKey,
    n: usize,
    k: usize,
    d: usize,
    separation: f64,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let (key_center, key_noise) = key.split2();
    let centers_kd = (key_center.normal((k, d), DType::F32, device)? * separation)?;
    let labels: Vec<u32> = (0..n).map(|i| (i % k) as u32).collect();
    let labels = Tensor::from_vec(labels, n, device)?;
    let noise_nd = key_noise.normal((n, d), DType::F32, device)?;
    let x_nd = (centers_kd.index_select(&labels, 0)? + noise_nd)?;
    let y_nk = candle_nn::encoding::one_hot(labels, k, 1f32, 0f32)?;
    Ok((x_nd, y_nk))
}

/// Shuffled minibatches `(x, y)`
fn minibatches(
    key: RngKey,
    x_nd: &Tensor,
    y_nk: &Tensor,
    batch_size: usize,
) -> Result<Vec<(Tensor, Tensor)>> {
    let n = x_nd.dim(0)?;
    let perm = key.permutation(n)?;
    perm.chunks(batch_size)
        .map(|chunk| {
            let idx = Tensor::from_slice(chunk, chunk.len(), x_nd.device())?;
            Ok((x_nd.index_select(&idx, 0)?, y_nk.index_select(&idx, 0)?))
        })
        .collect()
}

fn to_f64(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}

pub fn run(args: &FitArgs) -> Result<()> {
    if args.batch_size == 0 {
        anyhow::bail!("batch size must be positive");
    }
    if args.n_obs == 0 {
        anyhow::bail!("need at least one example");
    }

    let device = if args.gpu {
        Device::cuda_if_available(0)?
    } else {
        Device::Cpu
    };
    let train_config = TrainConfig {
        learning_rate: args.lr,
        batch_size: args.batch_size,
        num_epochs: args.epochs,
        num_pretrain_epochs: args.pretrain_epochs,
        device,
        verbose: args.verbose,
        show_progress: true,
    };
    let device = &train_config.device;
    let dtype = DType::F32;

    let (key_data, key_init, key_train) = RngKey::new(args.seed).split3();
    let (key_pretrain, key_fit, key_eval) = key_train.split3();

    let (x_nd, y_nk) = gaussian_blobs(
        key_data,
        args.n_obs,
        args.classes,
        args.features,
        args.separation,
        device,
    )?;
    let low = to_f64(&x_nd.min_all()?)?;
    let high = to_f64(&x_nd.max_all()?)?;
    info!(
        "{} examples, {} features, {} classes, inputs in [{:.3}, {:.3}]",
        args.n_obs, args.features, args.classes, low, high
    );

    let mut mlp = MeanFieldMlp::new(args.features, &args.hidden, args.classes);
    if args.batch_norm {
        mlp = mlp.with_batch_norm(0.9, 1e-5);
    }
    let (params, mut state) = mlp.init_params(key_init, args.init_log_var, dtype, device)?;
    let prior_params = mlp.prior_params(args.prior_var, dtype, device)?;
    let (trainable, non_trainable) = params.split();
    let vars = TrainableVars::from_params(&trainable)?;
    info!(
        "mean-field MLP {:?}: {} mean, {} log-variance, {} deterministic entries",
        args.hidden,
        trainable.mean.elem_count(),
        trainable.log_var.elem_count(),
        non_trainable.elem_count()
    );

    let mut config = FsviConfig::new(args.classes).with_full_cov(args.full_cov);
    config.kl_scale = args.kl_scale;
    config.n_samples = args.samples;
    config.prior_type = args.prior_type;
    config.stochastic_linearization = args.stochastic_linearization;
    config.dtype = dtype;
    let objectives = FsviObjectives::new(mlp, JacobianLinearizer::default(), config)?;

    let isotropic = FunctionPrior::isotropic(
        args.inducing,
        args.classes,
        0.0,
        args.prior_var,
        dtype,
        device,
    )?;

    let mut adam = AdamW::new_lr(vars.all_vars(), train_config.learning_rate.into())?;

    if train_config.num_pretrain_epochs > 0 {
        let pb = ProgressBar::new(train_config.num_pretrain_epochs as u64);
        if !train_config.show_progress || train_config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        for epoch in 0..train_config.num_pretrain_epochs {
            let (key_perm, key_steps) = key_pretrain.fold_in(epoch as u64).split2();
            let batches = minibatches(key_perm, &x_nd, &y_nk, train_config.batch_size)?;
            let mut nll_tot = 0f64;

            for (b, (x_b, y_b)) in batches.iter().enumerate() {
                let batch = Batch::new(x_b, y_b)?;
                let (loss, new_state) = objectives.nll_loss_classification(
                    &vars.params(),
                    &non_trainable,
                    &state,
                    &batch,
                    key_steps.fold_in(b as u64),
                )?;
                adam.backward_step(&loss)?;
                state = new_state;
                nll_tot += to_f64(&loss)?;
            }
            pb.inc(1);
            if train_config.verbose {
                info!(
                    "[pretrain {}] nll per example: {:.4}",
                    epoch + 1,
                    nll_tot / batches.len() as f64
                );
            }
        }
        pb.finish_and_clear();
    }

    let pb = ProgressBar::new(train_config.num_epochs as u64);
    if !train_config.show_progress || train_config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let mut trace = vec![];

    for epoch in 0..train_config.num_epochs {
        let (key_perm, key_steps) = key_fit.fold_in(epoch as u64).split2();
        let batches = minibatches(key_perm, &x_nd, &y_nk, train_config.batch_size)?;
        let mut tot = FsviRecord {
            elbo: 0.0,
            log_likelihood: 0.0,
            kl: 0.0,
            scale: 0.0,
        };

        for (b, (x_b, y_b)) in batches.iter().enumerate() {
            let (key_z, key_prior, key_obj) = key_steps.fold_in(b as u64).split3();
            let z_md = uniform_inducing_inputs(
                key_z,
                args.inducing,
                args.features,
                low,
                high,
                dtype,
                device,
            )?;
            let prior = match args.prior_type {
                PriorType::Isotropic => isotropic.clone(),
                PriorType::PerPoint => FunctionPrior::bnn_induced(
                    objectives.forward(),
                    objectives.linearizer(),
                    &prior_params,
                    &state,
                    &z_md,
                    key_prior,
                    objectives.config().full_ntk,
                )?,
            };
            let inducing = InducingSet {
                inputs: &z_md,
                prior: &prior,
            };
            let batch = Batch::new(x_b, y_b)?;

            let (loss, diagnostics) = objectives.nelbo_fsvi_classification(
                &vars.params(),
                &non_trainable,
                &state,
                &batch,
                &inducing,
                key_obj,
            )?;
            adam.backward_step(&loss)?;
            let record = diagnostics.to_record();
            state = diagnostics.state;

            tot.elbo += record.elbo;
            tot.log_likelihood += record.log_likelihood;
            tot.kl += record.kl;
            tot.scale += record.scale;
        }

        let nb = batches.len() as f64;
        let terms = FsviRecord {
            elbo: tot.elbo / nb,
            log_likelihood: tot.log_likelihood / nb,
            kl: tot.kl / nb,
            scale: tot.scale / nb,
        };
        pb.inc(1);
        if train_config.verbose {
            info!(
                "[{}] elbo: {:.4}, llik: {:.4}, kl: {:.4}, scale: {:.3}",
                epoch + 1,
                terms.elbo,
                terms.log_likelihood,
                terms.kl,
                terms.scale
            );
        }
        trace.push(EpochRecord {
            epoch: epoch + 1,
            terms,
        });
    }
    pb.finish_and_clear();

    let params = Params::merge(&vars.params(), &non_trainable)?;
    let full_batch = Batch::new(&x_nd, &y_nk)?;
    let train_accuracy = objectives.accuracy(&params, &state, &full_batch, key_eval)?;
    info!("train accuracy: {:.4}", train_accuracy);

    if let Some(path) = &args.trace {
        let out = FitTrace {
            epochs: trace,
            train_accuracy,
        };
        serde_json::to_writer_pretty(BufWriter::new(File::create(path)?), &out)?;
        info!("wrote trace to {:?}", path);
    }

    Ok(())
}
