use std::collections::BTreeMap;

use candle_core::{bail, Result, Tensor, Var};

use crate::candle_rng_key::RngKey;

/// Suffix of variational mean parameters, e.g. `fc0.weight_mu`
pub const MEAN_SUFFIX: &str = "_mu";
/// Suffix of variational log-variance parameters, e.g. `fc0.weight_logvar`
pub const LOG_VAR_SUFFIX: &str = "_logvar";

/// Name of the log-variance parameter paired with a mean parameter
pub fn paired_log_var_name(mean_name: &str) -> Option<String> {
    mean_name
        .strip_suffix(MEAN_SUFFIX)
        .map(|base| format!("{}{}", base, LOG_VAR_SUFFIX))
}

/// Named collection of tensors, ordered by name
#[derive(Clone, Debug, Default)]
pub struct TensorMap {
    tensors: BTreeMap<String, Tensor>,
}

/// Non-gradient state threaded through forward passes (running statistics)
pub type ModelState = TensorMap;

impl TensorMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(name.into(), tensor)
    }

    /// Look up a tensor; missing names are a contract error
    pub fn get(&self, name: &str) -> Result<&Tensor> {
        match self.tensors.get(name) {
            Some(t) => Ok(t),
            None => bail!("missing tensor `{}`", name),
        }
    }

    pub fn try_get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Copy with every tensor cut off the autodiff graph
    pub fn detach(&self) -> Self {
        self.iter()
            .map(|(k, v)| (k.to_string(), v.detach()))
            .collect()
    }

    /// Total number of scalar entries
    pub fn elem_count(&self) -> usize {
        self.tensors.values().map(|t| t.elem_count()).sum()
    }
}

impl FromIterator<(String, Tensor)> for TensorMap {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

/// Trainable partitions: variational means and log-variances
#[derive(Clone, Debug, Default)]
pub struct TrainableParams {
    pub mean: TensorMap,
    pub log_var: TensorMap,
}

/// Full parameter set of a mean-field network.
///
/// Three disjoint partitions: variational means, variational
/// log-variances, and deterministic terms (e.g. normalization affine
/// parameters). Every constructor rejects a name that shows up in more
/// than one partition.
#[derive(Clone, Debug)]
pub struct Params {
    mean: TensorMap,
    log_var: TensorMap,
    deterministic: TensorMap,
}

fn ensure_disjoint(parts: &[(&str, &TensorMap)]) -> Result<()> {
    let mut owner: BTreeMap<&str, &str> = BTreeMap::new();
    for &(label, map) in parts {
        for name in map.names() {
            if let Some(prev) = owner.insert(name, label) {
                bail!(
                    "parameter `{}` appears in both `{}` and `{}` partitions",
                    name,
                    prev,
                    label
                );
            }
        }
    }
    Ok(())
}

impl Params {
    pub fn new(mean: TensorMap, log_var: TensorMap, deterministic: TensorMap) -> Result<Self> {
        ensure_disjoint(&[
            ("mean", &mean),
            ("log_var", &log_var),
            ("deterministic", &deterministic),
        ])?;
        Ok(Self {
            mean,
            log_var,
            deterministic,
        })
    }

    /// Merge trainable and non-trainable partitions; overlapping names fail
    pub fn merge(trainable: &TrainableParams, non_trainable: &TensorMap) -> Result<Self> {
        Self::new(
            trainable.mean.clone(),
            trainable.log_var.clone(),
            non_trainable.clone(),
        )
    }

    /// `(mean, log_var, deterministic)` views
    pub fn partition(&self) -> (&TensorMap, &TensorMap, &TensorMap) {
        (&self.mean, &self.log_var, &self.deterministic)
    }

    /// `(trainable, non_trainable)` copies
    pub fn split(&self) -> (TrainableParams, TensorMap) {
        (
            TrainableParams {
                mean: self.mean.clone(),
                log_var: self.log_var.clone(),
            },
            self.deterministic.clone(),
        )
    }

    /// Look up a parameter in whichever partition holds it
    pub fn get(&self, name: &str) -> Result<&Tensor> {
        let found = self
            .mean
            .try_get(name)
            .or_else(|| self.log_var.try_get(name))
            .or_else(|| self.deterministic.try_get(name));
        match found {
            Some(t) => Ok(t),
            None => bail!("missing parameter `{}`", name),
        }
    }

    /// Copy with every mean replaced by one draw θ = μ + exp(0.5 lnσ²) ε
    ///
    /// Log-variances and deterministic terms are kept as they are.
    pub fn draw(&self, key: RngKey) -> Result<Self> {
        let mean = self
            .mean
            .iter()
            .enumerate()
            .map(|(i, (name, mu))| {
                let Some(log_var_name) = paired_log_var_name(name) else {
                    bail!("`{}` is not a mean parameter", name);
                };
                let log_var = self.log_var.get(&log_var_name)?;
                let key_i = key.fold_in(i as u64);
                let eps = key_i.normal(mu.dims(), mu.dtype(), mu.device())?;
                let theta = (mu + (log_var * 0.5)?.exp()?.mul(&eps)?)?;
                Ok((name.to_string(), theta))
            })
            .collect::<Result<TensorMap>>()?;
        Self::new(mean, self.log_var.clone(), self.deterministic.clone())
    }

    pub fn len(&self) -> usize {
        self.mean.len() + self.log_var.len() + self.deterministic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Optimizer-side handles of the trainable partitions.
///
/// The training loop owns these; [`TrainableVars::params`] hands out the
/// current values (still attached to the variables) for one step.
pub struct TrainableVars {
    mean: BTreeMap<String, Var>,
    log_var: BTreeMap<String, Var>,
}

fn to_vars(map: &TensorMap) -> Result<BTreeMap<String, Var>> {
    map.iter()
        .map(|(name, t)| Ok((name.to_string(), Var::from_tensor(&t.detach())?)))
        .collect()
}

fn from_vars(vars: &BTreeMap<String, Var>) -> TensorMap {
    vars.iter()
        .map(|(name, v)| (name.clone(), v.as_tensor().clone()))
        .collect()
}

impl TrainableVars {
    pub fn from_params(trainable: &TrainableParams) -> Result<Self> {
        Ok(Self {
            mean: to_vars(&trainable.mean)?,
            log_var: to_vars(&trainable.log_var)?,
        })
    }

    pub fn params(&self) -> TrainableParams {
        TrainableParams {
            mean: from_vars(&self.mean),
            log_var: from_vars(&self.log_var),
        }
    }

    pub fn all_vars(&self) -> Vec<Var> {
        self.mean
            .values()
            .chain(self.log_var.values())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn map(names: &[&str]) -> Result<TensorMap> {
        names
            .iter()
            .map(|n| Ok((n.to_string(), Tensor::zeros(2, DType::F32, &Device::Cpu)?)))
            .collect()
    }

    #[test]
    fn test_merge_disjoint() -> Result<()> {
        let trainable = TrainableParams {
            mean: map(&["w_mu", "b_mu"])?,
            log_var: map(&["w_logvar", "b_logvar"])?,
        };
        let params = Params::merge(&trainable, &map(&["bn.gamma"])?)?;
        assert_eq!(params.len(), 5);
        assert!(params.get("bn.gamma").is_ok());
        assert!(params.get("w_logvar").is_ok());
        assert!(params.get("nope").is_err());

        let (t, nt) = params.split();
        assert_eq!(t.mean.len(), 2);
        assert_eq!(nt.len(), 1);
        Ok(())
    }

    #[test]
    fn test_merge_overlap_fails() -> Result<()> {
        let trainable = TrainableParams {
            mean: map(&["w_mu"])?,
            log_var: map(&["w_logvar"])?,
        };
        assert!(Params::merge(&trainable, &map(&["w_mu"])?).is_err());
        let overlapping = Params::new(map(&["a"])?, map(&["a"])?, TensorMap::new());
        assert!(overlapping.is_err());
        Ok(())
    }

    #[test]
    fn test_draw_replaces_means_only() -> Result<()> {
        let trainable = TrainableParams {
            mean: map(&["w_mu", "b_mu"])?,
            log_var: map(&["w_logvar", "b_logvar"])?,
        };
        let params = Params::merge(&trainable, &map(&["bn.gamma"])?)?;
        let a = params.draw(RngKey::new(5))?;
        let b = params.draw(RngKey::new(5))?;

        let w_a: Vec<f32> = a.get("w_mu")?.to_vec1()?;
        let w_b: Vec<f32> = b.get("w_mu")?.to_vec1()?;
        let b_a: Vec<f32> = a.get("b_mu")?.to_vec1()?;
        assert_eq!(w_a, w_b);
        assert!(w_a.iter().any(|&v| v != 0.0));
        assert_ne!(w_a, b_a);

        let log_var: Vec<f32> = a.get("w_logvar")?.to_vec1()?;
        assert_eq!(log_var, vec![0.0, 0.0]);
        assert!(a.get("bn.gamma").is_ok());

        let stray = TrainableParams {
            mean: map(&["w"])?,
            log_var: map(&["w_logvar"])?,
        };
        let stray = Params::merge(&stray, &TensorMap::new())?;
        assert!(stray.draw(RngKey::new(5)).is_err());
        Ok(())
    }

    #[test]
    fn test_paired_names() {
        assert_eq!(
            paired_log_var_name("fc0.weight_mu").as_deref(),
            Some("fc0.weight_logvar")
        );
        assert_eq!(paired_log_var_name("bn0.gamma"), None);
    }

    #[test]
    fn test_vars_round_trip() -> Result<()> {
        let trainable = TrainableParams {
            mean: map(&["w_mu"])?,
            log_var: map(&["w_logvar"])?,
        };
        let vars = TrainableVars::from_params(&trainable)?;
        assert_eq!(vars.all_vars().len(), 2);
        let back = vars.params();
        assert!(back.mean.contains("w_mu"));
        assert!(back.log_var.contains("w_logvar"));
        Ok(())
    }
}
