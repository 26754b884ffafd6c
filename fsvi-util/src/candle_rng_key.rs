use candle_core::{bail, DType, Device, Result, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// Explicit pseudo-random key.
///
/// Every stochastic call takes one of these; the same key always yields
/// the same draws. Independent streams are derived with [`RngKey::split`]
/// or [`RngKey::fold_in`], never by reusing a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RngKey {
    seed: u64,
}

fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(GOLDEN_GAMMA);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

impl RngKey {
    pub fn new(seed: u64) -> Self {
        Self {
            seed: splitmix64(seed),
        }
    }

    /// Derive a new key by mixing `data` into this one
    pub fn fold_in(&self, data: u64) -> Self {
        Self {
            seed: splitmix64(self.seed ^ splitmix64(data.wrapping_mul(GOLDEN_GAMMA))),
        }
    }

    /// Derive `n` independent keys
    pub fn split(&self, n: usize) -> Vec<Self> {
        (0..n).map(|i| self.fold_in(i as u64 + 1)).collect()
    }

    pub fn split2(&self) -> (Self, Self) {
        (self.fold_in(1), self.fold_in(2))
    }

    pub fn split3(&self) -> (Self, Self, Self) {
        (self.fold_in(1), self.fold_in(2), self.fold_in(3))
    }

    fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed)
    }

    /// Standard normal draws ε ~ N(0, I)
    pub fn normal<S: Into<Shape>>(
        &self,
        shape: S,
        dtype: DType,
        device: &Device,
    ) -> Result<Tensor> {
        let shape = shape.into();
        let mut rng = self.rng();
        let values: Vec<f64> = (0..shape.elem_count())
            .map(|_| rng.sample(StandardNormal))
            .collect();
        // Convert on CPU before moving to device (Metal doesn't support F64)
        Tensor::from_vec(values, shape, &Device::Cpu)?
            .to_dtype(dtype)?
            .to_device(device)
    }

    /// Uniform draws on `[low, high)`
    pub fn uniform<S: Into<Shape>>(
        &self,
        shape: S,
        low: f64,
        high: f64,
        dtype: DType,
        device: &Device,
    ) -> Result<Tensor> {
        if low.is_nan() || high.is_nan() || low >= high {
            bail!("uniform draws need low < high, got [{}, {})", low, high);
        }
        let shape = shape.into();
        let mut rng = self.rng();
        let values: Vec<f64> = (0..shape.elem_count())
            .map(|_| rng.random_range(low..high))
            .collect();
        Tensor::from_vec(values, shape, &Device::Cpu)?
            .to_dtype(dtype)?
            .to_device(device)
    }

    /// Draw `n` distinct indices out of `0..n_total`
    pub fn sample_indices(&self, n_total: usize, n: usize) -> Result<Vec<u32>> {
        if n > n_total {
            bail!("cannot draw {} distinct indices out of {}", n, n_total);
        }
        let mut rng = self.rng();
        Ok(rand::seq::index::sample(&mut rng, n_total, n)
            .into_iter()
            .map(|i| i as u32)
            .collect())
    }

    /// A random permutation of `0..n`
    pub fn permutation(&self, n: usize) -> Result<Vec<u32>> {
        self.sample_indices(n, n)
    }
}
