//! Small dense linear algebra written in candle tensor ops.
//!
//! Everything stays on the autodiff tape, so losses built on top of
//! these (e.g. a full-covariance Gaussian KL) can be differentiated.
//! Loops run over one matrix dimension; meant for the modest sizes of an
//! inducing set, not for large systems.

use candle_core::{bail, DType, Device, Result, Tensor};

fn lower_mask(m: usize, j: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mask: Vec<f64> = (0..m).map(|i| if i >= j { 1.0 } else { 0.0 }).collect();
    Tensor::from_vec(mask, (m, 1), &Device::Cpu)?
        .to_dtype(dtype)?
        .to_device(device)
}

/// Lower Cholesky factor `L` with `A = L Lᵀ`
///
/// Column-by-column (Cholesky–Crout). A matrix that is not positive
/// definite yields NaN entries rather than an error.
///
/// * `a_mm` - symmetric positive-definite matrix (m x m)
pub fn cholesky(a_mm: &Tensor) -> Result<Tensor> {
    let (m, m2) = a_mm.dims2()?;
    if m != m2 {
        bail!("cholesky expects a square matrix, got ({}, {})", m, m2);
    }
    let dtype = a_mm.dtype();
    let device = a_mm.device();

    let mut cols: Vec<Tensor> = Vec::with_capacity(m);
    for j in 0..m {
        let a_j = a_mm.narrow(1, j, 1)?.contiguous()?;
        let v_j = if j == 0 {
            a_j
        } else {
            let l_prev = Tensor::cat(&cols, 1)?; // m x j
            let l_row = l_prev.narrow(0, j, 1)?.contiguous()?; // 1 x j
            (a_j - l_prev.matmul(&l_row.t()?.contiguous()?)?)?
        };
        let d_j = v_j.narrow(0, j, 1)?.sqrt()?;
        let mask = lower_mask(m, j, dtype, device)?;
        cols.push(v_j.broadcast_div(&d_j)?.mul(&mask)?);
    }
    Tensor::cat(&cols, 1)
}

/// Solve `L X = B` by forward substitution
///
/// * `l_mm` - lower-triangular matrix (m x m)
/// * `b_mn` - right-hand side (m x n)
pub fn solve_lower_triangular(l_mm: &Tensor, b_mn: &Tensor) -> Result<Tensor> {
    let (m, m2) = l_mm.dims2()?;
    let (mb, _) = b_mn.dims2()?;
    if m != m2 || m != mb {
        bail!(
            "triangular solve shape mismatch: L is ({}, {}), B has {} rows",
            m,
            m2,
            mb
        );
    }

    let mut rows: Vec<Tensor> = Vec::with_capacity(m);
    for i in 0..m {
        let b_i = b_mn.narrow(0, i, 1)?;
        let l_ii = l_mm.narrow(0, i, 1)?.narrow(1, i, 1)?;
        let r_i = if i == 0 {
            b_i
        } else {
            let x_prev = Tensor::cat(&rows, 0)?; // i x n
            let l_row = l_mm.narrow(0, i, 1)?.narrow(1, 0, i)?.contiguous()?; // 1 x i
            (b_i - l_row.matmul(&x_prev)?)?
        };
        rows.push(r_i.broadcast_div(&l_ii)?);
    }
    Tensor::cat(&rows, 0)
}

/// Diagonal of a square matrix as an (m x 1) column
pub fn diag(a_mm: &Tensor) -> Result<Tensor> {
    let m = a_mm.dim(0)?;
    let eye = Tensor::eye(m, a_mm.dtype(), a_mm.device())?;
    a_mm.mul(&eye)?.sum_keepdim(1)
}

/// log |A| from its Cholesky factor: 2 Σ log L(i,i)
pub fn log_det_from_cholesky(l_mm: &Tensor) -> Result<Tensor> {
    diag(l_mm)?.log()?.sum_all()? * 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spd(device: &Device) -> Result<Tensor> {
        Tensor::new(
            &[[4.0f64, 2.0, 0.4], [2.0, 3.0, 0.5], [0.4, 0.5, 2.0]],
            device,
        )
    }

    #[test]
    fn test_cholesky_reconstructs() -> Result<()> {
        let device = Device::Cpu;
        let a = spd(&device)?;
        let l = cholesky(&a)?;
        let recon = l.matmul(&l.t()?)?;
        let err: f64 = (recon - &a)?.abs()?.max_all()?.to_scalar()?;
        assert!(err < 1e-12, "reconstruction error {}", err);

        // strictly upper part is zero
        let upper: f64 = l.get(0)?.get(1)?.to_scalar()?;
        assert_eq!(upper, 0.0);
        Ok(())
    }

    #[test]
    fn test_solve_and_log_det() -> Result<()> {
        let device = Device::Cpu;
        let a = spd(&device)?;
        let l = cholesky(&a)?;
        let b = Tensor::new(&[[1.0f64], [2.0], [3.0]], &device)?;
        let x = solve_lower_triangular(&l, &b)?;
        let err: f64 = (l.matmul(&x)? - &b)?.abs()?.max_all()?.to_scalar()?;
        assert!(err < 1e-12);

        // det = 4*(3*2 - 0.25) - 2*(2*2 - 0.2) + 0.4*(1.0 - 1.2)
        let det = 4.0 * (6.0 - 0.25) - 2.0 * (4.0 - 0.2) + 0.4 * (1.0 - 1.2);
        let log_det: f64 = log_det_from_cholesky(&l)?.to_scalar()?;
        assert!((log_det - f64::ln(det)).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_not_positive_definite_is_nan() -> Result<()> {
        let a = Tensor::new(&[[1.0f64, 2.0], [2.0, 1.0]], &Device::Cpu)?;
        let l = cholesky(&a)?;
        let l11: f64 = l.get(1)?.get(1)?.to_scalar()?;
        assert!(l11.is_nan());
        Ok(())
    }
}
