//! Dense local factorization kernels.
//!
//! Every routine here is synchronous, CPU-bound and free of I/O. Matrices come in as
//! `ndarray` views, are bridged into `faer` without copying when the layout allows it,
//! and come back out as owned `Array2`s.
//!
//! Sign convention: intermediate `R` blocks produced by different tasks are later
//! stacked and factored again, so every `R` returned from this module has a
//! non-negative diagonal and the matching column of `Q` is negated along with it.
//! A kernel that let signs drift between calls would still produce a valid
//! factorization per call but silently break cross-task consistency.

use dyn_stack::{MemBuffer, MemStack};
use faer::diag::Diag;
use faer::linalg::solvers;
use faer::linalg::svd::{self, ComputeSvdVectors};
use faer::{Mat, MatRef, Side, get_global_parallelism};
use ndarray::{Array1, Array2, ArrayBase, ArrayView2, Data, Ix2};
use thiserror::Error;

/// Singular values at or below this fraction of the largest count as zero in [`pinv`]
/// and [`inverse`].
pub const RANK_TOLERANCE: f64 = 1.0e-12;

/// Smallest accepted ratio between a Cholesky pivot and the largest pivot. Below it
/// the input is treated as rank deficient even if every pivot came out positive.
pub const CHOLESKY_PIVOT_TOLERANCE: f64 = 1.0e-7;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("SVD failed to converge")]
    SvdNoConvergence,
    #[error("Cholesky factorization failed, matrix is not positive definite: {0:?}")]
    Cholesky(solvers::LltError),
    #[error("matrix of size {size}x{size} is singular (numerical rank {rank})")]
    Singular { size: usize, rank: usize },
    #[error("shape mismatch: {0}")]
    Shape(String),
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

/// An `ndarray` view as a `faer` matrix. Row-major contiguous views are borrowed;
/// anything else is copied once.
enum FaerInput<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

impl<'a> FaerInput<'a> {
    fn new(a: &'a ArrayView2<'_, f64>) -> Self {
        match a.as_slice() {
            Some(slice) => FaerInput::Borrowed(MatRef::from_row_major_slice(
                slice,
                a.nrows(),
                a.ncols(),
            )),
            None => FaerInput::Owned(Mat::from_fn(a.nrows(), a.ncols(), |i, j| a[(i, j)])),
        }
    }

    fn mat(&self) -> MatRef<'_, f64> {
        match self {
            FaerInput::Borrowed(view) => *view,
            FaerInput::Owned(mat) => mat.as_ref(),
        }
    }
}

/// Flips rows of `r` (and the matching columns of `q`) so the diagonal of `r` is
/// non-negative.
fn normalize_signs(r: &mut Array2<f64>, mut q: Option<&mut Array2<f64>>) {
    let k = r.nrows().min(r.ncols());
    for i in 0..k {
        if r[(i, i)] < 0.0 {
            r.row_mut(i).mapv_inplace(|v| -v);
            if let Some(q) = q.as_deref_mut() {
                q.column_mut(i).mapv_inplace(|v| -v);
            }
        }
    }
}

/// Copies the upper trapezoid of the leading `k` rows of a faer `R` factor.
fn upper_trapezoid(r: MatRef<'_, f64>, k: usize, n: usize) -> Array2<f64> {
    Array2::from_shape_fn((k, n), |(i, j)| if j >= i { r[(i, j)] } else { 0.0 })
}

/// The `R` factor of `a = Q R`.
///
/// For an `m x n` input the result is `min(m, n) x n`: a short block yields a reduced
/// (trapezoidal) factor rather than a zero-padded one, and an empty block yields a
/// `0 x n` matrix.
pub fn qr_r(a: ArrayView2<'_, f64>) -> Array2<f64> {
    let (m, n) = a.dim();
    let k = m.min(n);
    if k == 0 {
        return Array2::zeros((0, n));
    }
    let input = FaerInput::new(&a);
    let qr = input.mat().qr();
    let mut r = upper_trapezoid(qr.R(), k, n);
    normalize_signs(&mut r, None);
    r
}

/// Explicit thin factorization `a = Q R` with `Q` of size `m x min(m, n)` and
/// orthonormal columns.
pub fn qr_full(a: ArrayView2<'_, f64>) -> (Array2<f64>, Array2<f64>) {
    let (m, n) = a.dim();
    let k = m.min(n);
    if k == 0 {
        return (Array2::zeros((m, 0)), Array2::zeros((0, n)));
    }
    let input = FaerInput::new(&a);
    let qr = input.mat().qr();
    let thin_q = qr.compute_thin_Q();
    let mut q = mat_to_array(thin_q.as_ref());
    let mut r = upper_trapezoid(qr.R(), k, n);
    normalize_signs(&mut r, Some(&mut q));
    (q, r)
}

/// Lower-triangular `L` with `s = L Lᵗ`.
pub fn cholesky(s: ArrayView2<'_, f64>) -> Result<Array2<f64>, KernelError> {
    let (rows, cols) = s.dim();
    if rows != cols {
        return Err(KernelError::Shape(format!(
            "Cholesky needs a square matrix, got {rows}x{cols}"
        )));
    }
    if rows == 0 {
        return Ok(Array2::zeros((0, 0)));
    }
    if s.iter().any(|v| !v.is_finite()) {
        return Err(KernelError::Shape(
            "Cholesky input contains non-finite entries".to_string(),
        ));
    }
    let input = FaerInput::new(&s);
    let factor = input
        .mat()
        .llt(Side::Lower)
        .map_err(KernelError::Cholesky)?;
    let l = factor.L();
    let pivots: Vec<f64> = (0..rows).map(|i| l[(i, i)]).collect();
    let largest = pivots.iter().copied().fold(0.0_f64, f64::max);
    let rank = pivots
        .iter()
        .filter(|&&p| p > largest * CHOLESKY_PIVOT_TOLERANCE)
        .count();
    if rank < rows {
        return Err(KernelError::Singular { size: rows, rank });
    }
    Ok(Array2::from_shape_fn((rows, rows), |(i, j)| {
        if j <= i { l[(i, j)] } else { 0.0 }
    }))
}

/// Thin singular value decomposition `a = U diag(s) Vᵗ`.
#[derive(Debug, Clone)]
pub struct SvdFactors {
    pub u: Array2<f64>,
    /// Singular values, non-increasing.
    pub s: Array1<f64>,
    pub vt: Array2<f64>,
}

pub fn svd(a: ArrayView2<'_, f64>) -> Result<SvdFactors, KernelError> {
    let (rows, cols) = a.dim();
    let k = rows.min(cols);
    if k == 0 {
        return Ok(SvdFactors {
            u: Array2::zeros((rows, 0)),
            s: Array1::zeros(0),
            vt: Array2::zeros((0, cols)),
        });
    }

    let input = FaerInput::new(&a);
    let mut singular = Diag::<f64>::zeros(k);
    let mut u_storage = Mat::<f64>::zeros(rows, k);
    let mut v_storage = Mat::<f64>::zeros(cols, k);

    let par = get_global_parallelism();
    let mut mem = MemBuffer::new(svd::svd_scratch::<f64>(
        rows,
        cols,
        ComputeSvdVectors::Thin,
        ComputeSvdVectors::Thin,
        par,
        Default::default(),
    ));
    let mut stack = MemStack::new(&mut mem);
    svd::svd(
        input.mat(),
        singular.as_mut(),
        Some(u_storage.as_mut()),
        Some(v_storage.as_mut()),
        par,
        &mut stack,
        Default::default(),
    )
    .map_err(|_| KernelError::SvdNoConvergence)?;

    let column = singular.as_ref().column_vector().as_mat();
    let values: Vec<f64> = (0..k).map(|i| column[(i, 0)]).collect();
    let mut order: Vec<usize> = (0..k).collect();
    order.sort_by(|&i, &j| values[j].total_cmp(&values[i]));

    let s = Array1::from_shape_fn(k, |i| values[order[i]]);
    let u = Array2::from_shape_fn((rows, k), |(i, j)| u_storage[(i, order[j])]);
    let vt = Array2::from_shape_fn((k, cols), |(i, j)| v_storage[(j, order[i])]);
    Ok(SvdFactors { u, s, vt })
}

/// Singular values at or below this count as zero.
fn rank_cutoff(s: &Array1<f64>) -> f64 {
    s.iter().copied().fold(0.0_f64, f64::max) * RANK_TOLERANCE
}

/// Moore-Penrose pseudo-inverse. Singular values below the rank cutoff are treated
/// as zero, so singular or non-square inputs are fine.
pub fn pinv(a: ArrayView2<'_, f64>) -> Result<Array2<f64>, KernelError> {
    let (rows, cols) = a.dim();
    let factors = svd(a)?;
    let cutoff = rank_cutoff(&factors.s);
    let mut out = Array2::<f64>::zeros((cols, rows));
    for (idx, &sigma) in factors.s.iter().enumerate() {
        if sigma <= cutoff || sigma == 0.0 {
            continue;
        }
        let v = factors.vt.row(idx);
        let u = factors.u.column(idx);
        for i in 0..cols {
            let scale = v[i] / sigma;
            if scale == 0.0 {
                continue;
            }
            for j in 0..rows {
                out[(i, j)] += scale * u[j];
            }
        }
    }
    Ok(out)
}

/// Inverse of a square, numerically full-rank matrix. Rank deficiency is reported
/// instead of being papered over with a pseudo-inverse.
pub fn inverse(a: ArrayView2<'_, f64>) -> Result<Array2<f64>, KernelError> {
    let (rows, cols) = a.dim();
    if rows != cols {
        return Err(KernelError::Shape(format!(
            "inverse needs a square matrix, got {rows}x{cols}"
        )));
    }
    let factors = svd(a)?;
    let cutoff = rank_cutoff(&factors.s);
    let rank = factors.s.iter().filter(|&&s| s > cutoff && s > 0.0).count();
    if rank < rows {
        return Err(KernelError::Singular { size: rows, rank });
    }
    pinv(a)
}

/// `aᵗ a`, the Gram matrix of a block of rows.
pub fn gram(a: ArrayView2<'_, f64>) -> Array2<f64> {
    a.t().dot(&a)
}

/// `bᵗ a` for two blocks with matching rows.
pub fn cross_product(
    b: ArrayView2<'_, f64>,
    a: ArrayView2<'_, f64>,
) -> Result<Array2<f64>, KernelError> {
    if b.nrows() != a.nrows() {
        return Err(KernelError::Shape(format!(
            "BtA needs matching row counts, got {} and {}",
            b.nrows(),
            a.nrows()
        )));
    }
    Ok(b.t().dot(&a))
}

pub fn frobenius_norm<S: Data<Elem = f64>>(matrix: &ArrayBase<S, Ix2>) -> f64 {
    matrix.iter().map(|&x| x * x).sum::<f64>().sqrt()
}
