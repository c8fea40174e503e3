//! Streaming row accumulation with periodic compression.
//!
//! Rows are buffered until more than `blocksize * ncols` of them are held, at which
//! point the buffer is replaced by a compressed form: the `R` factor of the buffered
//! rows (QR reduction) or their running `AᵗA` sum (Gram reduction). Because `R`
//! factors compose by re-stacking and re-factoring, the buffer never grows past
//! `blocksize * ncols + 1` rows no matter how many rows stream through.

use std::sync::Arc;

use log::trace;
use ndarray::{Array2, Axis, concatenate};

use crate::error::TsqrError;
use crate::kernels;

/// What a compression step reduces the buffered rows to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Keep the `R` factor of the buffered rows.
    Qr,
    /// Fold the buffered rows into a running `AᵗA`.
    Gram,
}

/// Counters reported by an accumulator. `peak_buffered_rows` is the high-water mark
/// of rows held in memory at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccumulatorStats {
    pub rows_observed: u64,
    pub compressions: u64,
    pub peak_buffered_rows: usize,
}

#[derive(Debug)]
pub struct RowAccumulator {
    reduction: Reduction,
    blocksize: usize,
    ncols: Option<usize>,
    premultiplier: Option<Arc<Array2<f64>>>,
    /// Rows already in compressed form (QR reduction only).
    factor: Option<Array2<f64>>,
    gram: Option<Array2<f64>>,
    raw: Vec<f64>,
    raw_rows: usize,
    stats: AccumulatorStats,
}

impl RowAccumulator {
    pub fn new(reduction: Reduction, blocksize: usize, ncols: Option<usize>) -> Self {
        Self {
            reduction,
            blocksize: blocksize.max(1),
            ncols,
            premultiplier: None,
            factor: None,
            gram: None,
            raw: Vec::new(),
            raw_rows: 0,
            stats: AccumulatorStats::default(),
        }
    }

    /// Every raw row is multiplied by `premultiplier` before it is reduced.
    pub fn with_premultiplier(mut self, premultiplier: Arc<Array2<f64>>) -> Self {
        self.premultiplier = Some(premultiplier);
        self
    }

    pub fn ncols(&self) -> Option<usize> {
        self.ncols
    }

    pub fn stats(&self) -> AccumulatorStats {
        self.stats
    }

    pub fn buffered_rows(&self) -> usize {
        self.raw_rows + self.factor.as_ref().map_or(0, |f| f.nrows())
    }

    fn threshold(&self) -> usize {
        self.ncols
            .map_or(usize::MAX, |n| self.blocksize.saturating_mul(n))
    }

    fn accept_width(&mut self, width: usize) -> Result<usize, TsqrError> {
        match self.ncols {
            Some(ncols) if ncols == width => Ok(ncols),
            Some(ncols) => Err(TsqrError::DataFormat(format!(
                "length of value ({width}) did not match number of columns ({ncols})"
            ))),
            None if width == 0 => Err(TsqrError::DataFormat(
                "rows must have at least one column".to_string(),
            )),
            None => {
                self.ncols = Some(width);
                Ok(width)
            }
        }
    }

    /// Buffers one row and compresses when the buffer exceeds its threshold.
    pub fn observe(&mut self, row: &[f64]) -> Result<(), TsqrError> {
        self.accept_width(row.len())?;
        self.raw.extend_from_slice(row);
        self.raw_rows += 1;
        self.stats.rows_observed += 1;
        let buffered = self.buffered_rows();
        self.stats.peak_buffered_rows = self.stats.peak_buffered_rows.max(buffered);
        if buffered > self.threshold() {
            self.compress()?;
        }
        Ok(())
    }

    fn take_raw_block(&mut self) -> Result<Array2<f64>, TsqrError> {
        let ncols = self.ncols.unwrap_or(0);
        let flat = std::mem::take(&mut self.raw);
        let rows = std::mem::take(&mut self.raw_rows);
        let block = Array2::from_shape_vec((rows, ncols), flat)
            .map_err(|e| TsqrError::DataFormat(format!("buffered rows are ragged: {e}")))?;
        match &self.premultiplier {
            Some(premultiplier) if premultiplier.nrows() != ncols => {
                Err(TsqrError::DataFormat(format!(
                    "premultiplier has {} rows but the matrix has {ncols} columns",
                    premultiplier.nrows()
                )))
            }
            Some(premultiplier) => Ok(block.dot(&**premultiplier)),
            None => Ok(block),
        }
    }

    /// Replaces the buffered rows with their compressed form.
    pub fn compress(&mut self) -> Result<(), TsqrError> {
        if self.raw_rows == 0 {
            return Ok(());
        }
        let block = self.take_raw_block()?;
        self.stats.compressions += 1;
        match self.reduction {
            Reduction::Qr => {
                let stacked = match self.factor.take() {
                    Some(factor) => concatenate(Axis(0), &[factor.view(), block.view()])
                        .map_err(|e| {
                            TsqrError::DataFormat(format!("cannot stack factor rows: {e}"))
                        })?,
                    None => block,
                };
                let r = kernels::qr_r(stacked.view());
                trace!(
                    "compressed {} rows into a {}x{} factor",
                    stacked.nrows(),
                    r.nrows(),
                    r.ncols()
                );
                self.factor = Some(r);
            }
            Reduction::Gram => {
                let update = kernels::gram(block.view());
                self.gram = Some(match self.gram.take() {
                    Some(current) => current + update,
                    None => update,
                });
            }
        }
        Ok(())
    }

    /// Forces a final compression and returns the reduced matrix: the `R` factor for
    /// QR reduction or `AᵗA` for Gram reduction. An accumulator that never saw a row
    /// returns a matrix with zero rows.
    pub fn finalize(mut self) -> Result<(Array2<f64>, AccumulatorStats), TsqrError> {
        self.compress()?;
        let width = match (&self.premultiplier, self.ncols) {
            (Some(premultiplier), _) => premultiplier.ncols(),
            (None, Some(ncols)) => ncols,
            (None, None) => 0,
        };
        let out = match self.reduction {
            Reduction::Qr => self.factor.take(),
            Reduction::Gram => self.gram.take(),
        };
        Ok((out.unwrap_or_else(|| Array2::zeros((0, width))), self.stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_matrix(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0))
    }

    fn stream(acc: &mut RowAccumulator, a: &Array2<f64>) {
        for row in a.rows() {
            acc.observe(row.as_slice().unwrap()).unwrap();
        }
    }

    #[test]
    fn blocksize_does_not_change_r() {
        let a = random_matrix(500, 7, 11);
        let mut small = RowAccumulator::new(Reduction::Qr, 1, None);
        let mut large = RowAccumulator::new(Reduction::Qr, 1000, None);
        stream(&mut small, &a);
        stream(&mut large, &a);
        let (r_small, stats_small) = small.finalize().unwrap();
        let (r_large, stats_large) = large.finalize().unwrap();
        assert!(stats_small.compressions > stats_large.compressions);
        assert_abs_diff_eq!(r_small.mapv(f64::abs), r_large.mapv(f64::abs), epsilon = 1e-10);
    }

    #[test]
    fn buffer_stays_bounded_regardless_of_row_count() {
        let ncols = 4;
        let blocksize = 3;
        let bound = blocksize * ncols + 1;
        for total in [100_usize, 20_000] {
            let mut acc = RowAccumulator::new(Reduction::Qr, blocksize, Some(ncols));
            let mut rng = StdRng::seed_from_u64(total as u64);
            let mut row = vec![0.0; ncols];
            for _ in 0..total {
                row.iter_mut().for_each(|v| *v = rng.gen_range(-1.0..1.0));
                acc.observe(&row).unwrap();
                assert!(acc.buffered_rows() <= bound);
            }
            let stats = acc.stats();
            assert_eq!(stats.rows_observed, total as u64);
            assert!(stats.peak_buffered_rows <= bound);
        }
    }

    #[test]
    fn gram_reduction_sums_blocks() {
        let a = random_matrix(60, 3, 5);
        let mut acc = RowAccumulator::new(Reduction::Gram, 2, None);
        stream(&mut acc, &a);
        let (ata, _) = acc.finalize().unwrap();
        assert_abs_diff_eq!(ata, a.t().dot(&a), epsilon = 1e-10);
    }

    #[test]
    fn premultiplier_is_applied_before_reduction() {
        let a = random_matrix(50, 3, 8);
        let p = random_matrix(3, 3, 9);
        let mut acc =
            RowAccumulator::new(Reduction::Qr, 2, None).with_premultiplier(Arc::new(p.clone()));
        stream(&mut acc, &a);
        let (r, _) = acc.finalize().unwrap();
        let expected = kernels::qr_r(a.dot(&p).view());
        assert_abs_diff_eq!(r, expected, epsilon = 1e-10);
    }

    #[test]
    fn width_mismatch_and_empty_input() {
        let mut acc = RowAccumulator::new(Reduction::Qr, 3, None);
        acc.observe(&[1.0, 2.0]).unwrap();
        assert!(matches!(
            acc.observe(&[1.0]),
            Err(TsqrError::DataFormat(_))
        ));

        let empty = RowAccumulator::new(Reduction::Qr, 3, Some(5));
        let (r, stats) = empty.finalize().unwrap();
        assert_eq!(r.dim(), (0, 5));
        assert_eq!(stats.rows_observed, 0);
    }

    #[test]
    fn short_input_yields_reduced_factor() {
        let mut acc = RowAccumulator::new(Reduction::Qr, 3, None);
        acc.observe(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        acc.observe(&[0.0, 2.0, 0.0, 0.0]).unwrap();
        let (r, _) = acc.finalize().unwrap();
        assert_eq!(r.dim(), (2, 4));
        assert_abs_diff_eq!(r[(0, 0)], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(r[(1, 1)], 2.0, epsilon = 1e-12);
    }
}
