//! Cholesky-QR: `R` as the transposed Cholesky factor of `AᵗA`.
//!
//! Cheaper than a QR reduction tree (every task only keeps an `n x n` running sum)
//! but the condition number of `AᵗA` is the square of that of `A`, so it loses
//! accuracy on ill-conditioned inputs. Rank deficiency surfaces as a
//! [`TsqrError::Numerical`] from the final reducer.

use std::path::Path;
use std::sync::Arc;

use ndarray::Array2;

use crate::codec::RowDecoder;
use crate::error::TsqrError;
use crate::kernels;
use crate::pipeline::Pipeline;
use crate::products::{array_sum_reducer, gram_mapper};
use crate::runner::{Emitter, NewTask, StageSpec, Task, TaskContext, TaskFactory, split_records};
use crate::types::{Namespace, Record, RowKey};

/// Assembles `AᵗA` from rows keyed by their row index, then factors it.
#[derive(Default)]
pub struct CholeskyTask {
    decoder: RowDecoder,
    gram: Option<Array2<f64>>,
}

impl Task for CholeskyTask {
    fn observe(
        &mut self,
        key: &RowKey,
        payload: &[u8],
        _: &mut dyn Emitter,
    ) -> Result<(), TsqrError> {
        let row = self.decoder.decode(payload)?;
        let n = row.len();
        let index = match key {
            RowKey::Index(i) if (*i as usize) < n => *i as usize,
            other => {
                return Err(TsqrError::DataFormat(format!(
                    "'{other}' is not a row index of a {n}x{n} matrix"
                )));
            }
        };
        let gram = self.gram.get_or_insert_with(|| Array2::zeros((n, n)));
        gram.row_mut(index)
            .iter_mut()
            .zip(row)
            .for_each(|(g, v)| *g += v);
        Ok(())
    }

    fn finalize(self: Box<Self>, out: &mut dyn Emitter) -> Result<(), TsqrError> {
        let Some(gram) = self.gram else {
            return Ok(());
        };
        let l = kernels::cholesky(gram.view())?;
        for (i, row) in l.t().rows().into_iter().enumerate() {
            let values: Vec<f64> = row.iter().copied().collect();
            out.emit(Namespace::Output, RowKey::Index(i as u64), &values);
        }
        Ok(())
    }
}

pub fn cholesky_reducer() -> TaskFactory {
    Arc::new(|_: &TaskContext| -> NewTask {
        Ok(Box::new(CholeskyTask::default()) as Box<dyn Task>)
    })
}

/// Two rounds: blocked `AᵗA` per map task summed across the first round's
/// reducers, then one reducer that factors the sum.
pub fn run_cholesky_qr(
    pipeline: &mut Pipeline<'_>,
    input: Vec<Record>,
    premultiplier: Option<&Path>,
) -> Result<Array2<f64>, TsqrError> {
    let config = pipeline.config().clone();
    let gram_stage = StageSpec::map_reduce(
        "cholesky-qr gram",
        Some(gram_mapper(
            config.blocksize,
            config.ncols,
            premultiplier.map(Path::to_path_buf),
        )),
        Some(array_sum_reducer()),
        config.reduce_schedule.rounds()[0],
    );
    let mut sums = pipeline.run_stage(&gram_stage, split_records(input, config.map_tasks))?;
    let factor_stage =
        StageSpec::map_reduce("cholesky-qr factor", None, Some(cholesky_reducer()), 1);
    let output = pipeline.run_stage(
        &factor_stage,
        split_records(sums.take(Namespace::Output), config.map_tasks),
    )?;
    output.matrix(Namespace::Output)
}
