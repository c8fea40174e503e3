//! Serial TSQR: the implicit-Q reduction tree.
//!
//! The first round's mappers stream their partition through a [`RowAccumulator`]
//! and emit the partition's `R`. Every round's reducers stack what they receive and
//! compress it again. Later rounds use the identity mapper, so a schedule such as
//! `40,1` first reduces into 40 partial factors and then into one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use ndarray::{Array1, Array2, Axis};

use crate::accumulator::{Reduction, RowAccumulator};
use crate::codec::{RowDecoder, parse_matrix_txt};
use crate::error::TsqrError;
use crate::kernels;
use crate::pipeline::Pipeline;
use crate::runner::{
    Emitter, NewTask, StageSpec, Task, TaskContext, TaskFactory, matrix_sorted_by_key, split_records,
};
use crate::types::{Namespace, PartitionId, Record, RowKey};

/// What the last reducer does with the merged `R`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialFinish {
    /// Emit `R` as is.
    Plain,
    /// Emit `Lᵗ` where `L Lᵗ = RᵗR`.
    Cholesky,
    /// Emit the singular values of `R`, one per row.
    Svd,
}

/// Loads a side-file matrix and inverts it for use as a premultiplier.
pub fn load_premultiplier(path: &Path) -> Result<Arc<Array2<f64>>, TsqrError> {
    let matrix = parse_matrix_txt(path)?;
    let inverse = kernels::inverse(matrix.view())?;
    debug!(
        "premultiplier {} loaded ({}x{})",
        path.display(),
        inverse.nrows(),
        inverse.ncols()
    );
    Ok(Arc::new(inverse))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Map,
    Reduce { last: bool },
}

/// One Serial TSQR task: a decoder and an accumulator, specialised by role.
pub struct SerialTsqrTask {
    role: Role,
    finish: SerialFinish,
    partition: PartitionId,
    decoder: RowDecoder,
    accumulator: RowAccumulator,
}

fn emit_rows(role: Role, partition: PartitionId, rows: &Array2<f64>, out: &mut dyn Emitter) {
    for (i, row) in rows.rows().into_iter().enumerate() {
        let values: Vec<f64> = row.iter().copied().collect();
        let key = match role {
            Role::Reduce { last: true } => RowKey::Index(i as u64),
            _ => RowKey::tagged(partition, RowKey::Index(i as u64)),
        };
        out.emit(Namespace::Output, key, &values);
    }
}

impl Task for SerialTsqrTask {
    fn observe(
        &mut self,
        _: &RowKey,
        payload: &[u8],
        _: &mut dyn Emitter,
    ) -> Result<(), TsqrError> {
        let row = self.decoder.decode(payload)?;
        self.accumulator.observe(&row)
    }

    fn finalize(self: Box<Self>, out: &mut dyn Emitter) -> Result<(), TsqrError> {
        let SerialTsqrTask {
            role,
            finish,
            partition,
            accumulator,
            ..
        } = *self;
        let (r, stats) = accumulator.finalize()?;
        out.count("rows processed", stats.rows_observed);
        out.count("QR compressions", stats.compressions);
        let result = match (role, finish) {
            (Role::Reduce { last: true }, SerialFinish::Cholesky) => {
                let l = kernels::cholesky(kernels::gram(r.view()).view())?;
                l.t().to_owned()
            }
            (Role::Reduce { last: true }, SerialFinish::Svd) => {
                kernels::svd(r.view())?.s.insert_axis(Axis(1))
            }
            _ => r,
        };
        emit_rows(role, partition, &result, out);
        Ok(())
    }
}

/// Builds Serial TSQR task factories from a pipeline's configuration.
#[derive(Debug, Clone)]
pub struct SerialTsqr {
    blocksize: usize,
    ncols: Option<usize>,
    finish: SerialFinish,
    premultiplier: Option<PathBuf>,
}

impl SerialTsqr {
    pub fn new(blocksize: usize, ncols: Option<usize>, finish: SerialFinish) -> Self {
        Self {
            blocksize,
            ncols,
            finish,
            premultiplier: None,
        }
    }

    /// Map tasks multiply every row by the inverse of the matrix in `path`.
    pub fn with_premultiplier(mut self, path: impl Into<PathBuf>) -> Self {
        self.premultiplier = Some(path.into());
        self
    }

    fn factory(&self, role: Role) -> TaskFactory {
        let this = self.clone();
        Arc::new(move |ctx: &TaskContext| -> NewTask {
            let mut accumulator = RowAccumulator::new(Reduction::Qr, this.blocksize, None);
            let mut ncols = this.ncols;
            if role == Role::Map {
                if let Some(path) = &this.premultiplier {
                    accumulator = accumulator.with_premultiplier(load_premultiplier(path)?);
                }
            } else {
                // Reducers see already-premultiplied factors whose width may differ.
                ncols = None;
            }
            Ok(Box::new(SerialTsqrTask {
                role,
                finish: this.finish,
                partition: ctx.partition_id,
                decoder: RowDecoder::new(ncols),
                accumulator,
            }) as Box<dyn Task>)
        })
    }

    pub fn mapper(&self) -> TaskFactory {
        self.factory(Role::Map)
    }

    pub fn reducer(&self, last: bool) -> TaskFactory {
        self.factory(Role::Reduce { last })
    }

    /// Runs every round of the configured reduce schedule and returns the final
    /// reducer's rows, sorted by row index.
    pub fn run(
        &self,
        pipeline: &mut Pipeline<'_>,
        input: Vec<Record>,
    ) -> Result<Array2<f64>, TsqrError> {
        let config = pipeline.config().clone();
        let rounds = config.reduce_schedule.rounds().to_vec();
        if rounds.last() != Some(&1) {
            return Err(TsqrError::Configuration(format!(
                "reduce schedule '{}' must end with a single reducer",
                config.reduce_schedule
            )));
        }
        let mut records = input;
        for (round, &reducers) in rounds.iter().enumerate() {
            let last = round + 1 == rounds.len();
            let stage = StageSpec::map_reduce(
                format!("serial-tsqr round {}", round + 1),
                (round == 0).then(|| self.mapper()),
                Some(self.reducer(last)),
                reducers,
            );
            let mut output =
                pipeline.run_stage(&stage, split_records(records, config.map_tasks))?;
            records = output.take(Namespace::Output);
            debug!("round {} left {} row(s)", round + 1, records.len());
        }
        let result = matrix_sorted_by_key(&records)?;
        info!(
            "serial TSQR finished with a {}x{} result",
            result.nrows(),
            result.ncols()
        );
        Ok(result)
    }
}

/// `R` of `A`, optionally replaced by the Cholesky finish.
pub fn run_serial_tsqr(
    pipeline: &mut Pipeline<'_>,
    input: Vec<Record>,
    finish: SerialFinish,
) -> Result<Array2<f64>, TsqrError> {
    let config = pipeline.config();
    SerialTsqr::new(config.blocksize, config.ncols, finish).run(pipeline, input)
}

/// Singular values of `A`, non-increasing.
pub fn run_tssvd(
    pipeline: &mut Pipeline<'_>,
    input: Vec<Record>,
) -> Result<Array1<f64>, TsqrError> {
    let values = run_serial_tsqr(pipeline, input, SerialFinish::Svd)?;
    if values.ncols() == 0 {
        return Ok(Array1::zeros(0));
    }
    Ok(values.column(0).to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReduceSchedule, TsqrConfig};
    use crate::runner::{LocalJobRunner, records_from_matrix};
    use crate::storage::Workspace;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_matrix(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0))
    }

    fn config(schedule: &str) -> TsqrConfig {
        TsqrConfig {
            blocksize: 2,
            reduce_schedule: schedule.parse::<ReduceSchedule>().unwrap(),
            map_tasks: 5,
            ..TsqrConfig::default()
        }
    }

    #[test]
    fn multi_round_schedule_matches_local_qr() {
        let dir = tempfile::tempdir().unwrap();
        let a = random_matrix(300, 4, 1);
        let mut pipeline = Pipeline::new(
            &LocalJobRunner,
            Workspace::new(dir.path().join("serial")),
            config("3,1"),
        );
        let r = run_serial_tsqr(&mut pipeline, records_from_matrix(&a), SerialFinish::Plain)
            .unwrap();
        assert_eq!(pipeline.stages_run(), 2);
        assert_abs_diff_eq!(r, kernels::qr_r(a.view()), epsilon = 1e-10);
    }

    #[test]
    fn tssvd_reports_singular_values() {
        let dir = tempfile::tempdir().unwrap();
        let a = random_matrix(120, 3, 2);
        let mut pipeline = Pipeline::new(
            &LocalJobRunner,
            Workspace::new(dir.path().join("svd")),
            config("1"),
        );
        let s = run_tssvd(&mut pipeline, records_from_matrix(&a)).unwrap();
        let expected = kernels::svd(a.view()).unwrap().s;
        assert_abs_diff_eq!(s, expected, epsilon = 1e-10);
    }

    #[test]
    fn cholesky_finish_rejects_rank_deficient_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = Array2::<f64>::ones((12, 3));
        a.row_mut(4).fill(2.0);
        let mut pipeline = Pipeline::new(
            &LocalJobRunner,
            Workspace::new(dir.path().join("chol")),
            config("1"),
        );
        let result = run_serial_tsqr(&mut pipeline, records_from_matrix(&a), SerialFinish::Cholesky);
        assert!(matches!(result, Err(TsqrError::Numerical(_))));
    }
}
