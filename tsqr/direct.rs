//! Direct TSQR: an explicit, globally orthogonal `Q` in three stages.
//!
//! 1. Map-only. Every task factors its whole partition, `A_p = Q1_p R1_p`, and emits
//!    `R1_p` keyed by the task's partition id (`R`) and the rows of `Q1_p` keyed by
//!    partition id plus original row key (`Q`).
//! 2. One reducer stacks every `R1_p` in partition-id order and factors the stack,
//!    `[R1_0; R1_1; ...] = Q2 R`. `Q2` is cut back into per-partition blocks using the
//!    row counts recorded while stacking (`Q2`), and `R` is the final answer (`R_final`).
//! 3. Map-only. Every task reads the `Q2` blocks from a side file and emits
//!    `Q1_p Q2_p` row by row under the original row keys.
//!
//! The recursive variant replaces stage 2 by a nested Direct TSQR over the `R1` rows,
//! relabelled with `(partition, row)` keys, followed by a grouping stage that turns
//! the nested `Q` back into per-partition `Q2` blocks.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use ndarray::{Array1, Array2};

use crate::codec::{
    RowDecoder, parse_keyed_rows_txt, parse_matrix_txt, write_keyed_rows_txt, write_matrix_txt,
};
use crate::config::{DirectSchedule, TsqrConfig};
use crate::error::TsqrError;
use crate::kernels::{self, SvdFactors};
use crate::pipeline::Pipeline;
use crate::runner::{
    Emitter, NewTask, StageSpec, Task, TaskContext, TaskFactory, matrix_sorted_by_key,
    split_records,
};
use crate::types::{Namespace, PartitionId, Record, RowKey};

fn partition_of(key: &RowKey) -> Result<PartitionId, TsqrError> {
    match key {
        RowKey::Partition(pid) => Ok(*pid),
        other => Err(TsqrError::DataFormat(format!(
            "expected a partition id key, got '{other}'"
        ))),
    }
}

fn stack_rows(rows: Vec<Vec<f64>>, ncols: usize) -> Result<Array2<f64>, TsqrError> {
    let nrows = rows.len();
    Array2::from_shape_vec((nrows, ncols), rows.into_iter().flatten().collect())
        .map_err(|e| TsqrError::DataFormat(format!("cannot stack {nrows} rows: {e}")))
}

fn emit_indexed(namespace: Namespace, matrix: &Array2<f64>, out: &mut dyn Emitter) {
    for (i, row) in matrix.rows().into_iter().enumerate() {
        let values: Vec<f64> = row.iter().copied().collect();
        out.emit(namespace, RowKey::Index(i as u64), &values);
    }
}

// ========================================================================================
//                                   Stage 1: local QR
// ========================================================================================

/// Holds a whole partition in memory and factors it once in `finalize`.
struct LocalFactorTask {
    partition: PartitionId,
    decoder: RowDecoder,
    keys: Vec<RowKey>,
    rows: Vec<f64>,
}

impl Task for LocalFactorTask {
    fn observe(
        &mut self,
        key: &RowKey,
        payload: &[u8],
        out: &mut dyn Emitter,
    ) -> Result<(), TsqrError> {
        let row = self.decoder.decode(payload)?;
        self.keys.push(key.clone());
        self.rows.extend(row);
        out.count("rows processed", 1);
        Ok(())
    }

    fn finalize(self: Box<Self>, out: &mut dyn Emitter) -> Result<(), TsqrError> {
        let Some(ncols) = self.decoder.ncols() else {
            debug!("partition {} is empty", self.partition);
            return Ok(());
        };
        if self.keys.is_empty() {
            return Ok(());
        }
        let a = Array2::from_shape_vec((self.keys.len(), ncols), self.rows)
            .map_err(|e| TsqrError::DataFormat(format!("partition rows are ragged: {e}")))?;
        let (q1, r1) = kernels::qr_full(a.view());
        for row in r1.rows() {
            let values: Vec<f64> = row.iter().copied().collect();
            out.emit(Namespace::R, RowKey::Partition(self.partition), &values);
        }
        for (key, row) in self.keys.into_iter().zip(q1.rows()) {
            let values: Vec<f64> = row.iter().copied().collect();
            out.emit(Namespace::Q, RowKey::tagged(self.partition, key), &values);
        }
        Ok(())
    }
}

fn local_factor_mapper(ncols: Option<usize>) -> TaskFactory {
    Arc::new(move |ctx: &TaskContext| -> NewTask {
        Ok(Box::new(LocalFactorTask {
            partition: ctx.partition_id,
            decoder: RowDecoder::new(ncols),
            keys: Vec::new(),
            rows: Vec::new(),
        }) as Box<dyn Task>)
    })
}

// ========================================================================================
//                              Stage 2: second-level QR
// ========================================================================================

/// Single reducer over every partition's `R1` rows.
struct StackedFactorTask {
    decoder: RowDecoder,
    blocks: BTreeMap<PartitionId, Vec<Vec<f64>>>,
    compute_svd: bool,
}

impl Task for StackedFactorTask {
    fn observe(
        &mut self,
        key: &RowKey,
        payload: &[u8],
        _: &mut dyn Emitter,
    ) -> Result<(), TsqrError> {
        let pid = partition_of(key)?;
        let row = self.decoder.decode(payload)?;
        self.blocks.entry(pid).or_default().push(row);
        Ok(())
    }

    fn finalize(self: Box<Self>, out: &mut dyn Emitter) -> Result<(), TsqrError> {
        let Some(ncols) = self.decoder.ncols() else {
            return Ok(());
        };
        // The stacking order is recorded here and reused verbatim to cut Q2.
        let order: Vec<(PartitionId, usize)> = self
            .blocks
            .iter()
            .map(|(pid, rows)| (*pid, rows.len()))
            .collect();
        let stacked = stack_rows(self.blocks.into_values().flatten().collect(), ncols)?;
        let (q2, r) = kernels::qr_full(stacked.view());
        info!(
            "stacked {} R1 block(s) into a {}x{} matrix",
            order.len(),
            stacked.nrows(),
            ncols
        );
        emit_indexed(Namespace::RFinal, &r, out);
        if self.compute_svd {
            let SvdFactors { u, s, vt } = kernels::svd(r.view())?;
            emit_indexed(Namespace::U, &u, out);
            for (i, value) in s.iter().enumerate() {
                out.emit(Namespace::Sigma, RowKey::Index(i as u64), &[*value]);
            }
            emit_indexed(Namespace::Vt, &vt, out);
        }
        let mut offset = 0;
        for (pid, count) in order {
            for (i, row) in q2.rows().into_iter().skip(offset).take(count).enumerate() {
                let values: Vec<f64> = row.iter().copied().collect();
                out.emit(
                    Namespace::Q2,
                    RowKey::tagged(pid, RowKey::Index(i as u64)),
                    &values,
                );
            }
            offset += count;
        }
        Ok(())
    }
}

fn stacked_factor_reducer(compute_svd: bool) -> TaskFactory {
    Arc::new(move |_: &TaskContext| -> NewTask {
        Ok(Box::new(StackedFactorTask {
            decoder: RowDecoder::new(None),
            blocks: BTreeMap::new(),
            compute_svd,
        }) as Box<dyn Task>)
    })
}

// ========================================================================================
//                            Recursive stage 2 helpers
// ========================================================================================

/// Rekeys each partition's `R1` rows as `(partition, row index)`. Runs as a reducer
/// so that every row of one partition reaches the same task in emission order.
#[derive(Default)]
struct RelabelTask {
    decoder: RowDecoder,
    next_index: HashMap<PartitionId, u64>,
}

impl Task for RelabelTask {
    fn observe(
        &mut self,
        key: &RowKey,
        payload: &[u8],
        out: &mut dyn Emitter,
    ) -> Result<(), TsqrError> {
        let pid = partition_of(key)?;
        let row = self.decoder.decode(payload)?;
        let index = self.next_index.entry(pid).or_insert(0);
        out.emit(
            Namespace::Output,
            RowKey::tagged(pid, RowKey::Index(*index)),
            &row,
        );
        *index += 1;
        Ok(())
    }

    fn finalize(self: Box<Self>, _: &mut dyn Emitter) -> Result<(), TsqrError> {
        Ok(())
    }
}

/// Moves the row index of a `(partition, row index)` key into the value so the
/// shuffle groups rows by partition alone.
#[derive(Default)]
struct UngroupTask {
    decoder: RowDecoder,
}

impl Task for UngroupTask {
    fn observe(
        &mut self,
        key: &RowKey,
        payload: &[u8],
        out: &mut dyn Emitter,
    ) -> Result<(), TsqrError> {
        let (pid, index) = match key {
            RowKey::Tagged(pid, inner) => match inner.as_ref() {
                RowKey::Index(i) => (*pid, *i),
                _ => {
                    return Err(TsqrError::DataFormat(format!(
                        "'{key}' does not carry a row index"
                    )));
                }
            },
            _ => {
                return Err(TsqrError::DataFormat(format!(
                    "'{key}' is not a partition-tagged key"
                )));
            }
        };
        let mut value = vec![index as f64];
        value.extend(self.decoder.decode(payload)?);
        out.emit(Namespace::Output, RowKey::Partition(pid), &value);
        Ok(())
    }

    fn finalize(self: Box<Self>, _: &mut dyn Emitter) -> Result<(), TsqrError> {
        Ok(())
    }
}

/// Reassembles one `Q2` block per partition and checks that no row is missing.
#[derive(Default)]
struct Q2BlockTask {
    decoder: RowDecoder,
    current: Option<(PartitionId, Vec<(u64, Vec<f64>)>)>,
}

impl Q2BlockTask {
    fn flush(&mut self, out: &mut dyn Emitter) -> Result<(), TsqrError> {
        let Some((pid, mut rows)) = self.current.take() else {
            return Ok(());
        };
        rows.sort_by_key(|(index, _)| *index);
        for (expected, (index, values)) in rows.iter().enumerate() {
            if *index != expected as u64 {
                return Err(TsqrError::DataFormat(format!(
                    "Q2 block of partition {pid} is missing row {expected}"
                )));
            }
            out.emit(
                Namespace::Q2,
                RowKey::tagged(pid, RowKey::Index(*index)),
                values,
            );
        }
        Ok(())
    }
}

impl Task for Q2BlockTask {
    fn observe(
        &mut self,
        key: &RowKey,
        payload: &[u8],
        out: &mut dyn Emitter,
    ) -> Result<(), TsqrError> {
        let pid = partition_of(key)?;
        let value = self.decoder.decode(payload)?;
        let (index, row) = value
            .split_first()
            .ok_or_else(|| TsqrError::DataFormat("empty Q2 row".to_string()))?;
        if self.current.as_ref().is_some_and(|(current, _)| *current != pid) {
            self.flush(out)?;
        }
        let (_, rows) = self.current.get_or_insert_with(|| (pid, Vec::new()));
        rows.push((*index as u64, row.to_vec()));
        Ok(())
    }

    fn finalize(mut self: Box<Self>, out: &mut dyn Emitter) -> Result<(), TsqrError> {
        self.flush(out)
    }
}

// ========================================================================================
//                              Stage 3: Q reconstruction
// ========================================================================================

/// Per-partition `Q2` blocks as read from a keyed side file.
fn load_q2_blocks(path: &Path) -> Result<HashMap<PartitionId, Array2<f64>>, TsqrError> {
    let mut grouped: BTreeMap<PartitionId, Vec<(u64, Vec<f64>)>> = BTreeMap::new();
    for (key, values) in parse_keyed_rows_txt(path)? {
        match key {
            RowKey::Tagged(pid, inner) => match *inner {
                RowKey::Index(i) => grouped.entry(pid).or_default().push((i, values)),
                other => {
                    return Err(TsqrError::DataFormat(format!(
                        "{}: Q2 row key '{other}' is not an index",
                        path.display()
                    )));
                }
            },
            other => {
                return Err(TsqrError::DataFormat(format!(
                    "{}: Q2 row key '{other}' carries no partition",
                    path.display()
                )));
            }
        }
    }
    let mut blocks = HashMap::with_capacity(grouped.len());
    for (pid, mut rows) in grouped {
        rows.sort_by_key(|(i, _)| *i);
        if rows.iter().enumerate().any(|(expected, (i, _))| *i != expected as u64) {
            return Err(TsqrError::DataFormat(format!(
                "{}: Q2 block of partition {pid} has gaps",
                path.display()
            )));
        }
        let ncols = rows.first().map_or(0, |(_, row)| row.len());
        let block = stack_rows(rows.into_iter().map(|(_, row)| row).collect(), ncols)?;
        blocks.insert(pid, block);
    }
    Ok(blocks)
}

struct ReconstructTask {
    decoder: RowDecoder,
    q2: HashMap<PartitionId, Array2<f64>>,
    u: Option<Array2<f64>>,
}

impl Task for ReconstructTask {
    fn observe(
        &mut self,
        key: &RowKey,
        payload: &[u8],
        out: &mut dyn Emitter,
    ) -> Result<(), TsqrError> {
        let RowKey::Tagged(pid, original) = key else {
            return Err(TsqrError::DataFormat(format!(
                "Q1 row key '{key}' carries no partition"
            )));
        };
        let block = self.q2.get(pid).ok_or_else(|| {
            TsqrError::DataFormat(format!("no Q2 block for partition {pid}"))
        })?;
        // A short partition's Q1 is narrower than the others; its Q2 block fixes the width.
        let q1 = Array1::from(self.decoder.decode_any_width(payload)?);
        if q1.len() != block.nrows() {
            return Err(TsqrError::DataFormat(format!(
                "Q1 row of width {} cannot be combined with a {}x{} Q2 block",
                q1.len(),
                block.nrows(),
                block.ncols()
            )));
        }
        let mut row = q1.dot(block);
        if let Some(u) = &self.u {
            row = row.dot(u);
        }
        out.emit(Namespace::Output, original.as_ref().clone(), &row.to_vec());
        out.count("rows processed", 1);
        Ok(())
    }

    fn finalize(self: Box<Self>, _: &mut dyn Emitter) -> Result<(), TsqrError> {
        Ok(())
    }
}

fn reconstruct_mapper(q2_path: PathBuf, u_path: Option<PathBuf>) -> TaskFactory {
    Arc::new(move |_: &TaskContext| -> NewTask {
        let q2 = load_q2_blocks(&q2_path)?;
        let u = u_path.as_deref().map(parse_matrix_txt).transpose()?;
        Ok(Box::new(ReconstructTask {
            decoder: RowDecoder::new(None),
            q2,
            u,
        }) as Box<dyn Task>)
    })
}

// ========================================================================================
//                                       Driver
// ========================================================================================

/// Singular value decomposition of `A` returned by Direct TSSVD.
#[derive(Debug, Clone)]
pub struct DirectSvd {
    pub u: Array2<f64>,
    pub sigma: Array1<f64>,
    pub vt: Array2<f64>,
}

#[derive(Debug, Clone)]
pub struct DirectTsqrOutput {
    /// Rows of `Q` (or of the left singular vectors with SVD) under their input keys.
    pub q: Vec<Record>,
    pub r: Array2<f64>,
    /// `R = U Σ Vᵗ`, present when the SVD was requested.
    pub svd: Option<DirectSvd>,
}

impl DirectTsqrOutput {
    /// `Q` as a dense matrix with rows sorted by key.
    pub fn q_matrix(&self) -> Result<Array2<f64>, TsqrError> {
        matrix_sorted_by_key(&self.q)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DirectTsqr {
    svd: bool,
    levels: usize,
}

impl DirectTsqr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct TSSVD: stage 3 emits `Q U` instead of `Q`.
    pub fn with_svd(mut self) -> Self {
        self.svd = true;
        self
    }

    /// Replace stage 2 by `levels` nested Direct TSQR pipelines.
    pub fn recursive(mut self, levels: usize) -> Self {
        self.levels = levels;
        self
    }

    pub fn run(
        &self,
        pipeline: &mut Pipeline<'_>,
        input: Vec<Record>,
    ) -> Result<DirectTsqrOutput, TsqrError> {
        let config = pipeline.config().clone();
        let mut first = pipeline.run_stage(
            &StageSpec::map_only("direct-tsqr stage 1", local_factor_mapper(config.ncols)),
            split_records(input, config.direct.stage1_map_tasks),
        )?;
        let r1 = first.take(Namespace::R);
        let q1 = first.take(Namespace::Q);

        let (q2_rows, r, svd) = if self.levels == 0 {
            self.second_level(pipeline, r1)?
        } else {
            self.recursive_second_level(pipeline, &config, r1)?
        };

        let workspace = pipeline.workspace().clone();
        let q2_path = workspace.side_file("q2.txt")?;
        write_keyed_rows_txt(&q2_path, &q2_rows)?;
        let u_path = match &svd {
            Some(factors) => {
                let path = workspace.side_file("u.txt")?;
                write_matrix_txt(&path, &factors.u)?;
                Some(path)
            }
            None => None,
        };
        let mut third = pipeline.run_stage(
            &StageSpec::map_only("direct-tsqr stage 3", reconstruct_mapper(q2_path, u_path)),
            split_records(q1, config.direct.stage3_map_tasks),
        )?;
        info!("direct TSQR produced a {}x{} R", r.nrows(), r.ncols());
        Ok(DirectTsqrOutput {
            q: third.take(Namespace::Output),
            r,
            svd,
        })
    }

    fn second_level(
        &self,
        pipeline: &mut Pipeline<'_>,
        r1: Vec<Record>,
    ) -> Result<(Vec<(RowKey, Vec<f64>)>, Array2<f64>, Option<DirectSvd>), TsqrError> {
        let map_tasks = pipeline.config().map_tasks;
        let stage = StageSpec::map_reduce(
            "direct-tsqr stage 2",
            None,
            Some(stacked_factor_reducer(self.svd)),
            1,
        );
        let second = pipeline.run_stage(&stage, split_records(r1, map_tasks))?;
        let svd = if self.svd {
            Some(DirectSvd {
                u: second.matrix(Namespace::U)?,
                sigma: second
                    .rows(Namespace::Sigma)?
                    .into_iter()
                    .map(|(_, row)| row.first().copied().unwrap_or(0.0))
                    .collect(),
                vt: second.matrix(Namespace::Vt)?,
            })
        } else {
            None
        };
        Ok((
            second.rows(Namespace::Q2)?,
            second.matrix(Namespace::RFinal)?,
            svd,
        ))
    }

    fn recursive_second_level(
        &self,
        pipeline: &mut Pipeline<'_>,
        config: &TsqrConfig,
        r1: Vec<Record>,
    ) -> Result<(Vec<(RowKey, Vec<f64>)>, Array2<f64>, Option<DirectSvd>), TsqrError> {
        let relabel: TaskFactory = Arc::new(|_: &TaskContext| -> NewTask {
            Ok(Box::new(RelabelTask::default()) as Box<dyn Task>)
        });
        let mut labelled = pipeline.run_stage(
            &StageSpec::map_reduce(
                "direct-tsqr relabel R1",
                None,
                Some(relabel),
                config.recursive_map_tasks,
            ),
            split_records(r1, config.map_tasks),
        )?;

        let nested_config = TsqrConfig {
            map_tasks: config.recursive_map_tasks,
            direct: DirectSchedule {
                stage1_map_tasks: config.recursive_map_tasks,
                stage3_map_tasks: config.recursive_map_tasks,
            },
            ..config.clone()
        };
        let mut nested = pipeline.nested(&format!("rec{}", self.levels), nested_config);
        let inner = DirectTsqr::new()
            .recursive(self.levels - 1)
            .run(&mut nested, labelled.take(Namespace::Output))?;

        let ungroup: TaskFactory = Arc::new(|_: &TaskContext| -> NewTask {
            Ok(Box::new(UngroupTask::default()) as Box<dyn Task>)
        });
        let group: TaskFactory = Arc::new(|_: &TaskContext| -> NewTask {
            Ok(Box::new(Q2BlockTask::default()) as Box<dyn Task>)
        });
        let grouped = pipeline.run_stage(
            &StageSpec::map_reduce(
                "direct-tsqr group Q2",
                Some(ungroup),
                Some(group),
                config.recursive_map_tasks,
            ),
            split_records(inner.q, config.map_tasks),
        )?;

        let svd = if self.svd {
            let SvdFactors { u, s, vt } = kernels::svd(inner.r.view())?;
            Some(DirectSvd { u, sigma: s, vt })
        } else {
            None
        };
        Ok((grouped.rows(Namespace::Q2)?, inner.r, svd))
    }
}
