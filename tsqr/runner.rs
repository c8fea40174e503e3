//! The map/reduce execution boundary.
//!
//! Algorithms are expressed as [`Task`]s built by [`TaskFactory`] closures and
//! grouped into [`StageSpec`]s. A [`JobRunner`] executes one stage at a time: every
//! map task, then a shuffle that groups records by key, then every reduce task.
//! [`LocalJobRunner`] is an in-process runner built on `rayon`; a cluster runner
//! implements the same trait.

use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use log::{debug, info};
use ndarray::Array2;
use rayon::prelude::*;

use crate::codec::{RowDecoder, encode_packed};
use crate::error::TsqrError;
use crate::types::{Namespace, Partition, PartitionId, Record, RowKey};

/// Output channel handed to a task. Rows are encoded as packed binary on emission.
pub trait Emitter {
    fn emit(&mut self, namespace: Namespace, key: RowKey, row: &[f64]);

    /// Adds to a named task counter.
    fn count(&mut self, counter: &'static str, amount: u64) {
        let _ = (counter, amount);
    }
}

/// A map or reduce role. `observe` sees every record routed to the task instance in
/// order; `finalize` runs once after the last record.
pub trait Task: Send {
    fn observe(
        &mut self,
        key: &RowKey,
        payload: &[u8],
        out: &mut dyn Emitter,
    ) -> Result<(), TsqrError>;

    fn finalize(self: Box<Self>, out: &mut dyn Emitter) -> Result<(), TsqrError>;
}

/// Identity of one task instance.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub stage: String,
    pub task_index: usize,
    /// Freshly generated per task instance.
    pub partition_id: PartitionId,
    /// Label of the input the task reads (map tasks only).
    pub source: Option<String>,
}

/// What a [`TaskFactory`] returns for one task slot.
pub type NewTask = Result<Box<dyn Task>, TsqrError>;

pub type TaskFactory = Arc<dyn Fn(&TaskContext) -> NewTask + Send + Sync>;

/// One distributed stage: `mapper = None` is the identity mapper, `reduce_tasks = 0`
/// makes the stage map-only and `reducer = None` is the identity reducer.
#[derive(Clone)]
pub struct StageSpec {
    pub name: String,
    pub mapper: Option<TaskFactory>,
    pub reducer: Option<TaskFactory>,
    pub reduce_tasks: usize,
}

impl StageSpec {
    pub fn map_only(name: impl Into<String>, mapper: TaskFactory) -> Self {
        Self {
            name: name.into(),
            mapper: Some(mapper),
            reducer: None,
            reduce_tasks: 0,
        }
    }

    pub fn map_reduce(
        name: impl Into<String>,
        mapper: Option<TaskFactory>,
        reducer: Option<TaskFactory>,
        reduce_tasks: usize,
    ) -> Self {
        Self {
            name: name.into(),
            mapper,
            reducer,
            reduce_tasks: reduce_tasks.max(1),
        }
    }
}

/// Records read by one map task.
#[derive(Debug, Clone, Default)]
pub struct InputSplit {
    pub source: Option<String>,
    pub records: Partition,
}

impl InputSplit {
    pub fn new(records: Partition) -> Self {
        Self {
            source: None,
            records,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Splits records into at most `map_tasks` contiguous splits.
pub fn split_records(records: Vec<Record>, map_tasks: usize) -> Vec<InputSplit> {
    if records.is_empty() {
        return vec![InputSplit::default()];
    }
    let tasks = map_tasks.clamp(1, records.len());
    let per_task = records.len().div_ceil(tasks);
    let mut splits = Vec::with_capacity(tasks);
    let mut iter = records.into_iter().peekable();
    while iter.peek().is_some() {
        splits.push(InputSplit::new(iter.by_ref().take(per_task).collect()));
    }
    splits
}

/// Builds `Index`-keyed records from the rows of a matrix, packed binary encoded.
pub fn records_from_matrix(matrix: &Array2<f64>) -> Vec<Record> {
    matrix
        .rows()
        .into_iter()
        .enumerate()
        .map(|(i, row)| {
            let values: Vec<f64> = row.iter().copied().collect();
            Record::new(RowKey::Index(i as u64), encode_packed(&values))
        })
        .collect()
}

/// Decodes records into `(key, row)` pairs with one decoder for the whole list.
pub fn decode_records(records: &[Record]) -> Result<Vec<(RowKey, Vec<f64>)>, TsqrError> {
    let mut decoder = RowDecoder::new(None);
    records
        .iter()
        .map(|record| Ok((record.key.clone(), decoder.decode(&record.payload)?)))
        .collect()
}

/// Stacks decoded rows into a matrix, sorted by key.
pub fn matrix_sorted_by_key(records: &[Record]) -> Result<Array2<f64>, TsqrError> {
    let mut rows = decode_records(records)?;
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    let ncols = rows.first().map_or(0, |(_, row)| row.len());
    let nrows = rows.len();
    let flat: Vec<f64> = rows.into_iter().flat_map(|(_, row)| row).collect();
    Array2::from_shape_vec((nrows, ncols), flat)
        .map_err(|e| TsqrError::DataFormat(format!("rows have differing lengths: {e}")))
}

/// The buffered output of one task; nothing becomes visible to the stage until the
/// task has finished without error.
#[derive(Debug, Default)]
pub struct TaskOutput {
    records: Vec<(Namespace, Record)>,
    counters: BTreeMap<&'static str, u64>,
}

impl TaskOutput {
    fn push_payload(&mut self, namespace: Namespace, key: RowKey, payload: Vec<u8>) {
        self.records.push((namespace, Record::new(key, payload)));
    }

    pub fn records(&self) -> &[(Namespace, Record)] {
        &self.records
    }
}

impl Emitter for TaskOutput {
    fn emit(&mut self, namespace: Namespace, key: RowKey, row: &[f64]) {
        self.push_payload(namespace, key, encode_packed(row));
    }

    fn count(&mut self, counter: &'static str, amount: u64) {
        *self.counters.entry(counter).or_insert(0) += amount;
    }
}

/// Everything one stage produced, grouped by namespace in task order.
#[derive(Debug, Default, Clone)]
pub struct StageOutput {
    namespaces: BTreeMap<Namespace, Vec<Record>>,
    pub counters: BTreeMap<&'static str, u64>,
}

impl StageOutput {
    fn absorb(&mut self, output: TaskOutput) {
        for (namespace, record) in output.records {
            self.namespaces.entry(namespace).or_default().push(record);
        }
        for (counter, amount) in output.counters {
            *self.counters.entry(counter).or_insert(0) += amount;
        }
    }

    pub fn records(&self, namespace: Namespace) -> &[Record] {
        self.namespaces
            .get(&namespace)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn take(&mut self, namespace: Namespace) -> Vec<Record> {
        self.namespaces.remove(&namespace).unwrap_or_default()
    }

    pub fn namespaces(&self) -> impl Iterator<Item = (Namespace, &[Record])> {
        self.namespaces
            .iter()
            .map(|(namespace, records)| (*namespace, records.as_slice()))
    }

    pub fn insert(&mut self, namespace: Namespace, records: Vec<Record>) {
        self.namespaces.insert(namespace, records);
    }

    pub fn rows(&self, namespace: Namespace) -> Result<Vec<(RowKey, Vec<f64>)>, TsqrError> {
        decode_records(self.records(namespace))
    }

    pub fn matrix(&self, namespace: Namespace) -> Result<Array2<f64>, TsqrError> {
        matrix_sorted_by_key(self.records(namespace))
    }
}

/// Executes one stage: all map tasks, the shuffle, then all reduce tasks. Returns only
/// once every task has finished, so a stage's output is fully materialized before the
/// next stage can start.
pub trait JobRunner: Sync {
    fn run_stage(&self, stage: &StageSpec, input: Vec<InputSplit>)
    -> Result<StageOutput, TsqrError>;
}

/// In-process runner. Map and reduce tasks run on the `rayon` pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalJobRunner;

fn reduce_bucket(key: &RowKey, reduce_tasks: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % reduce_tasks as u64) as usize
}

fn run_task(
    factory: Option<&TaskFactory>,
    ctx: &TaskContext,
    records: Vec<Record>,
) -> Result<TaskOutput, TsqrError> {
    let mut output = TaskOutput::default();
    match factory {
        None => {
            for record in records {
                output.push_payload(Namespace::Output, record.key, record.payload);
            }
        }
        Some(factory) => {
            let mut task = factory(ctx)?;
            for record in &records {
                task.observe(&record.key, &record.payload, &mut output)?;
            }
            task.finalize(&mut output)?;
        }
    }
    Ok(output)
}

impl JobRunner for LocalJobRunner {
    fn run_stage(
        &self,
        stage: &StageSpec,
        input: Vec<InputSplit>,
    ) -> Result<StageOutput, TsqrError> {
        debug!(
            "stage '{}': {} map task(s), {} reduce task(s)",
            stage.name,
            input.len(),
            stage.reduce_tasks
        );
        let map_outputs: Vec<TaskOutput> = input
            .into_par_iter()
            .enumerate()
            .map(|(task_index, split)| {
                let ctx = TaskContext {
                    stage: stage.name.clone(),
                    task_index,
                    partition_id: PartitionId::random(),
                    source: split.source,
                };
                run_task(stage.mapper.as_ref(), &ctx, split.records)
            })
            .collect::<Result<_, _>>()?;

        let mut stage_output = StageOutput::default();
        if stage.reduce_tasks == 0 {
            for output in map_outputs {
                stage_output.absorb(output);
            }
            log_counters(&stage.name, &stage_output);
            return Ok(stage_output);
        }

        let mut buckets: Vec<Vec<Record>> = vec![Vec::new(); stage.reduce_tasks];
        for output in map_outputs {
            for (counter, amount) in output.counters {
                *stage_output.counters.entry(counter).or_insert(0) += amount;
            }
            for (namespace, record) in output.records {
                if namespace != Namespace::Output {
                    return Err(TsqrError::Configuration(format!(
                        "stage '{}': a mapper emitted into '{namespace}' but the stage shuffles",
                        stage.name
                    )));
                }
                let bucket = reduce_bucket(&record.key, stage.reduce_tasks);
                buckets[bucket].push(record);
            }
        }

        let reduce_outputs: Vec<TaskOutput> = buckets
            .into_par_iter()
            .enumerate()
            .filter(|(_, records)| !records.is_empty())
            .map(|(task_index, mut records)| {
                // Stable: values under one key keep their arrival order.
                records.sort_by(|a, b| a.key.cmp(&b.key));
                let ctx = TaskContext {
                    stage: stage.name.clone(),
                    task_index,
                    partition_id: PartitionId::random(),
                    source: None,
                };
                run_task(stage.reducer.as_ref(), &ctx, records)
            })
            .collect::<Result<_, _>>()?;

        for output in reduce_outputs {
            stage_output.absorb(output);
        }
        log_counters(&stage.name, &stage_output);
        Ok(stage_output)
    }
}

fn log_counters(stage: &str, output: &StageOutput) {
    for (counter, amount) in &output.counters {
        info!("[{stage}] {counter}: {amount}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doubler;

    impl Task for Doubler {
        fn observe(
            &mut self,
            key: &RowKey,
            payload: &[u8],
            out: &mut dyn Emitter,
        ) -> Result<(), TsqrError> {
            let row = RowDecoder::new(None).decode(payload)?;
            let doubled: Vec<f64> = row.iter().map(|v| v * 2.0).collect();
            out.emit(Namespace::Output, key.clone(), &doubled);
            out.count("rows processed", 1);
            Ok(())
        }

        fn finalize(self: Box<Self>, _: &mut dyn Emitter) -> Result<(), TsqrError> {
            Ok(())
        }
    }

    /// Sums every row routed to it and emits one row per task.
    struct Summer {
        total: Vec<f64>,
        index: usize,
    }

    impl Task for Summer {
        fn observe(
            &mut self,
            _: &RowKey,
            payload: &[u8],
            _: &mut dyn Emitter,
        ) -> Result<(), TsqrError> {
            let row = RowDecoder::new(None).decode(payload)?;
            if self.total.is_empty() {
                self.total = vec![0.0; row.len()];
            }
            for (t, v) in self.total.iter_mut().zip(row) {
                *t += v;
            }
            Ok(())
        }

        fn finalize(self: Box<Self>, out: &mut dyn Emitter) -> Result<(), TsqrError> {
            out.emit(Namespace::Output, RowKey::Index(self.index as u64), &self.total);
            Ok(())
        }
    }

    fn doubler() -> TaskFactory {
        Arc::new(|_: &TaskContext| -> NewTask {
            Ok(Box::new(Doubler) as Box<dyn Task>)
        })
    }

    #[test]
    fn map_only_stage_preserves_keys_and_counts() {
        let matrix = ndarray::array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let splits = split_records(records_from_matrix(&matrix), 2);
        assert_eq!(splits.len(), 2);
        let output = LocalJobRunner
            .run_stage(&StageSpec::map_only("double", doubler()), splits)
            .unwrap();
        assert_eq!(output.matrix(Namespace::Output).unwrap(), &matrix * 2.0);
        assert_eq!(output.counters.get("rows processed"), Some(&3));
    }

    #[test]
    fn single_reducer_sees_every_key() {
        let matrix = ndarray::Array2::from_shape_fn((10, 2), |(i, j)| (i + j) as f64);
        let reducer: TaskFactory = Arc::new(|ctx: &TaskContext| -> NewTask {
            Ok(Box::new(Summer {
                total: Vec::new(),
                index: ctx.task_index,
            }) as Box<dyn Task>)
        });
        let stage = StageSpec::map_reduce("sum", None, Some(reducer), 1);
        let output = LocalJobRunner
            .run_stage(&stage, split_records(records_from_matrix(&matrix), 3))
            .unwrap();
        let rows = output.rows(Namespace::Output).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, vec![45.0, 55.0]);
    }

    #[test]
    fn failing_task_fails_the_stage() {
        let failing: TaskFactory = Arc::new(|_: &TaskContext| -> NewTask {
            Err(TsqrError::Configuration("no side file".to_string()))
        });
        let result = LocalJobRunner.run_stage(
            &StageSpec::map_only("fail", failing),
            vec![InputSplit::default()],
        );
        assert!(matches!(result, Err(TsqrError::Configuration(_))));
    }
}
