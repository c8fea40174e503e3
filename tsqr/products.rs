//! Tall-and-skinny products: `A·B` against a small side matrix, `A·R⁺`, `AᵗA` and
//! `BᵗA`, plus the array-sum reducer that merges per-task partial sums.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use ndarray::Array2;

use crate::accumulator::{Reduction, RowAccumulator};
use crate::codec::{RowDecoder, parse_matrix_txt};
use crate::error::TsqrError;
use crate::kernels;
use crate::pipeline::Pipeline;
use crate::runner::{
    Emitter, InputSplit, NewTask, StageSpec, Task, TaskContext, TaskFactory, matrix_sorted_by_key,
    split_records,
};
use crate::serial::load_premultiplier;
use crate::types::{Namespace, Record, RowKey};

/// Source label of the `A` input of a `BᵗA` product.
pub const SOURCE_A: &str = "A";
/// Source label of the `B` input of a `BᵗA` product.
pub const SOURCE_B: &str = "B";

fn emit_matrix(matrix: &Array2<f64>, out: &mut dyn Emitter) {
    for (i, row) in matrix.rows().into_iter().enumerate() {
        let values: Vec<f64> = row.iter().copied().collect();
        out.emit(Namespace::Output, RowKey::Index(i as u64), &values);
    }
}

// ========================================================================================
//                                 Right multiplication
// ========================================================================================

/// How the right factor of a tall-and-skinny product is obtained from side files.
#[derive(Debug, Clone)]
pub enum RightFactor {
    /// `A · M`.
    Matrix { path: PathBuf, second: Option<PathBuf> },
    /// `A · M⁺`, optionally followed by `· N⁻¹`.
    Inverse { path: PathBuf, second: Option<PathBuf> },
}

impl RightFactor {
    /// Parses and combines the side files into one small matrix.
    pub fn load(&self) -> Result<Array2<f64>, TsqrError> {
        let (first, second) = match self {
            RightFactor::Matrix { path, second } => (
                parse_matrix_txt(path)?,
                second.as_deref().map(parse_matrix_txt).transpose()?,
            ),
            RightFactor::Inverse { path, second } => {
                let first = kernels::pinv(parse_matrix_txt(path)?.view())?;
                let second = match second {
                    Some(path) => Some(Arc::unwrap_or_clone(load_premultiplier(path)?)),
                    None => None,
                };
                (first, second)
            }
        };
        match second {
            Some(second) if second.nrows() != first.ncols() => Err(TsqrError::DataFormat(
                format!(
                    "cannot chain a {}x{} factor with a {}x{} factor",
                    first.nrows(),
                    first.ncols(),
                    second.nrows(),
                    second.ncols()
                ),
            )),
            Some(second) => Ok(first.dot(&second)),
            None => Ok(first),
        }
    }
}

/// Buffers keyed rows and multiplies each full block by a fixed right factor. The
/// original keys are preserved.
pub struct RightMultiplyTask {
    decoder: RowDecoder,
    factor: Arc<Array2<f64>>,
    blocksize: usize,
    keys: Vec<RowKey>,
    rows: Vec<f64>,
}

impl RightMultiplyTask {
    pub fn new(factor: Arc<Array2<f64>>, blocksize: usize, ncols: Option<usize>) -> Self {
        Self {
            decoder: RowDecoder::new(ncols),
            factor,
            blocksize: blocksize.max(1),
            keys: Vec::new(),
            rows: Vec::new(),
        }
    }

    fn flush(&mut self, out: &mut dyn Emitter) -> Result<(), TsqrError> {
        if self.keys.is_empty() {
            return Ok(());
        }
        let ncols = self.rows.len() / self.keys.len();
        if ncols != self.factor.nrows() {
            return Err(TsqrError::DataFormat(format!(
                "rows have {ncols} columns but the right factor has {} rows",
                self.factor.nrows()
            )));
        }
        let flat = std::mem::take(&mut self.rows);
        let block = Array2::from_shape_vec((self.keys.len(), ncols), flat)
            .map_err(|e| TsqrError::DataFormat(format!("buffered rows are ragged: {e}")))?;
        let product = block.dot(&*self.factor);
        for (key, row) in std::mem::take(&mut self.keys).into_iter().zip(product.rows()) {
            let values: Vec<f64> = row.iter().copied().collect();
            out.emit(Namespace::Output, key, &values);
        }
        out.count("MatMul compressions", 1);
        Ok(())
    }
}

impl Task for RightMultiplyTask {
    fn observe(
        &mut self,
        key: &RowKey,
        payload: &[u8],
        out: &mut dyn Emitter,
    ) -> Result<(), TsqrError> {
        let row = self.decoder.decode(payload)?;
        let ncols = row.len();
        self.keys.push(key.clone());
        self.rows.extend(row);
        out.count("rows processed", 1);
        if self.keys.len() >= self.blocksize.saturating_mul(ncols) {
            self.flush(out)?;
        }
        Ok(())
    }

    fn finalize(mut self: Box<Self>, out: &mut dyn Emitter) -> Result<(), TsqrError> {
        self.flush(out)
    }
}

/// Map-only `A · F` for the right factor described by `factor`. Every map task loads
/// the side files itself.
pub fn run_right_multiply(
    pipeline: &mut Pipeline<'_>,
    input: Vec<Record>,
    factor: RightFactor,
) -> Result<Vec<Record>, TsqrError> {
    let config = pipeline.config().clone();
    let mapper: TaskFactory = Arc::new(move |_: &TaskContext| -> NewTask {
        let matrix = Arc::new(factor.load()?);
        Ok(Box::new(RightMultiplyTask::new(matrix, config.blocksize, config.ncols))
            as Box<dyn Task>)
    });
    let map_tasks = pipeline.config().map_tasks;
    let mut output = pipeline.run_stage(
        &StageSpec::map_only("tsmatmul", mapper),
        split_records(input, map_tasks),
    )?;
    Ok(output.take(Namespace::Output))
}

// ========================================================================================
//                                    Gram products
// ========================================================================================

/// Map side of `AᵗA`: blocked Gram accumulation, one output row per column of `A`.
pub struct GramTask {
    decoder: RowDecoder,
    accumulator: RowAccumulator,
}

impl GramTask {
    pub fn new(
        blocksize: usize,
        ncols: Option<usize>,
        premultiplier: Option<Arc<Array2<f64>>>,
    ) -> Self {
        let mut accumulator = RowAccumulator::new(Reduction::Gram, blocksize, ncols);
        if let Some(premultiplier) = premultiplier {
            accumulator = accumulator.with_premultiplier(premultiplier);
        }
        Self {
            decoder: RowDecoder::new(ncols),
            accumulator,
        }
    }
}

impl Task for GramTask {
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
        let (ata, stats) = self.accumulator.finalize()?;
        out.count("rows processed", stats.rows_observed);
        out.count("AtA compressions", stats.compressions);
        if stats.rows_observed > 0 {
            emit_matrix(&ata, out);
        }
        Ok(())
    }
}

/// Sums every value that arrives under one key. Relies on the shuffle delivering
/// equal keys next to each other.
#[derive(Default)]
pub struct ArraySumTask {
    decoder: RowDecoder,
    current: Option<(RowKey, Vec<f64>)>,
}

impl ArraySumTask {
    fn flush(&mut self, out: &mut dyn Emitter) {
        if let Some((key, sum)) = self.current.take() {
            out.emit(Namespace::Output, key, &sum);
        }
    }
}

impl Task for ArraySumTask {
    fn observe(
        &mut self,
        key: &RowKey,
        payload: &[u8],
        out: &mut dyn Emitter,
    ) -> Result<(), TsqrError> {
        let value = self.decoder.decode(payload)?;
        match &mut self.current {
            Some((current, sum)) if current == key => {
                for (s, v) in sum.iter_mut().zip(value) {
                    *s += v;
                }
            }
            _ => {
                self.flush(out);
                self.current = Some((key.clone(), value));
            }
        }
        Ok(())
    }

    fn finalize(mut self: Box<Self>, out: &mut dyn Emitter) -> Result<(), TsqrError> {
        self.flush(out);
        Ok(())
    }
}

pub fn array_sum_reducer() -> TaskFactory {
    Arc::new(|_: &TaskContext| -> NewTask {
        Ok(Box::new(ArraySumTask::default()) as Box<dyn Task>)
    })
}

/// Gram mapper factory; `premultiplier` names a side file whose inverse multiplies
/// every row first.
pub fn gram_mapper(
    blocksize: usize,
    ncols: Option<usize>,
    premultiplier: Option<PathBuf>,
) -> TaskFactory {
    Arc::new(move |_: &TaskContext| -> NewTask {
        let premult = premultiplier
            .as_deref()
            .map(load_premultiplier)
            .transpose()?;
        Ok(Box::new(GramTask::new(blocksize, ncols, premult)) as Box<dyn Task>)
    })
}

/// `AᵗA` with per-task Gram accumulation and an array-sum reduce.
pub fn run_ata(
    pipeline: &mut Pipeline<'_>,
    input: Vec<Record>,
    premultiplier: Option<&Path>,
) -> Result<Array2<f64>, TsqrError> {
    let config = pipeline.config().clone();
    let stage = StageSpec::map_reduce(
        "ata",
        Some(gram_mapper(
            config.blocksize,
            config.ncols,
            premultiplier.map(Path::to_path_buf),
        )),
        Some(array_sum_reducer()),
        config.reduce_schedule.rounds()[0],
    );
    let output = pipeline.run_stage(&stage, split_records(input, config.map_tasks))?;
    output.matrix(Namespace::Output)
}

// ========================================================================================
//                                        BᵗA
// ========================================================================================

const TAG_A: f64 = 0.0;
const TAG_B: f64 = 1.0;

/// Prefixes every row with a marker for the input it was read from.
struct SourceTagTask {
    tag: f64,
    decoder: RowDecoder,
}

impl Task for SourceTagTask {
    fn observe(
        &mut self,
        key: &RowKey,
        payload: &[u8],
        out: &mut dyn Emitter,
    ) -> Result<(), TsqrError> {
        let mut tagged = vec![self.tag];
        tagged.extend(self.decoder.decode(payload)?);
        out.emit(Namespace::Output, key.clone(), &tagged);
        out.count(if self.tag == TAG_A { "A values" } else { "B values" }, 1);
        Ok(())
    }

    fn finalize(self: Box<Self>, _: &mut dyn Emitter) -> Result<(), TsqrError> {
        Ok(())
    }
}

fn source_tag_mapper() -> TaskFactory {
    Arc::new(|ctx: &TaskContext| -> NewTask {
        let tag = match ctx.source.as_deref() {
            Some(SOURCE_A) => TAG_A,
            Some(SOURCE_B) => TAG_B,
            other => {
                return Err(TsqrError::DataFormat(format!(
                    "do not recognise the source of data: {other:?}"
                )));
            }
        };
        Ok(Box::new(SourceTagTask {
            tag,
            decoder: RowDecoder::new(None),
        }) as Box<dyn Task>)
    })
}

/// One key's rows as they arrive at a cross-product reducer.
struct KeyedPair {
    key: RowKey,
    a: Option<Vec<f64>>,
    b: Option<Vec<f64>>,
}

/// Pairs each key's `A` row with its `B` row and accumulates `bᵗa` block by block.
/// Every key must carry exactly one row of each input.
struct CrossProductTask {
    blocksize: usize,
    decoder: RowDecoder,
    current: Option<KeyedPair>,
    a_width: Option<usize>,
    b_width: Option<usize>,
    a_rows: Vec<Vec<f64>>,
    b_rows: Vec<Vec<f64>>,
    sum: Option<Array2<f64>>,
}

fn stack(rows: Vec<Vec<f64>>, ncols: usize) -> Result<Array2<f64>, TsqrError> {
    let nrows = rows.len();
    Array2::from_shape_vec((nrows, ncols), rows.into_iter().flatten().collect())
        .map_err(|e| TsqrError::DataFormat(format!("differing row lengths: {e}")))
}

/// Fixes the width of one input on its first row and checks every later row.
fn accept_width(width: &mut Option<usize>, row: &[f64], source: &str) -> Result<(), TsqrError> {
    match *width {
        Some(expected) if expected != row.len() => Err(TsqrError::DataFormat(format!(
            "{source} row has {} columns, expected {expected}",
            row.len()
        ))),
        Some(_) => Ok(()),
        None => {
            *width = Some(row.len());
            Ok(())
        }
    }
}

impl CrossProductTask {
    /// Moves the finished key's pair into the block, failing on an unpaired key.
    fn close_key(&mut self, out: &mut dyn Emitter) -> Result<(), TsqrError> {
        let Some(pair) = self.current.take() else {
            return Ok(());
        };
        let (a, b) = match (pair.a, pair.b) {
            (Some(a), Some(b)) => (a, b),
            (Some(_), None) => {
                return Err(TsqrError::DataFormat(format!(
                    "row '{}' of A has no matching row in B",
                    pair.key
                )));
            }
            (None, _) => {
                return Err(TsqrError::DataFormat(format!(
                    "row '{}' of B has no matching row in A",
                    pair.key
                )));
            }
        };
        accept_width(&mut self.a_width, &a, SOURCE_A)?;
        accept_width(&mut self.b_width, &b, SOURCE_B)?;
        self.a_rows.push(a);
        self.b_rows.push(b);
        out.count("rows processed", 1);
        let width = self.a_width.unwrap_or(1).max(self.b_width.unwrap_or(1));
        if self.a_rows.len() > self.blocksize.saturating_mul(width) {
            self.compress(out)?;
        }
        Ok(())
    }

    fn compress(&mut self, out: &mut dyn Emitter) -> Result<(), TsqrError> {
        let (Some(a_width), Some(b_width)) = (self.a_width, self.b_width) else {
            return Ok(());
        };
        if self.a_rows.is_empty() {
            return Ok(());
        }
        let a = stack(std::mem::take(&mut self.a_rows), a_width)?;
        let b = stack(std::mem::take(&mut self.b_rows), b_width)?;
        let update = kernels::cross_product(b.view(), a.view())?;
        self.sum = Some(match self.sum.take() {
            Some(sum) => sum + update,
            None => update,
        });
        out.count("BtA compressions", 1);
        Ok(())
    }
}

impl Task for CrossProductTask {
    fn observe(
        &mut self,
        key: &RowKey,
        payload: &[u8],
        out: &mut dyn Emitter,
    ) -> Result<(), TsqrError> {
        let tagged = self.decoder.decode_any_width(payload)?;
        let (tag, values) = tagged
            .split_first()
            .ok_or_else(|| TsqrError::DataFormat("empty tagged row".to_string()))?;
        if self.current.as_ref().is_some_and(|pair| pair.key != *key) {
            self.close_key(out)?;
        }
        let pair = self.current.get_or_insert_with(|| KeyedPair {
            key: key.clone(),
            a: None,
            b: None,
        });
        let (slot, source) = if *tag == TAG_A {
            (&mut pair.a, SOURCE_A)
        } else if *tag == TAG_B {
            (&mut pair.b, SOURCE_B)
        } else {
            return Err(TsqrError::DataFormat(format!("unknown source tag {tag}")));
        };
        if slot.is_some() {
            return Err(TsqrError::DataFormat(format!(
                "row '{key}' appears more than once in {source}"
            )));
        }
        *slot = Some(values.to_vec());
        Ok(())
    }

    fn finalize(mut self: Box<Self>, out: &mut dyn Emitter) -> Result<(), TsqrError> {
        self.close_key(out)?;
        self.compress(out)?;
        if let Some(sum) = &self.sum {
            emit_matrix(sum, out);
        }
        Ok(())
    }
}

/// `BᵗA` for two matrices whose rows share keys: a tagging map with cross-product
/// reducers that pair rows by key, then an array-sum round that merges the reducers'
/// partial products.
pub fn run_bta(
    pipeline: &mut Pipeline<'_>,
    a: Vec<Record>,
    b: Vec<Record>,
) -> Result<Array2<f64>, TsqrError> {
    let config = pipeline.config().clone();
    let mut splits: Vec<InputSplit> = split_records(a, config.map_tasks)
        .into_iter()
        .map(|split| split.with_source(SOURCE_A))
        .collect();
    splits.extend(
        split_records(b, config.map_tasks)
            .into_iter()
            .map(|split| split.with_source(SOURCE_B)),
    );
    let blocksize = config.blocksize;
    let reducer: TaskFactory = Arc::new(move |_: &TaskContext| -> NewTask {
        Ok(Box::new(CrossProductTask {
            blocksize,
            decoder: RowDecoder::new(None),
            current: None,
            a_width: None,
            b_width: None,
            a_rows: Vec::new(),
            b_rows: Vec::new(),
            sum: None,
        }) as Box<dyn Task>)
    });
    let first = StageSpec::map_reduce(
        "bta",
        Some(source_tag_mapper()),
        Some(reducer),
        config.reduce_schedule.rounds()[0],
    );
    let mut partial = pipeline.run_stage(&first, splits)?;
    let records = partial.take(Namespace::Output);
    debug!("{} partial BtA row(s)", records.len());
    let merge = StageSpec::map_reduce("bta sum", None, Some(array_sum_reducer()), 1);
    let output = pipeline.run_stage(&merge, split_records(records, config.map_tasks))?;
    matrix_sorted_by_key(output.records(Namespace::Output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::write_matrix_txt;
    use crate::config::TsqrConfig;
    use crate::runner::{LocalJobRunner, records_from_matrix};
    use crate::storage::Workspace;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_matrix(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0))
    }

    fn pipeline<'a>(dir: &Path, runner: &'a LocalJobRunner) -> Pipeline<'a> {
        let config = TsqrConfig {
            blocksize: 2,
            map_tasks: 3,
            reduce_schedule: "2".parse().unwrap(),
            ..TsqrConfig::default()
        };
        Pipeline::new(runner, Workspace::new(dir.join("products")), config)
    }

    #[test]
    fn matmul_preserves_keys() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalJobRunner;
        let a = random_matrix(40, 3, 4);
        let m = array![[1.0, 0.0], [2.0, 1.0], [0.0, -1.0]];
        let mpath = dir.path().join("m.txt");
        write_matrix_txt(&mpath, &m).unwrap();
        let mut pipeline = pipeline(dir.path(), &runner);
        let records = run_right_multiply(
            &mut pipeline,
            records_from_matrix(&a),
            RightFactor::Matrix {
                path: mpath,
                second: None,
            },
        )
        .unwrap();
        assert_eq!(records.len(), 40);
        let product = matrix_sorted_by_key(&records).unwrap();
        assert_abs_diff_eq!(product, a.dot(&m), epsilon = 1e-12);
    }

    #[test]
    fn arinv_multiplies_by_the_inverse() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalJobRunner;
        let a = random_matrix(30, 3, 5);
        let r = kernels::qr_r(a.view());
        let rpath = dir.path().join("r.txt");
        write_matrix_txt(&rpath, &r).unwrap();
        let mut pipeline = pipeline(dir.path(), &runner);
        let records = run_right_multiply(
            &mut pipeline,
            records_from_matrix(&a),
            RightFactor::Inverse {
                path: rpath,
                second: None,
            },
        )
        .unwrap();
        let q = matrix_sorted_by_key(&records).unwrap();
        assert_abs_diff_eq!(q.t().dot(&q), Array2::eye(3), epsilon = 1e-10);
    }

    #[test]
    fn ata_and_bta_match_dense_products() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalJobRunner;
        let a = random_matrix(50, 4, 6);
        let b = random_matrix(50, 2, 7);
        let mut pipeline = pipeline(dir.path(), &runner);
        let ata = run_ata(&mut pipeline, records_from_matrix(&a), None).unwrap();
        assert_abs_diff_eq!(ata, a.t().dot(&a), epsilon = 1e-10);
        let bta = run_bta(&mut pipeline, records_from_matrix(&a), records_from_matrix(&b))
            .unwrap();
        assert_abs_diff_eq!(bta, b.t().dot(&a), epsilon = 1e-10);
    }

    fn keyed_records(a: &Array2<f64>, keys: &[u64]) -> Vec<Record> {
        a.rows()
            .into_iter()
            .zip(keys)
            .map(|(row, &k)| {
                let values: Vec<f64> = row.iter().copied().collect();
                Record::new(RowKey::Index(k), crate::codec::encode_packed(&values))
            })
            .collect()
    }

    #[test]
    fn bta_pairs_rows_by_key_not_by_arrival() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalJobRunner;
        let a = random_matrix(3, 2, 10);
        let b = random_matrix(3, 2, 11);
        let mut pipeline = pipeline(dir.path(), &runner);
        let result = run_bta(
            &mut pipeline,
            keyed_records(&a, &[0, 1, 3]),
            keyed_records(&b, &[0, 1, 2]),
        );
        assert!(matches!(result, Err(TsqrError::DataFormat(_))));

        // Same key sets in a different order pair correctly.
        let shuffled = keyed_records(&b, &[2, 0, 1]);
        let expected = array![[0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]].dot(&b);
        let bta = run_bta(&mut pipeline, keyed_records(&a, &[0, 1, 2]), shuffled).unwrap();
        assert_abs_diff_eq!(bta, expected.t().dot(&a), epsilon = 1e-12);
    }

    #[test]
    fn bta_rejects_duplicate_keys() {
        let mut task = CrossProductTask {
            blocksize: 3,
            decoder: RowDecoder::new(None),
            current: None,
            a_width: None,
            b_width: None,
            a_rows: Vec::new(),
            b_rows: Vec::new(),
            sum: None,
        };
        let mut sink = crate::runner::TaskOutput::default();
        let row = crate::codec::encode_packed(&[TAG_A, 1.0, 2.0]);
        task.observe(&RowKey::Index(0), &row, &mut sink).unwrap();
        assert!(matches!(
            task.observe(&RowKey::Index(0), &row, &mut sink),
            Err(TsqrError::DataFormat(_))
        ));
    }

    #[test]
    fn bta_rejects_unpaired_rows() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalJobRunner;
        let a = random_matrix(6, 2, 8);
        let b = random_matrix(5, 2, 9);
        let mut pipeline = pipeline(dir.path(), &runner);
        let result = run_bta(&mut pipeline, records_from_matrix(&a), records_from_matrix(&b));
        assert!(matches!(result, Err(TsqrError::DataFormat(_))));
    }
}
