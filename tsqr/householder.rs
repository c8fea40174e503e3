//! Householder QR with one distributed round per column.
//!
//! Round `i` runs four stages over the working matrix:
//!
//! 1. map-only: apply reflection `i - 1` to columns `i..` using the `w` vector from
//!    the previous round, emit the matrix (`A_matrix`) and the column `i` entries of
//!    every row not yet picked as a pivot (`KV_output`);
//! 2. one reducer: pick the pivot row (largest magnitude, first key on ties) and
//!    compute `alpha`, `tau` and `sigma` for the reflection;
//! 3. map-only: write `beta` into the pivot row, store the reflection vector in column
//!    `i` of the other active rows and emit per-task partial sums of `vᵗ A[:, k]`;
//! 4. array-sum reducer: `w_k = vᵗ A[:, k]` for every `k > i`.
//!
//! The scalars and the picked set are threaded between rounds through a TOML side
//! file, `w` through a keyed side file. `Q` is rebuilt on request by a backward pass
//! that applies the stored reflectors to the pivot columns of the identity.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::codec::{RowDecoder, parse_keyed_rows_txt, write_keyed_rows_txt};
use crate::error::TsqrError;
use crate::pipeline::Pipeline;
use crate::products::array_sum_reducer;
use crate::runner::{
    Emitter, NewTask, StageSpec, Task, TaskContext, TaskFactory, matrix_sorted_by_key,
    split_records,
};
use crate::types::{Namespace, Record, RowKey};

/// A column norm at or below this fraction of the largest norm seen so far is treated
/// as zero.
pub const ZERO_NORM_TOLERANCE: f64 = 1.0e-12;

/// Everything a round needs to know about the reflections computed so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HouseholderState {
    /// Pivot row keys in the order they were picked.
    pub picked: Vec<String>,
    /// `beta` of every reflection: the diagonal of `R` before sign normalization.
    pub alpha: Vec<f64>,
    pub tau: Vec<f64>,
    pub sigma: Vec<f64>,
    /// Largest column norm met so far.
    pub largest_norm: f64,
}

fn parse_key(text: &str) -> RowKey {
    match text.parse::<RowKey>() {
        Ok(key) => key,
        Err(never) => match never {},
    }
}

impl HouseholderState {
    pub fn load(path: &Path) -> Result<Self, TsqrError> {
        let text = fs::read_to_string(path).map_err(|e| TsqrError::io(path, e))?;
        Ok(toml::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), TsqrError> {
        let text = toml::to_string(self)?;
        fs::write(path, text).map_err(|e| TsqrError::io(path, e))
    }

    pub fn reflections(&self) -> usize {
        self.picked.len()
    }

    /// Pick order of every pivot row.
    fn positions(&self) -> HashMap<RowKey, usize> {
        self.picked
            .iter()
            .enumerate()
            .map(|(i, key)| (parse_key(key), i))
            .collect()
    }
}

/// Reads a keyed side file of `Index(k) -> [value]` rows into a dense vector.
fn load_indexed_vector(path: &Path, len: usize) -> Result<Vec<f64>, TsqrError> {
    let mut out = vec![0.0; len];
    for (key, values) in parse_keyed_rows_txt(path)? {
        match (key, values.as_slice()) {
            (RowKey::Index(k), [value]) if (k as usize) < len => out[k as usize] += value,
            (key, _) => {
                return Err(TsqrError::DataFormat(format!(
                    "{}: '{key}' is not an entry of a length-{len} vector",
                    path.display()
                )));
            }
        }
    }
    Ok(out)
}

fn check_width(row: &[f64], ncols: usize) -> Result<(), TsqrError> {
    if row.len() != ncols {
        return Err(TsqrError::DataFormat(format!(
            "length of value ({}) did not match number of columns ({ncols})",
            row.len()
        )));
    }
    Ok(())
}

// ========================================================================================
//                              Round stage 1: apply
// ========================================================================================

/// Reflection `step` waiting to be applied to columns `step + 1..`.
struct PendingReflection {
    step: usize,
    tau: f64,
    w: Vec<f64>,
}

impl PendingReflection {
    fn apply(&self, position: Option<usize>, row: &mut [f64]) {
        let c = self.step;
        let scale = match position {
            Some(p) if p == c => self.tau,
            Some(_) => return,
            None => self.tau * row[c],
        };
        for k in c + 1..row.len() {
            row[k] -= scale * self.w[k];
        }
    }
}

struct ApplyTask {
    step: usize,
    ncols: usize,
    batch: usize,
    decoder: RowDecoder,
    positions: HashMap<RowKey, usize>,
    pending: Option<PendingReflection>,
    buffered: Vec<(RowKey, Vec<f64>)>,
}

impl ApplyTask {
    fn flush(&mut self, out: &mut dyn Emitter) {
        for (key, row) in self.buffered.drain(..) {
            if !self.positions.contains_key(&key) {
                out.emit(Namespace::KvOutput, key.clone(), &[row[self.step]]);
            }
            out.emit(Namespace::AMatrix, key, &row);
        }
        out.count("flushes", 1);
    }
}

impl Task for ApplyTask {
    fn observe(
        &mut self,
        key: &RowKey,
        payload: &[u8],
        out: &mut dyn Emitter,
    ) -> Result<(), TsqrError> {
        let mut row = self.decoder.decode(payload)?;
        check_width(&row, self.ncols)?;
        if let Some(pending) = &self.pending {
            pending.apply(self.positions.get(key).copied(), &mut row);
        }
        self.buffered.push((key.clone(), row));
        out.count("rows processed", 1);
        if self.buffered.len() >= self.batch {
            self.flush(out);
        }
        Ok(())
    }

    fn finalize(mut self: Box<Self>, out: &mut dyn Emitter) -> Result<(), TsqrError> {
        if !self.buffered.is_empty() {
            self.flush(out);
        }
        Ok(())
    }
}

// ========================================================================================
//                              Round stage 2: pivot
// ========================================================================================

struct PivotTask {
    decoder: RowDecoder,
    scale: f64,
    pivot: Option<(RowKey, f64)>,
    sum_squares: f64,
}

impl Task for PivotTask {
    fn observe(
        &mut self,
        key: &RowKey,
        payload: &[u8],
        _: &mut dyn Emitter,
    ) -> Result<(), TsqrError> {
        let value = match self.decoder.decode(payload)?.as_slice() {
            [value] => *value,
            other => {
                return Err(TsqrError::DataFormat(format!(
                    "expected one column entry for '{key}', got {}",
                    other.len()
                )));
            }
        };
        self.sum_squares += value * value;
        let better = self
            .pivot
            .as_ref()
            .is_none_or(|(_, best)| value.abs() > best.abs());
        if better {
            self.pivot = Some((key.clone(), value));
        }
        Ok(())
    }

    fn finalize(self: Box<Self>, out: &mut dyn Emitter) -> Result<(), TsqrError> {
        let PivotTask {
            scale,
            pivot,
            sum_squares,
            ..
        } = *self;
        let Some((pivot, alpha)) = pivot else {
            return Ok(());
        };
        let eta = sum_squares.sqrt();
        if !eta.is_finite() || eta == 0.0 || eta <= ZERO_NORM_TOLERANCE * scale {
            return Err(TsqrError::Numerical(format!(
                "column norm {eta:e} at pivot '{pivot}' is numerically zero; the matrix is \
                 rank deficient"
            )));
        }
        let beta = -eta.copysign(alpha);
        let tau = (beta - alpha) / beta;
        let sigma = 1.0 / (alpha - beta);
        out.emit(Namespace::Output, pivot, &[beta, tau, sigma, eta]);
        Ok(())
    }
}

// ========================================================================================
//                             Round stage 3: reflect
// ========================================================================================

struct ReflectTask {
    step: usize,
    ncols: usize,
    decoder: RowDecoder,
    positions: HashMap<RowKey, usize>,
    beta: f64,
    sigma: f64,
    partial: Vec<f64>,
    seen: bool,
}

impl Task for ReflectTask {
    fn observe(
        &mut self,
        key: &RowKey,
        payload: &[u8],
        out: &mut dyn Emitter,
    ) -> Result<(), TsqrError> {
        let mut row = self.decoder.decode(payload)?;
        check_width(&row, self.ncols)?;
        let i = self.step;
        let v = match self.positions.get(key) {
            Some(&p) if p == i => {
                row[i] = self.beta;
                Some(1.0)
            }
            Some(_) => None,
            None => {
                row[i] *= self.sigma;
                Some(row[i])
            }
        };
        if let Some(v) = v {
            for k in i + 1..self.ncols {
                self.partial[k] += v * row[k];
            }
        }
        self.seen = true;
        out.emit(Namespace::AMatrix, key.clone(), &row);
        Ok(())
    }

    fn finalize(self: Box<Self>, out: &mut dyn Emitter) -> Result<(), TsqrError> {
        if !self.seen {
            return Ok(());
        }
        for k in self.step + 1..self.ncols {
            out.emit(
                Namespace::KvOutput,
                RowKey::Index(k as u64),
                &[self.partial[k]],
            );
        }
        Ok(())
    }
}

// ========================================================================================
//                                 R extraction
// ========================================================================================

struct ExtractRTask {
    decoder: RowDecoder,
    positions: HashMap<RowKey, usize>,
    signs: Vec<f64>,
}

impl Task for ExtractRTask {
    fn observe(
        &mut self,
        key: &RowKey,
        payload: &[u8],
        out: &mut dyn Emitter,
    ) -> Result<(), TsqrError> {
        let Some(&c) = self.positions.get(key) else {
            return Ok(());
        };
        let mut row = self.decoder.decode(payload)?;
        for (k, value) in row.iter_mut().enumerate() {
            *value = if k < c { 0.0 } else { *value * self.signs[c] };
        }
        out.emit(Namespace::RFinal, RowKey::Index(c as u64), &row);
        Ok(())
    }

    fn finalize(self: Box<Self>, _: &mut dyn Emitter) -> Result<(), TsqrError> {
        Ok(())
    }
}

// ========================================================================================
//                              Q backward pass
// ========================================================================================

/// Entry `j` of reflection vector `step`, read from the stored working matrix row.
fn reflector_entry(step: usize, position: Option<usize>, a_row: &[f64]) -> f64 {
    match position {
        Some(p) if p == step => 1.0,
        Some(p) if p < step => 0.0,
        _ => a_row[step],
    }
}

/// Rows carry the final working matrix row followed by the row of the `Q` being
/// built. Applies the pending reflector, then either projects onto the next one or,
/// in the last stage, emits the finished `Q` row.
struct QPassTask {
    ncols: usize,
    reflections: usize,
    initial: bool,
    decoder: RowDecoder,
    positions: HashMap<RowKey, usize>,
    taus: Vec<f64>,
    pending: Option<(usize, Vec<f64>)>,
    project: Option<usize>,
    signs: Vec<f64>,
    partial: Vec<f64>,
    seen: bool,
}

impl Task for QPassTask {
    fn observe(
        &mut self,
        key: &RowKey,
        payload: &[u8],
        out: &mut dyn Emitter,
    ) -> Result<(), TsqrError> {
        let values = self.decoder.decode(payload)?;
        let position = self.positions.get(key).copied();
        let (a_row, mut x) = if self.initial {
            check_width(&values, self.ncols)?;
            let mut x = vec![0.0; self.reflections];
            if let Some(c) = position {
                x[c] = 1.0;
            }
            (values, x)
        } else {
            check_width(&values, self.ncols + self.reflections)?;
            let mut a_row = values;
            let x = a_row.split_off(self.ncols);
            (a_row, x)
        };

        if let Some((step, z)) = &self.pending {
            let scale = self.taus[*step] * reflector_entry(*step, position, &a_row);
            if scale != 0.0 {
                for (xc, zc) in x.iter_mut().zip(z) {
                    *xc -= scale * zc;
                }
            }
        }
        self.seen = true;

        match self.project {
            Some(step) => {
                let v = reflector_entry(step, position, &a_row);
                for (p, xc) in self.partial.iter_mut().zip(&x) {
                    *p += v * xc;
                }
                let mut combined = a_row;
                combined.extend_from_slice(&x);
                out.emit(Namespace::AMatrix, key.clone(), &combined);
            }
            None => {
                for (xc, sign) in x.iter_mut().zip(&self.signs) {
                    *xc *= sign;
                }
                out.emit(Namespace::Output, key.clone(), &x);
            }
        }
        Ok(())
    }

    fn finalize(self: Box<Self>, out: &mut dyn Emitter) -> Result<(), TsqrError> {
        if self.project.is_none() || !self.seen {
            return Ok(());
        }
        for (c, value) in self.partial.iter().enumerate() {
            out.emit(Namespace::KvOutput, RowKey::Index(c as u64), &[*value]);
        }
        Ok(())
    }
}

// ========================================================================================
//                                       Driver
// ========================================================================================

#[derive(Debug, Clone)]
pub struct HouseholderOutput {
    /// `min(m, n) x n`, non-negative diagonal.
    pub r: Array2<f64>,
    /// Rows of the thin `Q` under their input keys, when requested.
    pub q: Option<Vec<Record>>,
    pub state: HouseholderState,
}

impl HouseholderOutput {
    pub fn q_matrix(&self) -> Result<Option<Array2<f64>>, TsqrError> {
        self.q
            .as_deref()
            .map(matrix_sorted_by_key)
            .transpose()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HouseholderQr {
    compute_q: bool,
}

fn sum_stage(name: String) -> StageSpec {
    StageSpec::map_reduce(name, None, Some(array_sum_reducer()), 1)
}

impl HouseholderQr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also rebuild the thin `Q` with a backward pass over the reflectors.
    pub fn with_q(mut self) -> Self {
        self.compute_q = true;
        self
    }

    pub fn run(
        &self,
        pipeline: &mut Pipeline<'_>,
        input: Vec<Record>,
    ) -> Result<HouseholderOutput, TsqrError> {
        let config = pipeline.config().clone();
        let ncols = match (config.ncols, input.first()) {
            (Some(ncols), _) => ncols,
            (None, Some(first)) => RowDecoder::new(None).decode(&first.payload)?.len(),
            (None, None) => 0,
        };
        let workspace = pipeline.workspace().clone();
        let mut state = HouseholderState::default();
        let mut records = input;
        let mut w_path: Option<PathBuf> = None;

        for step in 0..ncols {
            let info_path = workspace.side_file(&format!("info_{step}.toml"))?;
            state.save(&info_path)?;

            let apply = {
                let info_path = info_path.clone();
                let w_path = w_path.clone();
                let batch = config.householder_batch;
                Arc::new(move |_: &TaskContext| -> NewTask {
                    let state = HouseholderState::load(&info_path)?;
                    let pending = match (&w_path, step.checked_sub(1)) {
                        (Some(path), Some(previous)) => Some(PendingReflection {
                            step: previous,
                            tau: state.tau[previous],
                            w: load_indexed_vector(path, ncols)?,
                        }),
                        _ => None,
                    };
                    Ok(Box::new(ApplyTask {
                        step,
                        ncols,
                        batch,
                        decoder: RowDecoder::new(Some(ncols)),
                        positions: state.positions(),
                        pending,
                        buffered: Vec::new(),
                    }) as Box<dyn Task>)
                }) as TaskFactory
            };
            let mut applied = pipeline.run_stage(
                &StageSpec::map_only(format!("householder step {step} apply"), apply),
                split_records(records, config.map_tasks),
            )?;
            records = applied.take(Namespace::AMatrix);
            let column = applied.take(Namespace::KvOutput);
            if column.is_empty() {
                debug!("no active rows left at column {step}");
                break;
            }

            let scale = state.largest_norm;
            let pivot: TaskFactory = Arc::new(move |_: &TaskContext| -> NewTask {
                Ok(Box::new(PivotTask {
                    decoder: RowDecoder::new(Some(1)),
                    scale,
                    pivot: None,
                    sum_squares: 0.0,
                }) as Box<dyn Task>)
            });
            let chosen = pipeline.run_stage(
                &StageSpec::map_reduce(format!("householder step {step} pivot"), None, Some(pivot), 1),
                split_records(column, config.map_tasks),
            )?;
            let (pivot_key, scalars) = chosen
                .rows(Namespace::Output)?
                .into_iter()
                .next()
                .ok_or_else(|| TsqrError::Numerical(format!("no pivot chosen for column {step}")))?;
            let [beta, tau, sigma, eta] = scalars.as_slice() else {
                return Err(TsqrError::DataFormat(
                    "pivot record does not hold four scalars".to_string(),
                ));
            };
            state.picked.push(pivot_key.to_string());
            state.alpha.push(*beta);
            state.tau.push(*tau);
            state.sigma.push(*sigma);
            state.largest_norm = state.largest_norm.max(*eta);
            state.save(&info_path)?;
            debug!("column {step}: pivot '{pivot_key}', beta {beta:e}, tau {tau:e}");

            let reflect = {
                let info_path = info_path.clone();
                Arc::new(move |_: &TaskContext| -> NewTask {
                    let state = HouseholderState::load(&info_path)?;
                    Ok(Box::new(ReflectTask {
                        step,
                        ncols,
                        decoder: RowDecoder::new(Some(ncols)),
                        positions: state.positions(),
                        beta: state.alpha[step],
                        sigma: state.sigma[step],
                        partial: vec![0.0; ncols],
                        seen: false,
                    }) as Box<dyn Task>)
                }) as TaskFactory
            };
            let mut reflected = pipeline.run_stage(
                &StageSpec::map_only(format!("householder step {step} reflect"), reflect),
                split_records(records, config.map_tasks),
            )?;
            records = reflected.take(Namespace::AMatrix);

            if step + 1 < ncols {
                let summed = pipeline.run_stage(
                    &sum_stage(format!("householder step {step} w")),
                    split_records(reflected.take(Namespace::KvOutput), config.map_tasks),
                )?;
                let path = workspace.side_file(&format!("w_{step}.txt"))?;
                write_keyed_rows_txt(&path, &summed.rows(Namespace::Output)?)?;
                w_path = Some(path);
            }
        }

        let info_path = workspace.side_file("info_final.toml")?;
        state.save(&info_path)?;
        let signs: Vec<f64> = state
            .alpha
            .iter()
            .map(|beta| if *beta < 0.0 { -1.0 } else { 1.0 })
            .collect();

        let extract = {
            let positions = state.positions();
            let signs = signs.clone();
            Arc::new(move |_: &TaskContext| -> NewTask {
                Ok(Box::new(ExtractRTask {
                    decoder: RowDecoder::new(Some(ncols)),
                    positions: positions.clone(),
                    signs: signs.clone(),
                }) as Box<dyn Task>)
            }) as TaskFactory
        };
        let extracted = pipeline.run_stage(
            &StageSpec::map_only("householder R", extract),
            split_records(records.clone(), config.map_tasks),
        )?;
        let mut r = extracted.matrix(Namespace::RFinal)?;
        if r.nrows() == 0 {
            r = Array2::zeros((0, ncols));
        }
        info!(
            "householder QR finished after {} reflection(s)",
            state.reflections()
        );

        let q = if self.compute_q && state.reflections() > 0 {
            Some(self.rebuild_q(pipeline, records, &info_path, ncols, &state, signs)?)
        } else {
            None
        };
        Ok(HouseholderOutput { r, q, state })
    }

    fn rebuild_q(
        &self,
        pipeline: &mut Pipeline<'_>,
        mut records: Vec<Record>,
        info_path: &Path,
        ncols: usize,
        state: &HouseholderState,
        signs: Vec<f64>,
    ) -> Result<Vec<Record>, TsqrError> {
        let map_tasks = pipeline.config().map_tasks;
        let workspace = pipeline.workspace().clone();
        let reflections = state.reflections();
        let factory = |initial: bool,
                       pending: Option<(usize, PathBuf)>,
                       project: Option<usize>|
         -> TaskFactory {
            let info_path = info_path.to_path_buf();
            let signs = signs.clone();
            Arc::new(move |_: &TaskContext| -> NewTask {
                let state = HouseholderState::load(&info_path)?;
                let pending = match &pending {
                    Some((step, path)) => Some((*step, load_indexed_vector(path, reflections)?)),
                    None => None,
                };
                Ok(Box::new(QPassTask {
                    ncols,
                    reflections,
                    initial,
                    decoder: RowDecoder::new(None),
                    positions: state.positions(),
                    taus: state.tau.clone(),
                    pending,
                    project,
                    signs: signs.clone(),
                    partial: vec![0.0; reflections],
                    seen: false,
                }) as Box<dyn Task>)
            })
        };

        let mut pending: Option<(usize, PathBuf)> = None;
        for step in (0..reflections).rev() {
            let mut projected = pipeline.run_stage(
                &StageSpec::map_only(
                    format!("householder Q project {step}"),
                    factory(step + 1 == reflections, pending.take(), Some(step)),
                ),
                split_records(records, map_tasks),
            )?;
            records = projected.take(Namespace::AMatrix);
            let summed = pipeline.run_stage(
                &sum_stage(format!("householder Q sum {step}")),
                split_records(projected.take(Namespace::KvOutput), map_tasks),
            )?;
            let path = workspace.side_file(&format!("z_{step}.txt"))?;
            write_keyed_rows_txt(&path, &summed.rows(Namespace::Output)?)?;
            pending = Some((step, path));
        }
        let mut finished = pipeline.run_stage(
            &StageSpec::map_only("householder Q", factory(false, pending, None)),
            split_records(records, map_tasks),
        )?;
        Ok(finished.take(Namespace::Output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_packed;
    use crate::config::TsqrConfig;
    use crate::kernels;
    use crate::runner::{LocalJobRunner, decode_records, records_from_matrix};
    use crate::storage::Workspace;
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_matrix(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0))
    }

    fn config() -> TsqrConfig {
        TsqrConfig {
            map_tasks: 3,
            householder_batch: 4,
            ..TsqrConfig::default()
        }
    }

    #[test]
    fn r_matches_local_qr() {
        let dir = tempfile::tempdir().unwrap();
        let a = random_matrix(40, 4, 41);
        let mut pipeline =
            Pipeline::new(&LocalJobRunner, Workspace::new(dir.path().join("h")), config());
        let output = HouseholderQr::new()
            .run(&mut pipeline, records_from_matrix(&a))
            .unwrap();
        assert_eq!(output.state.reflections(), 4);
        assert_abs_diff_eq!(output.r, kernels::qr_r(a.view()), epsilon = 1e-10);
    }

    #[test]
    fn backward_pass_rebuilds_orthonormal_q() {
        let dir = tempfile::tempdir().unwrap();
        let a = random_matrix(25, 3, 42);
        let mut pipeline =
            Pipeline::new(&LocalJobRunner, Workspace::new(dir.path().join("q")), config());
        let output = HouseholderQr::new()
            .with_q()
            .run(&mut pipeline, records_from_matrix(&a))
            .unwrap();
        let q = output.q_matrix().unwrap().unwrap();
        assert_eq!(q.dim(), (25, 3));
        assert_abs_diff_eq!(q.t().dot(&q), Array2::eye(3), epsilon = 1e-10);
        assert_abs_diff_eq!(q.dot(&output.r), a, epsilon = 1e-10);
    }

    #[test]
    fn digit_string_labels_are_tracked_as_pivots() {
        let dir = tempfile::tempdir().unwrap();
        let a = random_matrix(30, 3, 44);
        let records: Vec<Record> = a
            .rows()
            .into_iter()
            .enumerate()
            .map(|(i, row)| {
                let values: Vec<f64> = row.to_vec();
                Record::new(RowKey::label(i.to_string()), encode_packed(&values))
            })
            .collect();
        let mut pipeline =
            Pipeline::new(&LocalJobRunner, Workspace::new(dir.path().join("l")), config());
        let output = HouseholderQr::new()
            .with_q()
            .run(&mut pipeline, records)
            .unwrap();
        assert_eq!(output.state.reflections(), 3);
        assert_abs_diff_eq!(output.r, kernels::qr_r(a.view()), epsilon = 1e-10);

        let q_rows = decode_records(output.q.as_deref().unwrap()).unwrap();
        assert_eq!(q_rows.len(), 30);
        for (key, row) in q_rows {
            let RowKey::Label(text) = key else {
                panic!("Q row lost its label key: {key}");
            };
            let i: usize = text.parse().unwrap();
            let rebuilt = Array1::from(row).dot(&output.r);
            assert_abs_diff_eq!(rebuilt, a.row(i).to_owned(), epsilon = 1e-10);
        }
    }

    #[test]
    fn zero_column_is_a_numerical_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = random_matrix(10, 3, 43);
        a.column_mut(1).fill(0.0);
        let mut pipeline =
            Pipeline::new(&LocalJobRunner, Workspace::new(dir.path().join("z")), config());
        let result = HouseholderQr::new().run(&mut pipeline, records_from_matrix(&a));
        assert!(matches!(result, Err(TsqrError::Numerical(_))));
    }

    #[test]
    fn state_survives_the_side_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("info.toml");
        let state = HouseholderState {
            picked: vec!["3".to_string(), "0".to_string()],
            alpha: vec![-2.0, 1.5],
            tau: vec![1.2, 1.9],
            sigma: vec![0.25, -0.5],
            largest_norm: 2.0,
        };
        state.save(&path).unwrap();
        assert_eq!(HouseholderState::load(&path).unwrap(), state);
        let positions = state.positions();
        assert_eq!(positions.get(&RowKey::Index(0)), Some(&1));
    }
}
