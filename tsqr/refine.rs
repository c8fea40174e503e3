//! Explicit `Q` through `A · R⁻¹`, with one step of iterative refinement.
//!
//! `Q = A R⁻¹` loses orthogonality as `cond(A)` grows. Refining once with a second
//! factorization of the computed `Q` recovers it for all but numerically singular
//! inputs. The pre-conditioned variant replaces the first full pass with a QR of a
//! row sample and folds its inverse into the second pass as a premultiplier.

use log::info;
use ndarray::Array2;

use crate::codec::write_matrix_txt;
use crate::error::TsqrError;
use crate::kernels;
use crate::pipeline::Pipeline;
use crate::products::{RightFactor, run_right_multiply};
use crate::runner::{decode_records, matrix_sorted_by_key};
use crate::serial::{SerialFinish, SerialTsqr};
use crate::types::Record;

#[derive(Debug, Clone)]
pub struct RefinedQr {
    /// Rows of `Q` under the keys of the corresponding input rows.
    pub q: Vec<Record>,
    pub r: Array2<f64>,
}

impl RefinedQr {
    pub fn q_matrix(&self) -> Result<Array2<f64>, TsqrError> {
        matrix_sorted_by_key(&self.q)
    }
}

fn serial_r(pipeline: &mut Pipeline<'_>, input: Vec<Record>) -> Result<Array2<f64>, TsqrError> {
    let config = pipeline.config();
    SerialTsqr::new(config.blocksize, config.ncols, SerialFinish::Plain).run(pipeline, input)
}

/// `R1 = tsqr(A)`, `Q1 = A R1⁻¹`, `R2 = tsqr(Q1)`, `Q = Q1 R2⁻¹`, `R = R2 R1`.
pub fn tsqr_ir(pipeline: &mut Pipeline<'_>, input: Vec<Record>) -> Result<RefinedQr, TsqrError> {
    let workspace = pipeline.workspace().clone();

    let r1 = serial_r(pipeline, input.clone())?;
    let r1_path = workspace.side_file("ir_r1.txt")?;
    write_matrix_txt(&r1_path, &r1)?;
    let q1 = run_right_multiply(
        pipeline,
        input,
        RightFactor::Inverse {
            path: r1_path,
            second: None,
        },
    )?;

    let r2 = serial_r(pipeline, q1.clone())?;
    let r2_path = workspace.side_file("ir_r2.txt")?;
    write_matrix_txt(&r2_path, &r2)?;
    let q = run_right_multiply(
        pipeline,
        q1,
        RightFactor::Inverse {
            path: r2_path,
            second: None,
        },
    )?;

    info!("iterative refinement finished after {} stage(s)", pipeline.stages_run());
    Ok(RefinedQr { q, r: r2.dot(&r1) })
}

/// `R1` from a QR of the first `blocksize * ncols` rows, `R2 = tsqr(A R1⁻¹)` with
/// `R1⁻¹` applied inside the map tasks, `Q = A R1⁻¹ R2⁻¹`, `R = R2 R1`.
pub fn tsqr_pir(pipeline: &mut Pipeline<'_>, input: Vec<Record>) -> Result<RefinedQr, TsqrError> {
    let config = pipeline.config().clone();
    let workspace = pipeline.workspace().clone();

    let first = decode_records(&input[..input.len().min(1)])?;
    let Some((_, row)) = first.first() else {
        return Err(TsqrError::DataFormat("cannot refine an empty matrix".to_string()));
    };
    let ncols = config.ncols.unwrap_or(row.len());
    let sample_rows = config.block_rows(ncols).max(ncols).min(input.len());
    let sample = matrix_sorted_by_key(&input[..sample_rows])?;
    if sample.nrows() < ncols {
        return Err(TsqrError::Numerical(format!(
            "a {}x{} sample cannot precondition {ncols} columns",
            sample.nrows(),
            sample.ncols()
        )));
    }
    let r1 = kernels::qr_r(sample.view());
    let r1_path = workspace.side_file("pir_r1.txt")?;
    write_matrix_txt(&r1_path, &r1)?;

    let r2 = SerialTsqr::new(config.blocksize, config.ncols, SerialFinish::Plain)
        .with_premultiplier(&r1_path)
        .run(pipeline, input.clone())?;
    let r2_path = workspace.side_file("pir_r2.txt")?;
    write_matrix_txt(&r2_path, &r2)?;

    let q = run_right_multiply(
        pipeline,
        input,
        RightFactor::Inverse {
            path: r1_path,
            second: Some(r2_path),
        },
    )?;
    info!(
        "pre-conditioned refinement finished after {} stage(s)",
        pipeline.stages_run()
    );
    Ok(RefinedQr { q, r: r2.dot(&r1) })
}
