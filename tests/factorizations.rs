use std::collections::BTreeSet;
use std::fs;

use approx::assert_abs_diff_eq;
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::{TempDir, tempdir};

use mrtsqr::cholesky::run_cholesky_qr;
use mrtsqr::codec::{encode_packed, encode_text};
use mrtsqr::config::{DirectSchedule, TsqrConfig};
use mrtsqr::direct::DirectTsqr;
use mrtsqr::error::TsqrError;
use mrtsqr::householder::HouseholderQr;
use mrtsqr::kernels::{self, frobenius_norm};
use mrtsqr::pipeline::Pipeline;
use mrtsqr::products::run_bta;
use mrtsqr::refine::tsqr_ir;
use mrtsqr::runner::{LocalJobRunner, decode_records, records_from_matrix};
use mrtsqr::serial::{SerialFinish, run_serial_tsqr};
use mrtsqr::storage::{Workspace, read_text_matrix_records};
use mrtsqr::types::{Record, RowKey};

fn random_matrix(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0))
}

fn pipeline(dir: &TempDir, name: &str, config: TsqrConfig) -> Pipeline<'static> {
    Pipeline::new(&LocalJobRunner, Workspace::new(dir.path().join(name)), config)
}

fn relative_residual(a: &Array2<f64>, q: &Array2<f64>, r: &Array2<f64>) -> f64 {
    frobenius_norm(&(a - &q.dot(r))) / frobenius_norm(a)
}

fn orthogonality_error(q: &Array2<f64>) -> f64 {
    frobenius_norm(&(q.t().dot(q) - Array2::<f64>::eye(q.ncols())))
}

/// Rows compared by absolute value, which removes any per-row sign choice.
fn abs(matrix: &Array2<f64>) -> Array2<f64> {
    matrix.mapv(f64::abs)
}

#[test]
fn twelve_row_rank_one_scenario() {
    let dir = tempdir().unwrap();
    let mut text = String::new();
    for i in 0..12 {
        text.push_str(if i == 5 { "2 2 2\n" } else { "1,1,1\n" });
    }
    let path = dir.path().join("a.txt");
    fs::write(&path, text).unwrap();
    let input = read_text_matrix_records(&path).unwrap();
    assert_eq!(input.len(), 12);

    let config = TsqrConfig {
        blocksize: 2,
        ncols: Some(3),
        ..TsqrConfig::default()
    };
    let mut serial = pipeline(&dir, "serial", config.clone());
    let r = run_serial_tsqr(&mut serial, input.clone(), SerialFinish::Plain).unwrap();
    assert_eq!(r.dim(), (3, 3));
    assert_abs_diff_eq!(r[[0, 0]], 15f64.sqrt(), epsilon = 1e-12);
    for i in 0..3 {
        for j in 0..i {
            assert_eq!(r[[i, j]], 0.0);
        }
    }

    let mut direct = pipeline(&dir, "direct", config);
    let output = DirectTsqr::new().run(&mut direct, input).unwrap();
    let a = Array2::from_shape_fn((12, 3), |(i, _)| if i == 5 { 2.0 } else { 1.0 });
    let q = output.q_matrix().unwrap();
    assert!(relative_residual(&a, &q, &output.r) < 1e-10);
    assert!(orthogonality_error(&q) < 1e-10);
    assert_abs_diff_eq!(abs(&output.r), abs(&r), epsilon = 1e-10);
}

#[test]
fn direct_tsqr_round_trips_and_keeps_every_key() {
    let dir = tempdir().unwrap();
    let a = random_matrix(500, 6, 101);
    let input: Vec<Record> = a
        .axis_iter(Axis(0))
        .enumerate()
        .map(|(i, row)| {
            let values: Vec<f64> = row.to_vec();
            Record::new(RowKey::label(format!("sample-{i:04}")), encode_text(&values))
        })
        .collect();
    let expected_keys: BTreeSet<RowKey> = input.iter().map(|record| record.key.clone()).collect();

    let config = TsqrConfig {
        direct: DirectSchedule {
            stage1_map_tasks: 7,
            stage3_map_tasks: 3,
        },
        ..TsqrConfig::default()
    };
    let mut pipeline = pipeline(&dir, "keys", config);
    let output = DirectTsqr::new().run(&mut pipeline, input).unwrap();
    assert_eq!(pipeline.stages_run(), 3);

    let keys: Vec<RowKey> = output.q.iter().map(|record| record.key.clone()).collect();
    assert_eq!(keys.len(), 500, "duplicate or missing rows");
    assert_eq!(keys.into_iter().collect::<BTreeSet<_>>(), expected_keys);

    // Label keys sort like the row indices they were built from.
    let q = output.q_matrix().unwrap();
    assert!(relative_residual(&a, &q, &output.r) < 1e-10);
    assert!(orthogonality_error(&q) < 1e-10);
}

#[test]
fn partitions_shorter_than_the_row_width_are_handled() {
    let dir = tempdir().unwrap();
    let a = random_matrix(10, 4, 102);
    let config = TsqrConfig {
        direct: DirectSchedule {
            stage1_map_tasks: 5,
            stage3_map_tasks: 5,
        },
        ..TsqrConfig::default()
    };
    let mut pipeline = pipeline(&dir, "short", config);
    let output = DirectTsqr::new()
        .run(&mut pipeline, records_from_matrix(&a))
        .unwrap();
    let q = output.q_matrix().unwrap();
    assert_eq!(q.dim(), (10, 4));
    assert!(relative_residual(&a, &q, &output.r) < 1e-10);
    assert!(orthogonality_error(&q) < 1e-10);
}

#[test]
fn short_last_partition_survives_a_different_stage_three_split() {
    let dir = tempdir().unwrap();
    // 13 rows over 4 tasks leaves a single-row last partition, whose Q1 rows are one
    // column wide. Three stage-3 tasks mix those rows with full-width ones.
    let a = random_matrix(13, 3, 107);
    let config = TsqrConfig {
        direct: DirectSchedule {
            stage1_map_tasks: 4,
            stage3_map_tasks: 3,
        },
        ..TsqrConfig::default()
    };
    let mut pipeline = pipeline(&dir, "mixed", config);
    let output = DirectTsqr::new()
        .run(&mut pipeline, records_from_matrix(&a))
        .unwrap();
    let q = output.q_matrix().unwrap();
    assert_eq!(q.dim(), (13, 3));
    assert!(relative_residual(&a, &q, &output.r) < 1e-10);
    assert!(orthogonality_error(&q) < 1e-10);
}

#[test]
fn bta_handles_inputs_of_different_widths() {
    let dir = tempdir().unwrap();
    let a = random_matrix(80, 5, 108);
    let b = random_matrix(80, 2, 109);
    let config = TsqrConfig {
        blocksize: 2,
        map_tasks: 3,
        reduce_schedule: "3".parse().unwrap(),
        ..TsqrConfig::default()
    };
    let mut pipeline = pipeline(&dir, "bta", config);
    let bta = run_bta(&mut pipeline, records_from_matrix(&a), records_from_matrix(&b)).unwrap();
    assert_eq!(bta.dim(), (2, 5));
    assert_abs_diff_eq!(bta, b.t().dot(&a), epsilon = 1e-10);

    let btb = run_bta(&mut pipeline, records_from_matrix(&b), records_from_matrix(&a)).unwrap();
    assert_abs_diff_eq!(btb, a.t().dot(&b), epsilon = 1e-10);
}

#[test]
fn householder_accepts_label_keys_that_look_like_indices() {
    let dir = tempdir().unwrap();
    let a = random_matrix(40, 4, 110);
    let input: Vec<Record> = a
        .axis_iter(Axis(0))
        .enumerate()
        .map(|(i, row)| {
            let values: Vec<f64> = row.to_vec();
            Record::new(RowKey::label(i.to_string()), encode_packed(&values))
        })
        .collect();
    let config = TsqrConfig {
        ncols: Some(4),
        map_tasks: 3,
        householder_batch: 5,
        ..TsqrConfig::default()
    };
    let mut householder = pipeline(&dir, "labels", config);
    let output = HouseholderQr::new()
        .with_q()
        .run(&mut householder, input)
        .unwrap();
    assert_eq!(output.r.dim(), (4, 4));
    assert_abs_diff_eq!(output.r, kernels::qr_r(a.view()), epsilon = 1e-10);

    let rows = decode_records(output.q.as_deref().unwrap()).unwrap();
    let mut q = Array2::<f64>::zeros((40, 4));
    for (key, row) in rows {
        let RowKey::Label(text) = key else {
            panic!("unexpected key kind {key}");
        };
        let i: usize = text.parse().unwrap();
        q.row_mut(i).assign(&ndarray::Array1::from(row));
    }
    assert!(relative_residual(&a, &q, &output.r) < 1e-10);
    assert!(orthogonality_error(&q) < 1e-10);
}

#[test]
fn cholesky_qr_agrees_with_qr_on_a_well_conditioned_matrix() {
    let dir = tempdir().unwrap();
    let a = random_matrix(1000, 10, 103);
    let config = TsqrConfig {
        ncols: Some(10),
        reduce_schedule: "4".parse().unwrap(),
        map_tasks: 8,
        ..TsqrConfig::default()
    };
    let mut pipeline = pipeline(&dir, "chol", config);
    let r_chol = run_cholesky_qr(&mut pipeline, records_from_matrix(&a), None).unwrap();
    let r_qr = kernels::qr_r(a.view());
    assert!(frobenius_norm(&(abs(&r_chol) - abs(&r_qr))) < 1e-6);
}

#[test]
fn householder_r_agrees_with_serial_tsqr() {
    let dir = tempdir().unwrap();
    let a = random_matrix(60, 5, 104);
    let config = TsqrConfig {
        ncols: Some(5),
        map_tasks: 3,
        householder_batch: 7,
        ..TsqrConfig::default()
    };
    let mut householder = pipeline(&dir, "householder", config.clone());
    let output = HouseholderQr::new()
        .with_q()
        .run(&mut householder, records_from_matrix(&a))
        .unwrap();
    let mut serial = pipeline(&dir, "serial", config);
    let r = run_serial_tsqr(&mut serial, records_from_matrix(&a), SerialFinish::Plain).unwrap();
    assert_abs_diff_eq!(output.r, r, epsilon = 1e-10);

    let q = output.q_matrix().unwrap().unwrap();
    assert!(relative_residual(&a, &q, &output.r) < 1e-10);
}

#[test]
fn recursive_direct_tsqr_matches_the_flat_pipeline() {
    let dir = tempdir().unwrap();
    let a = random_matrix(240, 3, 105);
    let config = TsqrConfig {
        direct: DirectSchedule {
            stage1_map_tasks: 12,
            stage3_map_tasks: 4,
        },
        recursive_map_tasks: 3,
        ..TsqrConfig::default()
    };
    let mut flat = pipeline(&dir, "flat", config.clone());
    let expected = DirectTsqr::new()
        .run(&mut flat, records_from_matrix(&a))
        .unwrap();
    let mut nested = pipeline(&dir, "nested", config);
    let output = DirectTsqr::new()
        .recursive(1)
        .run(&mut nested, records_from_matrix(&a))
        .unwrap();
    assert_abs_diff_eq!(output.r, expected.r, epsilon = 1e-10);
    assert_abs_diff_eq!(
        output.q_matrix().unwrap(),
        expected.q_matrix().unwrap(),
        epsilon = 1e-10
    );
}

#[test]
fn refinement_recovers_orthogonality() {
    let dir = tempdir().unwrap();
    let mut a = random_matrix(200, 4, 106);
    a.column_mut(3).mapv_inplace(|v| v * 1e-7);
    let mut pipeline = pipeline(&dir, "ir", TsqrConfig::default());
    let refined = tsqr_ir(&mut pipeline, records_from_matrix(&a)).unwrap();
    let q = refined.q_matrix().unwrap();
    assert!(orthogonality_error(&q) < 1e-10);
    assert!(relative_residual(&a, &q, &refined.r) < 1e-11);
}

#[test]
fn malformed_row_halts_the_pipeline() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ragged.txt");
    fs::write(&path, "1 2 3\n4 5 6\n7 8\n").unwrap();
    let input = read_text_matrix_records(&path).unwrap();
    let config = TsqrConfig {
        ncols: Some(3),
        ..TsqrConfig::default()
    };
    let mut pipeline = pipeline(&dir, "ragged", config);
    let result = DirectTsqr::new().run(&mut pipeline, input);
    assert!(matches!(result, Err(TsqrError::DataFormat(_))));
    assert_eq!(pipeline.stages_run(), 0);
}
