use std::fs;
use std::process::Command;

use approx::assert_abs_diff_eq;
use tempfile::tempdir;

use mrtsqr::codec::{parse_keyed_rows_txt, parse_matrix_txt};

fn write_matrix(path: &std::path::Path) {
    let mut text = String::new();
    for i in 0..24 {
        let x = i as f64;
        text.push_str(&format!("{} {} {}\n", 1.0 + x, (x * 0.7).sin(), x * x / 50.0));
    }
    fs::write(path, text).expect("write matrix");
}

#[test]
fn direct_subcommand_writes_r_and_keyed_q() {
    let tmp = tempdir().expect("temporary directory");
    let mat = tmp.path().join("a.txt");
    write_matrix(&mat);
    let base = tmp.path().join("run");

    let status = Command::new(env!("CARGO_BIN_EXE_mrtsqr"))
        .args([
            "direct",
            "--mat",
            mat.to_str().expect("path str"),
            "--output",
            base.to_str().expect("path str"),
            "--blocksize",
            "2",
        ])
        .status()
        .expect("run mrtsqr cli");
    assert!(status.success(), "CLI exited with status {status:?}");

    let r = parse_matrix_txt(&tmp.path().join("run.R.txt")).expect("R file");
    assert_eq!(r.dim(), (3, 3));
    let q = parse_keyed_rows_txt(&tmp.path().join("run.Q.txt")).expect("Q file");
    assert_eq!(q.len(), 24);
    assert!(tmp.path().join("run_0").is_dir(), "stage 1 output missing");
}

#[test]
fn tsqr_subcommand_reads_a_config_file() {
    let tmp = tempdir().expect("temporary directory");
    let mat = tmp.path().join("a.txt");
    write_matrix(&mat);
    let config = tmp.path().join("job.toml");
    fs::write(&config, "blocksize = 1\nreduce_schedule = \"2,1\"\nmap_tasks = 5\n")
        .expect("write config");

    let status = Command::new(env!("CARGO_BIN_EXE_mrtsqr"))
        .args([
            "tsqr",
            "--mat",
            mat.to_str().expect("path str"),
            "--config",
            config.to_str().expect("path str"),
        ])
        .status()
        .expect("run mrtsqr cli");
    assert!(status.success(), "CLI exited with status {status:?}");

    let r = parse_matrix_txt(&tmp.path().join("a.txt.out.R.txt")).expect("R file");
    assert_eq!(r.dim(), (3, 3));
    assert!(r[[0, 0]] > 0.0);
    assert_abs_diff_eq!(r[[1, 0]], 0.0);
}

#[test]
fn missing_required_flags_fail_before_any_stage() {
    let tmp = tempdir().expect("temporary directory");
    let mat = tmp.path().join("a.txt");
    write_matrix(&mat);

    let no_mat = Command::new(env!("CARGO_BIN_EXE_mrtsqr"))
        .current_dir(tmp.path())
        .args(["tsqr"])
        .output()
        .expect("run mrtsqr cli");
    assert!(!no_mat.status.success());
    assert!(String::from_utf8_lossy(&no_mat.stderr).contains("--mat"));

    let no_ncols = Command::new(env!("CARGO_BIN_EXE_mrtsqr"))
        .current_dir(tmp.path())
        .args(["householder", "--mat", mat.to_str().expect("path str")])
        .output()
        .expect("run mrtsqr cli");
    assert!(!no_ncols.status.success());
    assert!(String::from_utf8_lossy(&no_ncols.stderr).contains("ncols"));
    assert!(!tmp.path().join("a.txt.out_0").exists());
}
