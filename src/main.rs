// ========================================================================================
//
//                            Command line driver: mrtsqr
//
// ========================================================================================
//
// Parses flags into a `TsqrConfig`, reads the input matrix, runs one algorithm through
// a `Pipeline` on the local job runner and writes the small results as text files
// next to the workspace base. Everything numerical lives in the library.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::info;
use ndarray::{Array1, Array2, Axis};

use mrtsqr::cholesky::run_cholesky_qr;
use mrtsqr::codec::{write_keyed_rows_txt, write_matrix_txt};
use mrtsqr::config::{ReduceSchedule, TsqrConfig};
use mrtsqr::direct::DirectTsqr;
use mrtsqr::error::TsqrError;
use mrtsqr::householder::HouseholderQr;
use mrtsqr::pipeline::Pipeline;
use mrtsqr::products::{RightFactor, run_ata, run_bta, run_right_multiply};
use mrtsqr::progress::{LogPipelineProgress, PipelineObserver, StageSummary};
use mrtsqr::refine::{tsqr_ir, tsqr_pir};
use mrtsqr::runner::{LocalJobRunner, decode_records};
use mrtsqr::serial::{SerialFinish, run_serial_tsqr, run_tssvd};
use mrtsqr::storage::{Workspace, read_text_matrix_records};
use mrtsqr::types::Record;

#[derive(Parser)]
#[command(
    name = "mrtsqr",
    about = "Tall-and-skinny QR and SVD as chained map/reduce stages",
    long_about = "Factors matrices with many more rows than columns by splitting them across \
                  map tasks and reducing the partial factorizations."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct CommonArgs {
    /// Input matrix, one row per line, comma or whitespace separated
    #[arg(long, value_name = "FILE")]
    mat: Option<PathBuf>,

    /// Base path of the per-stage output directories (default: <mat>.out)
    #[arg(long, value_name = "BASE")]
    output: Option<PathBuf>,

    /// TOML configuration file; flags below override its values
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long)]
    ncols: Option<usize>,

    /// Rows buffered before compression are blocksize * ncols
    #[arg(long)]
    blocksize: Option<usize>,

    /// Reducer counts per round, e.g. "40,1"
    #[arg(long, value_name = "LIST")]
    reduce_schedule: Option<ReduceSchedule>,

    #[arg(long)]
    map_tasks: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Serial TSQR: R only (outputs: <base>.R.txt)")]
    Tsqr {
        #[command(flatten)]
        common: CommonArgs,
        /// Replace R by the transposed Cholesky factor of RᵗR
        #[arg(long)]
        cholesky: bool,
    },
    #[command(about = "Singular values through Serial TSQR (outputs: <base>.Sigma.txt)")]
    Tssvd {
        #[command(flatten)]
        common: CommonArgs,
    },
    #[command(about = "Cholesky-QR (outputs: <base>.R.txt)")]
    Chol {
        #[command(flatten)]
        common: CommonArgs,
        /// Multiply every row by the inverse of this matrix first
        #[arg(long, value_name = "FILE")]
        premult: Option<PathBuf>,
    },
    #[command(about = "Direct TSQR with explicit Q (outputs: <base>.R.txt, <base>.Q.txt)")]
    Direct {
        #[command(flatten)]
        common: CommonArgs,
        /// Also compute R = U Σ Vᵗ; Q then holds the left singular vectors
        #[arg(long)]
        svd: bool,
        /// Factor the stacked R blocks with a nested Direct TSQR this many levels deep
        #[arg(long, value_name = "LEVELS", default_value_t = 0)]
        recursive: usize,
    },
    #[command(about = "Householder QR, one round per column (outputs: <base>.R.txt)")]
    Householder {
        #[command(flatten)]
        common: CommonArgs,
        /// Rebuild the thin Q with a backward pass
        #[arg(long)]
        q: bool,
    },
    #[command(about = "A·B for a small side matrix B (outputs: <base>.out.txt)")]
    Matmul {
        #[command(flatten)]
        common: CommonArgs,
        #[arg(long, value_name = "FILE")]
        factor: PathBuf,
    },
    #[command(about = "A·R⁺, optionally followed by ·N⁻¹ (outputs: <base>.out.txt)")]
    Arinv {
        #[command(flatten)]
        common: CommonArgs,
        #[arg(long, value_name = "FILE")]
        factor: PathBuf,
        #[arg(long, value_name = "FILE")]
        second: Option<PathBuf>,
    },
    #[command(about = "AᵗA (outputs: <base>.out.txt)")]
    Ata {
        #[command(flatten)]
        common: CommonArgs,
        #[arg(long, value_name = "FILE")]
        premult: Option<PathBuf>,
    },
    #[command(about = "BᵗA for a second matrix B with the same rows (outputs: <base>.out.txt)")]
    Bta {
        #[command(flatten)]
        common: CommonArgs,
        #[arg(long, value_name = "FILE")]
        other: PathBuf,
    },
    #[command(about = "Q = A R⁻¹ with one refinement step (outputs: <base>.R.txt, <base>.Q.txt)")]
    Ir {
        #[command(flatten)]
        common: CommonArgs,
    },
    #[command(about = "Pre-conditioned refinement from a row sample (outputs: <base>.R.txt, <base>.Q.txt)")]
    Pir {
        #[command(flatten)]
        common: CommonArgs,
    },
}

// ========================================================================================
//                                   Progress display
// ========================================================================================

struct StageProgress {
    bar: ProgressBar,
}

impl StageProgress {
    fn new() -> Self {
        let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr_with_hz(20));
        if let Ok(style) = ProgressStyle::with_template("\n> [{elapsed_precise}] {pos} stage(s) {msg}")
        {
            bar.set_style(style);
        }
        Self { bar }
    }
}

impl PipelineObserver for StageProgress {
    fn on_stage_start(&self, _: usize, name: &str) {
        self.bar.set_message(name.to_string());
    }

    fn on_stage_finish(&self, _: usize, name: &str, summary: &StageSummary) {
        self.bar.inc(1);
        self.bar.set_message(format!("{name}: {summary}"));
    }
}

fn observer() -> Arc<dyn PipelineObserver> {
    if std::io::stderr().is_terminal() {
        Arc::new(StageProgress::new())
    } else {
        Arc::new(LogPipelineProgress)
    }
}

// ========================================================================================
//                                       Helpers
// ========================================================================================

struct Job {
    mat: PathBuf,
    base: PathBuf,
    config: TsqrConfig,
}

impl Job {
    fn from_args(common: &CommonArgs, needs_ncols: bool) -> Result<Self, TsqrError> {
        let mut config = match &common.config {
            Some(path) => TsqrConfig::from_toml_file(path)?,
            None => TsqrConfig::default(),
        };
        if let Some(ncols) = common.ncols {
            config.ncols = Some(ncols);
        }
        if let Some(blocksize) = common.blocksize {
            config.blocksize = blocksize;
        }
        if let Some(schedule) = &common.reduce_schedule {
            config.reduce_schedule = schedule.clone();
        }
        if let Some(map_tasks) = common.map_tasks {
            config.map_tasks = map_tasks;
        }
        config.validate()?;
        if needs_ncols {
            config.require_ncols()?;
        }
        let mat = common
            .mat
            .clone()
            .ok_or_else(|| TsqrError::Configuration("--mat is required".to_string()))?;
        let base = common.output.clone().unwrap_or_else(|| {
            let mut name = mat.clone().into_os_string();
            name.push(".out");
            PathBuf::from(name)
        });
        Ok(Self { mat, base, config })
    }

    fn input(&self) -> Result<Vec<Record>, TsqrError> {
        let records = read_text_matrix_records(&self.mat)?;
        info!("read {} row(s) from {}", records.len(), self.mat.display());
        Ok(records)
    }

    fn result_path(&self, suffix: &str) -> PathBuf {
        let mut name = self.base.clone().into_os_string();
        name.push(format!(".{suffix}.txt"));
        PathBuf::from(name)
    }

    fn write_matrix(&self, suffix: &str, matrix: &Array2<f64>) -> Result<(), TsqrError> {
        let path = self.result_path(suffix);
        write_matrix_txt(&path, matrix)?;
        eprintln!("> Wrote {}x{} matrix to {}", matrix.nrows(), matrix.ncols(), path.display());
        Ok(())
    }

    fn write_vector(&self, suffix: &str, values: &Array1<f64>) -> Result<(), TsqrError> {
        self.write_matrix(suffix, &values.clone().insert_axis(Axis(1)))
    }

    fn write_rows(&self, suffix: &str, records: &[Record]) -> Result<(), TsqrError> {
        let path = self.result_path(suffix);
        let mut rows = decode_records(records)?;
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        write_keyed_rows_txt(&path, &rows)?;
        eprintln!("> Wrote {} keyed row(s) to {}", rows.len(), path.display());
        Ok(())
    }

    fn run<T>(
        &self,
        body: impl FnOnce(&mut Pipeline<'_>, Vec<Record>) -> Result<T, TsqrError>,
    ) -> Result<T, TsqrError> {
        let input = self.input()?;
        let runner = LocalJobRunner;
        let mut pipeline =
            Pipeline::new(&runner, Workspace::new(&self.base), self.config.clone())
                .with_observer(observer());
        let result = body(&mut pipeline, input)?;
        eprintln!("> Finished after {} stage(s)", pipeline.stages_run());
        Ok(result)
    }
}

fn existing(path: &Path) -> Result<PathBuf, TsqrError> {
    if !path.is_file() {
        return Err(TsqrError::Configuration(format!(
            "side file '{}' does not exist",
            path.display()
        )));
    }
    Ok(path.to_path_buf())
}

// ========================================================================================
//                                    Entry point
// ========================================================================================

fn run(command: Commands) -> Result<(), TsqrError> {
    match command {
        Commands::Tsqr { common, cholesky } => {
            let job = Job::from_args(&common, false)?;
            let finish = if cholesky {
                SerialFinish::Cholesky
            } else {
                SerialFinish::Plain
            };
            let r = job.run(|pipeline, input| run_serial_tsqr(pipeline, input, finish))?;
            job.write_matrix("R", &r)
        }
        Commands::Tssvd { common } => {
            let job = Job::from_args(&common, false)?;
            let sigma = job.run(run_tssvd)?;
            job.write_vector("Sigma", &sigma)
        }
        Commands::Chol { common, premult } => {
            let job = Job::from_args(&common, true)?;
            let premult = premult.as_deref().map(existing).transpose()?;
            let r = job.run(|pipeline, input| {
                run_cholesky_qr(pipeline, input, premult.as_deref())
            })?;
            job.write_matrix("R", &r)
        }
        Commands::Direct {
            common,
            svd,
            recursive,
        } => {
            let job = Job::from_args(&common, false)?;
            let mut direct = DirectTsqr::new();
            if svd {
                direct = direct.with_svd();
            }
            if recursive > 0 {
                direct = direct.recursive(recursive);
            }
            let output = job.run(|pipeline, input| direct.run(pipeline, input))?;
            job.write_matrix("R", &output.r)?;
            job.write_rows("Q", &output.q)?;
            if let Some(svd) = &output.svd {
                job.write_matrix("U", &svd.u)?;
                job.write_vector("Sigma", &svd.sigma)?;
                job.write_matrix("Vt", &svd.vt)?;
            }
            Ok(())
        }
        Commands::Householder { common, q } => {
            let job = Job::from_args(&common, true)?;
            let mut householder = HouseholderQr::new();
            if q {
                householder = householder.with_q();
            }
            let output = job.run(|pipeline, input| householder.run(pipeline, input))?;
            job.write_matrix("R", &output.r)?;
            if let Some(q) = &output.q {
                job.write_rows("Q", q)?;
            }
            Ok(())
        }
        Commands::Matmul { common, factor } => {
            let job = Job::from_args(&common, false)?;
            let factor = RightFactor::Matrix {
                path: existing(&factor)?,
                second: None,
            };
            let rows = job.run(|pipeline, input| run_right_multiply(pipeline, input, factor))?;
            job.write_rows("out", &rows)
        }
        Commands::Arinv {
            common,
            factor,
            second,
        } => {
            let job = Job::from_args(&common, false)?;
            let factor = RightFactor::Inverse {
                path: existing(&factor)?,
                second: second.as_deref().map(existing).transpose()?,
            };
            let rows = job.run(|pipeline, input| run_right_multiply(pipeline, input, factor))?;
            job.write_rows("out", &rows)
        }
        Commands::Ata { common, premult } => {
            let job = Job::from_args(&common, true)?;
            let premult = premult.as_deref().map(existing).transpose()?;
            let product = job.run(|pipeline, input| run_ata(pipeline, input, premult.as_deref()))?;
            job.write_matrix("out", &product)
        }
        Commands::Bta { common, other } => {
            let job = Job::from_args(&common, true)?;
            let b = read_text_matrix_records(&existing(&other)?)?;
            let product = job.run(|pipeline, a| run_bta(pipeline, a, b))?;
            job.write_matrix("out", &product)
        }
        Commands::Ir { common } => {
            let job = Job::from_args(&common, false)?;
            let refined = job.run(tsqr_ir)?;
            job.write_matrix("R", &refined.r)?;
            job.write_rows("Q", &refined.q)
        }
        Commands::Pir { common } => {
            let job = Job::from_args(&common, false)?;
            let refined = job.run(tsqr_pir)?;
            job.write_matrix("R", &refined.r)?;
            job.write_rows("Q", &refined.q)
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    if let Err(e) = run(cli.command) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
