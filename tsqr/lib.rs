//! Tall-and-skinny QR factorizations expressed as chained map/reduce stages.
//!
//! A matrix with many more rows than columns is stored as keyed rows split across map
//! tasks. [`serial`] reduces it to `R` through a tree of local QR factorizations,
//! [`direct`] also recovers an explicit `Q` (and optionally the thin SVD) in three
//! stages, [`cholesky`] and [`householder`] are the classic alternatives and
//! [`refine`] builds `Q = A R⁻¹` with one step of iterative refinement.
//!
//! Every algorithm runs through a [`pipeline::Pipeline`], which executes stages on a
//! [`runner::JobRunner`] and persists each stage's output under a
//! [`storage::Workspace`].

pub mod accumulator;
pub mod cholesky;
pub mod codec;
pub mod config;
pub mod direct;
pub mod error;
pub mod householder;
pub mod kernels;
pub mod pipeline;
pub mod products;
pub mod progress;
pub mod refine;
pub mod runner;
pub mod serial;
pub mod storage;
pub mod types;
