use std::fmt;

use log::info;

/// Summary of one finished stage, handed to observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageSummary {
    pub records_out: usize,
    pub namespaces: Vec<String>,
}

impl fmt::Display for StageSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} record(s) in [{}]",
            self.records_out,
            self.namespaces.join(", ")
        )
    }
}

/// Observer for reporting progress across the stages of a pipeline.
///
/// Observers are shared between nested pipelines, so the methods take `&self`.
pub trait PipelineObserver: Send + Sync {
    fn on_stage_start(&self, index: usize, name: &str) {
        let _ = (index, name);
    }
    fn on_stage_finish(&self, index: usize, name: &str, summary: &StageSummary) {
        let _ = (index, name, summary);
    }
}

#[derive(Default)]
pub struct NoopPipelineProgress;

impl PipelineObserver for NoopPipelineProgress {}

/// Writes one `info` line per finished stage.
#[derive(Default)]
pub struct LogPipelineProgress;

impl PipelineObserver for LogPipelineProgress {
    fn on_stage_finish(&self, index: usize, name: &str, summary: &StageSummary) {
        info!("stage {index} ({name}) finished: {summary}");
    }
}
