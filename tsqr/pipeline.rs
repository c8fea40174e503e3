use std::sync::Arc;

use log::info;

use crate::config::TsqrConfig;
use crate::error::TsqrError;
use crate::progress::{NoopPipelineProgress, PipelineObserver, StageSummary};
use crate::runner::{InputSplit, JobRunner, StageOutput, StageSpec};
use crate::storage::Workspace;

/// Driver-side context for chaining stages: the runner that executes them, the
/// workspace they persist to and the configuration every task factory reads.
pub struct Pipeline<'a> {
    runner: &'a dyn JobRunner,
    workspace: Workspace,
    config: TsqrConfig,
    observer: Arc<dyn PipelineObserver>,
    next_stage: usize,
}

impl<'a> Pipeline<'a> {
    pub fn new(runner: &'a dyn JobRunner, workspace: Workspace, config: TsqrConfig) -> Self {
        Self {
            runner,
            workspace,
            config,
            observer: Arc::new(NoopPipelineProgress),
            next_stage: 0,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &TsqrConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Number of stages this pipeline has completed.
    pub fn stages_run(&self) -> usize {
        self.next_stage
    }

    /// A pipeline sharing this one's runner and observer, persisting under a
    /// sub-workspace.
    pub fn nested(&self, suffix: &str, config: TsqrConfig) -> Pipeline<'a> {
        Pipeline {
            runner: self.runner,
            workspace: self.workspace.nested(suffix),
            config,
            observer: Arc::clone(&self.observer),
            next_stage: 0,
        }
    }

    /// Runs one stage to completion and persists its output before returning it.
    pub fn run_stage(
        &mut self,
        stage: &StageSpec,
        input: Vec<InputSplit>,
    ) -> Result<StageOutput, TsqrError> {
        let index = self.next_stage;
        self.observer.on_stage_start(index, &stage.name);
        let records_in: usize = input.iter().map(|split| split.records.len()).sum();
        info!(
            "stage {index} ({}): {records_in} record(s) across {} split(s)",
            stage.name,
            input.len()
        );
        let output = self.runner.run_stage(stage, input)?;
        let dir = self.workspace.persist_stage(index, &output)?;
        let summary = StageSummary {
            records_out: output.namespaces().map(|(_, records)| records.len()).sum(),
            namespaces: output
                .namespaces()
                .map(|(namespace, _)| namespace.to_string())
                .collect(),
        };
        info!("stage {index} ({}) -> {}", stage.name, dir.display());
        self.observer.on_stage_finish(index, &stage.name, &summary);
        self.next_stage += 1;
        Ok(output)
    }
}
