use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TsqrError;

pub const DEFAULT_BLOCKSIZE: usize = 3;
pub const DEFAULT_MAP_TASKS: usize = 4;
pub const DEFAULT_HOUSEHOLDER_BATCH: usize = 500;

/// Reducer counts for successive map -> shuffle -> reduce rounds, e.g. `40,1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReduceSchedule(Vec<usize>);

impl ReduceSchedule {
    pub fn single() -> Self {
        Self(vec![1])
    }

    pub fn rounds(&self) -> &[usize] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for ReduceSchedule {
    fn default() -> Self {
        Self::single()
    }
}

impl FromStr for ReduceSchedule {
    type Err = TsqrError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut rounds = Vec::new();
        for part in text.split(',') {
            let trimmed = part.trim();
            let count = trimmed.parse::<usize>().map_err(|_| {
                TsqrError::Configuration(format!(
                    "schedule entry '{trimmed}' in '{text}' is not a positive integer"
                ))
            })?;
            if count == 0 {
                return Err(TsqrError::Configuration(format!(
                    "schedule '{text}' contains a zero entry"
                )));
            }
            rounds.push(count);
        }
        Ok(Self(rounds))
    }
}

impl fmt::Display for ReduceSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|c| c.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

impl Serialize for ReduceSchedule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ReduceSchedule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Map task counts for the first and last Direct TSQR stages. The middle stage always
/// runs one reducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectSchedule {
    pub stage1_map_tasks: usize,
    pub stage3_map_tasks: usize,
}

impl Default for DirectSchedule {
    fn default() -> Self {
        Self {
            stage1_map_tasks: DEFAULT_MAP_TASKS,
            stage3_map_tasks: DEFAULT_MAP_TASKS,
        }
    }
}

/// The immutable job configuration. Built once per pipeline run and handed by
/// reference to every driver and task factory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TsqrConfig {
    /// Rows buffered before compression is `blocksize * ncols`.
    pub blocksize: usize,
    /// Column count; discovered from the first row when absent.
    pub ncols: Option<usize>,
    pub reduce_schedule: ReduceSchedule,
    /// Number of map tasks the input is split across.
    pub map_tasks: usize,
    pub direct: DirectSchedule,
    /// Map tasks used by the nested pipeline of recursive Direct TSQR.
    pub recursive_map_tasks: usize,
    /// Rows a Householder map task buffers before flushing.
    pub householder_batch: usize,
}

impl Default for TsqrConfig {
    fn default() -> Self {
        Self {
            blocksize: DEFAULT_BLOCKSIZE,
            ncols: None,
            reduce_schedule: ReduceSchedule::single(),
            map_tasks: DEFAULT_MAP_TASKS,
            direct: DirectSchedule::default(),
            recursive_map_tasks: DEFAULT_MAP_TASKS,
            householder_batch: DEFAULT_HOUSEHOLDER_BATCH,
        }
    }
}

impl TsqrConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self, TsqrError> {
        let text = fs::read_to_string(path).map_err(|e| TsqrError::io(path, e))?;
        let config: TsqrConfig = toml::from_str(&text).map_err(|e| {
            TsqrError::Configuration(format!("invalid config '{}': {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TsqrError> {
        if self.blocksize == 0 {
            return Err(TsqrError::Configuration(
                "blocksize must be a positive integer".to_string(),
            ));
        }
        if self.ncols == Some(0) {
            return Err(TsqrError::Configuration(
                "ncols must be a positive integer".to_string(),
            ));
        }
        if self.map_tasks == 0
            || self.direct.stage1_map_tasks == 0
            || self.direct.stage3_map_tasks == 0
            || self.recursive_map_tasks == 0
        {
            return Err(TsqrError::Configuration(
                "map task counts must be positive".to_string(),
            ));
        }
        if self.householder_batch == 0 {
            return Err(TsqrError::Configuration(
                "householder_batch must be positive".to_string(),
            ));
        }
        if self.reduce_schedule.is_empty() {
            return Err(TsqrError::Configuration(
                "reduce schedule is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// The column count, or a configuration error for algorithms that need it up front.
    pub fn require_ncols(&self) -> Result<usize, TsqrError> {
        self.ncols.ok_or_else(|| {
            TsqrError::Configuration("ncols must be provided for this algorithm".to_string())
        })
    }

    /// Rows an accumulator may buffer before it compresses.
    pub fn block_rows(&self, ncols: usize) -> usize {
        self.blocksize.saturating_mul(ncols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_parses_and_rejects_bad_entries() {
        let schedule: ReduceSchedule = "40, 1".parse().unwrap();
        assert_eq!(schedule.rounds(), &[40, 1]);
        assert_eq!(schedule.to_string(), "40,1");
        assert!(matches!(
            "4,x".parse::<ReduceSchedule>(),
            Err(TsqrError::Configuration(_))
        ));
        assert!("0".parse::<ReduceSchedule>().is_err());
        assert!("".parse::<ReduceSchedule>().is_err());
    }

    #[test]
    fn toml_config_fills_defaults() {
        let config: TsqrConfig = toml::from_str(
            r#"
            blocksize = 5
            ncols = 10
            reduce_schedule = "8,1"
            "#,
        )
        .unwrap();
        assert_eq!(config.blocksize, 5);
        assert_eq!(config.ncols, Some(10));
        assert_eq!(config.reduce_schedule.rounds(), &[8, 1]);
        assert_eq!(config.map_tasks, DEFAULT_MAP_TASKS);
        config.validate().unwrap();
    }

    #[test]
    fn validation_fails_fast() {
        let config = TsqrConfig {
            blocksize: 0,
            ..TsqrConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TsqrError::Configuration(_))
        ));
        assert!(TsqrConfig::default().require_ncols().is_err());
    }
}
