//! Persisted stage layout.
//!
//! Stage `i` of a run rooted at `base` writes each namespace it produced to
//! `<base>_<i>/<namespace>/part-00000`. Side files shipped to a later stage live
//! under `<base>_side/`.

use std::ffi::OsString;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use log::debug;

use crate::codec::write_records;
use crate::error::TsqrError;
use crate::runner::StageOutput;
use crate::types::{Namespace, Record, RowKey};

const PART_FILE: &str = "part-00000";

#[derive(Debug, Clone)]
pub struct Workspace {
    base: PathBuf,
}

impl Workspace {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn suffixed(&self, suffix: &str) -> PathBuf {
        let mut name = OsString::from(self.base.as_os_str());
        name.push("_");
        name.push(suffix);
        PathBuf::from(name)
    }

    pub fn stage_dir(&self, index: usize) -> PathBuf {
        self.suffixed(&index.to_string())
    }

    pub fn namespace_file(&self, index: usize, namespace: Namespace) -> PathBuf {
        self.stage_dir(index)
            .join(namespace.dir_name())
            .join(PART_FILE)
    }

    /// A workspace for a pipeline nested inside this one.
    pub fn nested(&self, suffix: &str) -> Workspace {
        Workspace::new(self.suffixed(suffix))
    }

    /// Path of a side file, creating the side directory on first use.
    pub fn side_file(&self, name: &str) -> Result<PathBuf, TsqrError> {
        let dir = self.suffixed("side");
        fs::create_dir_all(&dir).map_err(|e| TsqrError::io(&dir, e))?;
        Ok(dir.join(name))
    }

    /// Writes a finished stage to disk. An earlier attempt of the same stage is
    /// replaced wholesale.
    pub fn persist_stage(&self, index: usize, output: &StageOutput) -> Result<PathBuf, TsqrError> {
        let dir = self.stage_dir(index);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| TsqrError::io(&dir, e))?;
        }
        for (namespace, records) in output.namespaces() {
            let path = self.namespace_file(index, namespace);
            if let Some(ns_dir) = path.parent() {
                fs::create_dir_all(ns_dir).map_err(|e| TsqrError::io(ns_dir, e))?;
            }
            write_records(&path, records)?;
            debug!("persisted {} record(s) to {}", records.len(), path.display());
        }
        Ok(dir)
    }
}

/// Reads a text matrix, one row per line, keyed by zero-based line number among the
/// non-blank lines. Payloads stay text; decoding happens inside the first stage.
pub fn read_text_matrix_records(path: &Path) -> Result<Vec<Record>, TsqrError> {
    let file = fs::File::open(path).map_err(|e| TsqrError::io(path, e))?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| TsqrError::io(path, e))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let key = RowKey::Index(records.len() as u64);
        records.push(Record::new(key, trimmed.as_bytes().to_vec()));
    }
    Ok(records)
}
