// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// Types shared between modules. Types used by a single module live next to it.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// A globally unique label for one task instance. Stage 1 of Direct TSQR uses it to
/// correlate a partition's `Q1` rows with the `Q2` block computed for it in stage 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionId(Uuid);

impl PartitionId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Builds an id from a fixed integer, for deterministic tests.
    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    fn parse(text: &str) -> Option<Self> {
        if text.len() != 32 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Uuid::parse_str(text).ok().map(Self)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// The opaque identity of a row. Keys are carried end-to-end by the pipelines that
/// need row identity (Direct TSQR) and synthesised by the ones that do not.
///
/// The canonical text form is what record files and keyed side files store:
///
/// * `Index(17)` is `17`
/// * `Partition(p)` is the 32 hex digits of `p`
/// * `Tagged(p, k)` is `p/k`
/// * `Label(s)` is `s` between single quotes, so that `Label("7")` never reads back
///   as `Index(7)`
///
/// Parsing is the exact inverse of that form. Any other text reads as a `Label`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RowKey {
    Index(u64),
    Label(String),
    Partition(PartitionId),
    Tagged(PartitionId, Box<RowKey>),
}

impl RowKey {
    pub fn tagged(partition: PartitionId, key: RowKey) -> Self {
        RowKey::Tagged(partition, Box::new(key))
    }

    pub fn label(text: impl Into<String>) -> Self {
        RowKey::Label(text.into())
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowKey::Index(i) => write!(f, "{i}"),
            RowKey::Label(s) => write!(f, "'{s}'"),
            RowKey::Partition(pid) => write!(f, "{pid}"),
            RowKey::Tagged(pid, inner) => write!(f, "{pid}/{inner}"),
        }
    }
}

impl FromStr for RowKey {
    type Err = std::convert::Infallible;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if let Some(label) = text
            .strip_prefix('\'')
            .and_then(|rest| rest.strip_suffix('\''))
        {
            return Ok(RowKey::Label(label.to_string()));
        }
        if let Some((head, tail)) = text.split_once('/') {
            if let Some(pid) = PartitionId::parse(head) {
                // Parsing never fails; unrecognised shapes fall through to `Label`.
                let inner = tail.parse::<RowKey>()?;
                return Ok(RowKey::tagged(pid, inner));
            }
            return Ok(RowKey::Label(text.to_string()));
        }
        if let Some(pid) = PartitionId::parse(text) {
            return Ok(RowKey::Partition(pid));
        }
        if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(index) = text.parse::<u64>() {
                return Ok(RowKey::Index(index));
            }
        }
        Ok(RowKey::Label(text.to_string()))
    }
}

/// Sub-namespaces that distinguish row classes within one stage's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Namespace {
    /// Plain output of a stage that has a single row class.
    Output,
    /// Per-partition `R` factors.
    R,
    /// Per-partition `Q` factors tagged with their original row keys.
    Q,
    /// Per-partition blocks of the second-level orthogonal factor.
    Q2,
    /// The global `R` factor.
    RFinal,
    U,
    Sigma,
    Vt,
    /// The working matrix threaded between Householder rounds.
    AMatrix,
    /// Key/value contributions consumed by the next reduce.
    KvOutput,
}

impl Namespace {
    pub fn dir_name(self) -> &'static str {
        match self {
            Namespace::Output => "output",
            Namespace::R => "R",
            Namespace::Q => "Q",
            Namespace::Q2 => "Q2",
            Namespace::RFinal => "R_final",
            Namespace::U => "U",
            Namespace::Sigma => "Sigma",
            Namespace::Vt => "Vt",
            Namespace::AMatrix => "A_matrix",
            Namespace::KvOutput => "KV_output",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// One `(key, payload)` pair as it crosses a stage boundary. The payload is a
/// byte-encoded fixed-length double vector, either delimited text or packed f64.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: RowKey,
    pub payload: Vec<u8>,
}

impl Record {
    pub fn new(key: RowKey, payload: Vec<u8>) -> Self {
        Self { key, payload }
    }
}

/// A contiguous subset of input rows processed by one map task.
pub type Partition = Vec<Record>;
