//! Row payload encodings, record files and small side files.
//!
//! Rows cross stage boundaries as `(key, bytes)` pairs. The bytes are either a
//! delimited list of floats or packed little-endian `f64`s; a task inspects the first
//! payload it sees and decodes every later payload the same way.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use log::debug;
use ndarray::Array2;

use crate::error::TsqrError;
use crate::types::{Record, RowKey};

const F64_WIDTH: usize = std::mem::size_of::<f64>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowEncoding {
    /// Floats separated by whitespace and/or commas.
    Text,
    /// Fixed-width binary elements.
    PackedBinary { element_width: usize },
}

fn is_separator(b: u8) -> bool {
    b == b',' || b.is_ascii_whitespace()
}

fn text_tokens(payload: &[u8]) -> impl Iterator<Item = &[u8]> {
    payload
        .split(|&b| is_separator(b))
        .filter(|token| !token.is_empty())
}

fn parse_float(token: &[u8]) -> Option<f64> {
    lexical_core::parse::<f64>(token).ok()
}

impl RowEncoding {
    /// Decides how a payload is encoded. Text wins whenever every token parses as a
    /// float; otherwise the byte length must be a multiple of 8.
    pub fn detect(payload: &[u8]) -> Result<Self, TsqrError> {
        if payload.is_empty() {
            return Err(TsqrError::DataFormat(
                "cannot deduce the encoding of an empty row".to_string(),
            ));
        }
        let mut tokens = text_tokens(payload).peekable();
        if tokens.peek().is_some() && tokens.all(|token| parse_float(token).is_some()) {
            return Ok(RowEncoding::Text);
        }
        if payload.len() % F64_WIDTH == 0 {
            return Ok(RowEncoding::PackedBinary {
                element_width: F64_WIDTH,
            });
        }
        Err(TsqrError::DataFormat(format!(
            "number of data bytes ({}) is not a multiple of {F64_WIDTH}",
            payload.len()
        )))
    }

    pub fn decode(self, payload: &[u8]) -> Result<Vec<f64>, TsqrError> {
        match self {
            RowEncoding::Text => text_tokens(payload)
                .map(|token| {
                    parse_float(token).ok_or_else(|| {
                        TsqrError::DataFormat(format!(
                            "token '{}' is not a float",
                            String::from_utf8_lossy(token)
                        ))
                    })
                })
                .collect(),
            RowEncoding::PackedBinary { element_width } => {
                if element_width != F64_WIDTH {
                    return Err(TsqrError::DataFormat(format!(
                        "unsupported element width {element_width}"
                    )));
                }
                if payload.len() % element_width != 0 {
                    return Err(TsqrError::DataFormat(format!(
                        "number of data bytes ({}) is not a multiple of {element_width}",
                        payload.len()
                    )));
                }
                Ok(payload
                    .chunks_exact(element_width)
                    .map(|chunk| {
                        let mut bytes = [0u8; F64_WIDTH];
                        bytes.copy_from_slice(chunk);
                        f64::from_le_bytes(bytes)
                    })
                    .collect())
            }
        }
    }
}

pub fn encode_packed(row: &[f64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(row.len() * F64_WIDTH);
    for value in row {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

pub fn encode_text(row: &[f64]) -> Vec<u8> {
    let mut buffer = ryu::Buffer::new();
    let mut out = Vec::with_capacity(row.len() * 12);
    for (i, value) in row.iter().enumerate() {
        if i > 0 {
            out.push(b' ');
        }
        out.extend_from_slice(buffer.format(*value).as_bytes());
    }
    out
}

/// Per-task row decoder. The encoding is resolved from the first payload and held
/// fixed for the task's lifetime; the column count is inferred from the first row
/// when not configured.
#[derive(Debug, Clone, Default)]
pub struct RowDecoder {
    encoding: Option<RowEncoding>,
    ncols: Option<usize>,
}

impl RowDecoder {
    pub fn new(ncols: Option<usize>) -> Self {
        Self {
            encoding: None,
            ncols,
        }
    }

    pub fn ncols(&self) -> Option<usize> {
        self.ncols
    }

    pub fn decode(&mut self, payload: &[u8]) -> Result<Vec<f64>, TsqrError> {
        let row = self.decode_any_width(payload)?;
        self.check_width(row.len())?;
        Ok(row)
    }

    /// Decodes with the task's encoding but leaves the width unchecked. For tasks whose
    /// rows legitimately differ in width, which validate each row themselves.
    pub fn decode_any_width(&mut self, payload: &[u8]) -> Result<Vec<f64>, TsqrError> {
        let encoding = match self.encoding {
            Some(encoding) => encoding,
            None => {
                let encoding = RowEncoding::detect(payload)?;
                debug!("row encoding deduced as {encoding:?}");
                self.encoding = Some(encoding);
                encoding
            }
        };
        encoding.decode(payload)
    }

    /// Validates a row width against the column count, inferring it if unset.
    fn check_width(&mut self, width: usize) -> Result<usize, TsqrError> {
        match self.ncols {
            Some(ncols) if ncols == width => Ok(ncols),
            Some(ncols) => Err(TsqrError::DataFormat(format!(
                "length of value ({width}) did not match number of columns ({ncols})"
            ))),
            None if width == 0 => Err(TsqrError::DataFormat(
                "rows must have at least one column".to_string(),
            )),
            None => {
                debug!("matrix size: {width} columns");
                self.ncols = Some(width);
                Ok(width)
            }
        }
    }
}

// ========================================================================================
//                                   Record files
// ========================================================================================

fn write_frame<W: Write>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(bytes.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame exceeds 4 GiB")
    })?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(bytes)
}

/// Reads one length-prefixed frame; `Ok(None)` at a clean end of file.
#[cfg(test)]
fn read_frame<R: std::io::Read>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    Ok(Some(bytes))
}

pub fn write_records(path: &Path, records: &[Record]) -> Result<(), TsqrError> {
    let file = File::create(path).map_err(|e| TsqrError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    for record in records {
        write_frame(&mut writer, record.key.to_string().as_bytes())
            .and_then(|()| write_frame(&mut writer, &record.payload))
            .map_err(|e| TsqrError::io(path, e))?;
    }
    writer.flush().map_err(|e| TsqrError::io(path, e))
}

/// Reads a record file back; stages only ever write them.
#[cfg(test)]
pub(crate) fn read_records(path: &Path) -> Result<Vec<Record>, TsqrError> {
    let file = File::open(path).map_err(|e| TsqrError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    while let Some(key_bytes) = read_frame(&mut reader).map_err(|e| TsqrError::io(path, e))? {
        let payload = read_frame(&mut reader)
            .map_err(|e| TsqrError::io(path, e))?
            .ok_or_else(|| {
                TsqrError::DataFormat(format!(
                    "record file '{}' ends between a key and its value",
                    path.display()
                ))
            })?;
        let key_text = String::from_utf8(key_bytes).map_err(|_| {
            TsqrError::DataFormat(format!("record key in '{}' is not UTF-8", path.display()))
        })?;
        let key = match key_text.parse::<RowKey>() {
            Ok(key) => key,
            Err(never) => match never {},
        };
        records.push(Record::new(key, payload));
    }
    Ok(records)
}

// ========================================================================================
//                                    Side files
// ========================================================================================

fn parse_float_line(line: &str, path: &Path, line_no: usize) -> Result<Vec<f64>, TsqrError> {
    text_tokens(line.as_bytes())
        .map(|token| {
            parse_float(token).ok_or_else(|| {
                TsqrError::DataFormat(format!(
                    "{}:{}: '{}' is not a float",
                    path.display(),
                    line_no + 1,
                    String::from_utf8_lossy(token)
                ))
            })
        })
        .collect()
}

fn rows_to_array(rows: Vec<Vec<f64>>, path: &Path) -> Result<Array2<f64>, TsqrError> {
    let ncols = rows.first().map_or(0, Vec::len);
    if let Some(bad) = rows.iter().position(|row| row.len() != ncols) {
        return Err(TsqrError::DataFormat(format!(
            "{}: row {} has {} entries, expected {ncols}",
            path.display(),
            bad + 1,
            rows[bad].len()
        )));
    }
    let nrows = rows.len();
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((nrows, ncols), flat)
        .map_err(|e| TsqrError::DataFormat(format!("{}: {e}", path.display())))
}

/// Parses a small matrix stored one row per line.
pub fn parse_matrix_txt(path: &Path) -> Result<Array2<f64>, TsqrError> {
    let file = File::open(path).map_err(|e| TsqrError::io(path, e))?;
    let mut rows = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| TsqrError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        rows.push(parse_float_line(&line, path, line_no)?);
    }
    rows_to_array(rows, path)
}

pub fn write_matrix_txt(path: &Path, matrix: &Array2<f64>) -> Result<(), TsqrError> {
    let file = File::create(path).map_err(|e| TsqrError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    for row in matrix.rows() {
        let values: Vec<f64> = row.iter().copied().collect();
        writer
            .write_all(&encode_text(&values))
            .and_then(|()| writer.write_all(b"\n"))
            .map_err(|e| TsqrError::io(path, e))?;
    }
    writer.flush().map_err(|e| TsqrError::io(path, e))
}

/// Parses `<key> <floats...>` lines, as written by [`write_keyed_rows_txt`].
pub fn parse_keyed_rows_txt(path: &Path) -> Result<Vec<(RowKey, Vec<f64>)>, TsqrError> {
    let file = File::open(path).map_err(|e| TsqrError::io(path, e))?;
    let mut rows = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| TsqrError::io(path, e))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let (key_text, values) = trimmed.split_once('\t').ok_or_else(|| {
            TsqrError::DataFormat(format!(
                "{}:{}: missing tab between key and values",
                path.display(),
                line_no + 1
            ))
        })?;
        let key = match key_text.parse::<RowKey>() {
            Ok(key) => key,
            Err(never) => match never {},
        };
        rows.push((key, parse_float_line(values, path, line_no)?));
    }
    Ok(rows)
}

pub fn write_keyed_rows_txt(path: &Path, rows: &[(RowKey, Vec<f64>)]) -> Result<(), TsqrError> {
    let file = File::create(path).map_err(|e| TsqrError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    for (key, values) in rows {
        writer
            .write_all(key.to_string().as_bytes())
            .and_then(|()| writer.write_all(b"\t"))
            .and_then(|()| writer.write_all(&encode_text(values)))
            .and_then(|()| writer.write_all(b"\n"))
            .map_err(|e| TsqrError::io(path, e))?;
    }
    writer.flush().map_err(|e| TsqrError::io(path, e))
}
