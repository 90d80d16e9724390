//! Loaders turning source files into tables.

use std::fmt::{self, Display, Formatter};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

use lab_primitives::Table;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use crate::dataset::Backend;
use crate::error::{RegistryError, RegistryResult};

/// Supported source formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    /// Comma-separated values with a header row.
    Csv,
    /// Tab-separated values with a header row.
    Tsv,
    /// A JSON array of objects.
    Json,
    /// One JSON object per line.
    Jsonl,
}

impl DataFormat {
    /// Guesses the format from a file extension.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(Self::Csv),
            "tsv" | "tab" => Some(Self::Tsv),
            "json" => Some(Self::Json),
            "jsonl" | "ndjson" => Some(Self::Jsonl),
            _ => None,
        }
    }
}

impl Display for DataFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Csv => "csv",
            Self::Tsv => "tsv",
            Self::Json => "json",
            Self::Jsonl => "jsonl",
        })
    }
}

impl FromStr for DataFormat {
    type Err = RegistryError;

    fn from_str(s: &str) -> RegistryResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "tsv" => Ok(Self::Tsv),
            "json" => Ok(Self::Json),
            "jsonl" | "ndjson" => Ok(Self::Jsonl),
            other => Err(RegistryError::validation(format!("unsupported format `{other}`"))),
        }
    }
}

/// Produces a table from a source file.
pub trait TableLoader: Send + Sync {
    /// Reads `path`. When `format` is `None` it is inferred from the
    /// extension.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Storage`] when the file cannot be read and
    /// [`RegistryError::Validation`] when its content does not parse.
    fn load(&self, path: &Path, format: Option<DataFormat>) -> RegistryResult<Table>;
}

/// Default loader for delimited text and JSON files.
#[derive(Debug, Default, Clone, Copy)]
pub struct FormatLoader;

impl FormatLoader {
    fn delimited(path: &Path, delimiter: u8) -> RegistryResult<Table> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(false)
            .from_path(path)
            .map_err(|err| csv_failure(path, err))?;
        let headers = reader
            .headers()
            .map_err(|err| csv_failure(path, err))?
            .iter()
            .map(str::to_owned)
            .collect();
        let rows = reader
            .records()
            .map(|record| {
                record
                    .map(|record| record.iter().map(str::to_owned).collect())
                    .map_err(|err| csv_failure(path, err))
            })
            .collect::<RegistryResult<Vec<Vec<String>>>>()?;
        Ok(Table::from_text_rows(headers, rows)?)
    }

    fn json(path: &Path) -> RegistryResult<Table> {
        let file = File::open(path).map_err(|err| io_failure(path, &err))?;
        let records: Vec<Map<String, JsonValue>> = serde_json::from_reader(BufReader::new(file))
            .map_err(|err| {
                if err.is_io() {
                    io_failure(path, &err)
                } else {
                    unparsable(path, err)
                }
            })?;
        Ok(Table::from_json_records(&records)?)
    }

    fn json_lines(path: &Path) -> RegistryResult<Table> {
        let file = File::open(path).map_err(|err| io_failure(path, &err))?;
        let mut records = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|err| match err.kind() {
                io::ErrorKind::InvalidData => unparsable(path, format!("line {}: {err}", idx + 1)),
                _ => io_failure(path, &err),
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let record: Map<String, JsonValue> = serde_json::from_str(&line)
                .map_err(|err| unparsable(path, format!("line {}: {err}", idx + 1)))?;
            records.push(record);
        }
        Ok(Table::from_json_records(&records)?)
    }
}

impl TableLoader for FormatLoader {
    fn load(&self, path: &Path, format: Option<DataFormat>) -> RegistryResult<Table> {
        let format = format
            .or_else(|| DataFormat::from_path(path))
            .ok_or_else(|| {
                RegistryError::validation(format!(
                    "cannot infer format of {}; pass an explicit format",
                    path.display()
                ))
            })?;
        let table = match format {
            DataFormat::Csv => Self::delimited(path, b',')?,
            DataFormat::Tsv => Self::delimited(path, b'\t')?,
            DataFormat::Json => Self::json(path)?,
            DataFormat::Jsonl => Self::json_lines(path)?,
        };
        debug!(path = %path.display(), %format, rows = table.row_count(), "loaded source file");
        Ok(table)
    }
}

/// Loading always materializes in memory first, so the registry rebinds
/// these to the dataset and the tier it was headed for.
pub(crate) fn io_failure(path: &Path, err: &impl Display) -> RegistryError {
    RegistryError::storage(
        path.display().to_string(),
        Backend::Memory,
        format!("cannot read {}: {err}", path.display()),
    )
}

fn unparsable(path: &Path, err: impl Display) -> RegistryError {
    RegistryError::validation(format!("cannot parse {}: {err}", path.display()))
}

fn csv_failure(path: &Path, err: csv::Error) -> RegistryError {
    if err.is_io_error() {
        io_failure(path, &err)
    } else {
        unparsable(path, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_primitives::{ColumnType, Value};

    #[test]
    fn loads_csv_with_inferred_types() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sales.csv");
        std::fs::write(&path, "region,amount\nnorth,10\nsouth,2.5\n").unwrap();

        let table = FormatLoader.load(&path, None).unwrap();
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.schema().fields()[1].ty(), ColumnType::Float);
    }

    #[test]
    fn loads_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        std::fs::write(&path, "{\"id\": 1}\n\n{\"id\": 2, \"tag\": \"x\"}\n").unwrap();

        let table = FormatLoader.load(&path, None).unwrap();
        assert_eq!(table.schema().names(), ["id", "tag"]);
        assert_eq!(table.rows()[0][1], Value::Null);
    }

    #[test]
    fn unknown_extension_requires_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, "a\tb\n1\t2\n").unwrap();
        assert!(FormatLoader.load(&path, None).is_err());
        let table = FormatLoader.load(&path, Some(DataFormat::Tsv)).unwrap();
        assert_eq!(table.column_count(), 2);
    }

    #[test]
    fn unreadable_files_are_storage_failures_and_bad_content_is_not() {
        let dir = tempfile::tempdir().unwrap();
        let missing = FormatLoader
            .load(&dir.path().join("absent.csv"), None)
            .unwrap_err();
        assert!(matches!(missing, RegistryError::Storage { .. }), "{missing}");
        let missing = FormatLoader
            .load(&dir.path().join("absent.jsonl"), None)
            .unwrap_err();
        assert!(matches!(missing, RegistryError::Storage { .. }), "{missing}");

        let ragged = dir.path().join("ragged.csv");
        std::fs::write(&ragged, "a,b\n1,2,3\n").unwrap();
        let err = FormatLoader.load(&ragged, None).unwrap_err();
        assert!(matches!(err, RegistryError::Validation { .. }), "{err}");

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "[{\"id\": 1},").unwrap();
        let err = FormatLoader.load(&broken, None).unwrap_err();
        assert!(matches!(err, RegistryError::Validation { .. }), "{err}");
    }
}
