use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow_array::{ArrayRef, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use diagdash_adapters::CanonicalField;
use diagdash_core::CanonicalRecord;
use parquet::arrow::ArrowWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Parquet,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Parquet => "parquet",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "parquet" => Ok(ExportFormat::Parquet),
            other => bail!("unsupported export format `{other}` (expected csv or parquet)"),
        }
    }
}

fn export_schema() -> Arc<Schema> {
    Arc::new(Schema::new(
        CanonicalField::ALL
            .iter()
            .map(|field| {
                let required = matches!(field, CanonicalField::Id | CanonicalField::CreatedAt);
                ArrowField::new(field.column_name(), DataType::Utf8, !required)
            })
            .collect::<Vec<_>>(),
    ))
}

/// One UTF-8 column per canonical field; unset optional fields become nulls.
pub fn records_to_batch(records: &[CanonicalRecord]) -> Result<RecordBatch> {
    let columns = CanonicalField::ALL
        .iter()
        .map(|field| {
            let values = records.iter().map(|r| field.text(r)).collect::<Vec<_>>();
            Arc::new(StringArray::from(values)) as ArrayRef
        })
        .collect::<Vec<_>>();
    RecordBatch::try_new(export_schema(), columns).context("building export record batch")
}

pub fn write_csv<W: Write>(writer: W, records: &[CanonicalRecord]) -> Result<W> {
    let batch = records_to_batch(records)?;
    let mut csv = arrow_csv::WriterBuilder::new()
        .with_header(true)
        .build(writer);
    csv.write(&batch).context("writing csv rows")?;
    Ok(csv.into_inner())
}

pub fn csv_bytes(records: &[CanonicalRecord]) -> Result<Vec<u8>> {
    write_csv(Vec::new(), records)
}

pub fn write_parquet(path: &Path, records: &[CanonicalRecord]) -> Result<()> {
    let batch = records_to_batch(records)?;
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

pub fn export_to_path(path: &Path, format: ExportFormat, records: &[CanonicalRecord]) -> Result<()> {
    match format {
        ExportFormat::Csv => {
            let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
            let mut file = write_csv(file, records)?;
            file.flush()
                .with_context(|| format!("flushing {}", path.display()))
        }
        ExportFormat::Parquet => write_parquet(path, records),
    }
}
