//! Local staging file for batch commits
//!
//! Rows consumed in the batch modes accumulate in an append-only local file,
//! one JSON object per line, created lazily at the first row. At commit time
//! the staging file is rendered into the adapter's load format: the newline-
//! delimited JSON itself, or an RFC 4180 CSV with quoted header and `\N`
//! nulls, optionally gzip-compressed. The file is deleted on both commit
//! (success or failure) and abort; a crash leaks it under a recognizable
//! name prefix so it can be swept up.

use crate::error::Result;
use crate::object::Object;
use crate::stream::BulkMode;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Serialization format of a bulk-load file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchFileFormat {
    /// One JSON object per line, UTF-8, no BOM.
    Ndjson,
    /// RFC 4180 CSV with a quoted header row and `\N` null marker.
    Csv,
}

/// Compression applied to a bulk-load file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCompression {
    None,
    Gzip,
}

/// A bulk-load source handed to `WarehouseOps::load_table`.
#[derive(Debug, Clone)]
pub struct LoadSource {
    pub path: PathBuf,
    pub format: BatchFileFormat,
    pub compression: FileCompression,
}

/// Replace anything outside `[A-Za-z0-9_]` so ids and table names are safe
/// in file names.
pub fn sanitize_component(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Staging file path for a stream, under the OS temp directory.
pub fn staging_path(mode: BulkMode, table_name: &str, stream_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "sluice_{}_{}_{}",
        mode,
        sanitize_component(table_name),
        sanitize_component(stream_id)
    ))
}

/// Append-only NDJSON staging file for a single commit window.
pub struct BatchFile {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    rows: u64,
    /// Derived load files produced by `finalize`, removed on cleanup.
    derived: Vec<PathBuf>,
}

impl BatchFile {
    pub fn new(mode: BulkMode, table_name: &str, stream_id: &str) -> Self {
        Self {
            path: staging_path(mode, table_name, stream_id),
            writer: None,
            rows: 0,
            derived: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Append one record as a full line. The file is created on first use.
    pub fn append(&mut self, object: &Object) -> Result<()> {
        if self.writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&self.path)?;
            self.writer = Some(BufWriter::new(file));
        }
        let writer = self.writer.as_mut().expect("writer just created");
        serde_json::to_writer(&mut *writer, object)?;
        writer.write_all(b"\n")?;
        self.rows += 1;
        Ok(())
    }

    /// Render the staged rows into the adapter's load format.
    ///
    /// `columns` fixes the CSV column order (the final table's column order);
    /// it is ignored for NDJSON.
    pub fn finalize(
        &mut self,
        format: BatchFileFormat,
        compression: FileCompression,
        columns: &[String],
    ) -> Result<LoadSource> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }

        let path = match (format, compression) {
            (BatchFileFormat::Ndjson, FileCompression::None) => self.path.clone(),
            (BatchFileFormat::Ndjson, FileCompression::Gzip) => {
                let out = self.path.with_extension("ndjson.gz");
                let reader = BufReader::new(File::open(&self.path)?);
                let mut encoder =
                    GzEncoder::new(BufWriter::new(File::create(&out)?), Compression::default());
                for line in reader.lines() {
                    encoder.write_all(line?.as_bytes())?;
                    encoder.write_all(b"\n")?;
                }
                encoder.finish()?.flush()?;
                self.derived.push(out.clone());
                out
            }
            (BatchFileFormat::Csv, compression) => {
                let out = match compression {
                    FileCompression::None => self.path.with_extension("csv"),
                    FileCompression::Gzip => self.path.with_extension("csv.gz"),
                };
                let file = BufWriter::new(File::create(&out)?);
                match compression {
                    FileCompression::None => {
                        self.write_csv(file, columns)?;
                    }
                    FileCompression::Gzip => {
                        let encoder = GzEncoder::new(file, Compression::default());
                        self.write_csv(encoder, columns)?.finish()?.flush()?;
                    }
                }
                self.derived.push(out.clone());
                out
            }
        };

        Ok(LoadSource {
            path,
            format,
            compression,
        })
    }

    fn write_csv<W: Write>(&self, mut out: W, columns: &[String]) -> Result<W> {
        // Header row: always quoted
        let header: Vec<String> = columns.iter().map(|c| csv_quote(c)).collect();
        out.write_all(header.join(",").as_bytes())?;
        out.write_all(b"\n")?;

        let reader = BufReader::new(File::open(&self.path)?);
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let object: Object = serde_json::from_str(&line)?;
            let row: Vec<String> = columns
                .iter()
                .map(|c| csv_value(object.get(c.as_str())))
                .collect();
            out.write_all(row.join(",").as_bytes())?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        Ok(out)
    }

    /// Delete the staging file and any derived load files, best effort.
    pub fn cleanup(&mut self) {
        self.writer = None;
        for path in self.derived.drain(..).chain(std::iter::once(self.path.clone())) {
            if path.exists() {
                if let Err(err) = fs::remove_file(&path) {
                    warn!(path = %path.display(), %err, "failed to remove staging file");
                }
            }
        }
        self.rows = 0;
    }
}

/// Render one value as a CSV field: `\N` for absent/null, JSON encoding for
/// nested structures, RFC 4180 quoting where needed.
fn csv_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "\\N".to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => csv_escape(s),
        Some(v @ (Value::Array(_) | Value::Object(_))) => {
            csv_escape(&serde_json::to_string(v).unwrap_or_default())
        }
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        csv_quote(field)
    } else {
        field.to_string()
    }
}

fn csv_quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}
