//! # Item Readers
//!
//! - [`DelimitedFileReader`]: tab-delimited text with a header row, the layout
//!   of Darwin Core archive core and extension files
//! - [`IterItemReader`]: in-memory source, mostly for tests and replays

use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use csv::{ReaderBuilder, StringRecord, Trim};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::context::{RunContext, SharedParameter};
use crate::error::{HarvesterError, HarvesterResult};
use crate::pipeline::ItemReader;

const DEFAULT_FILE_NAME: &str = "occurrence.txt";
const DELIMITER: u8 = b'\t';
const BYTE_ORDER_MARK: char = '\u{feff}';

/// Reads one record per row from a tab-delimited file
///
/// The header row names the columns. Column names are lower-cased and each
/// record is decoded from a JSON object of its non-blank cells, so `T` only
/// needs `Deserialize` with lower-case field names and a blank cell behaves
/// like a missing one.
///
/// The file location comes from [`DelimitedFileReader::with_path`] or from the
/// run's [`SharedParameter::DwcaPath`]. When the location is a directory the
/// file inside it is chosen by [`DelimitedFileReader::with_file_name`], else by
/// [`SharedParameter::DwcaExtensionType`] (`description` reads
/// `description.txt`), else `occurrence.txt`.
pub struct DelimitedFileReader<T> {
    path: Option<PathBuf>,
    file_name: Option<String>,
    headers: Vec<String>,
    records: Option<csv::Reader<BufReader<File>>>,
    record: StringRecord,
    rows_read: u64,
    resolved_path: Option<PathBuf>,
    _item: PhantomData<fn() -> T>,
}

impl<T> Default for DelimitedFileReader<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DelimitedFileReader<T> {
    pub fn new() -> Self {
        Self {
            path: None,
            file_name: None,
            headers: Vec::new(),
            records: None,
            record: StringRecord::new(),
            rows_read: 0,
            resolved_path: None,
            _item: PhantomData,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    /// Lower-cased header names, available after `open`
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Path actually opened, available after `open`
    pub fn resolved_path(&self) -> Option<&Path> {
        self.resolved_path.as_deref()
    }

    async fn resolve_path(&self, context: &RunContext) -> HarvesterResult<PathBuf> {
        let base = match &self.path {
            Some(path) => path.clone(),
            None => PathBuf::from(context.require_str(SharedParameter::DwcaPath, "delimited_file_reader")?),
        };

        let metadata = tokio::fs::metadata(&base)
            .await
            .map_err(|e| HarvesterError::read(format!("cannot access {}: {e}", base.display())))?;
        if !metadata.is_dir() {
            return Ok(base);
        }

        let file_name = self
            .file_name
            .clone()
            .or_else(|| {
                context
                    .get_str(SharedParameter::DwcaExtensionType)
                    .map(|extension| format!("{}.txt", extension.to_lowercase()))
            })
            .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string());
        Ok(base.join(file_name))
    }

    fn decode_record(&self) -> HarvesterResult<T>
    where
        T: DeserializeOwned,
    {
        let mut fields = Map::new();
        for (header, cell) in self.headers.iter().zip(self.record.iter()) {
            if !cell.is_empty() {
                fields.insert(header.clone(), Value::String(cell.to_string()));
            }
        }
        serde_json::from_value(Value::Object(fields)).map_err(|e| {
            HarvesterError::read(format!(
                "line {}: cannot decode record: {e}",
                record_line(&self.record)
            ))
        })
    }
}

fn record_line(record: &StringRecord) -> u64 {
    record.position().map(|position| position.line()).unwrap_or(0)
}

fn lowercase_headers(headers: &StringRecord) -> StringRecord {
    headers
        .iter()
        .enumerate()
        .map(|(index, column)| {
            let column = if index == 0 {
                column.trim_start_matches(BYTE_ORDER_MARK)
            } else {
                column
            };
            column.trim().to_lowercase()
        })
        .collect()
}

#[async_trait]
impl<T> ItemReader<T> for DelimitedFileReader<T>
where
    T: DeserializeOwned + Send + 'static,
{
    async fn open(&mut self, context: &RunContext) -> HarvesterResult<()> {
        let path = self.resolve_path(context).await?;
        let file = File::open(&path)
            .map_err(|e| HarvesterError::read(format!("cannot open {}: {e}", path.display())))?;

        // DwC-A text files are not quoted; a stray '"' is data
        let mut records = ReaderBuilder::new()
            .has_headers(true)
            .delimiter(DELIMITER)
            .quoting(false)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(BufReader::new(file));

        let headers = records
            .headers()
            .map_err(|e| HarvesterError::read(format!("{}: bad header row: {e}", path.display())))?;
        if headers.is_empty() {
            return Err(HarvesterError::read(format!("{} has no header row", path.display())));
        }
        let headers = lowercase_headers(headers);
        self.headers = headers.iter().map(str::to_string).collect();
        records.set_headers(headers);

        self.records = Some(records);
        self.rows_read = 0;
        info!(
            path = %path.display(),
            columns = self.headers.len(),
            "📂 Opened delimited file"
        );
        self.resolved_path = Some(path);
        Ok(())
    }

    async fn read_next(&mut self) -> HarvesterResult<Option<T>> {
        let records = self
            .records
            .as_mut()
            .ok_or_else(|| HarvesterError::illegal_state("delimited file reader is not open"))?;
        let more = records.read_record(&mut self.record).map_err(|e| {
            let line = e.position().map(|position| position.line()).unwrap_or(0);
            HarvesterError::read(format!("line {line}: {e}"))
        })?;
        if !more {
            return Ok(None);
        }
        self.rows_read += 1;
        self.decode_record().map(Some)
    }

    async fn close(&mut self) -> HarvesterResult<()> {
        if self.records.take().is_some() {
            debug!(rows = self.rows_read, "Closed delimited file");
        }
        Ok(())
    }
}

/// Serves items from memory in insertion order
#[derive(Debug)]
pub struct IterItemReader<T> {
    items: VecDeque<T>,
}

impl<T> IterItemReader<T> {
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.items.len()
    }
}

#[async_trait]
impl<T: Send> ItemReader<T> for IterItemReader<T> {
    async fn read_next(&mut self) -> HarvesterResult<Option<T>> {
        Ok(self.items.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, PartialEq, Deserialize)]
    struct Description {
        id: String,
        description: Option<String>,
        language: Option<String>,
    }

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_reads_records_with_lowercased_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "description.txt",
            "ID\tDescription\tLanguage\n1941\tPerennial herb\ten\n\n1942\t\tfr\n",
        );

        let mut reader = DelimitedFileReader::<Description>::new().with_path(&path);
        reader.open(&RunContext::empty()).await.unwrap();
        assert_eq!(reader.headers(), ["id", "description", "language"]);

        let first = reader.read_next().await.unwrap().unwrap();
        assert_eq!(first.id, "1941");
        assert_eq!(first.description.as_deref(), Some("Perennial herb"));

        let second = reader.read_next().await.unwrap().unwrap();
        assert_eq!(second.id, "1942");
        assert_eq!(second.description, None);
        assert_eq!(second.language.as_deref(), Some("fr"));

        assert!(reader.read_next().await.unwrap().is_none());
        reader.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_directory_resolved_through_extension_type() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "description.txt", "id\tdescription\n7\tShrub\n");

        let context = RunContext::builder()
            .with(SharedParameter::DwcaPath, dir.path().to_string_lossy().to_string())
            .with(SharedParameter::DwcaExtensionType, "Description")
            .build();

        let mut reader = DelimitedFileReader::<Description>::new();
        reader.open(&context).await.unwrap();
        assert_eq!(
            reader.resolved_path(),
            Some(dir.path().join("description.txt").as_path())
        );
        let record = reader.read_next().await.unwrap().unwrap();
        assert_eq!(record.description.as_deref(), Some("Shrub"));
    }

    #[tokio::test]
    async fn test_missing_path_parameter_is_configuration_error() {
        let mut reader = DelimitedFileReader::<Description>::new();
        let err = reader.open(&RunContext::empty()).await.unwrap_err();
        assert!(matches!(err, HarvesterError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_undecodable_row_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "occurrence.txt", "description\nno id column\n");

        let mut reader = DelimitedFileReader::<Description>::new().with_path(path);
        reader.open(&RunContext::empty()).await.unwrap();
        let err = reader.read_next().await.unwrap_err();
        assert!(matches!(err, HarvesterError::Read { .. }));
        assert!(err.to_string().contains("line 2"));
    }

    #[tokio::test]
    async fn test_byte_order_mark_before_header_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "occurrence.txt",
            "\u{feff}id\tDescription\n1941\tPerennial \"herb\n",
        );

        let mut reader = DelimitedFileReader::<Description>::new().with_path(path);
        reader.open(&RunContext::empty()).await.unwrap();
        assert_eq!(reader.headers(), ["id", "description"]);

        let record = reader.read_next().await.unwrap().unwrap();
        assert_eq!(record.id, "1941");
        assert_eq!(record.description.as_deref(), Some("Perennial \"herb"));
        assert_eq!(record.language, None);
    }

    #[tokio::test]
    async fn test_read_before_open_is_illegal_state() {
        let mut reader = DelimitedFileReader::<Description>::new();
        let err = reader.read_next().await.unwrap_err();
        assert!(matches!(err, HarvesterError::IllegalState { .. }));
    }

    #[tokio::test]
    async fn test_iter_reader_preserves_order() {
        let mut reader = IterItemReader::new(vec![1, 2, 3]);
        assert_eq!(reader.remaining(), 3);
        let mut seen = Vec::new();
        while let Some(item) = reader.read_next().await.unwrap() {
            seen.push(item);
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }
}
