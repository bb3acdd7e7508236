//! Per-job append-only checkpoint log.

use std::collections::{BTreeSet, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::CheckpointError;
use crate::job::JobId;

use super::csv;
use super::record::{CheckpointRecord, RecordSchema};

/// Decodes the longest valid UTF-8 prefix of `bytes`. A crash can cut the
/// last row inside a multi-byte character; that tail is dropped like any
/// other partial row.
fn valid_prefix(bytes: &[u8]) -> &str {
    match std::str::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => std::str::from_utf8(&bytes[..e.valid_up_to()]).unwrap_or_default(),
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Locates checkpoint logs under `<data_directory>/jobs/<job_id>/`.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(data_directory: &Path) -> Self {
        Self {
            root: data_directory.join("jobs"),
        }
    }

    pub fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    pub fn log_path(&self, job_id: &JobId) -> PathBuf {
        self.job_dir(job_id)
            .join(format!("raw_data_{}.csv", job_id))
    }

    /// Opens the log for writing.
    ///
    /// A trailing partial record left by an interrupted writer is cut off,
    /// so the file always ends on a record boundary before new appends.
    pub fn open(&self, job_id: JobId, schema: RecordSchema) -> Result<CheckpointLog, CheckpointError> {
        let path = self.log_path(&job_id);
        let loaded = load(&path, &schema)?;

        if let Some(ref loaded) = loaded {
            if loaded.clean_len < loaded.file_len {
                log::warn!(
                    "Checkpoint log for job {} has a partial trailing record; truncating {} bytes",
                    job_id,
                    loaded.file_len - loaded.clean_len
                );
                let file = OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .map_err(io_error(&path))?;
                file.set_len(loaded.clean_len as u64)
                    .map_err(io_error(&path))?;
                file.sync_all().map_err(io_error(&path))?;
            }
        }

        let (records, header_written) = match loaded {
            Some(loaded) => (loaded.records, loaded.has_header),
            None => (Vec::new(), false),
        };
        let index = records.iter().map(|r| r.source_file.clone()).collect();

        Ok(CheckpointLog {
            job_id,
            path,
            schema,
            records,
            index,
            header_written,
        })
    }

    /// Reads the complete records without modifying the file.
    ///
    /// Safe to call while another task appends to the same log.
    pub fn read_all(
        &self,
        job_id: &JobId,
        schema: &RecordSchema,
    ) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        let path = self.log_path(job_id);
        match load(&path, schema)? {
            Some(loaded) if loaded.has_header => Ok(loaded.records),
            _ => Err(CheckpointError::LogUnavailable(*job_id)),
        }
    }

    /// Returns the raw text of the log, up to its last complete record.
    pub fn read_text(&self, job_id: &JobId) -> Result<String, CheckpointError> {
        let path = self.log_path(job_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CheckpointError::LogUnavailable(*job_id))
            }
            Err(e) => return Err(io_error(&path)(e)),
        };
        let text = valid_prefix(&bytes);
        let clean_len = csv::parse_prefix(&text).clean_len;
        if clean_len == 0 {
            return Err(CheckpointError::LogUnavailable(*job_id));
        }
        Ok(text[..clean_len].to_string())
    }
}

struct Loaded {
    records: Vec<CheckpointRecord>,
    has_header: bool,
    clean_len: usize,
    file_len: usize,
}

fn load(path: &Path, schema: &RecordSchema) -> Result<Option<Loaded>, CheckpointError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path)(e)),
    };

    let prefix = csv::parse_prefix(valid_prefix(&bytes));
    let mut rows = prefix.rows.into_iter();

    let has_header = match rows.next() {
        Some(header) => {
            let expected = schema.header();
            if header != expected {
                return Err(CheckpointError::SchemaMismatch {
                    path: path.to_path_buf(),
                    expected,
                    found: header,
                });
            }
            true
        }
        None => false,
    };

    let mut records = Vec::new();
    let mut seen = HashSet::new();
    for (i, row) in rows.enumerate() {
        let record = schema
            .from_row(&row)
            .ok_or_else(|| CheckpointError::Malformed {
                path: path.to_path_buf(),
                row: i + 2,
                reason: format!("expected {} cells, found {}", schema.width(), row.len()),
            })?;
        if !seen.insert(record.source_file.clone()) {
            log::warn!(
                "Ignoring duplicate checkpoint row for '{}' in {}",
                record.source_file,
                path.display()
            );
            continue;
        }
        records.push(record);
    }

    Ok(Some(Loaded {
        records,
        has_header,
        clean_len: prefix.clean_len,
        file_len: bytes.len(),
    }))
}

/// Open handle on one job's log, owned by the task running that job.
#[derive(Debug)]
pub struct CheckpointLog {
    job_id: JobId,
    path: PathBuf,
    schema: RecordSchema,
    records: Vec<CheckpointRecord>,
    index: HashSet<String>,
    header_written: bool,
}

impl CheckpointLog {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }

    /// Appends a record and makes it durable before returning.
    ///
    /// Returns `false` without writing when a record for the same
    /// `source_file` is already present.
    pub fn append(&mut self, record: CheckpointRecord) -> Result<bool, CheckpointError> {
        if self.index.contains(&record.source_file) {
            log::debug!(
                "Job {}: '{}' already checkpointed, skipping append",
                self.job_id,
                record.source_file
            );
            return Ok(false);
        }

        let mut text = String::new();
        if !self.header_written {
            csv::write_row(&mut text, &self.schema.header());
        }
        csv::write_row(&mut text, &self.schema.to_row(&record));

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_error(&self.path))?;
        file.write_all(text.as_bytes())
            .map_err(io_error(&self.path))?;
        file.flush().map_err(io_error(&self.path))?;
        file.sync_data().map_err(io_error(&self.path))?;

        self.header_written = true;
        self.index.insert(record.source_file.clone());
        self.records.push(record);
        Ok(true)
    }

    /// Returns every record in append order.
    pub fn read_all(&self) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        if !self.header_written {
            return Err(CheckpointError::LogUnavailable(self.job_id));
        }
        Ok(self.records.clone())
    }

    /// Drops every errored record and returns their `source_file` values.
    ///
    /// The surviving rows are written to a sibling file which then replaces
    /// the log, so a crash leaves either the old or the new log intact.
    pub fn remove_errored(&mut self) -> Result<BTreeSet<String>, CheckpointError> {
        if !self.header_written {
            return Err(CheckpointError::LogUnavailable(self.job_id));
        }

        let (errored, kept): (Vec<&CheckpointRecord>, Vec<&CheckpointRecord>) =
            self.records.iter().partition(|r| r.is_error());
        let removed: BTreeSet<String> = errored.iter().map(|r| r.source_file.clone()).collect();
        if removed.is_empty() {
            return Ok(removed);
        }
        let kept: Vec<CheckpointRecord> = kept.into_iter().cloned().collect();

        let tmp_path = self.path.with_extension("csv.tmp");
        let text = self.schema.to_csv(&kept);
        {
            let mut file = File::create(&tmp_path).map_err(io_error(&tmp_path))?;
            file.write_all(text.as_bytes())
                .map_err(io_error(&tmp_path))?;
            file.sync_all().map_err(io_error(&tmp_path))?;
        }
        fs::rename(&tmp_path, &self.path).map_err(io_error(&self.path))?;

        // The file on disk is authoritative from here on.
        self.records = kept;
        for name in &removed {
            self.index.remove(name);
        }
        log::info!(
            "Job {}: removed {} errored checkpoint records",
            self.job_id,
            removed.len()
        );
        Ok(removed)
    }

    pub fn contains(&self, source_file: &str) -> bool {
        self.index.contains(source_file)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_error()).count()
    }

    pub fn records(&self) -> &[CheckpointRecord] {
        &self.records
    }

    /// Renders the current records with a header row.
    pub fn to_csv(&self) -> String {
        self.schema.to_csv(&self.records)
    }
}
