//! Disk-backed staging of extracted records.
//!
//! Extraction may produce far more records than should sit in memory until
//! the AU is committed. A [`SpillWriter`] appends them to a temporary file as
//! JSON lines; [`SpillWriter::into_reader`] consumes the writer and yields the
//! single forward [`SpillReader`] over what was written. The writer cannot be
//! used once read, and a second reader cannot be obtained.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Seek, Write};
use std::path::Path;

use tempfile::{NamedTempFile, TempPath};
use tracing::trace;

use aumeta_core::{Error, ExtractedRecord, Result};

const SPILL_PREFIX: &str = "aumeta-spill-";
const SPILL_SUFFIX: &str = ".jsonl";

/// Writable phase of a spill buffer.
#[derive(Debug)]
pub struct SpillWriter {
    out: BufWriter<NamedTempFile>,
    count: u64,
    broken: bool,
}

impl SpillWriter {
    /// Create an empty buffer backed by a new file in `dir`.
    pub fn create_in(dir: &Path) -> Result<Self> {
        let file = tempfile::Builder::new()
            .prefix(SPILL_PREFIX)
            .suffix(SPILL_SUFFIX)
            .tempfile_in(dir)?;
        trace!(path = %file.path().display(), "Spill buffer created");
        Ok(Self {
            out: BufWriter::new(file),
            count: 0,
            broken: false,
        })
    }

    /// Append a record.
    ///
    /// After a failed write the buffer no longer accepts records, since the
    /// file may hold a partial line.
    pub fn add(&mut self, record: &ExtractedRecord) -> Result<()> {
        if self.broken {
            return Err(Error::InvalidState(
                "spill buffer is unusable after a failed write".to_string(),
            ));
        }
        let written = serde_json::to_writer(&mut self.out, record)
            .map_err(Error::from)
            .and_then(|_| self.out.write_all(b"\n").map_err(Error::from));
        match written {
            Ok(()) => {
                self.count += 1;
                Ok(())
            }
            Err(e) => {
                self.broken = true;
                Err(e)
            }
        }
    }

    /// Records written so far.
    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn path(&self) -> &Path {
        self.out.get_ref().path()
    }

    /// Close the writable side and return the one reader over its records.
    pub fn into_reader(self) -> Result<SpillReader> {
        let file = self.out.into_inner().map_err(|e| Error::Io(e.into_error()))?;
        let (mut file, path) = file.into_parts();
        file.rewind()?;
        Ok(SpillReader {
            input: Some(BufReader::new(file)),
            storage: Some(path),
            remaining: self.count,
            line: String::new(),
        })
    }

    /// Discard the buffer and its backing file.
    pub fn close(self) -> Result<()> {
        let file = self.out.into_inner().map_err(|e| Error::Io(e.into_error()))?;
        file.close()?;
        Ok(())
    }
}

/// Readable phase of a spill buffer: a finite, forward-only sequence.
///
/// The backing file is removed by [`close`](Self::close) or on drop.
#[derive(Debug)]
pub struct SpillReader {
    input: Option<BufReader<File>>,
    storage: Option<TempPath>,
    remaining: u64,
    line: String,
}

impl SpillReader {
    /// Records not yet read.
    pub fn remaining(&self) -> u64 {
        if self.input.is_some() {
            self.remaining
        } else {
            0
        }
    }

    pub fn has_next(&self) -> bool {
        self.remaining() > 0
    }

    /// Read the next record. Reading past the written count is an error.
    pub fn next_record(&mut self) -> Result<ExtractedRecord> {
        if !self.has_next() {
            return Err(Error::InvalidState(
                "no records left in spill buffer".to_string(),
            ));
        }
        let input = self
            .input
            .as_mut()
            .ok_or_else(|| Error::InvalidState("spill buffer is closed".to_string()))?;

        self.line.clear();
        if input.read_line(&mut self.line)? == 0 {
            let unread = std::mem::take(&mut self.remaining);
            return Err(Error::Internal(format!(
                "spill buffer ended with {unread} records unread"
            )));
        }
        self.remaining -= 1;
        Ok(serde_json::from_str(self.line.trim_end())?)
    }

    /// Stop reading and delete the backing file. Safe to call repeatedly.
    pub fn close(&mut self) -> Result<()> {
        self.input = None;
        if let Some(path) = self.storage.take() {
            path.close()?;
        }
        Ok(())
    }
}

impl Iterator for SpillReader {
    type Item = Result<ExtractedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.has_next() {
            Some(self.next_record())
        } else {
            None
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = usize::try_from(self.remaining()).unwrap_or(usize::MAX);
        (n, Some(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: usize) -> ExtractedRecord {
        ExtractedRecord {
            article_title: Some(format!("Article {n}")),
            access_url: Some(format!("http://x/{n}")),
            ..Default::default()
        }
    }

    #[test]
    fn test_reads_back_every_record_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SpillWriter::create_in(dir.path()).unwrap();
        for n in 0..50 {
            writer.add(&record(n)).unwrap();
        }
        assert_eq!(writer.len(), 50);

        let reader = writer.into_reader().unwrap();
        let titles: Vec<String> = reader
            .map(|r| r.unwrap().article_title.unwrap())
            .collect();
        assert_eq!(titles.len(), 50);
        assert_eq!(titles[0], "Article 0");
        assert_eq!(titles[49], "Article 49");
    }

    #[test]
    fn test_has_next_agrees_with_remaining() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SpillWriter::create_in(dir.path()).unwrap();
        writer.add(&record(1)).unwrap();
        writer.add(&record(2)).unwrap();

        let mut reader = writer.into_reader().unwrap();
        assert_eq!(reader.remaining(), 2);
        reader.next_record().unwrap();
        assert!(reader.has_next());
        reader.next_record().unwrap();
        assert!(!reader.has_next());
        assert!(matches!(reader.next_record(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_empty_buffer_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SpillWriter::create_in(dir.path()).unwrap();
        assert!(writer.is_empty());
        let mut reader = writer.into_reader().unwrap();
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_close_is_idempotent_and_removes_storage() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SpillWriter::create_in(dir.path()).unwrap();
        let path = writer.path().to_path_buf();
        writer.add(&record(1)).unwrap();
        writer.add(&record(2)).unwrap();

        let mut reader = writer.into_reader().unwrap();
        reader.next_record().unwrap();
        assert!(path.exists());

        reader.close().unwrap();
        reader.close().unwrap();
        assert!(!path.exists());
        assert!(!reader.has_next());
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_writer_close_removes_storage() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SpillWriter::create_in(dir.path()).unwrap();
        writer.add(&record(1)).unwrap();
        let path = writer.path().to_path_buf();

        writer.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_removes_storage() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SpillWriter::create_in(dir.path()).unwrap();
        let path = writer.path().to_path_buf();
        let reader = writer.into_reader().unwrap();
        drop(reader);
        assert!(!path.exists());
    }

    #[test]
    fn test_missing_directory_fails_to_create() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        assert!(matches!(SpillWriter::create_in(&missing), Err(Error::Io(_))));
    }
}
