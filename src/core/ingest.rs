//! Purpose: Incremental delimited-row ingestion into a `RecordStore`.
//! Exports: `IngestConfig`, `IngestOutcome`, `IngestFailure`, `RowIngestor`, `IngestSink`.
//! Role: Terminal consumer for CSV pipelines; bytes in, store inserts out.
//! Invariants: Only the unterminated partial row is carried between chunks.
//! Invariants: Partial rows are capped at `max_row_bytes`; oversize rows skip to the next line break.
//! Invariants: Row-level failures are counted and logged, never propagated.
use bstr::ByteSlice;
use bytes::Bytes;

use crate::core::error::{Error, ErrorKind};
use crate::core::sink::Sink;
use crate::core::store::{IngestRow, InsertOutcome, RecordStore};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Copy, Clone, Debug)]
pub struct IngestConfig {
    pub max_row_bytes: usize,
    pub max_reported_failures: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_row_bytes: 64 * 1024,
            max_reported_failures: 32,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct IngestOutcome {
    /// Data rows seen, header excluded.
    pub rows: u64,
    pub inserted: u64,
    pub ignored: u64,
    pub rejected: u64,
    pub failed: u64,
    pub failures: Vec<IngestFailure>,
}

#[derive(Clone, Debug)]
pub struct IngestFailure {
    /// 1-based record number; the header is record 1.
    pub row: u64,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Eq, PartialEq)]
enum SplitEvent {
    Row { row: u64, fields: Vec<String> },
    Oversize { row: u64 },
}

/// Splits a byte stream into records, honoring quoted line breaks.
struct RowSplitter {
    partial: Vec<u8>,
    in_quotes: bool,
    skipping: bool,
    at_stream_start: bool,
    records: u64,
    max_row_bytes: usize,
}

impl RowSplitter {
    fn new(max_row_bytes: usize) -> Self {
        Self {
            partial: Vec::new(),
            in_quotes: false,
            skipping: false,
            at_stream_start: true,
            records: 0,
            max_row_bytes,
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<SplitEvent> {
        let mut events = Vec::new();
        for &byte in chunk {
            if self.skipping {
                if byte == b'\n' {
                    self.skipping = false;
                }
                continue;
            }
            match byte {
                b'\n' if !self.in_quotes => {
                    let record = std::mem::take(&mut self.partial);
                    events.extend(self.complete(record));
                    continue;
                }
                b'"' => self.in_quotes = !self.in_quotes,
                _ => {}
            }
            self.partial.push(byte);
            if self.partial.len() > self.max_row_bytes {
                self.partial.clear();
                self.in_quotes = false;
                self.skipping = true;
                self.at_stream_start = false;
                self.records += 1;
                events.push(SplitEvent::Oversize { row: self.records });
            }
        }
        events
    }

    /// Emits the trailing row when the stream ends without a terminator.
    fn finish(&mut self) -> Option<SplitEvent> {
        if self.skipping {
            self.skipping = false;
            return None;
        }
        self.in_quotes = false;
        let record = std::mem::take(&mut self.partial);
        self.complete(record)
    }

    fn complete(&mut self, record: Vec<u8>) -> Option<SplitEvent> {
        let mut record = record.as_slice();
        if self.at_stream_start {
            self.at_stream_start = false;
            record = record.strip_prefix(UTF8_BOM).unwrap_or(record);
        }
        let record = record.strip_suffix(b"\r").unwrap_or(record);
        if record.trim().is_empty() {
            return None;
        }
        self.records += 1;
        Some(SplitEvent::Row {
            row: self.records,
            fields: parse_fields(record),
        })
    }
}

fn parse_fields(record: &[u8]) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = Vec::new();
    let mut in_quotes = false;
    let mut bytes = record.iter().copied().peekable();
    while let Some(byte) = bytes.next() {
        if in_quotes {
            match byte {
                b'"' if bytes.peek() == Some(&b'"') => {
                    bytes.next();
                    field.push(b'"');
                }
                b'"' => in_quotes = false,
                _ => field.push(byte),
            }
            continue;
        }
        match byte {
            b'"' => in_quotes = true,
            b',' => fields.push(take_field(&mut field)),
            _ => field.push(byte),
        }
    }
    fields.push(take_field(&mut field));
    fields
}

fn take_field(field: &mut Vec<u8>) -> String {
    let text = field.to_str_lossy().into_owned();
    field.clear();
    text
}

#[derive(Default)]
struct Columns {
    id: Option<usize>,
    name: Option<usize>,
    email: Option<usize>,
    age: Option<usize>,
}

impl Columns {
    fn from_header(fields: &[String]) -> Self {
        let mut columns = Self::default();
        for (index, name) in fields.iter().enumerate() {
            let slot = match name.trim().to_ascii_lowercase().as_str() {
                "id" => &mut columns.id,
                "name" => &mut columns.name,
                "email" => &mut columns.email,
                "age" => &mut columns.age,
                _ => continue,
            };
            slot.get_or_insert(index);
        }
        columns
    }

    fn get<'a>(&self, column: Option<usize>, fields: &'a [String]) -> &'a str {
        column
            .and_then(|index| fields.get(index))
            .map(|field| field.trim())
            .unwrap_or("")
    }

    fn parse(&self, fields: &[String]) -> Result<IngestRow, String> {
        let name = self.get(self.name, fields);
        if name.is_empty() {
            return Err("missing name".to_string());
        }
        let email = self.get(self.email, fields);
        if email.is_empty() {
            return Err("missing email".to_string());
        }
        Ok(IngestRow {
            id: parse_optional_int("id", self.get(self.id, fields))?,
            name: name.to_string(),
            email: email.to_string(),
            age: parse_optional_int("age", self.get(self.age, fields))?,
        })
    }
}

fn parse_optional_int(column: &str, text: &str) -> Result<Option<i64>, String> {
    if text.is_empty() {
        return Ok(None);
    }
    text.parse()
        .map(Some)
        .map_err(|_| format!("{column} is not an integer: {text:?}"))
}

/// Column mapping taken from the first record.
enum Header {
    Mapped(Columns),
    /// The first record overflowed the row limit; no data row can be mapped.
    Unreadable,
}

/// Drives parsed rows into a store, one insert per valid row.
pub struct RowIngestor<S> {
    store: S,
    config: IngestConfig,
    splitter: RowSplitter,
    header: Option<Header>,
    outcome: IngestOutcome,
}

impl<S: RecordStore> RowIngestor<S> {
    pub fn new(store: S, config: IngestConfig) -> Self {
        Self {
            store,
            splitter: RowSplitter::new(config.max_row_bytes),
            config,
            header: None,
            outcome: IngestOutcome::default(),
        }
    }

    pub async fn push(&mut self, chunk: &[u8]) {
        for event in self.splitter.push(chunk) {
            self.handle(event).await;
        }
    }

    /// Flushes the trailing row and returns the totals so far.
    pub async fn finish(&mut self) -> &IngestOutcome {
        if let Some(event) = self.splitter.finish() {
            self.handle(event).await;
        }
        &self.outcome
    }

    pub fn outcome(&self) -> &IngestOutcome {
        &self.outcome
    }

    pub fn into_outcome(self) -> IngestOutcome {
        self.outcome
    }

    async fn handle(&mut self, event: SplitEvent) {
        match event {
            SplitEvent::Oversize { row } if self.header.is_none() => {
                let message = format!("header exceeds {} bytes", self.config.max_row_bytes);
                tracing::warn!(row, reason = %message, "unreadable header");
                self.note_failure(row, ErrorKind::RowRejected, message);
                self.header = Some(Header::Unreadable);
            }
            SplitEvent::Oversize { row } => {
                self.outcome.rows += 1;
                let message = format!("row exceeds {} bytes", self.config.max_row_bytes);
                self.reject(row, message);
            }
            SplitEvent::Row { row, fields } => {
                let Some(header) = &self.header else {
                    self.header = Some(Header::Mapped(Columns::from_header(&fields)));
                    return;
                };
                self.outcome.rows += 1;
                let parsed = match header {
                    Header::Mapped(columns) => columns.parse(&fields),
                    Header::Unreadable => Err("header row is unreadable".to_string()),
                };
                match parsed {
                    Ok(record) => self.insert(row, record).await,
                    Err(message) => self.reject(row, message),
                }
            }
        }
    }

    async fn insert(&mut self, row: u64, record: IngestRow) {
        match self.store.insert_if_absent(record).await {
            Ok(InsertOutcome::Inserted) => self.outcome.inserted += 1,
            Ok(InsertOutcome::Ignored) => self.outcome.ignored += 1,
            Err(err) => {
                tracing::error!(row, error = %err, "row insert failed");
                self.outcome.failed += 1;
                self.note_failure(row, err.kind(), err.to_string());
            }
        }
    }

    fn reject(&mut self, row: u64, message: String) {
        tracing::warn!(row, reason = %message, "rejected row");
        self.outcome.rejected += 1;
        self.note_failure(row, ErrorKind::RowRejected, message);
    }

    fn note_failure(&mut self, row: u64, kind: ErrorKind, message: String) {
        if self.outcome.failures.len() < self.config.max_reported_failures {
            self.outcome.failures.push(IngestFailure {
                row,
                kind: format!("{kind:?}"),
                message,
            });
        }
    }
}

/// Pipeline sink feeding a `RowIngestor`.
pub struct IngestSink<S> {
    ingestor: RowIngestor<S>,
}

impl<S: RecordStore> IngestSink<S> {
    pub fn new(store: S, config: IngestConfig) -> Self {
        Self {
            ingestor: RowIngestor::new(store, config),
        }
    }

    pub fn outcome(&self) -> &IngestOutcome {
        self.ingestor.outcome()
    }

    pub fn into_outcome(self) -> IngestOutcome {
        self.ingestor.into_outcome()
    }
}

impl<S: RecordStore> Sink for IngestSink<S> {
    async fn accept(&mut self, chunk: Bytes) -> Result<(), Error> {
        self.ingestor.push(&chunk).await;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), Error> {
        self.ingestor.finish().await;
        Ok(())
    }

    async fn abort(&mut self, err: &Error) {
        let outcome = self.ingestor.outcome();
        tracing::warn!(
            error = %err,
            rows = outcome.rows,
            inserted = outcome.inserted,
            "ingestion aborted"
        );
    }
}
