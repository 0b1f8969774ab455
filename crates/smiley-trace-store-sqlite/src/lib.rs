#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction};
use serde::Deserialize;
use smiley_trace_core::{
    decode, encode, encode_locals, encode_optional, format_rfc3339, parse_rfc3339_utc,
    DecodeError, EncodeError, EventKind, Locals, NewTraceEvent, RunRecord, TimestampError,
    TraceEventRecord, TraceRecorder, TraceValue,
};
use time::OffsetDateTime;
use tracing::{debug, warn};

const SCHEMA_TABLES: [&str; 2] = ["run", "trace"];

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS run (
  id TEXT PRIMARY KEY,
  cwd TEXT NOT NULL,
  description TEXT NOT NULL,
  start_time TEXT NOT NULL,
  end_time TEXT,
  error_message TEXT,
  traceback TEXT
);

CREATE TABLE IF NOT EXISTS trace (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL REFERENCES run(id),
  event TEXT NOT NULL,
  func_name TEXT NOT NULL,
  line_no INTEGER NOT NULL CHECK (line_no >= 0),
  filename TEXT NOT NULL,
  trace_arg TEXT NOT NULL,
  locals TEXT NOT NULL,
  timestamp TEXT NOT NULL
);
";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to open trace database at {}: {source}", .path.display())]
    Connection {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("{context}: {source}")]
    Constraint {
        context: &'static str,
        source: rusqlite::Error,
    },
    #[error(transparent)]
    Encoding(#[from] EncodeError),
    #[error("failed to decode stored {column}: {source}")]
    Decoding {
        column: &'static str,
        source: DecodeError,
    },
    #[error("invalid stored data: {0}")]
    InvalidData(String),
    #[error(transparent)]
    Timestamp(#[from] TimestampError),
    #[error("{context}: {source}")]
    Storage {
        context: &'static str,
        source: rusqlite::Error,
    },
}

impl StoreError {
    #[must_use]
    pub fn is_constraint(&self) -> bool {
        matches!(self, Self::Constraint { .. })
    }

    #[must_use]
    pub fn is_encoding(&self) -> bool {
        matches!(self, Self::Encoding(_))
    }
}

trait StorageContext<T> {
    fn context(self, context: &'static str) -> Result<T, StoreError>;
}

impl<T> StorageContext<T> for rusqlite::Result<T> {
    fn context(self, context: &'static str) -> Result<T, StoreError> {
        self.map_err(|source| match &source {
            rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
                StoreError::Constraint { context, source }
            }
            _ => StoreError::Storage { context, source },
        })
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum JournalMode {
    #[default]
    Wal,
    Delete,
    Memory,
}

impl JournalMode {
    #[must_use]
    pub fn as_pragma(self) -> &'static str {
        match self {
            Self::Wal => "WAL",
            Self::Delete => "DELETE",
            Self::Memory => "MEMORY",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Synchronous {
    #[default]
    Normal,
    Full,
}

impl Synchronous {
    #[must_use]
    pub fn as_pragma(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Full => "FULL",
        }
    }
}

/// Connection settings applied when the recorder opens its database.
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RecorderOptions {
    pub journal_mode: JournalMode,
    pub busy_timeout_ms: u32,
    pub synchronous: Synchronous,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        Self {
            journal_mode: JournalMode::Wal,
            busy_timeout_ms: 5000,
            synchronous: Synchronous::Normal,
        }
    }
}

impl RecorderOptions {
    fn pragmas(&self) -> String {
        // trace.run_id references stay a caller contract, so foreign keys are off.
        format!(
            "PRAGMA journal_mode = {};
             PRAGMA synchronous = {};
             PRAGMA busy_timeout = {};
             PRAGMA foreign_keys = OFF;",
            self.journal_mode.as_pragma(),
            self.synchronous.as_pragma(),
            self.busy_timeout_ms,
        )
    }
}

/// `SQLite`-backed recorder for runs and their trace events.
///
/// Holds one connection for its whole lifetime. Writes take `&mut self`, so
/// sharing a recorder between threads needs an outer lock.
pub struct SqliteRecorder {
    conn: Connection,
}

impl SqliteRecorder {
    /// Open or create a trace database with default options.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or configured, or if
    /// creating the schema fails.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with_options(path, &RecorderOptions::default())
    }

    /// Open or create a trace database, apply `options`, and make sure the
    /// schema exists.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or configured, or if
    /// creating the schema fails.
    pub fn open_with_options(path: &Path, options: &RecorderOptions) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|source| StoreError::Connection {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_connection(conn, path, options)
    }

    /// Open a private in-memory trace database.
    ///
    /// # Errors
    /// Returns an error if `SQLite` cannot allocate the database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let path = Path::new(":memory:");
        let conn = Connection::open_in_memory().map_err(|source| StoreError::Connection {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_connection(conn, path, &RecorderOptions::default())
    }

    fn from_connection(
        conn: Connection,
        path: &Path,
        options: &RecorderOptions,
    ) -> Result<Self, StoreError> {
        conn.execute_batch(&options.pragmas())
            .map_err(|source| StoreError::Connection {
                path: path.to_path_buf(),
                source,
            })?;

        let mut recorder = Self { conn };
        recorder.ensure_schema()?;
        debug!(path = %path.display(), "trace database ready");
        Ok(recorder)
    }

    /// Creates the `run` and `trace` tables unless both are already present.
    ///
    /// Presence is read from `sqlite_master`; a failed lookup is returned as
    /// an error rather than taken to mean the schema is missing.
    ///
    /// # Errors
    /// Returns an error if the catalog lookup or the bootstrap script fails.
    pub fn ensure_schema(&mut self) -> Result<(), StoreError> {
        let mut missing = Vec::new();
        for table in SCHEMA_TABLES {
            if !table_exists(&self.conn, table)? {
                missing.push(table);
            }
        }

        if missing.is_empty() {
            debug!("database already initialized");
            return Ok(());
        }

        debug!(missing = ?missing, "initializing database");
        self.in_transaction("ensure_schema", |tx| {
            tx.execute_batch(SCHEMA_V1)
                .context("failed to apply trace schema")
        })
    }

    /// Runs `op` inside a transaction on the held connection.
    ///
    /// Commits when `op` returns `Ok`. On `Err` the transaction is dropped,
    /// which rolls it back, and the error is returned unchanged.
    fn in_transaction<T, F>(&mut self, operation: &'static str, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    {
        let tx = self
            .conn
            .transaction()
            .context("failed to start transaction")?;

        match op(&tx) {
            Ok(value) => {
                tx.commit().context("failed to commit transaction")?;
                Ok(value)
            }
            Err(err) => {
                warn!(operation, error = %err, "rolling back transaction");
                drop(tx);
                Err(err)
            }
        }
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl TraceRecorder for SqliteRecorder {
    type Error = StoreError;

    fn start_run(
        &mut self,
        run_id: &str,
        cwd: &str,
        description: &str,
        start_time: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let start_time = format_rfc3339(start_time)?;

        self.in_transaction("start_run", |tx| {
            tx.execute(
                "INSERT INTO run (id, cwd, description, start_time)
                 VALUES (?1, ?2, ?3, ?4)",
                params![run_id, cwd, description, start_time],
            )
            .context("failed to insert run")?;
            Ok(())
        })?;

        debug!(run_id, "run started");
        Ok(())
    }

    fn end_run(
        &mut self,
        run_id: &str,
        end_time: OffsetDateTime,
        message: &str,
        traceback: Option<&TraceValue>,
    ) -> Result<(), StoreError> {
        let traceback = encode_optional(traceback)?;
        let end_time = format_rfc3339(end_time)?;

        let updated = self.in_transaction("end_run", |tx| {
            tx.execute(
                "UPDATE run
                 SET end_time = ?2, error_message = ?3, traceback = ?4
                 WHERE id = ?1",
                params![run_id, end_time, message, traceback],
            )
            .context("failed to update run")
        })?;

        if updated == 0 {
            debug!(run_id, "end_run matched no run");
        } else {
            debug!(run_id, "run ended");
        }
        Ok(())
    }

    fn trace(&mut self, event: &NewTraceEvent<'_>) -> Result<i64, StoreError> {
        let trace_arg = encode(event.trace_arg)?;
        let locals = encode_locals(event.locals)?;
        let timestamp = format_rfc3339(event.timestamp)?;

        let event_seq = self.in_transaction("trace", |tx| {
            tx.execute(
                "INSERT INTO trace (
                    run_id, event, func_name, line_no, filename,
                    trace_arg, locals, timestamp
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    event.run_id,
                    event.event.as_str(),
                    event.func_name,
                    i64::from(event.line_no),
                    event.filename,
                    trace_arg,
                    locals,
                    timestamp,
                ],
            )
            .context("failed to insert trace event")?;
            Ok(tx.last_insert_rowid())
        })?;

        tracing::trace!(
            run_id = event.run_id,
            event_seq,
            event = %event.event,
            line_no = event.line_no,
            "trace event recorded"
        );
        Ok(event_seq)
    }

    fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, cwd, description, start_time, end_time, error_message, traceback
                 FROM run
                 WHERE id = ?1",
            )
            .context("failed to prepare run lookup")?;

        stmt.query_row(params![run_id], StoredRun::from_row)
            .optional()
            .context("failed to load run")?
            .map(StoredRun::into_record)
            .transpose()
    }

    fn list_runs(&self) -> Result<Vec<RunRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, cwd, description, start_time, end_time, error_message, traceback
                 FROM run
                 ORDER BY rowid ASC",
            )
            .context("failed to prepare run listing")?;

        let rows = stmt
            .query_map([], StoredRun::from_row)
            .context("failed to list runs")?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("failed to read run row")?.into_record()?);
        }

        // Stored RFC3339 text does not sort chronologically once fractional
        // seconds vary in width.
        runs.sort_by(|lhs, rhs| {
            lhs.start_time
                .cmp(&rhs.start_time)
                .then_with(|| lhs.id.cmp(&rhs.id))
        });
        Ok(runs)
    }

    fn list_trace_events(&self, run_id: &str) -> Result<Vec<TraceEventRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT
                    event_seq, run_id, event, func_name, line_no, filename,
                    trace_arg, locals, timestamp
                 FROM trace
                 WHERE run_id = ?1
                 ORDER BY event_seq ASC",
            )
            .context("failed to prepare trace listing")?;

        let mut rows = stmt
            .query(params![run_id])
            .context("failed to list trace events")?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().context("failed to read trace row")? {
            let event: String = row.get(2).context("failed to read trace.event")?;
            let line_no: i64 = row.get(4).context("failed to read trace.line_no")?;
            let trace_arg: String = row.get(6).context("failed to read trace.trace_arg")?;
            let locals: String = row.get(7).context("failed to read trace.locals")?;
            let timestamp: String = row.get(8).context("failed to read trace.timestamp")?;

            out.push(TraceEventRecord {
                event_seq: row.get(0).context("failed to read trace.event_seq")?,
                run_id: row.get(1).context("failed to read trace.run_id")?,
                event: EventKind::parse(&event).ok_or_else(|| {
                    StoreError::InvalidData(format!("unknown trace event kind: {event}"))
                })?,
                func_name: row.get(3).context("failed to read trace.func_name")?,
                line_no: u32::try_from(line_no)
                    .map_err(|_| StoreError::InvalidData(format!("invalid line_no: {line_no}")))?,
                filename: row.get(5).context("failed to read trace.filename")?,
                trace_arg: decode_column("trace.trace_arg", &trace_arg)?,
                locals: decode_locals(&locals)?,
                timestamp: parse_rfc3339_utc(&timestamp)?,
            });
        }

        Ok(out)
    }
}

struct StoredRun {
    id: String,
    cwd: String,
    description: String,
    start_time: String,
    end_time: Option<String>,
    error_message: Option<String>,
    traceback: Option<String>,
}

impl StoredRun {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            cwd: row.get(1)?,
            description: row.get(2)?,
            start_time: row.get(3)?,
            end_time: row.get(4)?,
            error_message: row.get(5)?,
            traceback: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<RunRecord, StoreError> {
        Ok(RunRecord {
            id: self.id,
            cwd: self.cwd,
            description: self.description,
            start_time: parse_rfc3339_utc(&self.start_time)?,
            end_time: self
                .end_time
                .map(|value| parse_rfc3339_utc(&value))
                .transpose()?,
            error_message: self.error_message,
            traceback: self
                .traceback
                .map(|value| decode_column("run.traceback", &value))
                .transpose()?,
        })
    }
}

fn decode_column(column: &'static str, text: &str) -> Result<TraceValue, StoreError> {
    decode(text).map_err(|source| StoreError::Decoding { column, source })
}

fn decode_locals(text: &str) -> Result<Locals, StoreError> {
    match decode_column("trace.locals", text)? {
        TraceValue::Map(locals) => Ok(locals),
        other => Err(StoreError::InvalidData(format!(
            "trace.locals must be a mapping, found {}",
            other.kind()
        ))),
    }
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool, StoreError> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}
