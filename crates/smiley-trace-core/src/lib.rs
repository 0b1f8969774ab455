#![forbid(unsafe_code)]

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

mod ser;
mod value;

pub use value::{Locals, TraceValue, MAX_NESTING_DEPTH};

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("non-finite number {value} cannot be encoded")]
    NonFiniteNumber { value: f64 },
    #[error("integer {0} is outside the encodable i64 range")]
    IntegerOutOfRange(String),
    #[error("mapping keys must be strings, got {0}")]
    UnsupportedKey(String),
    #[error("value nests deeper than {limit} levels")]
    NestingTooDeep { limit: usize },
    #[error("value cannot be encoded: {0}")]
    Unrepresentable(String),
    #[error("failed to write encoded text: {0}")]
    Json(#[from] serde_json::Error),
}

impl serde::ser::Error for EncodeError {
    fn custom<T: Display>(msg: T) -> Self {
        Self::Unrepresentable(msg.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid encoded trace value: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TimestampError {
    #[error("failed to format RFC3339 timestamp: {0}")]
    Format(String),
    #[error("invalid RFC3339 timestamp: {0}")]
    Parse(String),
    #[error("timestamp MUST use UTC offset Z")]
    NotUtc,
}

/// Encodes a trace value as compact JSON text.
///
/// Mapping keys come out sorted, so equal values always produce identical
/// text.
///
/// # Errors
/// Returns [`EncodeError::NonFiniteNumber`] if the value holds a NaN or an
/// infinity anywhere inside it, and [`EncodeError::NestingTooDeep`] if it
/// nests deeper than [`MAX_NESTING_DEPTH`].
pub fn encode(value: &TraceValue) -> Result<String, EncodeError> {
    value.ensure_representable()?;
    Ok(serde_json::to_string(value)?)
}

/// Encodes a locals mapping; the result decodes to a [`TraceValue::Map`].
///
/// # Errors
/// Same conditions as [`encode`]. The mapping itself counts as one level of
/// nesting.
pub fn encode_locals(locals: &Locals) -> Result<String, EncodeError> {
    locals
        .values()
        .try_for_each(|value| value.check_representable(1))?;
    Ok(serde_json::to_string(locals)?)
}

/// Encodes an optional value, with absence stored as `null`.
///
/// # Errors
/// Same conditions as [`encode`].
pub fn encode_optional(value: Option<&TraceValue>) -> Result<String, EncodeError> {
    match value {
        Some(inner) => encode(inner),
        None => encode(&TraceValue::Null),
    }
}

/// Parses text produced by [`encode`] back into a trace value.
///
/// # Errors
/// Returns [`DecodeError`] for text that is not a valid encoding.
pub fn decode(text: &str) -> Result<TraceValue, DecodeError> {
    Ok(serde_json::from_str(text)?)
}

/// The label the tracer attaches to each recorded step. Labels outside this
/// set are rejected when read back.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Call,
    Line,
    Return,
    Exception,
    CCall,
    CReturn,
    CException,
    Opcode,
}

impl EventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Line => "line",
            Self::Return => "return",
            Self::Exception => "exception",
            Self::CCall => "c_call",
            Self::CReturn => "c_return",
            Self::CException => "c_exception",
            Self::Opcode => "opcode",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "call" => Some(Self::Call),
            "line" => Some(Self::Line),
            "return" => Some(Self::Return),
            "exception" => Some(Self::Exception),
            "c_call" => Some(Self::CCall),
            "c_return" => Some(Self::CReturn),
            "c_exception" => Some(Self::CException),
            "opcode" => Some(Self::Opcode),
            _ => None,
        }
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A run as stored, with its traceback decoded.
///
/// `end_time` is `None` while the run is still open. Once ended, `traceback`
/// holds whatever the tracer passed, which is `Some(TraceValue::Null)` when no
/// failure detail was supplied.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub id: String,
    pub cwd: String,
    pub description: String,
    pub start_time: OffsetDateTime,
    pub end_time: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    pub traceback: Option<TraceValue>,
}

impl RunRecord {
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceEventRecord {
    pub event_seq: i64,
    pub run_id: String,
    pub event: EventKind,
    pub func_name: String,
    pub line_no: u32,
    pub filename: String,
    pub trace_arg: TraceValue,
    pub locals: Locals,
    pub timestamp: OffsetDateTime,
}

/// One step reported by the tracer, borrowed for the duration of the write.
#[derive(Debug, Clone, Copy)]
pub struct NewTraceEvent<'a> {
    pub run_id: &'a str,
    pub event: EventKind,
    pub func_name: &'a str,
    pub line_no: u32,
    pub filename: &'a str,
    pub trace_arg: &'a TraceValue,
    pub locals: &'a Locals,
    pub timestamp: OffsetDateTime,
}

/// Persistence seam between the tracer and a backing store.
///
/// Write operations are all-or-nothing: on error nothing from that call is
/// visible to later reads.
pub trait TraceRecorder {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Records the beginning of a run. `run_id` must not have been used before.
    ///
    /// # Errors
    /// Fails if `run_id` already exists or the store cannot be written.
    fn start_run(
        &mut self,
        run_id: &str,
        cwd: &str,
        description: &str,
        start_time: OffsetDateTime,
    ) -> Result<(), Self::Error>;

    /// Records the end of a run. A `run_id` that matches no run is ignored.
    ///
    /// # Errors
    /// Fails if `traceback` cannot be encoded or the store cannot be written.
    fn end_run(
        &mut self,
        run_id: &str,
        end_time: OffsetDateTime,
        message: &str,
        traceback: Option<&TraceValue>,
    ) -> Result<(), Self::Error>;

    /// Records one event and returns its insertion sequence number.
    ///
    /// # Errors
    /// Fails if the payloads cannot be encoded or the store cannot be written.
    fn trace(&mut self, event: &NewTraceEvent<'_>) -> Result<i64, Self::Error>;

    #[allow(clippy::missing_errors_doc)]
    fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, Self::Error>;

    #[allow(clippy::missing_errors_doc)]
    fn list_runs(&self) -> Result<Vec<RunRecord>, Self::Error>;

    #[allow(clippy::missing_errors_doc)]
    fn list_trace_events(&self, run_id: &str) -> Result<Vec<TraceEventRecord>, Self::Error>;
}

/// Parses an RFC3339 timestamp, requiring the UTC `Z` offset.
///
/// # Errors
/// Returns [`TimestampError`] for malformed or non-UTC input.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, TimestampError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| TimestampError::Parse(err.to_string()))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(TimestampError::NotUtc);
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`TimestampError::Format`] when the value cannot be represented.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, TimestampError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| TimestampError::Format(err.to_string()))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
