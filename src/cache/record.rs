//! Lock record format
//!
//! Each lock file holds a single line with four whitespace-separated fields:
//!
//! ```text
//! 1 <last-modified ticks> <length> <format>
//! ```
//!
//! Ticks are 100 ns intervals since the Unix epoch (UTC). The format field is
//! written as a name; numeric codes from older writers are still accepted.

use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::str::FromStr;

/// Schema tag written as the first field. Bump when the line format changes.
pub const SCHEMA_VERSION: &str = "1";

/// Number of fields in a well-formed record
pub const FIELD_COUNT: usize = 4;

const TICKS_PER_SECOND: i64 = 10_000_000;
const NANOS_PER_TICK: i64 = 100;

/// How an entry's content was stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageFormat {
    /// Raw bytes stored as a single file, no extraction attempted
    WrittenAsFile,
    /// Package extracted into the entry directory
    WrittenAsPackage,
    /// Extraction was attempted, the content was not a valid package
    InvalidPackageWrittenAsFile,
}

impl StorageFormat {
    /// Name written into the record
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WrittenAsFile => "WrittenAsFile",
            Self::WrittenAsPackage => "WrittenAsPackage",
            Self::InvalidPackageWrittenAsFile => "InvalidPackageWrittenAsFile",
        }
    }

    /// Legacy numeric code
    pub fn code(&self) -> u8 {
        match self {
            Self::WrittenAsFile => 0,
            Self::WrittenAsPackage => 1,
            Self::InvalidPackageWrittenAsFile => 2,
        }
    }

    /// Whether the entry directory holds a single raw file
    pub fn is_single_file(&self) -> bool {
        !matches!(self, Self::WrittenAsPackage)
    }
}

impl fmt::Display for StorageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageFormat {
    type Err = RecordDefect;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WrittenAsFile" | "0" => Ok(Self::WrittenAsFile),
            "WrittenAsPackage" | "1" => Ok(Self::WrittenAsPackage),
            "InvalidPackageWrittenAsFile" | "2" => Ok(Self::InvalidPackageWrittenAsFile),
            _ => Err(RecordDefect::BadField("format")),
        }
    }
}

/// Storage representation a caller asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestedFormat {
    /// Try to extract a package, falling back per configuration
    AsPackage,
    /// Store the raw bytes as one file
    AsFile,
}

impl RequestedFormat {
    /// Whether an entry stored as `stored` serves this request
    ///
    /// An invalid package serves every request: asking again for extraction
    /// would produce the same invalid result.
    pub fn is_served_by(&self, stored: StorageFormat) -> bool {
        match (self, stored) {
            (_, StorageFormat::InvalidPackageWrittenAsFile) => true,
            (Self::AsPackage, StorageFormat::WrittenAsPackage) => true,
            (Self::AsFile, StorageFormat::WrittenAsFile) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RequestedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AsPackage => write!(f, "package"),
            Self::AsFile => write!(f, "file"),
        }
    }
}

/// Why a lock record could not be used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordDefect {
    /// Zero bytes: the builder never finished
    Empty,
    /// First field isn't the current schema tag
    VersionMismatch,
    /// Wrong number of fields
    FieldCount(usize),
    /// A field didn't parse
    BadField(&'static str),
}

impl fmt::Display for RecordDefect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty lock record"),
            Self::VersionMismatch => write!(f, "lock record schema mismatch"),
            Self::FieldCount(n) => write!(f, "lock record has {} fields, expected {}", n, FIELD_COUNT),
            Self::BadField(name) => write!(f, "lock record field '{}' is malformed", name),
        }
    }
}

/// Freshness data reported by the resource source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceMetadata {
    /// When the source content last changed
    pub last_modified: DateTime<Utc>,
    /// Content length in bytes
    pub length: u64,
}

impl SourceMetadata {
    /// Create source metadata
    pub fn new(last_modified: DateTime<Utc>, length: u64) -> Self {
        Self {
            last_modified,
            length,
        }
    }

    /// Last-modified time as a record tick count
    pub fn ticks(&self) -> i64 {
        to_ticks(&self.last_modified)
    }
}

/// Parsed lock record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRecord {
    /// Source last-modified time in ticks
    pub last_modified_ticks: i64,
    /// Source length in bytes
    pub length: u64,
    /// How the entry was stored
    pub format: StorageFormat,
}

impl LockRecord {
    /// Record describing content built from `metadata`
    pub fn new(metadata: &SourceMetadata, format: StorageFormat) -> Self {
        Self {
            last_modified_ticks: metadata.ticks(),
            length: metadata.length,
            format,
        }
    }

    /// Parse the first line of a lock file
    pub fn parse(contents: &str) -> Result<Self, RecordDefect> {
        let line = contents.lines().next().unwrap_or("");
        let fields: Vec<&str> = line.split_whitespace().collect();

        match fields.first() {
            None => return Err(RecordDefect::Empty),
            Some(&tag) if tag != SCHEMA_VERSION => return Err(RecordDefect::VersionMismatch),
            Some(_) => {}
        }

        if fields.len() != FIELD_COUNT {
            return Err(RecordDefect::FieldCount(fields.len()));
        }

        let last_modified_ticks = fields[1]
            .parse()
            .map_err(|_| RecordDefect::BadField("last_modified"))?;
        let length = fields[2]
            .parse()
            .map_err(|_| RecordDefect::BadField("length"))?;
        let format = fields[3].parse()?;

        Ok(Self {
            last_modified_ticks,
            length,
            format,
        })
    }

    /// Render the record line, including the trailing newline
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {}\n",
            SCHEMA_VERSION, self.last_modified_ticks, self.length, self.format
        )
    }

    /// Whether the source still matches what this entry was built from
    pub fn matches_source(&self, metadata: &SourceMetadata) -> bool {
        self.last_modified_ticks == metadata.ticks() && self.length == metadata.length
    }

    /// Source last-modified time recovered from the tick count
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        from_ticks(self.last_modified_ticks)
    }
}

/// Convert a timestamp to ticks since the Unix epoch
///
/// Saturates outside the range ticks can represent (roughly years -27000 to
/// 31000).
pub fn to_ticks(time: &DateTime<Utc>) -> i64 {
    time.timestamp()
        .saturating_mul(TICKS_PER_SECOND)
        .saturating_add(i64::from(time.timestamp_subsec_nanos()) / NANOS_PER_TICK)
}

/// Convert ticks since the Unix epoch back to a timestamp
pub fn from_ticks(ticks: i64) -> Option<DateTime<Utc>> {
    let secs = ticks.div_euclid(TICKS_PER_SECOND);
    let nanos = ticks.rem_euclid(TICKS_PER_SECOND) * NANOS_PER_TICK;
    Utc.timestamp_opt(secs, nanos as u32).single()
}
