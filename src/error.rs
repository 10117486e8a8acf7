// Error types for the assessment tracker library.
// Resolution and stagnation never fail; these cover boundary input and registry edits.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    /// Unit type text outside {Academic, Administrative}
    #[error("invalid unit type: {0:?} (expected \"Academic\" or \"Administrative\")")]
    InvalidUnitType(String),

    /// Report type text outside the three known report kinds
    #[error("invalid report type: {0:?}")]
    InvalidReportType(String),

    /// Extraction answer did not contain a parseable JSON object
    #[error("malformed extraction payload: {0}")]
    MalformedExtraction(String),

    #[error("unit not found: {0}")]
    UnitNotFound(String),

    #[error("unit already registered: {0}")]
    DuplicateUnit(String),
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;
