//! Error types for anticipy.
//!
//! Validation errors are raised immediately and never retried. Remote
//! failures abort the whole batch they belong to. An existing output that
//! does not need recomputing is not an error at all: it is skipped by
//! [`crate::datasource::check_file_existence`].

use std::path::PathBuf;

/// Result type for anticipy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the calendar, planner, engine, reducer and ledger.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A start date that falls after the end date.
    #[error("start date {start} must be earlier than end date {end}")]
    InvalidDateRange {
        /// Requested start.
        start: String,
        /// Requested end.
        end: String,
    },

    /// A date string that is not a valid ISO-8601 calendar date.
    #[error("invalid date {input:?}: expected YYYY-MM-DD")]
    InvalidDate {
        /// Raw user input.
        input: String,
    },

    /// A (year, period) pair outside the dekadal calendar.
    #[error("invalid dekad ({year}, {period}): {reason}")]
    InvalidDekad {
        /// Year component.
        year: i32,
        /// Period component.
        period: i64,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// Bounding box coordinates outside the globe or inverted.
    #[error("invalid bounding box: {0}")]
    InvalidBoundingBox(String),

    /// A lead time the product cannot serve.
    #[error("invalid lead time {0}: must be at least one day")]
    InvalidLeadtime(u32),

    /// A month filter value outside 1 to 12.
    #[error("invalid month {0}: must be between 1 and 12")]
    InvalidMonth(u32),

    /// A reporting point on or outside the raster's coordinate bounds.
    #[error(
        "reporting point {name} has out-of-bounds {axis} value of {value} \
         (data {axis} ranges from {min} to {max})"
    )]
    PointOutOfBounds {
        /// Point name.
        name: String,
        /// `lon` or `lat`.
        axis: &'static str,
        /// Offending coordinate.
        value: f64,
        /// Lower raster bound.
        min: f64,
        /// Upper raster bound.
        max: f64,
    },

    /// The country configuration lists no reporting points.
    #[error("country configuration for {iso3} has no GloFAS reporting points")]
    MissingReportingPoints {
        /// Country code.
        iso3: String,
    },

    /// Required configuration is missing or malformed.
    #[error("configuration error: {0}")]
    Config(String),

    /// The remote service reported a failed request.
    #[error("query {request_id} for {} has failed, try again", output_path.display())]
    ServiceFailure {
        /// Remote request identifier.
        request_id: String,
        /// Output the request was meant to produce.
        output_path: PathBuf,
    },

    /// The remote service replied with something we cannot interpret.
    #[error("unexpected service reply: {0}")]
    Service(String),

    /// A processed ledger whose columns differ from the expected schema.
    #[error("processed ledger columns {found:?} do not match expected {expected:?}; rerun with overwrite")]
    SchemaDrift {
        /// Columns the processor produces.
        expected: Vec<String>,
        /// Columns found on disk.
        found: Vec<String>,
    },

    /// A raster that lacks a required dimension or variable.
    #[error("malformed raster: {0}")]
    Raster(String),

    /// The batch was cancelled before every request completed.
    #[error("retrieval cancelled with {pending} request(s) outstanding")]
    Cancelled {
        /// Requests still active when cancellation arrived.
        pending: usize,
    },

    /// Filesystem error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV (de)serialization error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl Error {
    /// Whether this error stems from caller input rather than the environment.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidDateRange { .. }
                | Error::InvalidDate { .. }
                | Error::InvalidDekad { .. }
                | Error::InvalidBoundingBox(_)
                | Error::InvalidLeadtime(_)
                | Error::InvalidMonth(_)
                | Error::PointOutOfBounds { .. }
                | Error::MissingReportingPoints { .. }
                | Error::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_out_of_bounds_message() {
        let err = Error::PointOutOfBounds {
            name: "station".to_string(),
            axis: "lon",
            value: 10.0,
            min: 0.0,
            max: 5.0,
        };

        assert_eq!(
            err.to_string(),
            "reporting point station has out-of-bounds lon value of 10 (data lon ranges from 0 to 5)"
        );
        assert!(err.is_validation());
    }

    #[test]
    fn test_service_failure_is_not_validation() {
        let err = Error::ServiceFailure {
            request_id: "abc".to_string(),
            output_path: PathBuf::from("/tmp/out.grib"),
        };

        assert!(!err.is_validation());
        assert!(err.to_string().contains("abc"));
    }
}
