//! Error types shared across the archiver.
//!
//! The taxonomy follows the propagation policy of the data plane: ring
//! buffer conditions are converted to stream events and never appear here;
//! disk-writer failures are fatal and abort the process; everything a
//! command caller can trigger (bad mask, bad timestamp, query outside the
//! archive) is a descriptive, recoverable variant of [`FaError`].

use thiserror::Error;

/// Result alias used throughout the archiver crates.
pub type Result<T> = std::result::Result<T, FaError>;

/// Errors surfaced to callers of the archiver data plane.
#[derive(Error, Debug)]
pub enum FaError {
    /// I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The archive file failed structural validation.
    #[error("Invalid archive header: {0}")]
    InvalidHeader(String),

    /// The archive is already locked by another archiver process.
    #[error("Unable to lock archive '{path}' for writing: already running?")]
    ArchiveLocked { path: String },

    /// A command string could not be parsed.
    #[error("Error parsing {what}: {message} at offset {offset} in \"{input}\"")]
    Parse {
        what: &'static str,
        message: String,
        offset: usize,
        input: String,
    },

    /// A requested BPM id is not captured by this archive.
    #[error("BPM {id} not in archive")]
    NotInArchive { id: usize },

    /// The queried timestamp predates the oldest data held in the archive.
    #[error("Timestamp before start of archive")]
    TooEarly,

    /// The queried timestamp falls in the block currently being filled.
    #[error("Timestamp too late for archive")]
    TooLate,

    /// Fewer samples are available than were requested.
    #[error("Only {available} samples of {requested} requested available")]
    NotEnoughSamples { available: u64, requested: u64 },

    /// All historical-read buffers are in use.
    #[error("Read too busy")]
    ReadBusy,

    /// Configuration failed to load or validate.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl FaError {
    /// Builds a parse error positioned within the offending input.
    pub fn parse(what: &'static str, message: impl Into<String>, input: &str, rest: &str) -> Self {
        FaError::Parse {
            what,
            message: message.into(),
            offset: input.len().saturating_sub(rest.len()),
            input: input.to_string(),
        }
    }

    /// True for the recoverable query-range errors, which a server reports
    /// to the caller rather than logging as faults.
    pub fn is_query_range(&self) -> bool {
        matches!(self, FaError::TooEarly | FaError::TooLate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_reports_offset() {
        let input = "R?nonsense";
        let err = FaError::parse("read request", "Invalid source specification", input, &input[1..]);
        let text = err.to_string();
        assert!(text.contains("offset 1"));
        assert!(text.contains("read request"));
    }

    #[test]
    fn parse_error_offset_clamps_when_rest_is_not_a_suffix() {
        // Timestamp parsing reports errors against the sub-field text, which
        // can be longer than the context string it is reported under.
        let err = FaError::parse("timestamp", "Bad fraction", "q", "1.x");
        assert!(err.to_string().contains("offset 0"));
    }

    #[test]
    fn query_range_classification() {
        assert!(FaError::TooEarly.is_query_range());
        assert!(FaError::TooLate.is_query_range());
        assert!(!FaError::ReadBusy.is_query_range());
    }
}
