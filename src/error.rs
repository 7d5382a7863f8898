use std::path::PathBuf;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("block hash table was never allocated (job has no blocks)"))]
    HashTableNotAllocated,

    #[snafu(display("checksum stream ended before all {blocks} block records were read"))]
    InvalidChecksumStream { blocks: usize },

    #[snafu(display("cannot open checksum stream {}: {source}", path.display()))]
    ChecksumStreamOpenFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("read error on checksum stream: {source}"))]
    ChecksumStreamReadFailed { source: std::io::Error },

    #[snafu(display("seed file not found: {}", path.display()))]
    SeedNotFound { path: PathBuf },

    #[snafu(display("no permission to read seed file: {}", path.display()))]
    SeedNotReadable { path: PathBuf },

    #[snafu(display("cannot open seed file {}: {source}", path.display()))]
    SeedOpenFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("job aborted by caller"))]
    Aborted,

    #[snafu(display("write error on target file: {source}"))]
    TargetWriteFailed { source: std::io::Error },

    #[snafu(display("read error on seed file: {source}"))]
    SeedReadFailed { source: std::io::Error },

    #[snafu(display("invalid job parameters: {reason}"))]
    InvalidParameters { reason: String },
}

impl Error {
    // Stable numeric codes; 0 is reserved for success.
    pub fn code(&self) -> i16 {
        match self {
            Error::HashTableNotAllocated => 1,
            Error::InvalidChecksumStream { .. } => 2,
            Error::ChecksumStreamOpenFailed { .. } => 3,
            Error::ChecksumStreamReadFailed { .. } => 4,
            Error::SeedNotFound { .. } => 5,
            Error::SeedNotReadable { .. } => 6,
            Error::SeedOpenFailed { .. } => 7,
            Error::Aborted => 8,
            Error::TargetWriteFailed { .. } => 9,
            Error::SeedReadFailed { .. } => 10,
            Error::InvalidParameters { .. } => 11,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
