use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid mission state: {0}")]
    InvalidState(String),
    #[error("mission not found: {0}")]
    NotFound(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("snapshot codec error: {0}")]
    Codec(String),
    #[error("mission registry used before registration")]
    NotRegistered,
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Terminal failure recorded on a mission and persisted with its snapshot.
#[derive(Error, Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    #[error("server did not report a usable content length")]
    LengthUnsupported,
    #[error("remote resource not found")]
    NotFound,
    #[error("not enough free space for the download")]
    NoSpace,
    #[error("download failed")]
    Unknown,
}

impl ErrorCode {
    /// Numeric sentinel handed to listeners.
    pub fn code(&self) -> i32 {
        match self {
            ErrorCode::LengthUnsupported => 206,
            ErrorCode::NotFound => 404,
            ErrorCode::NoSpace => 1000,
            ErrorCode::Unknown => 233,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            206 => Some(ErrorCode::LengthUnsupported),
            404 => Some(ErrorCode::NotFound),
            1000 => Some(ErrorCode::NoSpace),
            233 => Some(ErrorCode::Unknown),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_map_both_ways() {
        for code in [
            ErrorCode::LengthUnsupported,
            ErrorCode::NotFound,
            ErrorCode::NoSpace,
            ErrorCode::Unknown,
        ] {
            assert_eq!(ErrorCode::from_code(code.code()), Some(code));
        }
        assert_eq!(ErrorCode::from_code(-1), None);
    }
}
