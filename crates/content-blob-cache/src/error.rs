//! Error types for the content blob cache

use std::fmt;

#[derive(Debug)]
pub enum CacheError {
    Io(Box<std::io::Error>),
    /// The reference graph could not be read; destruction must not proceed.
    ReferenceCheck(String),
    Store(String),
    Unsupported(String),
    Config(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Io(err) => write!(f, "IO error: {}", err),
            CacheError::ReferenceCheck(msg) => write!(f, "Reference check failed: {}", msg),
            CacheError::Store(msg) => write!(f, "Store error: {}", msg),
            CacheError::Unsupported(msg) => write!(f, "Unsupported operation: {}", msg),
            CacheError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
