//! Error types for the content cache server

use std::fmt;

#[derive(Debug)]
pub enum CacheServerError {
    Cache(content_blob_cache::CacheError),
    Io(Box<std::io::Error>),
    Config(String),
}

impl fmt::Display for CacheServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheServerError::Cache(err) => write!(f, "Cache error: {}", err),
            CacheServerError::Io(err) => write!(f, "IO error: {}", err),
            CacheServerError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for CacheServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheServerError::Cache(err) => Some(err),
            CacheServerError::Io(err) => Some(err.as_ref()),
            CacheServerError::Config(_) => None,
        }
    }
}

impl From<content_blob_cache::CacheError> for CacheServerError {
    fn from(err: content_blob_cache::CacheError) -> Self {
        CacheServerError::Cache(err)
    }
}

impl From<std::io::Error> for CacheServerError {
    fn from(err: std::io::Error) -> Self {
        CacheServerError::Io(Box::new(err))
    }
}

impl From<tracing_subscriber::filter::ParseError> for CacheServerError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        CacheServerError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheServerError>;
