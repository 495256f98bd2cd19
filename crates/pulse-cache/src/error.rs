use thiserror::Error;

pub type CacheResult<T> = Result<T, CacheError>;

/// Cache failures. None of these reach an API caller.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("failed to encode cache entry: {0}")]
    Encode(String),

    #[error("failed to decode cache entry: {0}")]
    Decode(String),
}
