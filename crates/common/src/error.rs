//! Unified error type for parkwatch.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Facility not found: {0}")]
    FacilityNotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Record store error: {0}")]
    Store(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// HTTP status the request layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::UpstreamUnavailable(_) => 503,
            Error::FacilityNotFound(_) => 404,
            Error::Validation(_) => 400,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::UpstreamUnavailable("x".into()).status_code(), 503);
        assert_eq!(Error::FacilityNotFound("osm_1".into()).status_code(), 404);
        assert_eq!(Error::Validation("bad".into()).status_code(), 400);
        assert_eq!(Error::Store("down".into()).status_code(), 500);
    }
}
