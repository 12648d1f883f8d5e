//! Error types for ServoLink

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// ServoLink error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Secure frame could not be decoded (malformed or tampered token)
    #[error("Frame decode failed: {0}")]
    Decode(String),

    /// Payload is not numeric or structurally invalid
    #[error("Invalid payload: {0}")]
    Parse(String),

    /// Credential mismatch or malformed credential payload
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Datagram downlink send failure
    #[error("Downlink transport error: {0}")]
    Transport(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Config(e.to_string())
    }
}
