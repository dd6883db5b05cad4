use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("File not found or could not be read: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse booking configuration JSON: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("Invalid booking configuration: {0}")]
    ConfigError(String),

    #[error("Authentication with the booking portal failed: {0}")]
    AuthError(String),

    #[error("HTTP request to the booking portal failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Could not generate TOTP code: {0}")]
    TotpError(String),

    #[error("Failed to write report: {0}")]
    CsvError(#[from] csv::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::ConfigError(message.into())
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Error::AuthError(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
