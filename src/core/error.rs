use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Targeting error: {0}")]
    Targeting(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// Transport failure scoped to one batch. Callers may retry the batch
    /// with a fresh interface.
    #[error("Interface error: {0}")]
    Interface(String),

    /// Transport failure that invalidates the whole interface (failed
    /// session setup, bad credentials). Never retried.
    #[error("Fatal interface error: {0}")]
    FatalInterface(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Targeting(_) => "TARGETING_ERROR",
            Error::Parse(_) => "PARSE_ERROR",
            Error::Interface(_) => "INTERFACE_ERROR",
            Error::FatalInterface(_) => "FATAL_INTERFACE_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Other(_) => "ERROR",
        }
    }

    /// True when the failure is scoped to one dispatched batch and the
    /// caller may retry it on a fresh interface.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Interface(_))
    }
}
