use core::error::Error;

/// Failures of the health endpoint server.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum ApiError {
    #[display("Unable to listen on {addr}: {message}")]
    Bind { addr: String, message: String },
    #[display("Health server stopped: {message}")]
    Serve { message: String },
}

impl Error for ApiError {}
