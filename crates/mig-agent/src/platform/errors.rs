use core::error::Error;

/// Errors raised by the MIG driver adapter.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum DriverError {
    #[display("MIG resource not found: {message}")]
    NotFound { message: String },
    #[display("MIG device is in use: {message}")]
    Busy { message: String },
    #[display("Insufficient GPU capacity: {message}")]
    Capacity { message: String },
    #[display("GPU driver error: {message}")]
    Driver { message: String },
    #[display("Operation timed out: {message}")]
    Timeout { message: String },
    #[display("Operation cancelled")]
    Cancelled,
}

impl Error for DriverError {}

impl DriverError {
    pub(crate) fn driver(message: impl Into<String>) -> Self {
        DriverError::Driver {
            message: message.into(),
        }
    }
}
