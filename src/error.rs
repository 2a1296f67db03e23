use thiserror::Error;

/// Result codes handed to the pin-control layer that sits on top of the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    AlreadyAdded,
    AlreadyRegistered,
    Error,
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Out of memory: {0}")]
    OutOfMemory(String),
    #[error("Edge detection already added: {0}")]
    AlreadyAdded(String),
    #[error("Already registered: {0}")]
    AlreadyRegistered(String),
    #[error("Edge conflict: {0}")]
    EdgeConflict(String),
    #[error("Multiplexer error: {0}")]
    Multiplexer(String),
    #[error("Invalid pin: {0}")]
    InvalidPin(String),
    #[error("Invalid edge: {0}")]
    InvalidEdge(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl EventError {
    pub fn code(&self) -> ResultCode {
        match self {
            EventError::AlreadyAdded(_) => ResultCode::AlreadyAdded,
            // a bounce mismatch on a blocking wait is reported like a registration clash
            EventError::AlreadyRegistered(_) | EventError::EdgeConflict(_) => {
                ResultCode::AlreadyRegistered
            }
            EventError::Io(_)
            | EventError::OutOfMemory(_)
            | EventError::Multiplexer(_)
            | EventError::InvalidPin(_)
            | EventError::InvalidEdge(_)
            | EventError::Config(_) => ResultCode::Error,
        }
    }
}
