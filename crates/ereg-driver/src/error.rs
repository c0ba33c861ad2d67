//! Error taxonomy for the e-Reg driver.
//!
//! Every failure the driver can produce falls into one of four buckets, and
//! callers route on the bucket rather than on the message:
//!
//! - **`Validation`**: a local argument was out of range or malformed. Raised
//!   before any bytes reach the socket.
//! - **`Connection`**: the transport is not connected, or the socket faulted
//!   mid-exchange. Fatal to the current connection.
//! - **`NegativeAcknowledgement`**: the regulator answered a well-formed
//!   command with one of its error codes. The connection stays usable.
//! - **`Unexpected`**: anything else, typically a response that could not be
//!   parsed.

use thiserror::Error;

/// Convenience alias for results produced by the driver.
pub type ERegResult<T> = std::result::Result<T, ERegError>;

/// Error codes the regulator may answer with, and what they mean.
pub const ERROR_RESPONSES: [(&str, &str); 4] = [
    ("bcr", "bad command response"),
    ("bdr", "bad data response"),
    ("cfe", "communication failure error"),
    ("ine", "internal unrecoverable error"),
];

/// Look up the description of a device error code.
pub fn describe_error_code(code: &str) -> Option<&'static str> {
    ERROR_RESPONSES
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, description)| *description)
}

/// Primary error type for all regulator I/O.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ERegError {
    /// Local input outside its documented bounds.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not connected, or the socket faulted during an exchange.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The regulator answered with one of its error codes.
    #[error("E-Reg returned an error response - \"{code}\": {description}")]
    NegativeAcknowledgement {
        /// Short code as sent by the device, e.g. `bcr`.
        code: String,
        /// Human-readable meaning of the code.
        description: String,
    },

    /// Malformed response or any other failure.
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// Fieldless mirror of [`ERegError`] used for routing decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad local input, nothing was sent.
    Validation,
    /// Transport-level failure.
    Connection,
    /// Device rejected the command.
    NegativeAcknowledgement,
    /// Anything else.
    Unexpected,
}

impl ERegError {
    /// Which bucket of the taxonomy this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ERegError::Validation(_) => ErrorKind::Validation,
            ERegError::Connection(_) => ErrorKind::Connection,
            ERegError::NegativeAcknowledgement { .. } => ErrorKind::NegativeAcknowledgement,
            ERegError::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    /// True when the error invalidates the current connection.
    pub fn is_connection(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }

    pub(crate) fn nak(code: &str) -> Option<Self> {
        describe_error_code(code).map(|description| ERegError::NegativeAcknowledgement {
            code: code.to_string(),
            description: description.to_string(),
        })
    }
}
