use std::io;

use n0_error::stack_error;

/// Errors establishing an upstream connection.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum DialError {
    /// Name resolution failed for the target authority.
    #[error("failed to resolve {authority}")]
    Resolve {
        /// The authority we tried to resolve.
        authority: String,
        #[error(source, std_err)]
        source: io::Error,
    },

    /// Name resolution yielded no usable address.
    #[error("no address found for {authority}")]
    NoAddress {
        /// The authority we tried to resolve.
        authority: String,
    },

    /// The TCP connect failed.
    #[error("failed to connect to {authority}")]
    Connect {
        /// The authority we tried to connect to.
        authority: String,
        #[error(source, std_err)]
        source: io::Error,
    },

    /// The TCP connect did not complete within the configured timeout.
    #[error("timed out connecting to {authority}")]
    Timeout {
        /// The authority we tried to connect to.
        authority: String,
    },
}
