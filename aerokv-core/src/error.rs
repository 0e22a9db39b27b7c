//! Error types for aerokv operations.

use std::io;
use thiserror::Error;

/// Result codes returned by the server in the message header.
///
/// Zero means success; everything else maps onto [`AerokvError::Server`]
/// unless the command treats it as an ordinary outcome (for example
/// `exists` turns [`ResultCode::KeyNotFound`] into `Ok(false)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// Operation succeeded.
    Ok,
    /// Unclassified server failure.
    ServerError,
    /// The requested record does not exist.
    KeyNotFound,
    /// Generation policy violated.
    GenerationError,
    /// The server rejected a request parameter.
    ParameterError,
    /// Create-only write failed because the record exists.
    KeyExists,
    /// Bin already exists on a create-only bin operation.
    BinExists,
    /// Cluster key mismatch during a coordinated operation.
    ClusterKeyMismatch,
    /// Server ran out of memory.
    ServerMemError,
    /// Server-side timeout.
    Timeout,
    /// Operation not allowed in the current server configuration.
    AlwaysForbidden,
    /// Partition is temporarily unavailable; retryable.
    PartitionUnavailable,
    /// Operation applied to a bin of an incompatible particle type.
    BinTypeError,
    /// Record exceeded the server write-block size.
    RecordTooBig,
    /// Record in a hot-key conflict.
    KeyBusy,
    /// Scan aborted by the user.
    ScanAbort,
    /// Feature not supported by the server.
    UnsupportedFeature,
    /// Addressed bin does not exist.
    BinNotFound,
    /// Storage device overloaded.
    DeviceOverload,
    /// Stored key does not match the sent key.
    KeyMismatch,
    /// Namespace is not configured on the cluster.
    InvalidNamespace,
    /// Bin name longer than the server limit.
    BinNameTooLong,
    /// Operation forbidden in the current state.
    FailForbidden,
    /// Requested element not found in a collection.
    ElementNotFound,
    /// Element exists on an add-unique collection write.
    ElementExists,
    /// Enterprise-only feature requested.
    EnterpriseOnly,
    /// Operation had no effect or its preconditions were unmet.
    OpNotApplicable,
    /// An attached expression evaluated to false for this record.
    FilteredOut,
    /// Write lost a conflict resolution.
    LostConflict,
    /// Security functionality not supported.
    SecurityNotSupported,
    /// Security functionality not enabled.
    SecurityNotEnabled,
    /// Unknown user.
    InvalidUser,
    /// User already exists.
    UserAlreadyExists,
    /// Password or credential rejected.
    InvalidCredential,
    /// Session token expired.
    ExpiredSession,
    /// Not authenticated.
    NotAuthenticated,
    /// Role violation.
    RoleViolation,
    /// User-defined function failed server-side.
    UdfBadResponse,
    /// Batch functionality disabled on the server.
    BatchDisabled,
    /// Batch queue full.
    BatchMaxRequests,
    /// A code this client does not recognize.
    Unknown(u8),
}

impl ResultCode {
    /// Maps a raw result-code byte from a response header.
    pub fn from_u8(code: u8) -> Self {
        match code {
            0 => ResultCode::Ok,
            1 => ResultCode::ServerError,
            2 => ResultCode::KeyNotFound,
            3 => ResultCode::GenerationError,
            4 => ResultCode::ParameterError,
            5 => ResultCode::KeyExists,
            6 => ResultCode::BinExists,
            7 => ResultCode::ClusterKeyMismatch,
            8 => ResultCode::ServerMemError,
            9 => ResultCode::Timeout,
            10 => ResultCode::AlwaysForbidden,
            11 => ResultCode::PartitionUnavailable,
            12 => ResultCode::BinTypeError,
            13 => ResultCode::RecordTooBig,
            14 => ResultCode::KeyBusy,
            15 => ResultCode::ScanAbort,
            16 => ResultCode::UnsupportedFeature,
            17 => ResultCode::BinNotFound,
            18 => ResultCode::DeviceOverload,
            19 => ResultCode::KeyMismatch,
            20 => ResultCode::InvalidNamespace,
            21 => ResultCode::BinNameTooLong,
            22 => ResultCode::FailForbidden,
            23 => ResultCode::ElementNotFound,
            24 => ResultCode::ElementExists,
            25 => ResultCode::EnterpriseOnly,
            26 => ResultCode::OpNotApplicable,
            27 => ResultCode::FilteredOut,
            28 => ResultCode::LostConflict,
            51 => ResultCode::SecurityNotSupported,
            52 => ResultCode::SecurityNotEnabled,
            60 => ResultCode::InvalidUser,
            61 => ResultCode::UserAlreadyExists,
            62 => ResultCode::InvalidCredential,
            63 => ResultCode::ExpiredSession,
            80 => ResultCode::NotAuthenticated,
            81 => ResultCode::RoleViolation,
            100 => ResultCode::UdfBadResponse,
            150 => ResultCode::BatchDisabled,
            151 => ResultCode::BatchMaxRequests,
            other => ResultCode::Unknown(other),
        }
    }

    /// Returns true if a command hitting this code may be retried on
    /// another replica or after a backoff sleep.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ResultCode::Timeout | ResultCode::PartitionUnavailable | ResultCode::DeviceOverload
        )
    }

    /// Returns true if this code denotes an authentication problem.
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            ResultCode::SecurityNotSupported
                | ResultCode::SecurityNotEnabled
                | ResultCode::InvalidUser
                | ResultCode::UserAlreadyExists
                | ResultCode::InvalidCredential
                | ResultCode::ExpiredSession
                | ResultCode::NotAuthenticated
                | ResultCode::RoleViolation
        )
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultCode::Unknown(code) => write!(f, "unknown result code {}", code),
            other => write!(f, "{:?}", other),
        }
    }
}

/// The main error type for aerokv operations.
#[derive(Debug, Error)]
pub enum AerokvError {
    /// Caller supplied invalid inputs (bad key shape, oversized bin name,
    /// out-of-range parameter).
    #[error("parameter error: {0}")]
    Param(String),

    /// Malformed frame or value observed from the peer.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Failed to acquire or open a socket, or disconnected mid-request.
    #[error("connection error: {0}")]
    Connection(String),

    /// A socket, per-iteration, or total deadline elapsed.
    #[error("timeout error: {0}")]
    Timeout(String),

    /// No usable cluster view, or no node owns the target partition.
    #[error("cluster error: {0}")]
    Cluster(String),

    /// Authentication refused or the session could not be established.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// A user-defined function raised an error on the server.
    #[error("UDF error: {0}")]
    Udf(String),

    /// The server rejected the request with a non-zero result code.
    #[error("server error from {}: {code}", node.as_deref().unwrap_or("<unknown node>"))]
    Server {
        /// The decoded result code.
        code: ResultCode,
        /// The node that produced the response, if known.
        node: Option<String>,
    },

    /// I/O errors from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl AerokvError {
    /// Builds a server error from a raw result-code byte.
    pub fn from_code(code: u8, node: Option<String>) -> Self {
        let code = ResultCode::from_u8(code);
        if code.is_security() {
            AerokvError::Authentication(format!("{} (node {:?})", code, node))
        } else {
            AerokvError::Server { code, node }
        }
    }

    /// Returns the server result code if this is a server error.
    pub fn result_code(&self) -> Option<ResultCode> {
        match self {
            AerokvError::Server { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns true if the retry layer may re-issue the command.
    ///
    /// Connection and iteration-level timeout errors are always
    /// retryable; server errors only for the codes the server marks
    /// transient. Everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            AerokvError::Connection(_) | AerokvError::Timeout(_) => true,
            AerokvError::Server { code, .. } => code.is_retryable(),
            AerokvError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// A specialized `Result` type for aerokv operations.
pub type Result<T> = std::result::Result<T, AerokvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_code_roundtrip() {
        assert_eq!(ResultCode::from_u8(0), ResultCode::Ok);
        assert_eq!(ResultCode::from_u8(2), ResultCode::KeyNotFound);
        assert_eq!(ResultCode::from_u8(26), ResultCode::OpNotApplicable);
        assert_eq!(ResultCode::from_u8(27), ResultCode::FilteredOut);
        assert_eq!(ResultCode::from_u8(200), ResultCode::Unknown(200));
    }

    #[test]
    fn retryable_codes() {
        assert!(ResultCode::Timeout.is_retryable());
        assert!(ResultCode::PartitionUnavailable.is_retryable());
        assert!(!ResultCode::KeyNotFound.is_retryable());
        assert!(!ResultCode::GenerationError.is_retryable());
    }

    #[test]
    fn security_codes_become_authentication_errors() {
        let err = AerokvError::from_code(62, Some("node-a".to_string()));
        assert!(matches!(err, AerokvError::Authentication(_)));

        let err = AerokvError::from_code(3, None);
        assert!(matches!(
            err,
            AerokvError::Server {
                code: ResultCode::GenerationError,
                ..
            }
        ));
    }

    #[test]
    fn error_display_includes_node() {
        let err = AerokvError::from_code(13, Some("A1".to_string()));
        assert!(err.to_string().contains("A1"));
        assert!(err.to_string().contains("RecordTooBig"));
    }

    #[test]
    fn connection_errors_are_retryable() {
        assert!(AerokvError::Connection("reset".into()).is_retryable());
        assert!(AerokvError::Timeout("iteration".into()).is_retryable());
        assert!(!AerokvError::Param("bad bin".into()).is_retryable());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AerokvError>();
    }
}
