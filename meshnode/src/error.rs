use serde::{Deserialize, Serialize};

/// JSON-RPC error codes surfaced on the wire.
pub mod code {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const HANDLER_FAILED: i64 = -32000;
    pub const NO_SUCH_TARGET: i64 = -32004;
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    InvalidArgument,
    MethodNotFound,
    NoSuchTarget,
    HandlerFailed,
    ConnectionClosed,
    ProtocolError,
    FramingFailed,
    SerdeJsonError,
    TcpConnectFailed,
    TcpBindFailed,
    TlsHandshakeFailed,
    PeerCertificateMissing,
    SendFailed,
    RecvFailed,
    Configuration,
    CertificateError,
    IoError,
    AlreadyExists,
    NotFound,
    #[serde(untagged)]
    Unknown(String),
}

impl ErrorKind {
    /// The JSON-RPC error code reported to remote callers.
    #[must_use]
    pub fn code(&self) -> i64 {
        match self {
            ErrorKind::MethodNotFound => code::METHOD_NOT_FOUND,
            ErrorKind::InvalidArgument => code::INVALID_PARAMS,
            ErrorKind::NoSuchTarget => code::NO_SUCH_TARGET,
            ErrorKind::HandlerFailed => code::HANDLER_FAILED,
            ErrorKind::ProtocolError | ErrorKind::SerdeJsonError => code::PARSE_ERROR,
            _ => code::INTERNAL_ERROR,
        }
    }

    #[must_use]
    pub fn from_code(code: i64) -> Self {
        match code {
            code::METHOD_NOT_FOUND => ErrorKind::MethodNotFound,
            code::INVALID_PARAMS => ErrorKind::InvalidArgument,
            code::NO_SUCH_TARGET => ErrorKind::NoSuchTarget,
            code::HANDLER_FAILED => ErrorKind::HandlerFailed,
            code::PARSE_ERROR | code::INVALID_REQUEST => ErrorKind::ProtocolError,
            other => ErrorKind::Unknown(other.to_string()),
        }
    }

    /// Transport failures are the only ones the connection registry retries.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ErrorKind::TcpConnectFailed
                | ErrorKind::TlsHandshakeFailed
                | ErrorKind::PeerCertificateMissing
                | ErrorKind::SendFailed
                | ErrorKind::RecvFailed
                | ErrorKind::ConnectionClosed
                | ErrorKind::Timeout
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub msg: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    #[must_use]
    pub fn kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            msg: String::default(),
        }
    }

    /// Invalid parameter, naming the offending parameter.
    #[must_use]
    pub fn invalid_argument(param: &str, reason: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::InvalidArgument, format!("{param}: {reason}"))
    }

    #[must_use]
    pub fn connection_closed() -> Self {
        Self::new(ErrorKind::ConnectionClosed, "connection closed")
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::kind(kind)
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(value: std::num::TryFromIntError) -> Self {
        Self::new(ErrorKind::InvalidArgument, value.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::new(ErrorKind::SerdeJsonError, value.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::new(ErrorKind::IoError, value.to_string())
    }
}

impl From<uuid::Error> for Error {
    fn from(value: uuid::Error) -> Self {
        Self::new(ErrorKind::InvalidArgument, value.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(value: rustls::Error) -> Self {
        Self::new(ErrorKind::TlsHandshakeFailed, value.to_string())
    }
}

impl From<rcgen::Error> for Error {
    fn from(value: rcgen::Error) -> Self {
        Self::new(ErrorKind::CertificateError, value.to_string())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.msg.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            write!(f, "{:?}: {}", self.kind, self.msg)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
