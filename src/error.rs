use crate::driver::NativeError;

/// Native code reported when an operation is attempted on a closed session.
pub const ERROR_INVALID_HANDLE: u32 = 6;
/// Native code reported for an unknown or rejected parameter.
pub const ERROR_INVALID_PARAMETER: u32 = 87;

#[derive(Debug, thiserror::Error)]
pub enum DivertError {
    #[error("{op} failed: {message} (native error {code})")]
    Resource {
        op: &'static str,
        code: u32,
        message: String,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unsupported protocol: requested {requested}, packet carries {found}")]
    UnsupportedProtocol {
        requested: &'static str,
        found: String,
    },
    #[error("{layer} header truncated: need {needed} bytes, have {have}")]
    Parse {
        layer: &'static str,
        needed: usize,
        have: usize,
    },
    #[error("malformed packet: {0}")]
    Malformed(String),
    #[error("output error: {0}")]
    Output(#[source] std::io::Error),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl DivertError {
    /// Error for an operation attempted while the session is closed.
    pub(crate) fn closed(op: &'static str) -> Self {
        DivertError::Resource {
            op,
            code: ERROR_INVALID_HANDLE,
            message: "session is not open".to_string(),
        }
    }

    pub(crate) fn native(op: &'static str, err: NativeError) -> Self {
        DivertError::Resource {
            op,
            code: err.code,
            message: err.message,
        }
    }

    pub(crate) fn truncated(layer: &'static str, needed: usize, have: usize) -> Self {
        DivertError::Parse {
            layer,
            needed,
            have,
        }
    }

    /// Native error code carried by a resource error, if any.
    pub fn native_code(&self) -> Option<u32> {
        match self {
            DivertError::Resource { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_resource(&self) -> bool {
        matches!(self, DivertError::Resource { .. })
    }
}

pub type Result<T> = std::result::Result<T, DivertError>;
