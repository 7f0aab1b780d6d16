use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Status kinds reported to callers of the public entry points
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    BadParam,
    NotImplemented,
    UnknownError,
    InternalError,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Bad parameter: {0}")]
    BadParam(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("No viable algorithm: {0}")]
    NoViableAlgorithm(String),

    #[error("No compiled kernel for {algorithm} under configuration {network_config}")]
    MissingKernel {
        algorithm: String,
        network_config: String,
    },

    #[error("Kernel build failed: {0}")]
    Build(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Numerics check failed: {0}")]
    Numerics(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn bad_param(msg: impl Into<String>) -> Self {
        Error::BadParam(msg.into())
    }

    /// Whether a search should drop the candidate that produced this error
    /// and keep going, rather than abort
    pub fn demotes_candidate(&self) -> bool {
        matches!(
            self,
            Error::BadParam(_)
                | Error::NotImplemented(_)
                | Error::Build(_)
                | Error::MissingKernel { .. }
        )
    }

    /// Status kind this error reports as
    pub fn status(&self) -> Status {
        match self {
            Error::BadParam(_) | Error::MissingKernel { .. } => Status::BadParam,
            Error::NotImplemented(_) => Status::NotImplemented,
            Error::NoViableAlgorithm(_) | Error::Build(_) => Status::UnknownError,
            Error::Device(_) | Error::Numerics(_) | Error::IoError(_) | Error::JsonError(_) => {
                Status::InternalError
            }
        }
    }
}
