use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("resource busy")]
    Busy,

    #[error("operation would block")]
    WouldBlock,

    #[error("wait interrupted")]
    Interrupted,

    #[error("buffer allocation failed")]
    OutOfMemory,
}

impl Error {
    pub fn error_code(&self) -> i32 {
        match self {
            Error::Io(_) => -1,
            Error::InvalidArgument(_) => -2,
            Error::InvalidState(_) => -3,
            Error::Busy => -4,
            Error::WouldBlock => -5,
            Error::Interrupted => -6,
            Error::OutOfMemory => -7,
        }
    }
}
