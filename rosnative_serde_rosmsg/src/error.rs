use std::fmt::Display;

/// Errors produced while encoding or decoding the ROS1 wire format.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Catch-all for errors reported by serde itself.
    #[error("{0}")]
    Message(String),
    /// Input ended before the announced amount of data was available.
    #[error("unexpected end of input")]
    Eof,
    /// Input contained bytes beyond the end of the decoded value.
    #[error("{remaining} trailing bytes after message body")]
    TrailingBytes { remaining: usize },
    /// A sequence announced one length but yielded another.
    #[error("sequence length mismatch: declared {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    /// A string field did not contain valid UTF-8.
    #[error("string field is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The ROS wire format has no representation for this Rust construct.
    #[error("type is not representable in the ROS wire format: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

impl serde::ser::Error for Error {
    fn custom<T: Display>(msg: T) -> Self {
        Error::Message(msg.to_string())
    }
}

impl serde::de::Error for Error {
    fn custom<T: Display>(msg: T) -> Self {
        Error::Message(msg.to_string())
    }
}
