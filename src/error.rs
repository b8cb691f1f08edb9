//! Errors surfaced by the kernel. Decode-side problems never show up here:
//! malformed lines become plain text and partial TP2 payloads are recovered
//! in place, so only operator input and the transport can fail.

use std::{error::Error, fmt::Display, io, sync::mpsc};

/// Operator input rejected before anything is encoded or sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// CAN identifier outside `0..=0x7FF`
    InvalidId(u32),
    /// More than 8 data bytes
    InvalidLength(usize),
    /// Angle outside `-179..=180`
    AngleOutOfRange(i32),
    /// Angle string not of the form `<R|C|O><sign?><1-4 digits>`
    MalformedAngle(String),
    /// A token that should be hexadecimal is not
    InvalidHex(String),
    /// Data field left empty
    EmptyData,
    /// Group outside `0..=7`
    InvalidGroup(u8),
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidId(id) => write!(f, "CAN id {id:#x} is outside 0x000..=0x7FF"),
            Self::InvalidLength(len) => write!(f, "{len} data bytes, a CAN frame carries at most 8"),
            Self::AngleOutOfRange(v) => write!(f, "angle {v} is outside -179..=180"),
            Self::MalformedAngle(s) => write!(f, "malformed angle string {s:?}"),
            Self::InvalidHex(s) => write!(f, "{s:?} is not valid hexadecimal"),
            Self::EmptyData => write!(f, "data cannot be empty"),
            Self::InvalidGroup(g) => write!(f, "group {g} is outside 0..=7"),
        }
    }
}

impl Error for ValidationError {}

/// Failures of the connection and its workers.
#[derive(Debug)]
pub enum SessionError {
    /// The session is disconnected (or the link went down); nothing was sent
    Closed,
    /// Reading from or writing to the serial channel failed
    Transport(io::Error),
    /// A transmit worker is already running on this session
    TransmissionActive,
    /// The command was rejected at the boundary
    Validation(ValidationError),
    /// A worker thread panicked and could not be joined
    Worker,
}

impl Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "channel is closed"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::TransmissionActive => write!(f, "a transmission is already running"),
            Self::Validation(e) => write!(f, "rejected: {e}"),
            Self::Worker => write!(f, "worker thread panicked"),
        }
    }
}

impl Error for SessionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Validation(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(value: io::Error) -> Self {
        Self::Transport(value)
    }
}

impl From<ValidationError> for SessionError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl<T> From<mpsc::SendError<T>> for SessionError {
    fn from(_: mpsc::SendError<T>) -> Self {
        Self::Closed
    }
}
