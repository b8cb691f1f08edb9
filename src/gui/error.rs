use crate::error::SessionError;

use std::{error::Error, fmt::Display, io};

/// Failures of the terminal front end.
#[derive(Debug)]
pub enum GuiError {
    /// The terminal could not be set up, drawn or restored
    IOError(io::Error),
    /// A command from the keyboard could not be carried out
    SessionError(SessionError),
}

impl Display for GuiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IOError(e) => write!(f, "terminal error: {e}"),
            Self::SessionError(e) => write!(f, "{e}"),
        }
    }
}

impl Error for GuiError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::IOError(e) => Some(e),
            Self::SessionError(e) => Some(e),
        }
    }
}

impl From<io::Error> for GuiError {
    fn from(value: io::Error) -> Self {
        Self::IOError(value)
    }
}

impl From<SessionError> for GuiError {
    fn from(value: SessionError) -> Self {
        Self::SessionError(value)
    }
}
