//! Parse errors for wire-level names.

/// A wire name that does not map onto a known value.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown cache strategy: {0}")]
    UnknownStrategy(String),

    #[error("unknown gesture kind: {0}")]
    UnknownGesture(String),

    #[error("unknown load state: {0}")]
    UnknownLoadState(String),

    #[error("unknown control message: {0}")]
    UnknownControlMessage(String),

    #[error("malformed control message: {0}")]
    MalformedControlMessage(String),
}
