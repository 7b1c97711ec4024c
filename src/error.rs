use std::time::Duration;
use thiserror::Error;

use crate::stanza::StanzaError;

/// The distinct ways a blocking wait for a correlated reply can fail. Callers always get
///  one of these kinds - never a generic failure - so retry logic can tell "try again"
///  (NoResponse) from "the stream is dead" (NotConnected) from "the server rejected it"
///  (ErrorReply).
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum WaitError {
    #[error("no response received within {0:?}")]
    NoResponse(Duration),

    #[error("the connection was lost while waiting for a response")]
    NotConnected,

    #[error("error reply received: {0}")]
    ErrorReply(StanzaError),

    #[error("the wait was cancelled")]
    Cancelled,
}
