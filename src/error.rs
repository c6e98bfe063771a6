use thiserror::Error;

use crate::{frontpanel::OkError, safety::SafetyViolation};

#[derive(Debug, Error)]
pub enum DaqError {
    #[error("device fault: {0}")]
    DeviceFault(String),

    #[error("FrontPanel call {call} failed: {code:?}")]
    FrontPanel { call: &'static str, code: OkError },

    #[error(transparent)]
    Safety(#[from] SafetyViolation),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("configuration error: {0}")]
    Config(#[from] confique::Error),
}

impl DaqError {
    pub(crate) fn front_panel(call: &'static str) -> impl FnOnce(OkError) -> Self {
        move |code| Self::FrontPanel { call, code }
    }
}

pub type Result<T> = std::result::Result<T, DaqError>;
