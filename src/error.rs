//! Error kinds per §7 of the design spec, one enum per component.

use serde::Serialize;
use thiserror::Error;

/// Stable machine-readable codes surfaced to API callers (§7 propagation policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Validation,
    NotFound,
    AtBoundary,
    EmptyCueList,
    TransientIo,
    FatalIo,
}

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("socket bind failed: {0}")]
    BindFailed(std::io::Error),
    #[error("universe {0} does not exist")]
    UnknownUniverse(u16),
}

impl OutputError {
    pub fn code(&self) -> ErrorCode {
        match self {
            OutputError::BindFailed(_) => ErrorCode::FatalIo,
            OutputError::UnknownUniverse(_) => ErrorCode::Validation,
        }
    }
}

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("cue list {0} not found")]
    NotFound(String),
    #[error("cue list {0} is empty")]
    EmptyCueList(String),
    #[error("navigation past the end of cue list {0}")]
    AtBoundary(String),
    #[error("index {index} out of range for cue list {cue_list_id} (len {len})")]
    InvalidIndex {
        cue_list_id: String,
        index: usize,
        len: usize,
    },
}

impl PlaybackError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PlaybackError::NotFound(_) => ErrorCode::NotFound,
            PlaybackError::EmptyCueList(_) => ErrorCode::EmptyCueList,
            PlaybackError::AtBoundary(_) => ErrorCode::AtBoundary,
            PlaybackError::InvalidIndex { .. } => ErrorCode::Validation,
        }
    }
}

/// Umbrella error for call sites that need to handle OE/PB failures
/// uniformly. The Fade Engine has no fallible operations (§4.2's failure
/// semantics isolate a bad tick rather than surfacing an error), and the
/// Preview Session Manager and Change Bus report failure as a plain `bool`
/// or a dropped message, per §4.4/§4.5, so neither gets its own variant here.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error(transparent)]
    Playback(#[from] PlaybackError),
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::Output(e) => e.code(),
            CoreError::Playback(e) => e.code(),
        }
    }
}
