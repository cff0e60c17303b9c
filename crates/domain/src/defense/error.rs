use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DefenseError {
    #[error("invalid defense level {0}: must be 0..=3")]
    InvalidLevel(u32),

    #[error("invalid tunable {name}: {reason}")]
    InvalidTunable {
        name: &'static str,
        reason: &'static str,
    },

    #[error("unknown connection state: {0}")]
    UnknownState(String),
}
