use thiserror::Error;

/// Failures while decoding a control-channel frame or payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated payload: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("payload length {actual} does not match expected {expected}")]
    BadLength { expected: usize, actual: usize },

    #[error("payload of {len} bytes exceeds ceiling of {max}")]
    TooLarge { len: usize, max: usize },

    #[error("unknown {kind} command {cmd}")]
    UnknownCommand { kind: &'static str, cmd: u32 },

    #[error("unknown frame kind {0}")]
    UnknownKind(u8),

    #[error("name too long: {len} bytes (max {max})")]
    NameTooLong { len: usize, max: usize },

    #[error("name is not valid UTF-8")]
    InvalidName,
}
