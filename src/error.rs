// Digital Voice Modem - Fixed Network Equipment
// Core protocol engine for DMR/P25 repeater traffic routing.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FneError {
    #[error("IO error {0}")]
    IoError(#[from] std::io::Error),

    #[error("Config parse error {0}")]
    ConfigError(#[from] toml::de::Error),

    #[error("CSV error {0}")]
    CsvError(#[from] csv::Error),

    #[error("Short frame, expected at least {expected} bytes, got {got}")]
    ShortFrame { expected: usize, got: usize },

    #[error("Unknown opcode {0:?}")]
    UnknownOpcode(Vec<u8>),

    #[error("Bad peer id")]
    BadPeerId,

    #[error("Unknown peer id {0}")]
    UnknownPeer(u32),

    #[error("Endpoint mismatch for peer {0}")]
    EndpointMismatch(u32),

    #[error("Challenge mismatch for peer {0}")]
    ChallengeMismatch(u32),

    #[error("Invalid config payload for peer {0}")]
    InvalidPeerConfig(u32),

    #[error("Opcode not permitted in current peer state")]
    IllegalStateTransition,

    #[error("ACL rejected frame: {0}")]
    AclRejected(&'static str),

    #[error("Stream collision on slot")]
    StreamCollision,

    #[error("Malformed link control payload")]
    MalformedLc,

    #[error("Rule file parse error: {0}")]
    RuleParseError(String),
}

impl FneError {
    /// Maps a subset of error kinds to the wire-visible `MSTNAK` reason code.
    /// Most error kinds have no wire representation and fall back to 0xFF.
    pub fn code(&self) -> u8 {
        match self {
            FneError::ShortFrame { .. } => 0,
            FneError::UnknownOpcode(_) => 1,
            FneError::BadPeerId | FneError::UnknownPeer(_) => 2,
            FneError::EndpointMismatch(_) => 3,
            FneError::ChallengeMismatch(_) => 4,
            FneError::InvalidPeerConfig(_) => 5,
            FneError::IllegalStateTransition => 6,
            _ => 255,
        }
    }
}

pub type FneResult<T> = std::result::Result<T, FneError>;
