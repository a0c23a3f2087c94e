use thiserror::Error;
use uuid::Uuid;

/// Rejections raised on the write path, before any state is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("intensity {0} is outside 1..=10")]
    InvalidIntensity(u8),

    #[error("unknown mood label: {0:?}")]
    UnknownMood(String),

    #[error("unknown coping mechanism id: {0:?}")]
    UnknownCopingMechanism(String),

    #[error("coping mechanism {0:?} requires premium features")]
    PremiumLocked(String),

    #[error("no active user")]
    NoActiveUser,

    #[error("entry {id} belongs to {owner:?}, not the active user")]
    ForeignEntry { id: Uuid, owner: String },

    #[error("duplicate entry id: {0}")]
    DuplicateEntry(Uuid),
}
