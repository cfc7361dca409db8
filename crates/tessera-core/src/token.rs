//! Tracking tokens over the global sequence.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identifiers::GlobalSequence;

/// Opaque, ordered cursor used by catch-up readers to resume streaming.
///
/// The tail token (no position) sorts before every positioned token.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct TrackingToken(Option<GlobalSequence>);

impl TrackingToken {
    /// Token representing the start of time.
    #[must_use]
    pub const fn tail() -> Self {
        Self(None)
    }

    /// Token positioned at `global_sequence`. A read from this token returns
    /// only events after it.
    #[must_use]
    pub const fn at(global_sequence: GlobalSequence) -> Self {
        Self(Some(global_sequence))
    }

    /// Returns the wrapped position, or `None` for the tail token.
    #[must_use]
    pub const fn position(self) -> Option<GlobalSequence> {
        self.0
    }

    /// Returns `true` if this is the tail token.
    #[must_use]
    pub const fn is_tail(self) -> bool {
        self.0.is_none()
    }

    /// Returns `true` if an event at `global_sequence` lies after this token.
    #[must_use]
    pub fn covers(self, global_sequence: GlobalSequence) -> bool {
        self.0.is_none_or(|position| global_sequence > position)
    }
}

impl fmt::Display for TrackingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(position) => write!(f, "token@{position}"),
            None => f.write_str("token@tail"),
        }
    }
}
