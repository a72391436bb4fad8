use serde::{Deserialize, Serialize};

/// Optimistic concurrency expectation for [`EventStore::add_to_stream`].
///
/// [`EventStore::add_to_stream`]: crate::EventStore::add_to_stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// Accept any current version.
    Any,
    /// The stream must be exactly at this version.
    At(u64),
}

impl ExpectedVersion {
    /// The stream must not exist yet. Equal by value to `At(0)`.
    pub const NEW: Self = Self::At(0);

    /// Checks the expectation against the stream's current version.
    pub const fn verify(self, actual: u64) -> bool {
        match self {
            Self::Any => true,
            Self::At(expected) => expected == actual,
        }
    }
}
