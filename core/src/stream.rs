//! Resource identification and sequencing types.
//!
//! Every resource owns an independent, numbered event stream. This module
//! defines the strong types that name a resource (`ResourceId`) and position
//! an event within its stream (`SequenceId`).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, stable key identifying one independent event stream.
///
/// The host keeps at most one active processor generation per resource and
/// never interprets the key beyond equality and hashing.
///
/// ```
/// use event_serializer_core::stream::ResourceId;
///
/// let resource = ResourceId::new("account-42");
/// assert_eq!(resource.as_str(), "account-42");
/// assert_eq!(resource.to_string(), "account-42");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(String);

impl ResourceId {
    /// Key for the resource named `id`.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position of an event within its resource's stream.
///
/// Producers number events starting at 1. The value 0 is reserved for
/// "nothing applied yet", so a fresh store expects `SequenceId::new(1)` next.
///
/// # Examples
///
/// ```
/// use event_serializer_core::stream::SequenceId;
///
/// let none_applied = SequenceId::INITIAL;
/// assert_eq!(none_applied.next(), SequenceId::new(1));
/// assert!(SequenceId::new(3) > SequenceId::new(2));
/// ```
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SequenceId(u64);

impl SequenceId {
    /// Sentinel meaning no event has been applied.
    pub const INITIAL: Self = Self(0);

    /// Create a new `SequenceId` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw sequence number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Get the next sequence id (current + 1).
    ///
    /// # Overflow Behavior
    ///
    /// Saturates at `u64::MAX`. No realistic stream reaches it.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Check if this is the initial sentinel (0).
    #[must_use]
    pub const fn is_initial(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SequenceId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SequenceId> for u64 {
    fn from(id: SequenceId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod resource_id_tests {
        use super::*;
        use std::collections::HashSet;

        #[test]
        fn same_name_is_same_resource() {
            let keys: HashSet<ResourceId> = ["account-1", "account-2", "account-1"]
                .into_iter()
                .map(ResourceId::new)
                .collect();

            assert_eq!(keys.len(), 2);
            assert!(keys.contains(&ResourceId::new(String::from("account-1"))));
        }

        #[test]
        #[allow(clippy::unwrap_used)]
        fn serializes_as_plain_string() {
            let id = ResourceId::new("account-9");

            assert_eq!(id.to_string(), "account-9");
            assert_eq!(serde_json::to_string(&id).unwrap(), "\"account-9\"");
        }
    }

    mod sequence_id_tests {
        use super::*;

        #[test]
        fn initial_expects_one() {
            assert!(SequenceId::INITIAL.is_initial());
            assert_eq!(SequenceId::INITIAL.next(), SequenceId::new(1));
            assert_eq!(SequenceId::default(), SequenceId::INITIAL);
        }

        #[test]
        fn ordering() {
            assert!(SequenceId::new(1) < SequenceId::new(2));
            assert!(SequenceId::new(10) > SequenceId::new(9));
        }

        #[test]
        fn next_saturates() {
            assert_eq!(SequenceId::new(u64::MAX).next(), SequenceId::new(u64::MAX));
        }

        #[test]
        fn conversions() {
            let id = SequenceId::from(42_u64);
            assert_eq!(id.value(), 42);
            let raw: u64 = id.into();
            assert_eq!(raw, 42);
            assert_eq!(format!("{id}"), "42");
        }
    }
}
