//! Strongly-typed identifiers for monbus

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a connected IPC client, unique within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u64);

impl ClientId {
    /// Allocate the next identifier. Identifiers are never reused.
    pub fn next() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_monotonic() {
        let a = ClientId::next();
        let b = ClientId::next();
        let c = ClientId::next();

        assert!(a < b);
        assert!(b < c);
        assert_ne!(a, c);
    }

    #[test]
    fn client_id_display() {
        let id = ClientId::next();
        assert_eq!(id.to_string(), id.as_u64().to_string());
    }
}
