//! Task identifiers and the sources that mint them.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a submitted task, formatted as 8-4-4-4-12 lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Produces a fresh identifier on every call.
pub trait IdSource: Send + Sync {
    fn next_id(&self) -> TaskId;
}

/// Default id source: 16 bytes from the thread-local CSPRNG.
///
/// The bytes are used as-is, without version or variant bits.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdSource;

impl IdSource for RandomIdSource {
    fn next_id(&self) -> TaskId {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        TaskId(Uuid::from_bytes(bytes).hyphenated().to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn random_id_has_five_hex_groups() {
        let id = RandomIdSource.next_id();
        let groups: Vec<&str> = id.as_str().split('-').collect();
        let lengths: Vec<usize> = groups.iter().map(|g| g.len()).collect();
        assert_eq!(lengths, vec![8, 4, 4, 4, 12]);
        assert!(
            groups
                .iter()
                .all(|g| g.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()))
        );
    }

    #[test]
    fn random_ids_do_not_repeat() {
        let ids: HashSet<TaskId> = (0..1000).map(|_| RandomIdSource.next_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
