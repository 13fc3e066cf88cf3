use std::fmt;

use app_server_client::RequestId;
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identity of a workspace as known to the workspace store.
    WorkspaceId
);

string_id!(
    /// App-local thread identity. Stable across backend process restarts; the
    /// backend's own thread id is tracked separately.
    ThreadId
);

impl ThreadId {
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Turn identity, unique within one session's coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(u64);

impl TurnId {
    #[must_use]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "turn-{}", self.0)
    }
}

/// Approval request identity: the backend's server-request id, or a
/// synthesized one for text-stream backends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApprovalId(RequestId);

impl ApprovalId {
    #[must_use]
    pub fn new(id: RequestId) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn request_id(&self) -> &RequestId {
        &self.0
    }

    /// Parse a user-supplied id: integers become integer ids, anything else a
    /// string id.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.parse::<i64>() {
            Ok(value) => Self(RequestId::Integer(value)),
            Err(_) => Self(RequestId::String(trimmed.to_string())),
        }
    }
}

impl fmt::Display for ApprovalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_ids_parse_integers_and_strings() {
        assert_eq!(
            ApprovalId::parse("42"),
            ApprovalId::new(RequestId::Integer(42))
        );
        assert_eq!(
            ApprovalId::parse(" approval-1 "),
            ApprovalId::new(RequestId::String("approval-1".to_string()))
        );
    }

    #[test]
    fn generated_thread_ids_are_distinct() {
        assert_ne!(ThreadId::generate(), ThreadId::generate());
    }
}
