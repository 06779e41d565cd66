use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of one live duplex connection.
///
/// Minted when the socket is accepted and never reused: the suffix is a
/// time-ordered v7 UUID, so two connections can never share an id even
/// across restarts.
#[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }

    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ConnectionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
